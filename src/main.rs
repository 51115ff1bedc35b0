//! CLI comparing sequential and Block-STM execution of transfer workloads.

use block_stm::PreEstimates;
use block_stm_bench::{
    bank, derive_from_workload, BlockStmExecutor, EstimatesFile, Executor, SequentialExecutor, Workload,
    WorkloadConfig,
};
use clap::Parser;
use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, default_value_t = 1000)]
    accounts: usize,

    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Conflict factors to run, between 0 and 1.
    #[arg(long, value_delimiter = ',', default_values_t = [0.0, 0.25, 0.5, 0.75, 1.0])]
    conflicts: Vec<f64>,

    /// Worker counts to run the parallel executor with.
    #[arg(long, value_delimiter = ',', default_values_t = [1, 2, 4, 8])]
    workers: Vec<usize>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long)]
    no_verify: bool,

    /// Make every transfer range-scan its sender's history.
    #[arg(long)]
    audit_history: bool,

    /// JSON file of write hints seeded before each parallel block.
    #[arg(long, conflicts_with = "derive_estimates")]
    estimates: Option<PathBuf>,

    /// Seed each parallel block with the write locations derived from its workload.
    #[arg(long)]
    derive_estimates: bool,

    /// Write the derived hints of the first workload to this file and exit.
    #[arg(long)]
    dump_estimates: Option<PathBuf>,

    /// Abort a parallel block that runs longer than this.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "block_stm={level},block_stm_bench={level},warn",
            level = args.log_level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let verify_signatures = !args.no_verify;
    let file_estimates = match &args.estimates {
        Some(path) => {
            let file = EstimatesFile::load(path)?;
            Some(file.to_pre_estimates(args.transactions, bank::NUM_STORES)?)
        }
        None => None,
    };

    println!("=== Block-STM Transfer Benchmark ===\n");
    println!(
        "Configuration: {} accounts, {} transactions per run, signatures {}\n",
        args.accounts,
        args.transactions,
        if verify_signatures { "verified" } else { "not verified" }
    );

    for &conflict_factor in &args.conflicts {
        let config = WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            conflict_factor,
            seed: args.seed,
            audit_history: args.audit_history,
            ..Default::default()
        };
        let workload = Workload::generate(config)?;

        if let Some(path) = &args.dump_estimates {
            EstimatesFile::from(&derive_from_workload(&workload)).save(path)?;
            info!(path = %path.display(), "wrote derived estimates");
            return Ok(());
        }

        let estimates: Option<PreEstimates> = if args.derive_estimates {
            Some(derive_from_workload(&workload))
        } else {
            file_estimates.clone()
        };

        println!("--- {:.0}% conflicts ---", conflict_factor * 100.0);

        let sequential = SequentialExecutor::new(verify_signatures);
        let start = Instant::now();
        let (expected, result) = sequential.execute(workload.genesis(), &workload)?;
        let baseline = start.elapsed();
        print_row(sequential.name(), 1, result.successful, baseline, baseline, 1.0);

        for &workers in &args.workers {
            let mut executor = BlockStmExecutor::new(workers, verify_signatures);
            if let Some(estimates) = &estimates {
                executor = executor.with_estimates(estimates.clone());
            }
            if let Some(timeout_ms) = args.timeout_ms {
                executor = executor.with_timeout(Duration::from_millis(timeout_ms));
            }

            let start = Instant::now();
            let (actual, result) = match executor.execute(workload.genesis(), &workload) {
                Ok(output) => output,
                Err(error) if error.is_cancellation() => {
                    warn!(workers, %error, "parallel block did not finish");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            let elapsed = start.elapsed();

            if actual != expected {
                return Err(format!("{workers}-worker parallel state diverged from sequential execution").into());
            }
            print_row(
                executor.name(),
                workers,
                result.successful,
                elapsed,
                baseline,
                result.reexecution_ratio(),
            );
        }
        println!();
    }

    Ok(())
}

fn print_row(name: &str, workers: usize, successful: usize, elapsed: Duration, baseline: Duration, ratio: f64) {
    let tps = successful as f64 / elapsed.as_secs_f64();
    println!(
        "{:12} | {:2} workers | {:5} successful | {:8.2} ms | {:9.0} tx/s | {:5.2}x | {:4.2} exec/tx",
        name,
        workers,
        successful,
        elapsed.as_secs_f64() * 1000.0,
        tps,
        baseline.as_secs_f64() / elapsed.as_secs_f64(),
        ratio,
    );
}
