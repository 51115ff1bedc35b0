//! Block-STM parallel executor.

use super::{ExecutionResult, Executor};
use crate::bank::{self, TransferOptions};
use crate::Workload;
use block_stm::{
    BlockStmError, BoxError, Context, ExecutorConfig, MemStorage, ParallelExecutor, PreEstimates,
};
use std::time::Duration;
use tracing::debug;

/// Runs a workload on the Block-STM engine.
///
/// Transfers are executed optimistically on `workers` threads and committed
/// in one step once the whole block has validated, leaving storage exactly as
/// [`super::SequentialExecutor`] would.
#[derive(Debug, Clone)]
pub struct BlockStmExecutor {
    pub workers: usize,
    pub verify_signatures: bool,
    /// Write hints seeded before the block starts.
    pub estimates: Option<PreEstimates>,
    pub timeout: Option<Duration>,
}

impl BlockStmExecutor {
    pub fn new(workers: usize, verify_signatures: bool) -> Self {
        Self {
            workers,
            verify_signatures,
            estimates: None,
            timeout: None,
        }
    }

    pub fn with_estimates(mut self, estimates: PreEstimates) -> Self {
        self.estimates = Some(estimates);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn engine(&self) -> ParallelExecutor {
        let mut config = ExecutorConfig::new(bank::store_configs()).with_workers(self.workers);
        if let Some(estimates) = &self.estimates {
            config = config.with_estimates(estimates.clone());
        }
        ParallelExecutor::new(config)
    }
}

impl Executor for BlockStmExecutor {
    fn execute(
        &self,
        mut storage: MemStorage,
        workload: &Workload,
    ) -> Result<(MemStorage, ExecutionResult), BlockStmError> {
        let options = TransferOptions {
            verify_signatures: self.verify_signatures,
            audit_history: workload.config.audit_history,
        };
        let ctx = match self.timeout {
            Some(timeout) => Context::with_timeout(timeout).0,
            None => Context::background(),
        };

        let num_txns = workload.transactions.len();
        let output = self.engine().execute_block(&ctx, num_txns, &mut storage, |txn, view| {
            bank::apply_transfer(view, &workload.transactions[txn], options).map_err(BoxError::from)
        })?;

        for failure in &output.failures {
            debug!(%failure, "transfer rejected");
        }

        let failed = output.failures.len();
        let result = ExecutionResult {
            successful: num_txns - failed,
            failed,
            executions: output.stats.executed,
            validations: output.stats.validated,
        };
        Ok((storage, result))
    }

    fn name(&self) -> &'static str {
        "block_stm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimates::derive_from_workload;
    use crate::{SequentialExecutor, WorkloadConfig};
    use alloy_primitives::U256;
    use proptest::prelude::*;

    fn assert_matches_sequential(workload: &Workload, parallel: &BlockStmExecutor) {
        let (expected, expected_result) = SequentialExecutor::new(parallel.verify_signatures)
            .execute(workload.genesis(), workload)
            .unwrap();
        let (actual, actual_result) = parallel.execute(workload.genesis(), workload).unwrap();

        assert_eq!(actual, expected);
        assert_eq!(actual_result.successful, expected_result.successful);
        assert_eq!(actual_result.failed, expected_result.failed);
        assert!(actual_result.executions >= workload.transactions.len());
    }

    #[test]
    fn test_block_stm_executor() {
        let config = WorkloadConfig {
            num_accounts: 10,
            num_transactions: 20,
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();

        let (_, result) = BlockStmExecutor::new(2, false).execute(workload.genesis(), &workload).unwrap();
        assert_eq!(result.successful, 20);
        assert_eq!(result.failed, 0);
    }

    #[test]
    fn test_matches_sequential_across_conflict_levels() {
        for conflict_factor in [0.0, 0.5, 1.0] {
            for workers in [1, 4] {
                let config = WorkloadConfig {
                    num_accounts: 20,
                    num_transactions: 60,
                    conflict_factor,
                    seed: 7,
                    ..Default::default()
                };
                let workload = Workload::generate(config).unwrap();
                assert_matches_sequential(&workload, &BlockStmExecutor::new(workers, true));
            }
        }
    }

    #[test]
    fn test_history_audits_pass_in_parallel() {
        let config = WorkloadConfig {
            num_accounts: 4,
            num_transactions: 80,
            conflict_factor: 0.9,
            audit_history: true,
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();

        let (_, result) = BlockStmExecutor::new(4, false).execute(workload.genesis(), &workload).unwrap();
        assert_eq!(result.successful, 80);
        assert_matches_sequential(&workload, &BlockStmExecutor::new(4, false));
    }

    #[test]
    fn test_overdrafts_match_sequential() {
        let config = WorkloadConfig {
            num_accounts: 3,
            num_transactions: 60,
            conflict_factor: 1.0,
            initial_balance: U256::from(30),
            transfer_value: U256::from(10),
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();
        assert_matches_sequential(&workload, &BlockStmExecutor::new(4, true));
    }

    #[test]
    fn test_derived_estimates_preserve_result() {
        let config = WorkloadConfig {
            num_accounts: 5,
            num_transactions: 50,
            conflict_factor: 0.8,
            audit_history: true,
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();
        let executor = BlockStmExecutor::new(4, true).with_estimates(derive_from_workload(&workload));
        assert_matches_sequential(&workload, &executor);
    }

    #[test]
    fn test_expired_timeout_commits_nothing() {
        let config = WorkloadConfig {
            num_accounts: 5,
            num_transactions: 10,
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();

        let executor = BlockStmExecutor::new(2, true).with_timeout(Duration::ZERO);
        let err = executor.execute(workload.genesis(), &workload).unwrap_err();
        assert!(matches!(err, BlockStmError::DeadlineExceeded));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_parallel_matches_sequential(
            seed in any::<u64>(),
            conflict_factor in 0.0f64..=1.0,
            workers in 1usize..8,
            audit_history in any::<bool>(),
        ) {
            let config = WorkloadConfig {
                num_accounts: 8,
                num_transactions: 40,
                conflict_factor,
                seed,
                audit_history,
                initial_balance: U256::from(50),
                transfer_value: U256::from(10),
                ..Default::default()
            };
            let workload = Workload::generate(config).unwrap();
            assert_matches_sequential(&workload, &BlockStmExecutor::new(workers, false));
        }
    }
}
