//! Transfer workloads for benchmarking the Block-STM engine.
//!
//! # Architecture
//!
//! - **Workload**: pre-generated secp256k1 accounts and signed transfers
//! - **Bank**: the transfer itself, over an `accounts` and a `history` store
//! - **Executor**: how a workload runs (sequentially, or on the parallel engine)
//! - **Estimates**: write hints, loaded from a JSON file or derived from the
//!   workload
//!
//! # Quick Start
//!
//! ```
//! use block_stm_bench::{BlockStmExecutor, Executor, SequentialExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     conflict_factor: 0.5,
//!     ..Default::default()
//! };
//! let workload = Workload::generate(config).unwrap();
//!
//! let (expected, _) = SequentialExecutor::new(true).execute(workload.genesis(), &workload).unwrap();
//! let (actual, result) = BlockStmExecutor::new(4, true).execute(workload.genesis(), &workload).unwrap();
//!
//! assert_eq!(actual, expected);
//! println!("successful: {}, executions: {}", result.successful, result.executions);
//! ```

pub mod bank;
pub mod estimates;
pub mod executor;
pub mod workload;

pub use bank::{apply_transfer, AccountState, Ledger, TransferError, TransferOptions};
pub use estimates::{derive_from_workload, EstimatesError, EstimatesFile};
pub use executor::{BlockStmExecutor, ExecutionResult, Executor, SequentialExecutor};
pub use workload::{Account, SignedTransaction, Workload, WorkloadConfig, WorkloadError};
