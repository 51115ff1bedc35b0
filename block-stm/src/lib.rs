//! Block-STM parallel execution engine for ordered blocks of transactions.
//!
//! Transactions run optimistically on a pool of worker threads against a
//! multi-version view of a set of named key-value stores. Every read is
//! recorded and validated once the transactions before it have executed;
//! transactions whose reads were invalidated run again. The committed state
//! is identical to executing the block sequentially in index order.
//!
//! # Core Components
//!
//! - **MVMemory**: per-store multi-version maps of the values written by each
//!   transaction, with estimate markers for writers that are being re-run
//! - **Scheduler**: hands out execution and validation tasks in index order
//!   and parks readers that hit an estimate until its writer finishes
//! - **ExecutionView**: what a transaction reads and writes through, including
//!   ordered range iteration that merges memory with the backing storage
//! - **ParallelExecutor**: runs the worker pool and commits the final snapshot
//!
//! # Example
//!
//! ```rust
//! use block_stm::{Context, ExecutorConfig, MemStorage, ParallelExecutor, StoreConfig, StoreId};
//!
//! let config = ExecutorConfig::new(vec![StoreConfig::bytes("balances")]).with_workers(4);
//! let mut storage = MemStorage::new(1);
//!
//! let output = ParallelExecutor::new(config)
//!     .execute_block(&Context::background(), 100, &mut storage, |txn, view| {
//!         let mut balances = view.store(StoreId(0))?;
//!         let total = balances.get(b"total").and_then(|v| v.as_bytes().map(|b| b[0])).unwrap_or(0);
//!         balances.set(b"total", vec![total.wrapping_add(txn as u8)]);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert!(output.stats.executed >= 100);
//! ```

pub mod context;
pub mod error;
pub mod estimates;
pub mod executor;
mod iterator;
pub mod key_set;
pub mod mvmemory;
pub mod mvstore;
pub mod read_set;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod version_tree;
pub mod view;

pub use context::{CancelHandle, Context};
pub use error::{BlockStmError, BoxError, Result};
pub use estimates::PreEstimates;
pub use executor::{BlockOutput, ExecutorConfig, ParallelExecutor};
pub use scheduler::Stats;
pub use storage::{ChangeSet, MemStorage, Storage, StorageMut};
pub use types::{
    Direction, Incarnation, Key, KeyRange, StoreConfig, StoreId, StoreKind, TxnIndex, Value, Version,
    DEFAULT_CAPTURE_LIMIT,
};
pub use view::{ExecutionView, StoreIterator, StoreView};
