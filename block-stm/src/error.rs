//! Error types for block execution.

use crate::types::{StoreId, TxnIndex};
use thiserror::Error;

/// Error returned by a transaction callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while executing a block.
#[derive(Debug, Error)]
pub enum BlockStmError {
    /// The executor configuration or a runtime store lookup is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A transaction addressed a store that is not part of the block.
    #[error("unknown store {0}")]
    UnknownStore(StoreId),

    /// The caller's context was cancelled before the block completed.
    #[error("block execution cancelled")]
    Cancelled,

    /// The caller's context deadline passed before the block completed.
    #[error("block execution deadline exceeded")]
    DeadlineExceeded,

    /// The scheduler reached a state it should never reach.
    #[error("scheduler stuck: {0}")]
    SchedulerStuck(String),

    /// A worker thread panicked; the block was aborted.
    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },

    /// The transaction callback returned an error at its final incarnation.
    #[error("transaction {txn} failed: {source}")]
    Transaction {
        txn: TxnIndex,
        #[source]
        source: BoxError,
    },
}

impl BlockStmError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BlockStmError::Cancelled | BlockStmError::DeadlineExceeded)
    }
}

pub type Result<T, E = BlockStmError> = std::result::Result<T, E>;
