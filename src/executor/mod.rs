//! Transaction execution strategies.
//!
//! [`SequentialExecutor`] is the reference: it applies transfers one after
//! another straight to storage. [`BlockStmExecutor`] runs the same transfers
//! on the parallel engine and must leave storage in the identical state.

mod parallel;
mod sequential;

pub use parallel::BlockStmExecutor;
pub use sequential::SequentialExecutor;

use crate::Workload;
use block_stm::{BlockStmError, MemStorage};

/// Result of executing a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Transfers that were applied.
    pub successful: usize,
    /// Transfers rejected by a signature, nonce, balance or history check.
    pub failed: usize,
    /// Transaction executions including re-executions.
    pub executions: usize,
    /// Transaction incarnations validated.
    pub validations: usize,
}

impl ExecutionResult {
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }

    /// Executions per transaction; 1.0 means nothing was re-executed.
    pub fn reexecution_ratio(&self) -> f64 {
        if self.total() == 0 {
            return 1.0;
        }
        self.executions as f64 / self.total() as f64
    }
}

/// A strategy for executing a workload's transfers against its genesis state.
pub trait Executor {
    /// Executes every transfer of `workload` on `storage` and returns the
    /// final state.
    fn execute(
        &self,
        storage: MemStorage,
        workload: &Workload,
    ) -> Result<(MemStorage, ExecutionResult), BlockStmError>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}
