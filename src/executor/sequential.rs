//! Sequential reference executor.

use super::{ExecutionResult, Executor};
use crate::bank::{self, TransferOptions};
use crate::Workload;
use block_stm::{BlockStmError, MemStorage};
use tracing::{debug, info};

/// Applies transfers one at a time, in block order, directly to storage.
///
/// # Example
///
/// ```
/// use block_stm_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default()).unwrap();
/// let executor = SequentialExecutor::new(true);
/// let (_, result) = executor.execute(workload.genesis(), &workload).unwrap();
///
/// assert_eq!(result.successful, 100);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor {
    pub verify_signatures: bool,
}

impl SequentialExecutor {
    pub fn new(verify_signatures: bool) -> Self {
        Self { verify_signatures }
    }
}

impl Executor for SequentialExecutor {
    fn execute(
        &self,
        mut storage: MemStorage,
        workload: &Workload,
    ) -> Result<(MemStorage, ExecutionResult), BlockStmError> {
        let options = TransferOptions {
            verify_signatures: self.verify_signatures,
            audit_history: workload.config.audit_history,
        };

        let mut result = ExecutionResult::default();
        for (txn, tx) in workload.transactions.iter().enumerate() {
            result.executions += 1;
            match bank::apply_transfer(&mut storage, tx, options) {
                Ok(()) => result.successful += 1,
                Err(error) => {
                    debug!(txn, %error, "transfer rejected");
                    result.failed += 1;
                }
            }
        }

        info!(successful = result.successful, failed = result.failed, "sequential execution finished");
        Ok((storage, result))
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkloadConfig;
    use alloy_primitives::U256;

    #[test]
    fn test_sequential_executor_with_verification() {
        let config = WorkloadConfig {
            num_accounts: 10,
            num_transactions: 5,
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();

        let executor = SequentialExecutor::new(true);
        let (_, result) = executor.execute(workload.genesis(), &workload).unwrap();

        assert_eq!(result.successful, 5);
        assert_eq!(result.failed, 0);
        assert_eq!(result.executions, 5);
    }

    #[test]
    fn test_sequential_executor_with_history_audit() {
        let config = WorkloadConfig {
            num_accounts: 3,
            num_transactions: 30,
            conflict_factor: 0.5,
            audit_history: true,
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();

        let (_, result) = SequentialExecutor::new(false).execute(workload.genesis(), &workload).unwrap();
        assert_eq!(result.successful, 30);
    }

    #[test]
    fn test_sequential_executor_counts_overdrafts() {
        let config = WorkloadConfig {
            num_accounts: 2,
            num_transactions: 10,
            initial_balance: U256::from(5),
            transfer_value: U256::from(10),
            ..Default::default()
        };
        let workload = Workload::generate(config).unwrap();
        let genesis = workload.genesis();

        let (after, result) = SequentialExecutor::new(true).execute(genesis.clone(), &workload).unwrap();
        assert_eq!(result.failed, 10);
        assert_eq!(after, genesis);
    }
}
