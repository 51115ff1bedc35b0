//! Collaborative scheduler handing out execution and validation tasks.
//!
//! Two shared indices walk the block in order: `execution_idx` over
//! transactions ready to run and `validation_idx` over transactions whose
//! latest incarnation has executed. Workers take the lower of the two, so
//! tasks for smaller transactions always come first. Either index is lowered
//! when earlier work has to be redone; `decrease_cnt` counts those moves so
//! that completion is only declared on a quiescent scheduler.
//!
//! Status transitions per transaction:
//!
//! ```text
//! ReadyToExecute(i) --next_task--> Executing(i) --finish_execution--> Executed(i)
//!                                    |      ^                            |
//!                         add_dependency    resume          try_validation_abort
//!                                    v      |                            v
//!                                 Suspended(i)                      Aborting(i)
//!                                                                        |
//!                     ReadyToExecute(i + 1) <----finish_validation-------+
//! ```

use crate::error::{BlockStmError, Result};
use crate::types::{Incarnation, TxnIndex, Version};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Incarnation given to transactions that were force-finished by
/// [`Scheduler::cancel_all`].
pub const CANCELLED_INCARNATION: Incarnation = Incarnation::MAX;

/// Condition a suspended reader parks on until its writer finishes.
pub type DependencyCondvar = Arc<(Mutex<bool>, Condvar)>;

/// Blocks until `condvar` is signalled by [`Scheduler::finish_execution`] or
/// [`Scheduler::cancel_all`].
pub fn wait_for(condvar: &DependencyCondvar) {
    let (lock, cvar) = &**condvar;
    let mut resolved = lock.lock();
    while !*resolved {
        cvar.wait(&mut resolved);
    }
}

/// Work item for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Execute(Version),
    Validate(Version),
}

#[derive(Debug)]
enum TransactionStatus {
    ReadyToExecute(Incarnation),
    Executing(Incarnation),
    Suspended(Incarnation, DependencyCondvar),
    Executed(Incarnation),
    Aborting(Incarnation),
}

/// Counters reported once a block finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Execution tasks completed, re-executions included.
    pub executed: usize,
    /// Incarnations validated. Repeat validations of the same incarnation
    /// count once.
    pub validated: usize,
}

pub struct Scheduler {
    num_txns: usize,

    execution_idx: AtomicUsize,
    validation_idx: AtomicUsize,
    decrease_cnt: AtomicUsize,

    /// Tasks handed out and not yet finished.
    num_active_tasks: AtomicUsize,
    done_marker: AtomicBool,
    cancelled: AtomicBool,

    /// Readers suspended on each transaction.
    txn_dependency: Vec<CachePadded<Mutex<Vec<TxnIndex>>>>,
    txn_status: Vec<CachePadded<Mutex<TransactionStatus>>>,

    executed_txns: AtomicUsize,
    validated_txns: AtomicUsize,
    /// One past the highest incarnation validated, per transaction.
    validated_through: Vec<AtomicUsize>,
}

impl Scheduler {
    pub fn new(num_txns: usize) -> Self {
        Self {
            num_txns,
            execution_idx: AtomicUsize::new(0),
            validation_idx: AtomicUsize::new(0),
            decrease_cnt: AtomicUsize::new(0),
            num_active_tasks: AtomicUsize::new(0),
            done_marker: AtomicBool::new(num_txns == 0),
            cancelled: AtomicBool::new(false),
            txn_dependency: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
            txn_status: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(TransactionStatus::ReadyToExecute(0))))
                .collect(),
            executed_txns: AtomicUsize::new(0),
            validated_txns: AtomicUsize::new(0),
            validated_through: (0..num_txns).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn num_txns(&self) -> usize {
        self.num_txns
    }

    /// Returns the next task, waiting while other workers hold the remaining
    /// work. `None` once the block is done or cancelled.
    pub fn next_task(&self) -> Option<Task> {
        loop {
            if self.done() || self.is_cancelled() {
                return None;
            }

            let idx_to_validate = self.validation_idx.load(Ordering::SeqCst);
            let idx_to_execute = self.execution_idx.load(Ordering::SeqCst);

            if idx_to_validate < idx_to_execute {
                if let Some(version) = self.try_validate_next_version() {
                    return Some(Task::Validate(version));
                }
            } else if let Some(version) = self.try_execute_next_version() {
                return Some(Task::Execute(version));
            }
        }
    }

    /// Records that `version` executed and resumes the readers waiting on it.
    ///
    /// With `wrote_new_location` every higher transaction has to be validated
    /// again; otherwise only this transaction does, and that validation is
    /// handed straight back to the caller when the validation index has
    /// already moved past it.
    pub fn finish_execution(&self, version: Version, wrote_new_location: bool) -> Result<Option<Task>> {
        let txn = version.txn_idx;
        self.executed_txns.fetch_add(1, Ordering::Relaxed);

        let stale = {
            let mut status = self.txn_status[txn].lock();
            match *status {
                TransactionStatus::Executing(incarnation) if incarnation == version.incarnation => {
                    *status = TransactionStatus::Executed(incarnation);
                    false
                }
                _ if self.is_cancelled() => true,
                ref other => {
                    return Err(BlockStmError::SchedulerStuck(format!(
                        "finish_execution of {version} found {other:?}"
                    )));
                }
            }
        };

        let dependents = std::mem::take(&mut *self.txn_dependency[txn].lock());
        for dependent in dependents {
            self.resume(dependent);
        }

        if !stale && self.validation_idx.load(Ordering::SeqCst) > txn {
            if wrote_new_location {
                self.decrease_validation_idx(txn);
            } else {
                return Ok(Some(Task::Validate(version)));
            }
        }

        self.num_active_tasks.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }

    /// Moves `Executed(i)` to `Aborting(i)`. Only one caller per version wins.
    pub fn try_validation_abort(&self, version: Version) -> bool {
        let mut status = self.txn_status[version.txn_idx].lock();
        match *status {
            TransactionStatus::Executed(incarnation) if incarnation == version.incarnation => {
                *status = TransactionStatus::Aborting(incarnation);
                true
            }
            _ => false,
        }
    }

    /// Completes a validation task. After an abort the transaction becomes
    /// ready at the next incarnation, every higher transaction is scheduled
    /// for validation again, and the re-execution is returned to the caller
    /// when the execution index has already passed it.
    pub fn finish_validation(&self, version: Version, aborted: bool) -> Result<Option<Task>> {
        let txn = version.txn_idx;
        if self.validated_through[txn].fetch_max(version.incarnation + 1, Ordering::Relaxed) <= version.incarnation {
            self.validated_txns.fetch_add(1, Ordering::Relaxed);
        }

        if aborted && self.set_aborted_status(txn)? {
            self.decrease_validation_idx(txn + 1);

            if self.execution_idx.load(Ordering::SeqCst) > txn {
                if let Some(incarnation) = self.try_incarnate(txn) {
                    return Ok(Some(Task::Execute(Version::new(txn, incarnation))));
                }
            }
        }

        self.num_active_tasks.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }

    /// Registers `reader` as waiting for `writer`, whose estimate it read.
    ///
    /// Returns the condition to park on, or `None` when the writer has
    /// already executed (or the block was cancelled) and the read should be
    /// retried at once.
    pub fn add_dependency(&self, reader: TxnIndex, writer: TxnIndex) -> Option<DependencyCondvar> {
        let condvar: DependencyCondvar = Arc::new((Mutex::new(false), Condvar::new()));

        let mut dependents = self.txn_dependency[writer].lock();
        // Checked under the lock `cancel_all` drains, so no reader is left behind.
        if self.is_cancelled() || self.is_executed(writer).is_some() {
            return None;
        }
        if !self.suspend(reader, condvar.clone()) {
            return None;
        }
        dependents.push(reader);
        Some(condvar)
    }

    /// Unwinds the block: every transaction not yet executed is marked
    /// executed, `on_cancel` runs for each transaction, and every suspended
    /// reader is woken. Workers stop receiving tasks.
    pub fn cancel_all(&self, on_cancel: impl Fn(TxnIndex)) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        for txn in 0..self.num_txns {
            {
                let mut status = self.txn_status[txn].lock();
                if matches!(
                    *status,
                    TransactionStatus::ReadyToExecute(_) | TransactionStatus::Aborting(_)
                ) {
                    *status = TransactionStatus::Executed(CANCELLED_INCARNATION);
                }
            }
            on_cancel(txn);

            let dependents = std::mem::take(&mut *self.txn_dependency[txn].lock());
            for dependent in dependents {
                self.resume(dependent);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether every transaction executed and validated at its final
    /// incarnation.
    pub fn done(&self) -> bool {
        self.done_marker.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            executed: self.executed_txns.load(Ordering::Relaxed),
            validated: self.validated_txns.load(Ordering::Relaxed),
        }
    }

    fn decrease_validation_idx(&self, target_idx: TxnIndex) {
        if self.validation_idx.fetch_min(target_idx, Ordering::SeqCst) > target_idx {
            self.decrease_cnt.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn try_incarnate(&self, txn: TxnIndex) -> Option<Incarnation> {
        if txn >= self.num_txns {
            return None;
        }
        let mut status = self.txn_status[txn].lock();
        match *status {
            TransactionStatus::ReadyToExecute(incarnation) => {
                *status = TransactionStatus::Executing(incarnation);
                Some(incarnation)
            }
            _ => None,
        }
    }

    fn is_executed(&self, txn: TxnIndex) -> Option<Incarnation> {
        if txn >= self.num_txns {
            return None;
        }
        match *self.txn_status[txn].lock() {
            TransactionStatus::Executed(incarnation) => Some(incarnation),
            _ => None,
        }
    }

    fn try_validate_next_version(&self) -> Option<Version> {
        if self.validation_idx.load(Ordering::SeqCst) >= self.num_txns {
            if !self.check_done() {
                thread::yield_now();
            }
            return None;
        }

        // Counted before the index moves so `check_done` never sees a gap.
        self.num_active_tasks.fetch_add(1, Ordering::SeqCst);
        let idx_to_validate = self.validation_idx.fetch_add(1, Ordering::SeqCst);

        match self.is_executed(idx_to_validate) {
            Some(incarnation) if incarnation != CANCELLED_INCARNATION => {
                Some(Version::new(idx_to_validate, incarnation))
            }
            _ => {
                self.num_active_tasks.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }

    fn try_execute_next_version(&self) -> Option<Version> {
        if self.execution_idx.load(Ordering::SeqCst) >= self.num_txns {
            if !self.check_done() {
                thread::yield_now();
            }
            return None;
        }

        self.num_active_tasks.fetch_add(1, Ordering::SeqCst);
        let idx_to_execute = self.execution_idx.fetch_add(1, Ordering::SeqCst);

        match self.try_incarnate(idx_to_execute) {
            Some(incarnation) => Some(Version::new(idx_to_execute, incarnation)),
            None => {
                self.num_active_tasks.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }

    fn suspend(&self, txn: TxnIndex, condvar: DependencyCondvar) -> bool {
        let mut status = self.txn_status[txn].lock();
        match *status {
            TransactionStatus::Executing(incarnation) => {
                *status = TransactionStatus::Suspended(incarnation, condvar);
                true
            }
            _ => false,
        }
    }

    /// Puts a suspended reader back to executing the same incarnation.
    fn resume(&self, txn: TxnIndex) {
        let mut status = self.txn_status[txn].lock();
        if let TransactionStatus::Suspended(incarnation, condvar) = &*status {
            let (incarnation, condvar) = (*incarnation, condvar.clone());
            *status = TransactionStatus::Executing(incarnation);
            drop(status);

            let (lock, cvar) = &*condvar;
            *lock.lock() = true;
            cvar.notify_one();
        }
    }

    /// `Aborting(i)` becomes `ReadyToExecute(i + 1)`. Returns `false` when
    /// the block was cancelled in between.
    fn set_aborted_status(&self, txn: TxnIndex) -> Result<bool> {
        let mut status = self.txn_status[txn].lock();
        match *status {
            TransactionStatus::Aborting(incarnation) => {
                *status = TransactionStatus::ReadyToExecute(incarnation + 1);
                Ok(true)
            }
            _ if self.is_cancelled() => Ok(false),
            ref other => Err(BlockStmError::SchedulerStuck(format!(
                "finish_validation of transaction {txn} found {other:?}"
            ))),
        }
    }

    /// Sets the done marker once both indices are past the block, no task is
    /// in flight, and no index moved back while this was being checked.
    fn check_done(&self) -> bool {
        let observed_cnt = self.decrease_cnt.load(Ordering::SeqCst);

        let val_idx = self.validation_idx.load(Ordering::SeqCst);
        let exec_idx = self.execution_idx.load(Ordering::SeqCst);
        let num_tasks = self.num_active_tasks.load(Ordering::SeqCst);
        if val_idx.min(exec_idx) < self.num_txns || num_tasks > 0 {
            return false;
        }

        if observed_cnt == self.decrease_cnt.load(Ordering::SeqCst) {
            self.done_marker.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}
