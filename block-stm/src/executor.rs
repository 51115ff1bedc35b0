//! Parallel block executor driving the scheduler with a pool of workers.

use crate::context::Context;
use crate::error::{BlockStmError, BoxError, Result};
use crate::estimates::PreEstimates;
use crate::mvmemory::MVMemory;
use crate::read_set::TxnReadSet;
use crate::scheduler::{Scheduler, Stats, Task};
use crate::storage::{Storage, StorageMut};
use crate::types::{StoreConfig, TxnIndex, Version, DEFAULT_CAPTURE_LIMIT};
use crate::view::ExecutionView;
use crossbeam::channel;
use crossbeam::select;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads; 0 uses one per CPU.
    pub workers: usize,
    /// The block's stores. A store's [`crate::StoreId`] is its position here.
    pub stores: Vec<StoreConfig>,
    /// Write locations to seed as estimates before the block starts.
    pub estimates: Option<PreEstimates>,
    /// Largest byte value captured for value-based validation.
    pub capture_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            stores: Vec::new(),
            estimates: None,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

impl ExecutorConfig {
    pub fn new(stores: Vec<StoreConfig>) -> Self {
        Self {
            stores,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_estimates(mut self, estimates: PreEstimates) -> Self {
        self.estimates = Some(estimates);
        self
    }

    pub fn with_capture_limit(mut self, capture_limit: usize) -> Self {
        self.capture_limit = capture_limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stores.is_empty() {
            return Err(BlockStmError::InvalidConfiguration("no stores configured".into()));
        }
        if self.stores.len() > usize::from(u16::MAX) {
            return Err(BlockStmError::InvalidConfiguration(format!(
                "{} stores configured",
                self.stores.len()
            )));
        }
        let mut names = HashSet::new();
        for store in &self.stores {
            if !names.insert(store.name.as_str()) {
                return Err(BlockStmError::InvalidConfiguration(format!(
                    "duplicate store name {:?}",
                    store.name
                )));
            }
        }
        Ok(())
    }

    /// Worker threads used for a block of `num_txns` transactions.
    pub fn effective_workers(&self, num_txns: usize) -> usize {
        let workers = if self.workers == 0 { num_cpus::get() } else { self.workers };
        workers.clamp(1, num_txns.max(1))
    }
}

/// Result of a completed block.
#[derive(Debug)]
pub struct BlockOutput {
    pub stats: Stats,
    /// [`BlockStmError::Transaction`] for each transaction whose final
    /// incarnation returned an error, by transaction index.
    pub failures: Vec<BlockStmError>,
}

/// State shared by the workers of one block.
struct Block<'a, F> {
    memory: &'a MVMemory<'a>,
    scheduler: &'a Scheduler,
    run: &'a F,
    /// Error returned by the latest incarnation of each transaction.
    failures: Vec<Mutex<Option<BoxError>>>,
    fatal: Mutex<Option<BlockStmError>>,
}

impl<'a, F> Block<'a, F>
where
    F: Fn(TxnIndex, &mut ExecutionView<'_>) -> std::result::Result<(), BoxError> + Sync,
{
    fn cancel(&self) {
        self.scheduler.cancel_all(|txn| self.memory.clear_estimates(txn));
    }

    fn fail(&self, error: BlockStmError) {
        warn!(%error, "aborting block");
        self.fatal.lock().get_or_insert(error);
        self.cancel();
    }

    fn worker_loop(&self, worker_id: usize) -> Result<()> {
        let mut local_executions = 0usize;
        let mut local_validations = 0usize;
        let mut read_set: Option<TxnReadSet> = None;

        let mut task = self.scheduler.next_task();
        while let Some(current) = task {
            task = match current {
                Task::Execute(version) => {
                    local_executions += 1;
                    if local_executions % 1000 == 0 {
                        let stats = self.scheduler.stats();
                        debug!(
                            worker_id,
                            local_executions,
                            executed = stats.executed,
                            validated = stats.validated,
                            "worker progress"
                        );
                    }
                    self.try_execute(version, &mut read_set)?
                }
                Task::Validate(version) => {
                    local_validations += 1;
                    self.needs_reexecution(version)?
                }
            }
            .or_else(|| self.scheduler.next_task());
        }

        debug!(worker_id, local_executions, local_validations, "worker finished");
        Ok(())
    }

    fn try_execute(&self, version: Version, read_set: &mut Option<TxnReadSet>) -> Result<Option<Task>> {
        let txn = version.txn_idx;
        let mut view = ExecutionView::new(version, self.memory, self.scheduler, read_set.take().unwrap_or_default());

        let result = (self.run)(txn, &mut view);
        if let Err(error) = &result {
            debug!(%version, %error, "transaction returned an error, dropping its writes");
            view.discard_writes();
        }
        let (wrote_new_location, recorded) = view.apply_writes();
        *read_set = self.memory.record_read_set(txn, recorded);

        *self.failures[txn].lock() = result.err();

        self.scheduler.finish_execution(version, wrote_new_location)
    }

    fn needs_reexecution(&self, version: Version) -> Result<Option<Task>> {
        let txn = version.txn_idx;
        let aborted = !self.memory.validate_read_set(txn) && self.scheduler.try_validation_abort(version);
        if aborted {
            self.memory.convert_writes_to_estimates(txn);
        }
        self.scheduler.finish_validation(version, aborted)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Parallel Block-STM executor.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes transactions `0..num_txns` with `run` and commits the result
    /// to `storage`, which ends up exactly as if the transactions had run one
    /// after another in index order.
    ///
    /// Transaction errors do not stop the block; they are reported in
    /// [`BlockOutput::failures`] and the failing transaction's writes are
    /// dropped. On cancellation, a worker panic or an
    /// internal error nothing is written to `storage`.
    pub fn execute_block<S, F>(&self, ctx: &Context, num_txns: usize, storage: &mut S, run: F) -> Result<BlockOutput>
    where
        S: StorageMut,
        F: Fn(TxnIndex, &mut ExecutionView<'_>) -> std::result::Result<(), BoxError> + Sync,
    {
        self.config.validate()?;
        if let Some(error) = ctx.err() {
            return Err(error);
        }

        let start = Instant::now();
        let workers = self.config.effective_workers(num_txns);
        info!(num_txns, workers, stores = self.config.stores.len(), "executing block");

        let (changes, stats, failures) = {
            let base: &dyn Storage = &*storage;
            let memory = MVMemory::new(num_txns, &self.config.stores, self.config.capture_limit, base);
            if let Some(estimates) = &self.config.estimates {
                memory.seed_estimates(estimates)?;
            }
            let scheduler = Scheduler::new(num_txns);

            let block = Block {
                memory: &memory,
                scheduler: &scheduler,
                run: &run,
                failures: (0..num_txns).map(|_| Mutex::new(None)).collect(),
                fatal: Mutex::new(None),
            };
            self.run_workers(ctx, &block, workers);

            if let Some(error) = block.fatal.lock().take() {
                return Err(error);
            }
            if scheduler.is_cancelled() || !scheduler.done() {
                let error = ctx.err().unwrap_or_else(|| {
                    BlockStmError::SchedulerStuck("workers exited before the block was done".into())
                });
                warn!(%error, elapsed_ms = start.elapsed().as_millis() as u64, "block not committed");
                return Err(error);
            }

            let failures: Vec<BlockStmError> = block
                .failures
                .into_iter()
                .enumerate()
                .filter_map(|(txn, slot)| {
                    slot.into_inner()
                        .map(|source| BlockStmError::Transaction { txn, source })
                })
                .collect();
            (memory.snapshot()?, scheduler.stats(), failures)
        };

        let written = changes.len();
        changes.apply_to(storage);

        info!(
            num_txns,
            executed = stats.executed,
            validated = stats.validated,
            failures = failures.len(),
            written,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "block executed"
        );
        Ok(BlockOutput { stats, failures })
    }

    fn run_workers<F>(&self, ctx: &Context, block: &Block<'_, F>, workers: usize)
    where
        F: Fn(TxnIndex, &mut ExecutionView<'_>) -> std::result::Result<(), BoxError> + Sync,
    {
        thread::scope(|s| {
            let (finished, finished_rx) = channel::bounded::<()>(0);

            s.spawn(move || {
                let deadline = ctx
                    .deadline()
                    .map(|deadline| channel::after(deadline.saturating_duration_since(Instant::now())))
                    .unwrap_or_else(channel::never);
                select! {
                    recv(ctx.done()) -> _ => {}
                    recv(deadline) -> _ => {}
                    recv(finished_rx) -> _ => return,
                }
                warn!("context ended, cancelling block");
                block.cancel();
            });

            let handles: Vec<_> = (0..workers)
                .map(|worker_id| {
                    s.spawn(move || {
                        match panic::catch_unwind(AssertUnwindSafe(|| block.worker_loop(worker_id))) {
                            Ok(Ok(())) => {}
                            Ok(Err(error)) => block.fail(error),
                            Err(payload) => block.fail(BlockStmError::WorkerPanicked {
                                worker: worker_id,
                                message: panic_message(payload.as_ref()),
                            }),
                        }
                    })
                })
                .collect();

            for handle in handles {
                // Panics are caught inside the worker.
                let _ = handle.join();
            }
            drop(finished);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use crate::types::{Direction, Incarnation, Key, KeyRange, StoreId, Value};
    use crate::view::StoreView;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const A: StoreId = StoreId(0);

    fn key(s: &str) -> Key {
        s.as_bytes().into()
    }

    fn executor(workers: usize) -> ParallelExecutor {
        ParallelExecutor::new(ExecutorConfig::new(vec![StoreConfig::bytes("a")]).with_workers(workers))
    }

    fn get(storage: &MemStorage, k: &str) -> Option<Vec<u8>> {
        storage
            .store(A)
            .and_then(|store| store.get(k.as_bytes()))
            .and_then(|value| value.as_bytes().map(<[u8]>::to_vec))
    }

    #[test]
    fn test_no_conflict_block() {
        for workers in [1, 2, 4, 8] {
            let mut storage = MemStorage::new(1);
            let output = executor(workers)
                .execute_block(&Context::background(), 10, &mut storage, |txn, view| {
                    view.store(A)?.set(format!("k_{txn}").as_bytes(), vec![txn as u8]);
                    Ok(())
                })
                .unwrap();

            for txn in 0..10 {
                assert_eq!(get(&storage, &format!("k_{txn}")), Some(vec![txn as u8]));
            }
            assert_eq!(output.stats.executed, 10);
            assert!(output.failures.is_empty());
            assert_eq!(output.stats.validated, 10);
        }
    }

    #[test]
    fn test_serial_dependency() {
        for workers in [1, 4, 16] {
            let mut storage = MemStorage::new(1);
            executor(workers)
                .execute_block(&Context::background(), 10, &mut storage, |txn, view| {
                    let mut store = view.store(A)?;
                    let previous = store.get(b"x");
                    if txn > 0 && previous != Some(Value::from(vec![txn as u8 - 1])) {
                        store.set(b"gap", vec![txn as u8]);
                    }
                    store.set(b"x", vec![txn as u8]);
                    Ok(())
                })
                .unwrap();

            assert_eq!(get(&storage, "x"), Some(vec![9]));
            assert_eq!(get(&storage, "gap"), None, "a transaction committed a stale read");
        }
    }

    #[test]
    fn test_aba_block() {
        for workers in [1, 3] {
            let mut storage = MemStorage::new(1);
            storage.set(A, key("x"), Value::from(vec![0x01]));
            let output = executor(workers)
                .execute_block(&Context::background(), 3, &mut storage, |txn, view| {
                    let mut store = view.store(A)?;
                    match txn {
                        0 => store.set(b"x", vec![0x02]),
                        1 => store.set(b"x", vec![0x01]),
                        _ => {
                            let value = store.get(b"x").ok_or("x missing")?;
                            store.set(b"y", value);
                        }
                    }
                    Ok(())
                })
                .unwrap();

            assert_eq!(get(&storage, "y"), Some(vec![0x01]));
            if workers == 1 {
                assert_eq!(output.stats.executed, 3);
            }
        }
    }

    #[test]
    fn test_iterator_sees_earlier_inserts() {
        const N: usize = 40;
        let mut storage = MemStorage::new(1);
        executor(4)
            .execute_block(&Context::background(), N, &mut storage, |txn, view| {
                let mut store = view.store(A)?;
                store.set(format!("iter/{txn:08}").as_bytes(), vec![1]);
                let seen: Vec<u8> = store
                    .iterator(KeyRange::prefix(b"iter/"), Direction::Ascending)
                    .take(10)
                    .flat_map(|(k, _)| k.to_vec())
                    .collect();
                store.set(format!("seen/{txn:08}").as_bytes(), seen);
                Ok(())
            })
            .unwrap();

        for txn in 0..N {
            assert_eq!(get(&storage, &format!("iter/{txn:08}")), Some(vec![1]));
            let expected: Vec<u8> = (0..=txn.min(9))
                .flat_map(|i| format!("iter/{i:08}").into_bytes())
                .collect();
            assert_eq!(get(&storage, &format!("seen/{txn:08}")), Some(expected));
        }
    }

    #[test]
    fn test_pre_estimates() {
        const N: usize = 12;
        for workers in [1, 4] {
            let mut storage = MemStorage::new(1);
            let config = ExecutorConfig::new(vec![StoreConfig::bytes("a")])
                .with_workers(workers)
                .with_estimates(PreEstimates::new().with(5, A, b"x".as_slice()).with(7, A, b"never".as_slice()));
            let output = ParallelExecutor::new(config)
                .execute_block(&Context::background(), N, &mut storage, |txn, view| {
                    let mut store = view.store(A)?;
                    if txn == 5 {
                        store.set(b"x", vec![5]);
                    } else {
                        let seen = store.get(b"x").and_then(|v| v.as_bytes().map(<[u8]>::to_vec));
                        let _ = store.get(b"never");
                        store.set(format!("out/{txn:02}").as_bytes(), seen.unwrap_or_default());
                    }
                    Ok(())
                })
                .unwrap();

            for txn in (0..N).filter(|txn| *txn != 5) {
                let expected = if txn > 5 { vec![5] } else { vec![] };
                assert_eq!(get(&storage, &format!("out/{txn:02}")), Some(expected));
            }
            assert_eq!(get(&storage, "never"), None);
            // Readers of x wait for 5 instead of running ahead and aborting.
            assert_eq!(output.stats.executed, N);
        }
    }

    #[test]
    fn test_cancellation_unblocks_and_leaves_storage() {
        let mut storage = MemStorage::new(1);
        storage.set(A, key("x"), Value::from(vec![1]));
        let before = storage.clone();

        let (ctx, handle) = Context::with_cancel();
        let config = ExecutorConfig::new(vec![StoreConfig::bytes("a")])
            .with_workers(4)
            .with_estimates(PreEstimates::new().with(0, A, b"x".as_slice()));

        let start = Instant::now();
        let result = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                handle.cancel();
            });
            ParallelExecutor::new(config).execute_block(&ctx, 8, &mut storage, |txn, view| {
                if txn == 0 {
                    // Never completes on its own.
                    while !ctx.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                let mut store = view.store(A)?;
                let _ = store.get(b"x");
                store.set(b"x", vec![txn as u8]);
                Ok(())
            })
        });

        assert!(matches!(result, Err(BlockStmError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(storage, before);
    }

    #[test]
    fn test_deadline_exceeded() {
        let mut storage = MemStorage::new(1);
        let (ctx, _handle) = Context::with_timeout(Duration::from_millis(10));
        let result = executor(2).execute_block(&ctx, 4, &mut storage, |_, _| {
            thread::sleep(Duration::from_millis(50));
            Ok(())
        });
        assert!(matches!(result, Err(BlockStmError::DeadlineExceeded)));
        assert_eq!(storage, MemStorage::new(1));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();
        let result = executor(2).execute_block(&ctx, 4, &mut MemStorage::new(1), |_, _| Ok(()));
        assert!(matches!(result, Err(BlockStmError::Cancelled)));
    }

    #[test]
    fn test_worker_panic_aborts_block() {
        let mut storage = MemStorage::new(1);
        let result = executor(3).execute_block(&Context::background(), 6, &mut storage, |txn, view| {
            view.store(A)?.set(b"x", vec![txn as u8]);
            if txn == 3 {
                panic!("boom");
            }
            Ok(())
        });
        match result {
            Err(BlockStmError::WorkerPanicked { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(storage, MemStorage::new(1));
    }

    #[test]
    fn test_transaction_errors_are_collected() {
        let mut storage = MemStorage::new(1);
        let output = executor(4)
            .execute_block(&Context::background(), 8, &mut storage, |txn, view| {
                view.store(A)?.set(format!("k{txn}").as_bytes(), vec![txn as u8]);
                if txn % 3 == 0 {
                    return Err(format!("txn {txn} rejected").into());
                }
                if txn == 7 {
                    view.store(StoreId(9))?;
                }
                Ok(())
            })
            .unwrap();

        let failed: Vec<TxnIndex> = output
            .failures
            .iter()
            .map(|failure| match failure {
                BlockStmError::Transaction { txn, .. } => *txn,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(failed, vec![0, 3, 6, 7]);
        assert!(output.failures[3].to_string().contains("unknown store"));
        // Writes of failed transactions are dropped.
        for txn in [0, 3, 6, 7] {
            assert_eq!(get(&storage, &format!("k{txn}")), None);
        }
        assert_eq!(get(&storage, "k1"), Some(vec![1]));
    }

    #[test]
    fn test_failed_transaction_does_not_shadow_earlier_write() {
        for workers in [1, 2] {
            let mut storage = MemStorage::new(1);
            let output = executor(workers)
                .execute_block(&Context::background(), 2, &mut storage, |txn, view| {
                    view.store(A)?.set(b"k", vec![txn as u8]);
                    if txn == 1 {
                        return Err("rejected".into());
                    }
                    Ok(())
                })
                .unwrap();

            assert_eq!(get(&storage, "k"), Some(vec![0]));
            assert_eq!(output.failures.len(), 1);
        }
    }

    #[test]
    fn test_config_validation() {
        let mut storage = MemStorage::new(1);
        let run = |_: TxnIndex, _: &mut ExecutionView<'_>| -> std::result::Result<(), BoxError> { Ok(()) };

        let empty = ParallelExecutor::new(ExecutorConfig::default());
        assert!(matches!(
            empty.execute_block(&Context::background(), 1, &mut storage, run),
            Err(BlockStmError::InvalidConfiguration(_))
        ));

        let duplicate = ParallelExecutor::new(ExecutorConfig::new(vec![
            StoreConfig::bytes("a"),
            StoreConfig::object("a"),
        ]));
        assert!(matches!(
            duplicate.execute_block(&Context::background(), 1, &mut storage, run),
            Err(BlockStmError::InvalidConfiguration(_))
        ));

        let estimates = ParallelExecutor::new(
            ExecutorConfig::new(vec![StoreConfig::bytes("a")])
                .with_estimates(PreEstimates::new().with(4, A, b"x".as_slice())),
        );
        assert!(matches!(
            estimates.execute_block(&Context::background(), 4, &mut storage, run),
            Err(BlockStmError::InvalidConfiguration(_))
        ));

        let config = ExecutorConfig::new(vec![StoreConfig::bytes("a")]).with_workers(64);
        assert_eq!(config.effective_workers(3), 3);
        assert_eq!(config.effective_workers(0), 1);
        assert!(ExecutorConfig::new(vec![StoreConfig::bytes("a")]).effective_workers(1000) >= 1);
    }

    #[test]
    fn test_object_store_values() {
        let mut storage = MemStorage::new(2);
        let config = ExecutorConfig::new(vec![StoreConfig::bytes("a"), StoreConfig::object("objects")]).with_workers(4);
        ParallelExecutor::new(config)
            .execute_block(&Context::background(), 20, &mut storage, |txn, view| {
                let mut objects = view.store(StoreId(1))?;
                let total = objects
                    .get(b"sum")
                    .and_then(|value| value.downcast_ref::<u64>().copied())
                    .unwrap_or(0);
                objects.set(b"sum", Value::object(total + txn as u64));
                Ok(())
            })
            .unwrap();

        let sum = storage
            .store(StoreId(1))
            .and_then(|store| store.get(b"sum".as_slice()))
            .and_then(|value| value.downcast_ref::<u64>().copied());
        assert_eq!(sum, Some((0..20).sum()));
    }

    #[test]
    fn test_incarnations_increase() {
        const N: usize = 30;
        let attempts: Vec<Mutex<Vec<Incarnation>>> = (0..N).map(|_| Mutex::new(Vec::new())).collect();
        let mut storage = MemStorage::new(1);
        executor(8)
            .execute_block(&Context::background(), N, &mut storage, |txn, view| {
                attempts[txn].lock().push(view.incarnation());
                let mut store = view.store(A)?;
                let counter = store.get(b"counter").and_then(|v| v.as_bytes().map(|b| b[0])).unwrap_or(0);
                store.set(b"counter", vec![counter.wrapping_add(1)]);
                Ok(())
            })
            .unwrap();

        assert_eq!(get(&storage, "counter"), Some(vec![N as u8]));
        for incarnations in &attempts {
            let incarnations = incarnations.lock();
            assert!(!incarnations.is_empty());
            assert!(incarnations.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    /// Operations of a generated transaction over a handful of keys.
    #[derive(Debug, Clone)]
    enum Op {
        Read(u8),
        Write(u8),
        Delete(u8),
        Scan(u8),
    }

    const KEYS: u8 = 6;

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..KEYS).prop_map(Op::Read),
            (0..KEYS).prop_map(Op::Write),
            (0..KEYS).prop_map(Op::Delete),
            (1..4u8).prop_map(Op::Scan),
        ]
    }

    fn block() -> impl Strategy<Value = Vec<Vec<Op>>> {
        prop::collection::vec(prop::collection::vec(op(), 1..6), 1..40)
    }

    /// The same store operations over an engine view and over a plain map.
    trait Kv {
        fn get(&mut self, key: &[u8]) -> Option<Value>;
        fn set(&mut self, key: &[u8], value: Vec<u8>);
        fn delete(&mut self, key: &[u8]);
        fn scan(&mut self, limit: usize) -> Vec<Key>;
    }

    impl Kv for StoreView<'_, '_> {
        fn get(&mut self, key: &[u8]) -> Option<Value> {
            StoreView::get(self, key)
        }

        fn set(&mut self, key: &[u8], value: Vec<u8>) {
            StoreView::set(self, key, value)
        }

        fn delete(&mut self, key: &[u8]) {
            StoreView::delete(self, key)
        }

        fn scan(&mut self, limit: usize) -> Vec<Key> {
            self.iterator(KeyRange::full(), Direction::Ascending)
                .take(limit)
                .map(|(k, _)| k)
                .collect()
        }
    }

    impl Kv for BTreeMap<Key, Value> {
        fn get(&mut self, key: &[u8]) -> Option<Value> {
            BTreeMap::get(self, key).cloned()
        }

        fn set(&mut self, key: &[u8], value: Vec<u8>) {
            self.insert(key.into(), value.into());
        }

        fn delete(&mut self, key: &[u8]) {
            self.remove(key);
        }

        fn scan(&mut self, limit: usize) -> Vec<Key> {
            self.keys().take(limit).cloned().collect()
        }
    }

    fn apply_ops(txn: TxnIndex, ops: &[Op], kv: &mut impl Kv) {
        let mut acc = txn as u64;
        for op in ops {
            match op {
                Op::Read(k) => {
                    let byte = kv.get(&[b'k', *k]).and_then(|v| v.as_bytes().map(|b| b[0])).unwrap_or(0);
                    acc = acc.wrapping_mul(31).wrapping_add(byte as u64);
                }
                Op::Write(k) => kv.set(&[b'k', *k], vec![acc as u8, txn as u8]),
                Op::Delete(k) => kv.delete(&[b'k', *k]),
                Op::Scan(limit) => {
                    for key in kv.scan(*limit as usize) {
                        acc = acc.wrapping_mul(17).wrapping_add(key[1] as u64);
                    }
                }
            }
        }
    }

    fn genesis() -> MemStorage {
        let mut storage = MemStorage::new(1);
        for k in 0..3u8 {
            storage.set(A, vec![b'k', k].into(), Value::from(vec![k + 1]));
        }
        storage
    }

    fn sequential(ops: &[Vec<Op>]) -> BTreeMap<Key, Value> {
        let mut state = genesis().store(A).cloned().unwrap_or_default();
        for (txn, txn_ops) in ops.iter().enumerate() {
            apply_ops(txn, txn_ops, &mut state);
        }
        state
    }

    fn parallel(ops: &[Vec<Op>], workers: usize) -> BTreeMap<Key, Value> {
        let mut storage = genesis();
        executor(workers)
            .execute_block(&Context::background(), ops.len(), &mut storage, |txn, view| {
                apply_ops(txn, &ops[txn], &mut view.store(A)?);
                Ok(())
            })
            .unwrap();
        storage.store(A).cloned().unwrap_or_default()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_matches_sequential(ops in block(), workers in 1usize..9) {
            prop_assert_eq!(parallel(&ops, workers), sequential(&ops));
        }

        #[test]
        fn prop_independent_of_worker_count(ops in block()) {
            let expected = parallel(&ops, 1);
            for workers in [2, 5, 32] {
                prop_assert_eq!(&parallel(&ops, workers), &expected);
            }
        }
    }
}
