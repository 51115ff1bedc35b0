//! Cancellation and deadline handle passed to block execution.

use crate::error::BlockStmError;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    /// Dropped on cancel, which disconnects `done`.
    sender: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

/// Carries cancellation and an optional deadline into
/// [`crate::ParallelExecutor::execute_block`].
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Self::new(None).0
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        Self::new(None)
    }

    /// A cancellable context that also expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> (Self, CancelHandle) {
        Self::new(Some(Instant::now() + timeout))
    }

    pub fn with_deadline(deadline: Instant) -> (Self, CancelHandle) {
        Self::new(Some(deadline))
    }

    fn new(deadline: Option<Instant>) -> (Self, CancelHandle) {
        let (sender, done) = channel::bounded(0);
        let inner = Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            deadline,
            sender: Mutex::new(Some(sender)),
            done,
        });
        (Self { inner: inner.clone() }, CancelHandle { inner })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Disconnected once the context is cancelled. Use with
    /// `crossbeam::select!`; the deadline is not reflected here.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Why the context ended, if it has.
    pub fn err(&self) -> Option<BlockStmError> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Some(BlockStmError::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(BlockStmError::DeadlineExceeded),
            _ => None,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.sender.lock().take();
    }
}
