//! Run context: cancellation and reporter hooks
//!
//! The engine never prints. Front-ends implement [`ProgressCallback`] and
//! [`ConfirmCallback`] to render progress and ask the operator.

use crate::types::{ExecuteSummary, Operation, ResourceOutcome, ResourceStatus};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Shared cancellation flag
///
/// Cloning shares the flag. Sleeping through [`CancelToken::sleep`] wakes
/// up as soon as the token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wakeup) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration`; returns `true` if cancelled before or during
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, wakeup) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = wakeup
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Progress callback for execution
///
/// Only the scheduling thread calls these, so implementations need not be
/// thread-safe beyond `Send`.
pub trait ProgressCallback: Send {
    /// Called once before any entry starts, with the number of changes
    fn on_run_start(&mut self, changes: usize);

    /// Called when an entry is handed to a worker
    fn on_resource_start(&mut self, id: &str, operation: Operation);

    /// Called for every persisted status change
    fn on_transition(&mut self, id: &str, status: ResourceStatus);

    /// Called when an entry reaches its final state for this run
    fn on_resource_complete(&mut self, outcome: &ResourceOutcome);

    /// Called after the last entry
    fn on_run_complete(&mut self, summary: &ExecuteSummary);
}

/// Confirmation callback for operator interaction
pub trait ConfirmCallback {
    /// Ask the operator to confirm; `false` aborts
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _changes: usize) {}
    fn on_resource_start(&mut self, _id: &str, _operation: Operation) {}
    fn on_transition(&mut self, _id: &str, _status: ResourceStatus) {}
    fn on_resource_complete(&mut self, _outcome: &ResourceOutcome) {}
    fn on_run_complete(&mut self, _summary: &ExecuteSummary) {}
}

/// Always confirms
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Always declines
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(false)
    }
}
