//! Worker pool and phase timers on top of a tokio runtime.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Shared worker pool.
///
/// Work items are blocking closures; they run on the runtime's blocking
/// thread pool so a slow store never stalls the timer reactor.
#[derive(Clone, Debug)]
pub struct TaskPool {
    handle: Handle,
}

impl TaskPool {
    /// Creates a pool that runs work on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Pool on the runtime of the calling thread, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Runs `work` on a worker thread.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(work));
    }

    /// Runs `work` on a worker thread once `delay` elapses.
    ///
    /// Dropping or cancelling the returned handle stops a timer that has
    /// not fired yet.
    pub fn schedule_timer<F>(&self, delay: Duration, work: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            pool.spawn(work);
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }
}

/// A pending timer.
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Stops the timer if it has not fired yet.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
