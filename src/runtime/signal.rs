//! The interruption primitive and per-task bookkeeping.
//!
//! Every interpreter task carries an [`InterruptSignal`]: a raisable flag
//! observed cooperatively at trampoline checkpoints, inside blocking waits,
//! and by cancellation-aware thunks such as `Effect::sleep`. Raising the
//! signal never preempts anything; it marks the task so the next
//! cooperative check unwinds with the structural cancellation error.
//!
//! The currently running task is recorded in a thread-local (saved and
//! restored on nested entry, since a synchronous `run` may be issued from
//! inside another task). Blocking primitives consult it through
//! [`current_task_cancelled`] so they can abort waits when their own task
//! is interrupted, wherever in the tree the wait happens.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::runtime::context::ExecutionContext;

/// Granularity of cooperative blocking waits.
///
/// Blocked joins, scope waits, and latch waits re-check interruption at
/// this interval, bounding how stale a cancellation can go unnoticed.
pub(crate) const WAIT_TICK: Duration = Duration::from_millis(5);

/// Granularity of cooperative sleeps.
pub(crate) const SLEEP_SLICE: Duration = Duration::from_millis(10);

// =============================================================================
// InterruptSignal
// =============================================================================

/// A per-task signal that can be raised externally and observed
/// cooperatively.
#[derive(Clone)]
pub struct InterruptSignal {
    raised: Arc<AtomicBool>,
}

impl InterruptSignal {
    /// Creates an unraised signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raises the signal. Idempotent.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// `true` once the signal has been raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterruptSignal {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InterruptSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}

// =============================================================================
// Current-task binding
// =============================================================================

/// What a running interpreter task knows about itself.
pub(crate) struct TaskState {
    pub(crate) context: Arc<ExecutionContext>,
    pub(crate) signal: InterruptSignal,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskState>> = const { RefCell::new(None) };
}

/// Binds the current thread to a task for the duration of the guard.
///
/// The previous binding, if any, is restored on drop so that synchronous
/// runs nested inside a task do not lose their caller's identity.
pub(crate) fn enter_task(state: TaskState) -> TaskGuard {
    let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace(state));
    TaskGuard { previous }
}

pub(crate) struct TaskGuard {
    previous: Option<TaskState>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
    }
}

/// `true` when the thread's current task has been interrupted or its
/// context cancelled. Threads outside any task are never cancelled.
pub(crate) fn current_task_cancelled() -> bool {
    CURRENT_TASK.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|task| task.signal.is_raised() || task.context.is_cancelled())
    })
}

// =============================================================================
// CompletionLatch
// =============================================================================

/// A one-shot completion latch for asynchronous runs.
///
/// The running task completes it exactly once; any number of callers may
/// block on it, with or without a timeout.
pub(crate) struct CompletionLatch {
    completed: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionLatch {
    pub(crate) fn new() -> Self {
        Self {
            completed: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self) {
        let mut completed = self.completed.lock();
        *completed = true;
        self.condvar.notify_all();
    }

    pub(crate) fn is_completed(&self) -> bool {
        *self.completed.lock()
    }

    /// Blocks until the latch completes.
    pub(crate) fn wait(&self) {
        let mut completed = self.completed.lock();
        while !*completed {
            self.condvar.wait(&mut completed);
        }
    }

    /// Blocks until the latch completes or the timeout elapses.
    ///
    /// Returns `true` when the latch completed within the timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut completed = self.completed.lock();
        while !*completed {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.condvar.wait_for(&mut completed, deadline - now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::thread;

    #[rstest]
    fn signal_starts_unraised_and_raises_idempotently() {
        let signal = InterruptSignal::new();
        assert!(!signal.is_raised());
        signal.raise();
        signal.raise();
        assert!(signal.is_raised());
    }

    #[rstest]
    fn signal_clones_share_state() {
        let signal = InterruptSignal::new();
        let clone = signal.clone();
        clone.raise();
        assert!(signal.is_raised());
    }

    #[rstest]
    fn no_task_means_never_cancelled() {
        assert!(!current_task_cancelled());
    }

    #[rstest]
    fn task_binding_observes_signal_and_restores_previous() {
        let context = ExecutionContext::root();
        let outer = InterruptSignal::new();
        let _outer_guard = enter_task(TaskState {
            context: context.clone(),
            signal: outer.clone(),
        });
        assert!(!current_task_cancelled());

        {
            let inner = InterruptSignal::new();
            let _inner_guard = enter_task(TaskState {
                context: context.clone(),
                signal: inner.clone(),
            });
            inner.raise();
            assert!(current_task_cancelled());
        }

        // Back on the outer task, which was never interrupted.
        assert!(!current_task_cancelled());
        outer.raise();
        assert!(current_task_cancelled());
    }

    #[rstest]
    fn task_binding_observes_context_cancellation() {
        let context = ExecutionContext::root();
        let _guard = enter_task(TaskState {
            context: context.clone(),
            signal: InterruptSignal::new(),
        });
        assert!(!current_task_cancelled());
        context.cancel();
        assert!(current_task_cancelled());
    }

    #[rstest]
    fn latch_wait_timeout_reports_completion() {
        let latch = Arc::new(CompletionLatch::new());
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        assert!(!latch.is_completed());

        let latch_clone = latch.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            latch_clone.complete();
        });

        assert!(latch.wait_timeout(Duration::from_secs(5)));
        latch.wait();
        assert!(latch.is_completed());
    }
}
