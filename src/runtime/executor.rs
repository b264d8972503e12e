//! Task executors.
//!
//! The runtime is agnostic about where its tasks run: anything that can
//! take a boxed thunk and run it on its own thread of execution is an
//! [`Executor`]. A task hosts one interpreter loop from start to finish and
//! may block (on joins, scope waits, or sleeping thunks), so executors must
//! tolerate blocking tasks and accommodate at least as many concurrent
//! tasks as the program forks at its peak.
//!
//! Two implementations ship with the crate:
//!
//! - [`ThreadExecutor`]: one named OS thread per task. The default; every
//!   task can block indefinitely without starving any other.
//! - [`TokioExecutor`] (feature `tokio`): dispatches onto the blocking
//!   pool of a shared multi-thread tokio runtime, for applications that
//!   already live inside tokio.

use std::sync::atomic::{AtomicU64, Ordering};

/// A boxed, parameterless unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Spawns tasks on lightweight threads of execution.
pub trait Executor: Send + Sync {
    /// Runs the task on a thread of this executor's choosing.
    ///
    /// The call returns without waiting for the task to finish.
    fn execute(&self, task: Task);
}

// =============================================================================
// ThreadExecutor
// =============================================================================

/// Thread-per-task executor.
///
/// Each task gets its own named OS thread, so blocking tasks never starve
/// one another.
pub struct ThreadExecutor {
    counter: AtomicU64,
}

impl ThreadExecutor {
    /// Creates a new thread-per-task executor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) {
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("filament-worker-{index}"))
            .spawn(task)
            .expect("failed to spawn effect worker thread");
    }
}

impl std::fmt::Debug for ThreadExecutor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ThreadExecutor")
            .field("spawned", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// TokioExecutor (feature "tokio")
// =============================================================================

#[cfg(feature = "tokio")]
mod tokio_executor {
    use super::{Executor, Task};
    use std::sync::LazyLock;
    use tokio::runtime::Runtime;

    /// Shared multi-thread runtime, initialised lazily on first dispatch
    /// and never dropped.
    static SHARED_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get())
            .thread_name("filament-tokio")
            .enable_all()
            .build()
            .expect("failed to create shared tokio runtime")
    });

    /// Executor backed by a shared tokio runtime's blocking pool.
    ///
    /// Interpreter tasks block, so they are dispatched with
    /// `spawn_blocking` rather than as async tasks. The blocking pool has
    /// a bounded thread count; programs that fork more simultaneously
    /// blocking fibers than the pool admits should prefer
    /// [`ThreadExecutor`](super::ThreadExecutor).
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TokioExecutor;

    impl TokioExecutor {
        /// Creates a tokio-backed executor.
        #[must_use]
        pub const fn new() -> Self {
            Self
        }
    }

    impl Executor for TokioExecutor {
        fn execute(&self, task: Task) {
            // Prefer the ambient runtime when one is present.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn_blocking(task);
            } else {
                SHARED_RUNTIME.spawn_blocking(task);
            }
        }
    }
}

#[cfg(feature = "tokio")]
pub use tokio_executor::TokioExecutor;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::mpsc;
    use std::time::Duration;

    #[rstest]
    fn thread_executor_runs_tasks() {
        let executor = ThreadExecutor::new();
        let (sender, receiver) = mpsc::channel();

        executor.execute(Box::new(move || {
            sender.send(42).unwrap();
        }));

        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[rstest]
    fn thread_executor_runs_tasks_concurrently() {
        let executor = ThreadExecutor::new();
        let (sender, receiver) = mpsc::channel();

        // Two tasks that each need the other to have started.
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
        for index in 0..2 {
            let sender = sender.clone();
            let barrier = barrier.clone();
            executor.execute(Box::new(move || {
                barrier.wait();
                sender.send(index).unwrap();
            }));
        }

        let mut seen: Vec<i32> = (0..2)
            .map(|_| receiver.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    #[cfg(feature = "tokio")]
    #[rstest]
    fn tokio_executor_runs_blocking_tasks() {
        let executor = TokioExecutor::new();
        let (sender, receiver) = mpsc::channel();

        executor.execute(Box::new(move || {
            std::thread::sleep(Duration::from_millis(10));
            sender.send("done").unwrap();
        }));

        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            "done"
        );
    }
}
