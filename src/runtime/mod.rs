//! The runtime: executors, contexts, fibers, scopes, and the façade that
//! ties them to the interpreter.
//!
//! [`EffectRuntime`] owns an [`Executor`](executor::Executor) and exposes
//! the ways to evaluate an effect description:
//!
//! - [`EffectRuntime::run`]: synchronous, on the calling thread.
//! - [`EffectRuntime::run_with_handler`]: synchronous, with a capability
//!   handler installed for the whole run.
//! - [`EffectRuntime::run_async`]: on an executor task, with completion
//!   callbacks and a [`CancellationHandle`].
//! - [`EffectRuntime::execute_fork`]: the primitive behind `Effect::fork`,
//!   exposed for interop.

pub mod context;
pub mod executor;
pub mod fiber;
pub mod generator;
pub(crate) mod interpreter;
pub mod scope;
pub mod signal;

use std::sync::Arc;

use crate::capability::CapabilityHandler;
use crate::effect::Effect;
use crate::error::{run_error_from, AnyValue, Failure, RunError};
use context::ExecutionContext;
use executor::{Executor, ThreadExecutor};
use fiber::Fiber;
use interpreter::interpret;
use signal::{CompletionLatch, InterruptSignal, TaskState};

// =============================================================================
// RuntimeCore
// =============================================================================

/// Shared innards of a runtime: the executor, reachable from every task
/// and scope the runtime spawns.
pub(crate) struct RuntimeCore {
    executor: Arc<dyn Executor>,
}

impl RuntimeCore {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub(crate) fn executor(&self) -> &dyn Executor {
        &*self.executor
    }
}

// =============================================================================
// EffectRuntime
// =============================================================================

/// Evaluates effect descriptions.
///
/// Cheap to clone; clones share the executor.
///
/// # Examples
///
/// ```rust
/// use filament::{Effect, EffectRuntime};
///
/// let runtime = EffectRuntime::create();
/// let program = Effect::<String, i32>::succeed(21).map(|x| x * 2);
/// assert_eq!(runtime.run(program).unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct EffectRuntime {
    core: Arc<RuntimeCore>,
}

impl EffectRuntime {
    /// Creates a runtime over the given executor.
    #[must_use]
    pub fn new<X: Executor + 'static>(executor: X) -> Self {
        Self {
            core: Arc::new(RuntimeCore::new(Arc::new(executor))),
        }
    }

    /// Creates a runtime over the default thread-per-task executor.
    #[must_use]
    pub fn create() -> Self {
        Self::new(ThreadExecutor::new())
    }

    /// Runs an effect synchronously on the calling thread.
    ///
    /// # Errors
    ///
    /// The effect's terminal error: its typed failure, cancellation, or a
    /// fault outside the typed channel.
    pub fn run<E, A>(&self, effect: Effect<E, A>) -> Result<A, RunError<E>>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        self.run_in(effect, ExecutionContext::root())
    }

    /// Runs an effect synchronously with a capability handler installed in
    /// a child of the run's root context.
    ///
    /// Every `PerformCapability` node reachable from the effect, however
    /// deeply nested under `flat_map` or `scoped`, dispatches to this
    /// handler or its fallback chain.
    ///
    /// # Errors
    ///
    /// Same terminal outcomes as [`EffectRuntime::run`].
    pub fn run_with_handler<E, A, H>(
        &self,
        effect: Effect<E, A>,
        handler: H,
    ) -> Result<A, RunError<E>>
    where
        E: Send + 'static,
        A: Send + 'static,
        H: CapabilityHandler + 'static,
    {
        let context = ExecutionContext::root().with_handler(Arc::new(handler));
        self.run_in(effect, context)
    }

    /// Starts an effect on an executor task and returns immediately.
    ///
    /// On completion, exactly one of the callbacks fires with the outcome,
    /// unless the handle was cancelled first or the run was cancelled
    /// internally: cancellation suppresses both callbacks, but the handle
    /// still completes so [`CancellationHandle::wait`] returns.
    pub fn run_async<E, A, S, F>(
        &self,
        effect: Effect<E, A>,
        on_success: S,
        on_error: F,
    ) -> CancellationHandle
    where
        E: Send + 'static,
        A: Send + 'static,
        S: FnOnce(A) + Send + 'static,
        F: FnOnce(RunError<E>) + Send + 'static,
    {
        let context = ExecutionContext::root();
        let signal = InterruptSignal::new();
        let latch = Arc::new(CompletionLatch::new());
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = CancellationHandle {
            cancelled: cancelled.clone(),
            signal: signal.clone(),
            context: context.clone(),
            latch: latch.clone(),
        };

        let core = self.core.clone();
        let node = effect.into_node();
        self.core.executor().execute(Box::new(move || {
            let _task = signal::enter_task(TaskState {
                context: context.clone(),
                signal,
            });
            let outcome = interpret(node, &context, &core);
            let suppressed = cancelled.load(std::sync::atomic::Ordering::Acquire);
            match outcome {
                Ok(value) => {
                    if !suppressed {
                        on_success(
                            *value
                                .downcast::<A>()
                                .expect("value type mismatch at async completion"),
                        );
                    }
                }
                Err(Failure::Cancelled(_)) => {}
                Err(failure) => {
                    if !suppressed {
                        on_error(run_error_from(failure));
                    }
                }
            }
            latch.complete();
        }));

        handle
    }

    /// Spawns an effect on a fresh task immediately, outside any scope.
    ///
    /// This is the primitive behind `Effect::fork`, exposed for interop;
    /// prefer forking inside a scope so the fiber cannot leak.
    pub fn execute_fork<E, A>(&self, effect: Effect<E, A>) -> Fiber<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let context = ExecutionContext::root();
        let core = fiber::execute_fork(&self.core, &context, effect.into_node());
        Fiber::from_core(core)
    }

    /// The executor backing this runtime, for interop.
    #[must_use]
    pub fn executor(&self) -> &dyn Executor {
        self.core.executor()
    }

    fn run_in<E, A>(
        &self,
        effect: Effect<E, A>,
        context: Arc<ExecutionContext>,
    ) -> Result<A, RunError<E>>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let _task = signal::enter_task(TaskState {
            context: context.clone(),
            signal: InterruptSignal::new(),
        });
        finish_run(interpret(effect.into_node(), &context, &self.core))
    }
}

impl std::fmt::Debug for EffectRuntime {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("EffectRuntime").finish()
    }
}

/// Converts a terminal interpreter outcome into the typed run result.
fn finish_run<E, A>(outcome: Result<AnyValue, Failure>) -> Result<A, RunError<E>>
where
    E: 'static,
    A: 'static,
{
    match outcome {
        Ok(value) => Ok(*value
            .downcast::<A>()
            .expect("value type mismatch at run completion")),
        Err(failure) => Err(run_error_from(failure)),
    }
}

// =============================================================================
// CancellationHandle
// =============================================================================

/// External cancellation and completion tracking for an asynchronous run.
pub struct CancellationHandle {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    signal: InterruptSignal,
    context: Arc<ExecutionContext>,
    latch: Arc<CompletionLatch>,
}

impl CancellationHandle {
    /// Cancels the run: suppresses its callbacks, raises the task's
    /// interruption signal, and cancels the run's context. Idempotent.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
        {
            self.signal.raise();
            self.context.cancel();
        }
    }

    /// `true` once [`CancellationHandle::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Blocks until the run completes, whether with a value, an error, or
    /// by cancellation.
    pub fn wait(&self) {
        self.latch.wait();
    }

    /// Bounded wait. Returns `true` when the run completed within the
    /// timeout (in any terminal state), `false` when the timeout elapsed.
    #[must_use]
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        self.latch.wait_timeout(timeout)
    }
}

impl std::fmt::Debug for CancellationHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancellationHandle")
            .field("cancelled", &self.is_cancelled())
            .field("completed", &self.latch.is_completed())
            .finish()
    }
}
