//! Effect scopes: lexical containers for forked fibers.
//!
//! A scope tracks every fiber forked through it and guarantees that none
//! of them outlives the scope's program, whichever way it exits. The
//! tracking set is the structured-task container: closing it interrupts
//! all recorded children, and the interpreter's exit protocol then waits
//! for each of them to observe the interruption or finish.
//!
//! Ownership is unidirectional: the scope holds its children strongly,
//! fibers hold only their own task machinery and know nothing about the
//! scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::error::{AnyValue, Cancelled, EffectError, Failure};
use crate::runtime::context::ExecutionContext;
use crate::runtime::fiber::{execute_fork, Fiber, FiberCore};
use crate::runtime::RuntimeCore;

// =============================================================================
// TaskSet
// =============================================================================

/// The structured-task container: records live children and shuts them
/// down as a unit.
struct TaskSet {
    children: Mutex<Vec<FiberCore>>,
    closed: AtomicBool,
}

impl TaskSet {
    fn new() -> Self {
        Self {
            children: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Records a child. A child recorded after shutdown is interrupted on
    /// the spot so the closing sweep cannot miss it.
    fn record(&self, child: FiberCore) {
        self.children.lock().push(child.clone());
        if self.closed.load(Ordering::Acquire) {
            child.interrupt_now();
        }
    }

    /// Interrupts every recorded child. Returns once the signal has been
    /// delivered to each; it does not wait for them to finish.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for child in self.children.lock().iter() {
            child.interrupt_now();
        }
    }

    fn snapshot(&self) -> Vec<FiberCore> {
        self.children.lock().clone()
    }
}

// =============================================================================
// EffectScope
// =============================================================================

struct ScopeInner {
    tasks: TaskSet,
    cancelled: AtomicBool,
    context: Arc<ExecutionContext>,
    runtime: Arc<RuntimeCore>,
}

/// Handle onto a lexical fork scope.
///
/// Passed to the body of `Effect::scoped`; cheap to clone, and meant to be
/// captured by the effects the body builds.
#[derive(Clone)]
pub struct EffectScope {
    inner: Arc<ScopeInner>,
}

impl EffectScope {
    pub(crate) fn new(runtime: Arc<RuntimeCore>, context: Arc<ExecutionContext>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                tasks: TaskSet::new(),
                cancelled: AtomicBool::new(false),
                context,
                runtime,
            }),
        }
    }

    /// Forks an effect into this scope.
    ///
    /// The returned effect performs the fork when evaluated: the child is
    /// recorded so that scope exit cancels and awaits it. Forking into a
    /// scope that has already been cancelled fails with the structural
    /// cancelled-scope error, which recovery combinators do not observe.
    pub fn fork<E, A>(&self, effect: Effect<E, A>) -> Effect<EffectError, Fiber<E, A>>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let scope = self.clone();
        Effect::from_node(crate::effect::Node::Suspend(Box::new(move || {
            if scope.inner.cancelled.load(Ordering::Acquire) {
                return Err(Failure::Cancelled(Cancelled::scope()));
            }
            let core = execute_fork(
                &scope.inner.runtime,
                &scope.inner.context,
                effect.into_node(),
            );
            scope.inner.tasks.record(core.clone());
            Ok(Box::new(Fiber::<E, A>::from_core(core)) as AnyValue)
        })))
    }

    /// An effect that cancels every fiber forked in this scope.
    ///
    /// Idempotent. Evaluation returns once the interruption signal has
    /// been delivered to each child; waiting for the children to wind down
    /// is the scope exit's job.
    pub fn cancel_all(&self) -> Effect<EffectError, ()> {
        let scope = self.clone();
        Effect::suspend(move || {
            scope.cancel_all_now();
            Ok(())
        })
    }

    /// `true` once the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Immediate (non-effect) form of [`EffectScope::cancel_all`], used by
    /// the interpreter's exit protocol.
    pub(crate) fn cancel_all_now(&self) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.tasks.shutdown();
            self.inner.context.cancel();
        }
    }

    /// The children recorded so far, in fork order.
    pub(crate) fn children(&self) -> Vec<FiberCore> {
        self.inner.tasks.snapshot()
    }
}

impl std::fmt::Debug for EffectScope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("EffectScope")
            .field("cancelled", &self.is_cancelled())
            .field("children", &self.inner.tasks.children.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::ThreadExecutor;
    use rstest::rstest;

    fn test_scope() -> EffectScope {
        let runtime = Arc::new(RuntimeCore::new(Arc::new(ThreadExecutor::new())));
        EffectScope::new(runtime, ExecutionContext::root())
    }

    #[rstest]
    fn scope_starts_uncancelled() {
        let scope = test_scope();
        assert!(!scope.is_cancelled());
        assert!(scope.children().is_empty());
    }

    #[rstest]
    fn cancel_all_now_is_idempotent_and_cancels_the_context() {
        let scope = test_scope();
        scope.cancel_all_now();
        scope.cancel_all_now();
        assert!(scope.is_cancelled());
        assert!(scope.inner.context.is_cancelled());
    }

    #[rstest]
    fn clones_share_cancellation_state() {
        let scope = test_scope();
        let clone = scope.clone();
        clone.cancel_all_now();
        assert!(scope.is_cancelled());
    }
}
