//! Fibers: handles onto concurrently running effects.
//!
//! A fork hands the effect's node tree to the executor and immediately
//! returns a [`Fiber`]. The fiber owns a write-once result slot, the
//! task's interruption signal, and the task's execution context; `join`
//! blocks cooperatively on the slot, `interrupt` raises the signal and
//! cancels the context.
//!
//! The slot is written exactly once by the task and consumed by whoever
//! observes the terminal state first. When a scope teardown has already
//! claimed a failed child's outcome, later observers see cancellation,
//! which is also what the scope inflicted on everything it tore down.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::effect::{Effect, Node};
use crate::error::{widen_to_effect_error, AnyValue, Cancelled, EffectError, Failure};
use crate::runtime::context::ExecutionContext;
use crate::runtime::interpreter::interpret;
use crate::runtime::signal::{self, InterruptSignal, TaskState, WAIT_TICK};
use crate::runtime::RuntimeCore;

// =============================================================================
// FiberId
// =============================================================================

/// Stable identity assigned to a fiber at fork time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(Uuid);

impl FiberId {
    pub(crate) fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

// =============================================================================
// FiberSlot
// =============================================================================

enum SlotState {
    Pending,
    // The inner Option distinguishes "completed" from "completed and the
    // outcome has been claimed".
    Done(Option<Result<AnyValue, Failure>>),
}

/// Write-once completion slot shared between a task and its observers.
pub(crate) struct FiberSlot {
    state: Mutex<SlotState>,
    done: Condvar,
}

impl FiberSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            done: Condvar::new(),
        }
    }

    /// Publishes the task's terminal outcome. A second completion is
    /// ignored.
    pub(crate) fn complete(&self, outcome: Result<AnyValue, Failure>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Done(Some(outcome));
            self.done.notify_all();
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Done(_))
    }

    /// Blocks until the slot is populated, re-checking the waiting task's
    /// own interruption every tick.
    ///
    /// # Errors
    ///
    /// Returns the structural cancellation when the waiting task is
    /// interrupted before the slot completes.
    pub(crate) fn await_done(&self) -> Result<(), Cancelled> {
        let mut state = self.state.lock();
        loop {
            if matches!(*state, SlotState::Done(_)) {
                return Ok(());
            }
            if signal::current_task_cancelled() {
                return Err(Cancelled::new());
            }
            let _ = self.done.wait_for(&mut state, WAIT_TICK);
        }
    }

    /// Claims the outcome of a completed slot.
    ///
    /// An outcome is delivered once; a second claim observes cancellation.
    pub(crate) fn take(&self) -> Result<AnyValue, Failure> {
        let mut state = self.state.lock();
        match &mut *state {
            SlotState::Done(outcome) => outcome
                .take()
                .unwrap_or(Err(Failure::Cancelled(Cancelled::new()))),
            SlotState::Pending => {
                unreachable!("fiber outcome claimed before completion")
            }
        }
    }

    /// Claims the outcome only when the slot holds a non-cancellation
    /// error.
    pub(crate) fn take_error(&self) -> Option<Failure> {
        let mut state = self.state.lock();
        match &mut *state {
            SlotState::Done(outcome) => {
                if matches!(outcome, Some(Err(Failure::Error(_)))) {
                    outcome.take().and_then(Result::err)
                } else {
                    None
                }
            }
            SlotState::Pending => None,
        }
    }
}

// =============================================================================
// FiberCore
// =============================================================================

/// The erased machinery behind a fiber handle.
///
/// Scopes record cores so they can interrupt and await children without
/// knowing their types; the public [`Fiber`] is a typed view over the same
/// core.
#[derive(Clone)]
pub(crate) struct FiberCore {
    pub(crate) id: FiberId,
    pub(crate) slot: Arc<FiberSlot>,
    pub(crate) signal: InterruptSignal,
    pub(crate) interrupted: Arc<AtomicBool>,
    pub(crate) context: Arc<ExecutionContext>,
}

impl FiberCore {
    /// Raises the task's interruption signal and cancels its context.
    /// Idempotent; the double-interrupt guard makes repeat calls no-ops.
    pub(crate) fn interrupt_now(&self) {
        if self
            .interrupted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.signal.raise();
            self.context.cancel();
        }
    }
}

/// Spawns a task interpreting `node` under a child of `parent`, returning
/// the fiber core immediately.
pub(crate) fn execute_fork(
    core: &Arc<RuntimeCore>,
    parent: &Arc<ExecutionContext>,
    node: Node,
) -> FiberCore {
    let context = parent.child();
    let slot = Arc::new(FiberSlot::new());
    let signal = InterruptSignal::new();
    let fiber = FiberCore {
        id: FiberId::fresh(),
        slot: slot.clone(),
        signal: signal.clone(),
        interrupted: Arc::new(AtomicBool::new(false)),
        context: context.clone(),
    };

    let runtime = core.clone();
    core.executor().execute(Box::new(move || {
        let _task = signal::enter_task(TaskState {
            context: context.clone(),
            signal,
        });
        let outcome = interpret(node, &context, &runtime);
        slot.complete(outcome);
    }));

    fiber
}

// =============================================================================
// Fiber
// =============================================================================

/// A handle onto a concurrently running effect.
///
/// Created by `Effect::fork` / `Effect::fork_in`. The fiber's error type is
/// the top [`EffectError`]: the fork erased the inner effect's error so
/// joining cannot leak it.
pub struct Fiber<E, A> {
    core: FiberCore,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Fiber<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    pub(crate) fn from_core(core: FiberCore) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// The fiber's stable identity.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.core.id
    }

    /// `true` once the fiber has reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.core.slot.is_done()
    }

    /// An effect that waits for the fiber's terminal state and replays it.
    ///
    /// A success yields the fiber's value; a typed failure re-raises as
    /// [`EffectError::Typed`]; an interrupted fiber re-raises the
    /// structural cancellation, which recovery combinators do not observe.
    pub fn join(self) -> Effect<EffectError, A> {
        let core = self.core;
        let error_type = std::any::type_name::<E>();
        Effect::from_node(Node::Suspend(Box::new(move || {
            core.slot.await_done().map_err(Failure::Cancelled)?;
            match core.slot.take() {
                Ok(value) => Ok(value),
                Err(Failure::Cancelled(cancelled)) => Err(Failure::Cancelled(cancelled)),
                Err(Failure::Error(payload)) => {
                    Err(Failure::fault(widen_to_effect_error(payload, error_type)))
                }
            }
        })))
    }

    /// An effect that interrupts the fiber and returns immediately.
    ///
    /// Idempotent: the first evaluation flips the interrupt flag, raises
    /// the task's signal, and cancels the task's context; subsequent joins
    /// observe cancellation. The interrupt does not wait for the fiber to
    /// notice.
    pub fn interrupt(&self) -> Effect<EffectError, ()> {
        let core = self.core.clone();
        Effect::suspend(move || {
            core.interrupt_now();
            Ok(())
        })
    }
}

impl<E, A> std::fmt::Debug for Fiber<E, A> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Fiber")
            .field("id", &self.core.id)
            .field("done", &self.core.slot.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::thread;
    use std::time::Duration;

    #[rstest]
    fn slot_completes_once_and_delivers_once() {
        let slot = FiberSlot::new();
        slot.complete(Ok(Box::new(1_i32)));
        slot.complete(Ok(Box::new(2_i32)));

        let first = slot.take().unwrap();
        assert_eq!(*first.downcast::<i32>().unwrap(), 1);

        // Second claim observes cancellation.
        assert!(matches!(slot.take(), Err(Failure::Cancelled(_))));
    }

    #[rstest]
    fn slot_await_done_blocks_until_completion() {
        let slot = Arc::new(FiberSlot::new());
        let writer = slot.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.complete(Ok(Box::new("late")));
        });

        slot.await_done().unwrap();
        assert!(slot.is_done());
    }

    #[rstest]
    fn take_error_skips_values_and_cancellations() {
        let ok_slot = FiberSlot::new();
        ok_slot.complete(Ok(Box::new(())));
        assert!(ok_slot.take_error().is_none());

        let cancelled_slot = FiberSlot::new();
        cancelled_slot.complete(Err(Failure::Cancelled(Cancelled::new())));
        assert!(cancelled_slot.take_error().is_none());

        let failed_slot = FiberSlot::new();
        failed_slot.complete(Err(Failure::from_error("boom".to_string())));
        assert!(matches!(
            failed_slot.take_error(),
            Some(Failure::Error(_))
        ));
    }

    #[rstest]
    fn interrupt_now_is_idempotent() {
        let core = FiberCore {
            id: FiberId::fresh(),
            slot: Arc::new(FiberSlot::new()),
            signal: InterruptSignal::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            context: ExecutionContext::root(),
        };

        core.interrupt_now();
        core.interrupt_now();

        assert!(core.signal.is_raised());
        assert!(core.context.is_cancelled());
    }

    #[rstest]
    fn fiber_ids_are_unique() {
        assert_ne!(FiberId::fresh(), FiberId::fresh());
    }
}
