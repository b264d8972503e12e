//! The stack-safe trampoline interpreter.
//!
//! Evaluation is a loop over three registers: the node to evaluate next,
//! the last success value, or the current failure, plus an explicit stack
//! of continuation frames. Descending into a child effect is a register
//! assignment and a frame push, never a native call, so native stack depth
//! stays constant however deep the description tree is. The only
//! recursion is through `Scoped` (bounded by lexical scope nesting) and
//! through generator reentry, both user-controlled.
//!
//! # Frames
//!
//! Three frame kinds mirror the three sequencing nodes:
//!
//! - `Seq`: a `flat_map` continuation. Applied on success, discarded on
//!   error.
//! - `Fold`: both branches of a `fold`. One of the two is applied to
//!   whichever outcome arrives.
//! - `MapErr`: a `map_error` transform. Applied on error, discarded on
//!   success.
//!
//! Frames unwind LIFO. Cancellation is exempt from all of them: a
//! cancellation in the failure register pops frames without ever invoking
//! one, because cancellation is a structural signal rather than a
//! recoverable condition.
//!
//! # Checkpoints
//!
//! Once per iteration, before evaluating a node, the loop observes the
//! task's interruption signal and the context's cancellation flag. That
//! checkpoint is the only ordering guarantee effects get about when
//! cancellation may be observed; a thunk that blocks without cooperating
//! can only be abandoned, not preempted.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::capability::HandlerOutcome;
use crate::effect::{FoldErrFn, MapErrFn, Node, SeqFn};
use crate::error::{
    panic_message, AnyValue, Cancelled, EffectError, Failure, NoHandler, Panicked,
};
use crate::runtime::context::ExecutionContext;
use crate::runtime::fiber::execute_fork;
use crate::runtime::generator::GeneratorContext;
use crate::runtime::scope::EffectScope;
use crate::runtime::signal;
use crate::runtime::RuntimeCore;

/// Inline capacity of the continuation stack; chains deeper than this
/// spill to the heap.
const FRAME_INLINE_CAPACITY: usize = 8;

enum Frame {
    Seq(SeqFn),
    Fold { on_error: FoldErrFn, on_success: SeqFn },
    MapErr(MapErrFn),
}

enum Step {
    Eval(Node),
    Done(AnyValue),
    Failed(Failure),
}

/// Runs one effect tree to completion on the current task.
pub(crate) fn interpret(
    node: Node,
    context: &Arc<ExecutionContext>,
    runtime: &Arc<RuntimeCore>,
) -> Result<AnyValue, Failure> {
    let mut frames: SmallVec<[Frame; FRAME_INLINE_CAPACITY]> = SmallVec::new();
    let mut step = Step::Eval(node);

    loop {
        // Cancellation checkpoint, once per node boundary.
        if matches!(step, Step::Eval(_))
            && (signal::current_task_cancelled() || context.is_cancelled())
        {
            step = Step::Failed(Failure::Cancelled(Cancelled::new()));
        }

        step = match step {
            Step::Eval(node) => evaluate(node, &mut frames, context, runtime),

            Step::Done(value) => match frames.pop() {
                None => return Ok(value),
                Some(Frame::Seq(continuation)) => Step::Eval(continuation(value)),
                Some(Frame::Fold { on_success, .. }) => Step::Eval(on_success(value)),
                Some(Frame::MapErr(_)) => Step::Done(value),
            },

            Step::Failed(failure) => match frames.pop() {
                None => return Err(failure),
                Some(frame) => unwind(failure, frame),
            },
        };
    }
}

/// One unwinding step: offers the failure to the popped frame.
fn unwind(failure: Failure, frame: Frame) -> Step {
    match failure {
        // Structural: no frame may observe it.
        Failure::Cancelled(cancelled) => Step::Failed(Failure::Cancelled(cancelled)),
        Failure::Error(payload) => match frame {
            Frame::Seq(_) => Step::Failed(Failure::Error(payload)),
            Frame::MapErr(transform) => Step::Failed(Failure::Error(transform(payload))),
            Frame::Fold { on_error, .. } => match on_error(payload) {
                Ok(recovery) => Step::Eval(recovery),
                // Not this fold's error type: keep unwinding.
                Err(payload) => Step::Failed(Failure::Error(payload)),
            },
        },
    }
}

/// Dispatches one node, pushing frames for the sequencing variants.
fn evaluate(
    node: Node,
    frames: &mut SmallVec<[Frame; FRAME_INLINE_CAPACITY]>,
    context: &Arc<ExecutionContext>,
    runtime: &Arc<RuntimeCore>,
) -> Step {
    match node {
        Node::Pure(value) => Step::Done(value),

        Node::Fail(error) => Step::Failed(Failure::Error(error)),

        Node::Suspend(thunk) => match catch_unwind(AssertUnwindSafe(thunk)) {
            Ok(Ok(value)) => Step::Done(value),
            Ok(Err(failure)) => Step::Failed(failure),
            Err(payload) => Step::Failed(Failure::fault(EffectError::Panicked(Panicked::new(
                panic_message(payload.as_ref()),
            )))),
        },

        Node::FlatMap {
            source,
            continuation,
        } => {
            frames.push(Frame::Seq(continuation));
            Step::Eval(*source)
        }

        Node::Fold {
            source,
            on_error,
            on_success,
        } => {
            frames.push(Frame::Fold {
                on_error,
                on_success,
            });
            Step::Eval(*source)
        }

        Node::MapError { source, transform } => {
            frames.push(Frame::MapErr(transform));
            Step::Eval(*source)
        }

        // Forking does not suspend: the parent proceeds with the handle.
        Node::Fork { effect, wrap } => {
            let fiber = execute_fork(runtime, context, *effect);
            Step::Done(wrap(fiber))
        }

        Node::Scoped { body } => execute_scoped(body, context, runtime),

        Node::Generate { generator, handler } => {
            let generator_context = context.child().with_handler(handler.clone());
            let mut bridge = GeneratorContext::new(handler, runtime.clone(), generator_context);
            match catch_unwind(AssertUnwindSafe(move || generator(&mut bridge))) {
                Ok(Ok(value)) => Step::Done(value),
                Ok(Err(failure)) => Step::Failed(failure),
                Err(payload) => Step::Failed(Failure::fault(EffectError::Panicked(
                    Panicked::new(panic_message(payload.as_ref())),
                ))),
            }
        }

        Node::Perform { capability } => {
            let Some(handler) = context.resolve_handler() else {
                return Step::Failed(Failure::fault(EffectError::NoHandler(NoHandler::new(
                    capability.type_name(),
                ))));
            };
            match catch_unwind(AssertUnwindSafe(|| handler.handle(capability))) {
                Ok(HandlerOutcome::Handled(value)) => Step::Done(value),
                Ok(HandlerOutcome::Rejected(capability)) => Step::Failed(Failure::fault(
                    EffectError::NoHandler(NoHandler::new(capability.type_name())),
                )),
                // A handler failure propagates exactly like a domain error.
                Ok(HandlerOutcome::Failed(error)) => Step::Failed(Failure::Error(error)),
                Err(payload) => Step::Failed(Failure::fault(EffectError::Panicked(
                    Panicked::new(panic_message(payload.as_ref())),
                ))),
            }
        }
    }
}

/// The scope exit protocol.
///
/// 1. Build the scope over a child context whose cancellation is linked to
///    it.
/// 2. Evaluate the body's program under that context (re-entrant into the
///    trampoline; this is the bounded recursion).
/// 3. On every exit path, cancel all children, then wait for each to
///    observe the interruption or finish.
/// 4. Body success: surface the first (fork-order) child error if one
///    exists, else the body's value. Body failure or cancellation:
///    re-raise it; children's errors during teardown are dropped.
fn execute_scoped(
    body: crate::effect::ScopeBodyFn,
    context: &Arc<ExecutionContext>,
    runtime: &Arc<RuntimeCore>,
) -> Step {
    let scope_context = context.child();
    let scope = EffectScope::new(runtime.clone(), scope_context.clone());

    let program = body(scope.clone());
    let outcome = interpret(program, &scope_context, runtime);

    scope.cancel_all_now();

    let mut first_child_error: Option<Failure> = None;
    for child in scope.children() {
        if child.slot.await_done().is_err() {
            // Our own task was interrupted while draining the scope. The
            // children have all been signalled; unwind as cancelled.
            return Step::Failed(Failure::Cancelled(Cancelled::new()));
        }
        if outcome.is_ok() && first_child_error.is_none() {
            first_child_error = child.slot.take_error();
        }
    }

    match outcome {
        Ok(value) => match first_child_error {
            Some(failure) => Step::Failed(failure),
            None => Step::Done(value),
        },
        Err(failure) => Step::Failed(failure),
    }
}
