//! The effect algebra: lazily evaluated descriptions of computations.
//!
//! An [`Effect<E, A>`] is an immutable description of a computation that
//! may fail with a typed error `E` or succeed with a value `A`. Building an
//! effect performs no work: constructors and combinators only allocate tree
//! nodes. Evaluation happens when a description is handed to an
//! [`EffectRuntime`](crate::EffectRuntime), which walks the tree with a
//! stack-safe trampoline.
//!
//! # Design
//!
//! The public type is parameterised by error and success types, but the
//! tree underneath is type-erased: payloads travel as `Box<dyn Any + Send>`
//! and the typed combinators wrap their continuations in erasing glue that
//! downcasts at the boundary. This keeps the interpreter a single untyped
//! loop while every user-visible signature stays fully typed.
//!
//! Descriptions are one-shot owned values: running or forking an effect
//! consumes it. Immutability is what the ownership system already
//! guarantees between construction and consumption.
//!
//! # Examples
//!
//! ```rust
//! use filament::{Effect, EffectRuntime};
//!
//! let runtime = EffectRuntime::create();
//!
//! let program = Effect::<String, i32>::succeed(1)
//!     .flat_map(|x| Effect::succeed(x + 1))
//!     .map(|x| x * 2);
//!
//! assert_eq!(runtime.run(program).unwrap(), 4);
//! ```
//!
//! Recovery and error mapping:
//!
//! ```rust
//! use filament::{Effect, EffectRuntime};
//!
//! let runtime = EffectRuntime::create();
//!
//! let program = Effect::<String, i32>::fail("boom".to_string())
//!     .catch_all(|_| Effect::succeed(99));
//!
//! assert_eq!(runtime.run(program).unwrap(), 99);
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capability::{AnyCapability, Capability, CapabilityHandler};
use crate::error::{AnyValue, Cancelled, EffectError, Failure};
use crate::runtime::fiber::{Fiber, FiberCore};
use crate::runtime::generator::GeneratorContext;
use crate::runtime::scope::EffectScope;
use crate::runtime::signal;

// =============================================================================
// Erased node tree
// =============================================================================

pub(crate) type SuspendFn = Box<dyn FnOnce() -> Result<AnyValue, Failure> + Send>;
pub(crate) type SeqFn = Box<dyn FnOnce(AnyValue) -> Node + Send>;
pub(crate) type FoldErrFn = Box<dyn FnOnce(AnyValue) -> Result<Node, AnyValue> + Send>;
pub(crate) type MapErrFn = Box<dyn FnOnce(AnyValue) -> AnyValue + Send>;
pub(crate) type FiberWrapFn = Box<dyn FnOnce(FiberCore) -> AnyValue + Send>;
pub(crate) type ScopeBodyFn = Box<dyn FnOnce(EffectScope) -> Node + Send>;
pub(crate) type GeneratorFn =
    Box<dyn FnOnce(&mut GeneratorContext) -> Result<AnyValue, Failure> + Send>;

/// The closed sum of effect nodes.
///
/// Error-recovery closures (`on_error`, `transform`) receive the erased
/// error value and give it back unchanged when it is not of their declared
/// type, so foreign errors keep unwinding past them.
pub(crate) enum Node {
    Pure(AnyValue),
    Fail(AnyValue),
    Suspend(SuspendFn),
    FlatMap {
        source: Box<Node>,
        continuation: SeqFn,
    },
    Fold {
        source: Box<Node>,
        on_error: FoldErrFn,
        on_success: SeqFn,
    },
    MapError {
        source: Box<Node>,
        transform: MapErrFn,
    },
    Fork {
        effect: Box<Node>,
        wrap: FiberWrapFn,
    },
    Scoped {
        body: ScopeBodyFn,
    },
    Generate {
        generator: GeneratorFn,
        handler: Arc<dyn CapabilityHandler>,
    },
    Perform {
        capability: AnyCapability,
    },
}

impl Node {
    /// Tears down a node spine iteratively.
    ///
    /// A chain of a million `flat_map`s nests a million source boxes; the
    /// default recursive drop would overflow the native stack, so sources
    /// are unlinked onto an explicit worklist first.
    pub(crate) fn drop_spine(self) {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::FlatMap { source, .. }
                | Self::Fold { source, .. }
                | Self::MapError { source, .. }
                | Self::Fork { effect: source, .. } => stack.push(*source),
                _ => {}
            }
        }
    }
}

// =============================================================================
// Effect
// =============================================================================

/// An immutable, lazily evaluated description of a computation.
///
/// See the [module documentation](self) for the overall model.
///
/// # Type Parameters
///
/// - `E`: The typed error channel.
/// - `A`: The success value.
#[must_use = "effects describe computations and do nothing until run"]
pub struct Effect<E, A> {
    node: Option<Node>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Drop for Effect<E, A> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.drop_spine();
        }
    }
}

impl<E, A> Effect<E, A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node: Some(node),
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(mut self) -> Node {
        self.node.take().expect("effect node already consumed")
    }
}

impl<E, A> Effect<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    // =========================================================================
    // Constructors
    // =========================================================================

    /// An already-known success value.
    pub fn succeed(value: A) -> Self {
        Self::from_node(Node::Pure(Box::new(value)))
    }

    /// An already-known error value.
    pub fn fail(error: E) -> Self {
        Self::from_node(Node::Fail(Box::new(error)))
    }

    /// Captures a side-effecting thunk.
    ///
    /// The thunk runs only under a runtime, once per evaluation of the
    /// node. A panic inside the thunk is caught and surfaces as
    /// [`EffectError::Panicked`] rather than unwinding the interpreter.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use filament::{Effect, EffectRuntime};
    ///
    /// let effect = Effect::<String, u32>::suspend(|| Ok(6 * 7));
    /// assert_eq!(EffectRuntime::create().run(effect).unwrap(), 42);
    /// ```
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Result<A, E> + Send + 'static,
    {
        Self::from_node(Node::Suspend(Box::new(move || match thunk() {
            Ok(value) => Ok(Box::new(value) as AnyValue),
            Err(error) => Err(Failure::from_error(error)),
        })))
    }

    /// Lifts a capability into an effect that performs it.
    ///
    /// Evaluation submits the capability to the handler resolved from the
    /// execution context; running without a bound handler is the
    /// [`NoHandler`](crate::NoHandler) fault.
    pub fn from<C>(capability: C) -> Self
    where
        C: Capability<Output = A>,
    {
        Self::from_node(Node::Perform {
            capability: AnyCapability::new(capability),
        })
    }

    /// Opens a lexical scope for forked fibers.
    ///
    /// The body receives an [`EffectScope`] handle and returns the scope's
    /// program. Whatever way that program exits, every fiber forked through
    /// the handle is cancelled and awaited before the scope's result is
    /// surfaced: no fork outlives its scope.
    pub fn scoped<F>(body: F) -> Self
    where
        F: FnOnce(EffectScope) -> Self + Send + 'static,
    {
        Self::from_node(Node::Scoped {
            body: Box::new(move |scope| body(scope).into_node()),
        })
    }

    /// Runs an imperative generator with the given handler installed.
    ///
    /// The generator is a plain synchronous function driven through a
    /// [`GeneratorContext`]; it runs on the same task as the enclosing
    /// interpreter call and is neither restartable nor multi-shot.
    pub fn generate<G, H>(generator: G, handler: H) -> Self
    where
        G: FnOnce(&mut GeneratorContext) -> Result<A, E> + Send + 'static,
        H: CapabilityHandler + 'static,
    {
        Self::from_node(Node::Generate {
            generator: Box::new(move |context| match generator(context) {
                Ok(value) => Ok(Box::new(value) as AnyValue),
                Err(error) => Err(Failure::from_error(error)),
            }),
            handler: Arc::new(handler),
        })
    }

    // =========================================================================
    // Sequencing combinators
    // =========================================================================

    /// Transforms the success value.
    pub fn map<B, F>(self, function: F) -> Effect<E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |value| Effect::succeed(function(value)))
    }

    /// Sequences a dependent effect after this one.
    ///
    /// The continuation runs only on success; errors flow past it
    /// untouched.
    pub fn flat_map<B, F>(self, continuation: F) -> Effect<E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<E, B> + Send + 'static,
    {
        Effect::from_node(Node::FlatMap {
            source: Box::new(self.into_node()),
            continuation: Box::new(move |value| {
                let value = *value
                    .downcast::<A>()
                    .expect("value type mismatch in flat_map continuation");
                continuation(value).into_node()
            }),
        })
    }

    /// Handles both outcomes, producing a new effect in either branch.
    ///
    /// Cancellation is not an outcome: it bypasses both branches.
    pub fn fold<E2, B, FE, FA>(self, on_error: FE, on_success: FA) -> Effect<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        FE: FnOnce(E) -> Effect<E2, B> + Send + 'static,
        FA: FnOnce(A) -> Effect<E2, B> + Send + 'static,
    {
        Effect::from_node(Node::Fold {
            source: Box::new(self.into_node()),
            on_error: Box::new(move |error| match error.downcast::<E>() {
                Ok(error) => Ok(on_error(*error).into_node()),
                Err(foreign) => Err(foreign),
            }),
            on_success: Box::new(move |value| {
                let value = *value
                    .downcast::<A>()
                    .expect("value type mismatch in fold success branch");
                on_success(value).into_node()
            }),
        })
    }

    /// Transforms the error value, passing successes through.
    pub fn map_error<E2, F>(self, transform: F) -> Effect<E2, A>
    where
        E2: Send + 'static,
        F: FnOnce(E) -> E2 + Send + 'static,
    {
        Effect::from_node(Node::MapError {
            source: Box::new(self.into_node()),
            transform: Box::new(move |error| match error.downcast::<E>() {
                Ok(error) => Box::new(transform(*error)) as AnyValue,
                Err(foreign) => foreign,
            }),
        })
    }

    /// Recovers from a typed error with a new effect.
    pub fn catch_all<F>(self, handler: F) -> Self
    where
        F: FnOnce(E) -> Self + Send + 'static,
    {
        self.fold(handler, Effect::succeed)
    }

    /// Falls back to another effect when this one fails.
    pub fn or_else(self, fallback: Self) -> Self {
        self.catch_all(move |_| fallback)
    }

    /// Reifies the outcome as a value.
    ///
    /// Typed errors become `Err(e)`, successes `Ok(a)`; the resulting
    /// effect never fails through the typed channel. Cancellation is not
    /// reified and re-raises.
    pub fn attempt(self) -> Effect<EffectError, Result<A, E>> {
        self.fold(
            |error| Effect::succeed(Err(error)),
            |value| Effect::succeed(Ok(value)),
        )
    }

    // =========================================================================
    // Concurrency combinators
    // =========================================================================

    /// Starts this effect on a new task, yielding a [`Fiber`] handle.
    ///
    /// Forking does not suspend: the parent proceeds as soon as the task is
    /// handed to the executor. The fiber's error type is erased to
    /// [`EffectError`], so joining cannot leak the inner type.
    pub fn fork(self) -> Effect<EffectError, Fiber<E, A>> {
        Effect::from_node(Node::Fork {
            effect: Box::new(self.into_node()),
            wrap: Box::new(|core| Box::new(Fiber::<E, A>::from_core(core)) as AnyValue),
        })
    }

    /// Forks this effect into the given scope, which will cancel it at
    /// scope exit if it is still running.
    pub fn fork_in(self, scope: &EffectScope) -> Effect<EffectError, Fiber<E, A>> {
        scope.fork(self)
    }

    /// Runs two effects in parallel and combines their results.
    ///
    /// Both sides start in program order on separate tasks; `combine` runs
    /// once both have produced values. If either side fails its error
    /// surfaces; when both fail, the left fiber's error wins (its join is
    /// observed first).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use filament::{Effect, EffectRuntime};
    ///
    /// let left = Effect::<String, i32>::succeed(20);
    /// let right = Effect::<String, i32>::succeed(22);
    /// let both = left.zip_par(right, |a, b| a + b);
    ///
    /// assert_eq!(EffectRuntime::create().run(both).unwrap(), 42);
    /// ```
    pub fn zip_par<B, C, F>(self, other: Effect<E, B>, combine: F) -> Effect<EffectError, C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        self.fork().flat_map(move |left| {
            other.fork().flat_map(move |right| {
                left.join()
                    .flat_map(move |a| right.join().map(move |b| combine(a, b)))
            })
        })
    }
}

impl<E> Effect<E, ()>
where
    E: Send + 'static,
{
    /// Sleeps cooperatively for the given duration.
    ///
    /// The sleep is sliced so that cancellation of the running task is
    /// observed within a bounded delay instead of at the end of the full
    /// duration. Outside a runtime-managed task it degrades to a plain
    /// uninterruptible sleep.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_node(Node::Suspend(Box::new(move || {
            let deadline = Instant::now() + duration;
            loop {
                if signal::current_task_cancelled() {
                    return Err(Failure::Cancelled(Cancelled::new()));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Box::new(()) as AnyValue);
                }
                std::thread::sleep((deadline - now).min(signal::SLEEP_SLICE));
            }
        })))
    }
}

// =============================================================================
// N-ary parallel helpers
// =============================================================================

/// Runs two effects in parallel and combines their results.
///
/// Equivalent to [`Effect::zip_par`].
pub fn par2<E, A, B, R, F>(
    first: Effect<E, A>,
    second: Effect<E, B>,
    combine: F,
) -> Effect<EffectError, R>
where
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
    R: Send + 'static,
    F: FnOnce(A, B) -> R + Send + 'static,
{
    first.zip_par(second, combine)
}

/// Runs three effects in parallel and combines their results.
///
/// All three are forked in program order before any join; joins are
/// observed left to right, so the leftmost failing fiber's error wins.
pub fn par3<E, A, B, C, R, F>(
    first: Effect<E, A>,
    second: Effect<E, B>,
    third: Effect<E, C>,
    combine: F,
) -> Effect<EffectError, R>
where
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    R: Send + 'static,
    F: FnOnce(A, B, C) -> R + Send + 'static,
{
    first.fork().flat_map(move |fiber_a| {
        second.fork().flat_map(move |fiber_b| {
            third.fork().flat_map(move |fiber_c| {
                fiber_a.join().flat_map(move |a| {
                    fiber_b
                        .join()
                        .flat_map(move |b| fiber_c.join().map(move |c| combine(a, b, c)))
                })
            })
        })
    })
}

/// Runs four effects in parallel and combines their results.
pub fn par4<E, A, B, C, D, R, F>(
    first: Effect<E, A>,
    second: Effect<E, B>,
    third: Effect<E, C>,
    fourth: Effect<E, D>,
    combine: F,
) -> Effect<EffectError, R>
where
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    D: Send + 'static,
    R: Send + 'static,
    F: FnOnce(A, B, C, D) -> R + Send + 'static,
{
    first.fork().flat_map(move |fiber_a| {
        second.fork().flat_map(move |fiber_b| {
            third.fork().flat_map(move |fiber_c| {
                fourth.fork().flat_map(move |fiber_d| {
                    fiber_a.join().flat_map(move |a| {
                        fiber_b.join().flat_map(move |b| {
                            fiber_c
                                .join()
                                .flat_map(move |c| fiber_d.join().map(move |d| combine(a, b, c, d)))
                        })
                    })
                })
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[rstest]
    fn construction_performs_no_side_effect() {
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let effect = Effect::<String, i32>::suspend(move || {
            executed_clone.store(true, Ordering::SeqCst);
            Ok(42)
        });

        assert!(!executed.load(Ordering::SeqCst));
        drop(effect);
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[rstest]
    fn combinators_only_rewrite_the_tree() {
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        let effect = Effect::<String, i32>::suspend(move || {
            executed_clone.store(true, Ordering::SeqCst);
            Ok(1)
        })
        .map(|x| x + 1)
        .flat_map(|x| Effect::succeed(x * 2))
        .catch_all(|_| Effect::succeed(0))
        .map_error(|error: String| error.len());

        assert!(!executed.load(Ordering::SeqCst));
        drop(effect);
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[rstest]
    fn deep_flat_map_spine_drops_without_overflow() {
        let mut effect = Effect::<String, u64>::succeed(0);
        for _ in 0..1_000_000_u64 {
            effect = effect.flat_map(|x| Effect::succeed(x + 1));
        }
        drop(effect);
    }

    #[rstest]
    fn deep_mixed_spine_drops_without_overflow() {
        let mut effect = Effect::<String, u64>::succeed(0);
        for index in 0..200_000_u64 {
            effect = match index % 3 {
                0 => effect.map(|x| x + 1),
                1 => effect.catch_all(Effect::fail),
                _ => effect.map_error(|error| error),
            };
        }
        drop(effect);
    }
}
