//! Generator contexts: imperative access to the effect machinery.
//!
//! `Effect::generate` runs a plain synchronous function with a handler
//! installed. Inside the function, the [`GeneratorContext`] is the bridge
//! back into the runtime: it performs capabilities eagerly, lifts them
//! into deferred effects, and re-enters the interpreter for arbitrary
//! sub-effects. The generator runs on the same task as the enclosing
//! interpreter call; it is neither restartable nor multi-shot, and long
//! blocking work inside it delays cancellation like any other
//! uncooperative thunk.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::capability::{AnyCapability, Capability, CapabilityHandler, HandlerOutcome};
use crate::error::{
    panic_message, run_error_from, widen_to_effect_error, EffectError, NoHandler, Panicked,
    RunError,
};
use crate::effect::Effect;
use crate::runtime::context::ExecutionContext;
use crate::runtime::interpreter::interpret;
use crate::runtime::RuntimeCore;

/// The context handed to a generator function.
pub struct GeneratorContext {
    handler: Arc<dyn CapabilityHandler>,
    runtime: Arc<RuntimeCore>,
    context: Arc<ExecutionContext>,
}

impl GeneratorContext {
    pub(crate) fn new(
        handler: Arc<dyn CapabilityHandler>,
        runtime: Arc<RuntimeCore>,
        context: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            handler,
            runtime,
            context,
        }
    }

    /// Performs a capability through the installed handler, blocking the
    /// generator until the handler answers.
    ///
    /// # Errors
    ///
    /// [`EffectError::NoHandler`] when the handler rejects the capability;
    /// the handler's own failure, widened to [`EffectError`], when it
    /// fails.
    ///
    /// # Panics
    ///
    /// Panics if the handler answers with a value of the wrong type, which
    /// is a bug in the handler.
    pub fn perform<C: Capability>(&mut self, capability: C) -> Result<C::Output, EffectError> {
        match self.handler.handle(AnyCapability::new(capability)) {
            HandlerOutcome::Handled(value) => Ok(*value
                .downcast::<C::Output>()
                .expect("capability handler produced a value of the wrong type")),
            HandlerOutcome::Rejected(capability) => Err(EffectError::NoHandler(NoHandler::new(
                capability.type_name(),
            ))),
            HandlerOutcome::Failed(error) => Err(widen_to_effect_error(error, "<handler error>")),
        }
    }

    /// Lifts a capability into an effect without performing it now.
    pub fn lift<E, C>(&self, capability: C) -> Effect<E, C::Output>
    where
        E: Send + 'static,
        C: Capability,
    {
        Effect::from(capability)
    }

    /// Runs a user thunk, converting a panic into a fault instead of
    /// unwinding through the generator.
    ///
    /// # Errors
    ///
    /// [`EffectError::Panicked`] when the thunk panics.
    pub fn call<R>(&mut self, thunk: impl FnOnce() -> R) -> Result<R, EffectError> {
        catch_unwind(AssertUnwindSafe(thunk))
            .map_err(|payload| EffectError::Panicked(Panicked::new(panic_message(payload.as_ref()))))
    }

    /// Re-enters the interpreter for an arbitrary sub-effect, returning
    /// its value and propagating its error.
    ///
    /// The sub-effect runs under the generator's own context, so the
    /// installed handler and the cancellation link are preserved.
    ///
    /// # Errors
    ///
    /// The sub-effect's terminal error, as a [`RunError`].
    pub fn evaluate<E2, R>(&mut self, effect: Effect<E2, R>) -> Result<R, RunError<E2>>
    where
        E2: Send + 'static,
        R: Send + 'static,
    {
        match interpret(effect.into_node(), &self.context, &self.runtime) {
            Ok(value) => Ok(*value
                .downcast::<R>()
                .expect("value type mismatch at generator reentry")),
            Err(failure) => Err(run_error_from(failure)),
        }
    }

    /// The handler installed for this generator, for composition.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn CapabilityHandler> {
        self.handler.clone()
    }
}

impl std::fmt::Debug for GeneratorContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("GeneratorContext").finish()
    }
}
