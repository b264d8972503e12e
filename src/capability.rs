//! Capabilities and their handlers.
//!
//! A capability is plain data describing a side-effecting request together
//! with the type of value the request produces. Capabilities have no
//! behavior of their own: lifting one into an effect
//! (`Effect::from(capability)`) defers interpretation to whichever
//! [`CapabilityHandler`] is bound in the execution context at run time.
//! Swapping the handler swaps the interpretation, which is how programs are
//! tested without mocks.
//!
//! # Dispatch model
//!
//! Handlers receive capabilities erased as [`AnyCapability`] and answer
//! with a [`HandlerOutcome`]:
//!
//! - `Handled(value)`: the capability was interpreted; the value must be
//!   the capability's declared output type.
//! - `Rejected(capability)`: "not mine". The capability is returned intact
//!   so a fallback chain can offer it to the next handler.
//! - `Failed(error)`: interpretation failed. The error propagates exactly
//!   like a domain error raised by the effect itself.
//!
//! Rejection is an explicit outcome, never an error: a chain built with
//! [`HandlerExt::or_else`] or [`compose`] moves to the next handler on
//! `Rejected` and stops on anything else.
//!
//! # Examples
//!
//! ```rust
//! use filament::{AnyCapability, Capability, CapabilityHandler, HandlerOutcome};
//!
//! struct ReadLine;
//!
//! impl Capability for ReadLine {
//!     type Output = String;
//! }
//!
//! struct CannedInput(String);
//!
//! impl CapabilityHandler for CannedInput {
//!     fn handle(&self, capability: AnyCapability) -> HandlerOutcome {
//!         match capability.downcast::<ReadLine>() {
//!             Ok(_) => HandlerOutcome::handled(self.0.clone()),
//!             Err(other) => HandlerOutcome::Rejected(other),
//!         }
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::effect::Effect;

/// A typed, inert request for a side effect.
///
/// Implementors are ordinary data types; the associated `Output` names the
/// value a handler must produce when it interprets the request.
pub trait Capability: Send + 'static {
    /// The value produced when a handler interprets this capability.
    type Output: Send + 'static;

    /// Lifts this capability into an effect that performs it.
    fn to_effect<E: Send + 'static>(self) -> Effect<E, Self::Output>
    where
        Self: Sized,
    {
        Effect::from(self)
    }
}

// =============================================================================
// AnyCapability
// =============================================================================

/// A capability erased for uniform dispatch.
///
/// The pair of payload and recorded type identity lets handlers recover the
/// concrete request with [`AnyCapability::downcast`] while the runtime
/// stays ignorant of user capability types.
pub struct AnyCapability {
    payload: Box<dyn Any + Send>,
    type_name: &'static str,
    type_id: TypeId,
}

impl AnyCapability {
    /// Erases a concrete capability.
    #[must_use]
    pub fn new<C: Capability>(capability: C) -> Self {
        Self {
            payload: Box::new(capability),
            type_name: std::any::type_name::<C>(),
            type_id: TypeId::of::<C>(),
        }
    }

    /// Recovers the concrete capability, or returns `self` intact so it can
    /// be offered to another handler.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` when the erased capability is not a `C`.
    pub fn downcast<C: Capability>(self) -> Result<C, Self> {
        let type_name = self.type_name;
        let type_id = self.type_id;
        match self.payload.downcast::<C>() {
            Ok(capability) => Ok(*capability),
            Err(payload) => Err(Self {
                payload,
                type_name,
                type_id,
            }),
        }
    }

    /// `true` when the erased capability is a `C`.
    #[must_use]
    pub fn is<C: Capability>(&self) -> bool {
        self.type_id == TypeId::of::<C>()
    }

    /// Type name of the erased capability.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) const fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl fmt::Debug for AnyCapability {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AnyCapability")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// HandlerOutcome
// =============================================================================

/// The answer a handler gives for one capability.
pub enum HandlerOutcome {
    /// The capability was interpreted; the value must be the capability's
    /// declared output type.
    Handled(Box<dyn Any + Send>),
    /// The capability is not this handler's to interpret. It is returned
    /// intact for the next handler in a fallback chain.
    Rejected(AnyCapability),
    /// Interpretation failed; the error propagates like a domain error.
    Failed(Box<dyn Any + Send>),
}

impl HandlerOutcome {
    /// Wraps an interpreted value.
    #[must_use]
    pub fn handled<T: Send + 'static>(value: T) -> Self {
        Self::Handled(Box::new(value))
    }

    /// Wraps an interpretation failure.
    #[must_use]
    pub fn failed<T: Send + 'static>(error: T) -> Self {
        Self::Failed(Box::new(error))
    }
}

impl fmt::Debug for HandlerOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handled(_) => formatter.write_str("Handled(..)"),
            Self::Rejected(capability) => {
                write!(formatter, "Rejected({})", capability.type_name())
            }
            Self::Failed(_) => formatter.write_str("Failed(..)"),
        }
    }
}

// =============================================================================
// CapabilityHandler
// =============================================================================

/// Interprets capabilities into results.
///
/// Handlers are shared across every fiber of a run and may be invoked from
/// several tasks at once, so implementations must be thread-safe; that is a
/// contract on the handler, not something the runtime enforces beyond the
/// `Send + Sync` bounds.
pub trait CapabilityHandler: Send + Sync {
    /// Interprets one capability.
    fn handle(&self, capability: AnyCapability) -> HandlerOutcome;
}

impl<H: CapabilityHandler + ?Sized> CapabilityHandler for Arc<H> {
    fn handle(&self, capability: AnyCapability) -> HandlerOutcome {
        (**self).handle(capability)
    }
}

/// Chaining extensions available on every handler.
pub trait HandlerExt: CapabilityHandler + Sized + 'static {
    /// Builds a two-handler fallback chain: `self` first, `fallback` when
    /// `self` rejects.
    fn or_else<H: CapabilityHandler + 'static>(self, fallback: H) -> ComposedHandler {
        compose([
            Arc::new(self) as Arc<dyn CapabilityHandler>,
            Arc::new(fallback) as Arc<dyn CapabilityHandler>,
        ])
    }
}

impl<H: CapabilityHandler + Sized + 'static> HandlerExt for H {}

// =============================================================================
// ComposedHandler
// =============================================================================

/// An n-ary fallback chain over handlers, tried in declaration order.
///
/// Each capability is offered to the handlers in turn; a `Rejected` answer
/// moves to the next handler, anything else is final. When every handler
/// rejects, the composite rejects.
pub struct ComposedHandler {
    chain: Vec<Arc<dyn CapabilityHandler>>,
}

/// Builds a fallback chain from the given handlers, in order.
#[must_use]
pub fn compose<I>(handlers: I) -> ComposedHandler
where
    I: IntoIterator<Item = Arc<dyn CapabilityHandler>>,
{
    ComposedHandler {
        chain: handlers.into_iter().collect(),
    }
}

impl ComposedHandler {
    /// Number of handlers in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// `true` when the chain holds no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

impl CapabilityHandler for ComposedHandler {
    fn handle(&self, capability: AnyCapability) -> HandlerOutcome {
        let mut current = capability;
        for handler in &self.chain {
            match handler.handle(current) {
                HandlerOutcome::Rejected(returned) => current = returned,
                outcome => return outcome,
            }
        }
        HandlerOutcome::Rejected(current)
    }
}

impl fmt::Debug for ComposedHandler {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ComposedHandler")
            .field("handlers", &self.chain.len())
            .finish()
    }
}

// =============================================================================
// CapabilityRegistry
// =============================================================================

type RegisteredHandler = Box<dyn Fn(AnyCapability) -> HandlerOutcome + Send + Sync>;

/// A handler built from per-capability-type entries.
///
/// Each entry binds one concrete capability type to an interpretation
/// closure; dispatch is a type-id lookup. Capabilities with no entry are
/// rejected, so a registry composes cleanly into fallback chains.
///
/// # Examples
///
/// ```rust
/// use filament::{Capability, CapabilityRegistry};
///
/// struct Add(i32, i32);
///
/// impl Capability for Add {
///     type Output = i32;
/// }
///
/// let registry = CapabilityRegistry::new()
///     .register(|Add(lhs, rhs)| Ok::<_, String>(lhs + rhs));
/// ```
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<TypeId, RegisteredHandler>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Binds an interpretation for the capability type `C`.
    ///
    /// A later registration for the same type replaces the earlier one. An
    /// `Err` from the closure becomes [`HandlerOutcome::Failed`] and
    /// propagates like a domain error.
    #[must_use]
    pub fn register<C, Er, F>(mut self, interpret: F) -> Self
    where
        C: Capability,
        Er: Send + 'static,
        F: Fn(C) -> Result<C::Output, Er> + Send + Sync + 'static,
    {
        self.entries.insert(
            TypeId::of::<C>(),
            Box::new(move |capability| match capability.downcast::<C>() {
                Ok(concrete) => match interpret(concrete) {
                    Ok(value) => HandlerOutcome::handled(value),
                    Err(error) => HandlerOutcome::failed(error),
                },
                Err(other) => HandlerOutcome::Rejected(other),
            }),
        );
        self
    }

    /// Number of registered capability types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CapabilityHandler for CapabilityRegistry {
    fn handle(&self, capability: AnyCapability) -> HandlerOutcome {
        match self.entries.get(&capability.type_id()) {
            Some(entry) => entry(capability),
            None => HandlerOutcome::Rejected(capability),
        }
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CapabilityRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct Ping;

    impl Capability for Ping {
        type Output = &'static str;
    }

    #[derive(Debug)]
    struct Echo(String);

    impl Capability for Echo {
        type Output = String;
    }

    struct PingHandler;

    impl CapabilityHandler for PingHandler {
        fn handle(&self, capability: AnyCapability) -> HandlerOutcome {
            match capability.downcast::<Ping>() {
                Ok(_) => HandlerOutcome::handled("pong"),
                Err(other) => HandlerOutcome::Rejected(other),
            }
        }
    }

    struct EchoHandler;

    impl CapabilityHandler for EchoHandler {
        fn handle(&self, capability: AnyCapability) -> HandlerOutcome {
            match capability.downcast::<Echo>() {
                Ok(echo) => HandlerOutcome::handled(echo.0),
                Err(other) => HandlerOutcome::Rejected(other),
            }
        }
    }

    #[rstest]
    fn any_capability_downcast_roundtrip() {
        let erased = AnyCapability::new(Echo("hi".to_string()));
        assert!(erased.is::<Echo>());
        assert!(!erased.is::<Ping>());
        let echo = erased.downcast::<Echo>().unwrap();
        assert_eq!(echo.0, "hi");
    }

    #[rstest]
    fn any_capability_downcast_mismatch_keeps_capability() {
        let erased = AnyCapability::new(Ping);
        let erased = erased.downcast::<Echo>().unwrap_err();
        assert!(erased.is::<Ping>());
    }

    #[rstest]
    fn single_handler_rejects_foreign_capability() {
        let outcome = PingHandler.handle(AnyCapability::new(Echo("x".to_string())));
        assert!(matches!(outcome, HandlerOutcome::Rejected(_)));
    }

    #[rstest]
    fn or_else_delegates_on_rejection() {
        let chain = PingHandler.or_else(EchoHandler);

        match chain.handle(AnyCapability::new(Echo("delegated".to_string()))) {
            HandlerOutcome::Handled(value) => {
                assert_eq!(*value.downcast::<String>().unwrap(), "delegated");
            }
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[rstest]
    fn compose_tries_handlers_in_declaration_order() {
        let chain = compose([
            Arc::new(EchoHandler) as Arc<dyn CapabilityHandler>,
            Arc::new(PingHandler) as Arc<dyn CapabilityHandler>,
        ]);
        assert_eq!(chain.len(), 2);

        match chain.handle(AnyCapability::new(Ping)) {
            HandlerOutcome::Handled(value) => {
                assert_eq!(*value.downcast::<&'static str>().unwrap(), "pong");
            }
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[rstest]
    fn compose_rejects_when_every_handler_rejects() {
        struct Unknown;
        impl Capability for Unknown {
            type Output = ();
        }

        let chain = PingHandler.or_else(EchoHandler);
        let outcome = chain.handle(AnyCapability::new(Unknown));
        assert!(matches!(outcome, HandlerOutcome::Rejected(_)));
    }

    #[rstest]
    fn registry_dispatches_by_type() {
        let registry = CapabilityRegistry::new()
            .register(|_: Ping| Ok::<_, String>("pong"))
            .register(|Echo(text)| Ok::<_, String>(text));
        assert_eq!(registry.len(), 2);

        match registry.handle(AnyCapability::new(Echo("registered".to_string()))) {
            HandlerOutcome::Handled(value) => {
                assert_eq!(*value.downcast::<String>().unwrap(), "registered");
            }
            other => panic!("expected Handled, got {other:?}"),
        }
    }

    #[rstest]
    fn registry_failure_becomes_failed_outcome() {
        let registry =
            CapabilityRegistry::new().register(|_: Ping| Err::<&'static str, _>("down".to_string()));

        match registry.handle(AnyCapability::new(Ping)) {
            HandlerOutcome::Failed(error) => {
                assert_eq!(*error.downcast::<String>().unwrap(), "down");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[rstest]
    fn registry_rejects_unregistered_capability() {
        let registry = CapabilityRegistry::new();
        assert!(registry.is_empty());
        let outcome = registry.handle(AnyCapability::new(Ping));
        assert!(matches!(outcome, HandlerOutcome::Rejected(_)));
    }
}
