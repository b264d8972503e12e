//! Error taxonomy for effect runs.
//!
//! Three channels of failure flow through the interpreter:
//!
//! 1. **Typed domain errors** (`E` in `Effect<E, A>`): raised by `fail` or a
//!    `suspend` thunk, caught and transformed by `fold` / `map_error` /
//!    `catch_all`.
//! 2. **Cancellation** ([`Cancelled`]): a structural signal that unwinds
//!    past every recovery combinator. It is observed at interpreter
//!    checkpoints and by cooperative blocking waits.
//! 3. **Faults** ([`EffectError`]): failures outside the typed channel,
//!    such as an unbound capability handler or a panicking thunk. Faults
//!    travel erased and only become catchable where the effect's error type
//!    is `EffectError` itself (the top error type used past fork/join
//!    boundaries).
//!
//! # Typed-boundary rule
//!
//! The interpreter carries the current error as an erased value. When an
//! error reaches a `fold` or `map_error` frame, it is downcast to that
//! frame's declared error type: a match hands the value to the recovery
//! function, a mismatch lets the error keep unwinding untouched. A `fold`
//! whose error type is [`EffectError`] therefore observes faults, while a
//! domain-typed `fold` cannot. Cancellation bypasses both unconditionally.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

/// Erased success or error payload moved through the interpreter registers.
pub(crate) type AnyValue = Box<dyn Any + Send>;

// =============================================================================
// Cancelled
// =============================================================================

/// The structural cancellation signal.
///
/// `Cancelled` is not a domain error: `catch_all`, `or_else` and
/// `map_error` never observe it, and `attempt` re-raises it. It terminates
/// the run (or the fiber) at the next checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled {
    detail: &'static str,
}

impl Cancelled {
    /// Cancellation observed at an interpreter checkpoint or blocking wait.
    pub(crate) const fn new() -> Self {
        Self {
            detail: "effect was cancelled",
        }
    }

    /// Rejection of a fork submitted to an already-cancelled scope.
    pub(crate) const fn scope() -> Self {
        Self {
            detail: "fork rejected: scope already cancelled",
        }
    }

    /// Human-readable description of where the cancellation was observed.
    #[must_use]
    pub const fn detail(&self) -> &'static str {
        self.detail
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.detail)
    }
}

impl StdError for Cancelled {}

// =============================================================================
// TypedError
// =============================================================================

/// A typed domain error that crossed a fork/join boundary.
///
/// Forking erases the inner effect's error type, so a joined fiber reports
/// failures as [`EffectError::Typed`]. The original value is preserved and
/// can be recovered with [`TypedError::downcast_ref`] or
/// [`TypedError::downcast`].
pub struct TypedError {
    payload: AnyValue,
    type_name: &'static str,
}

impl TypedError {
    /// Wraps a concrete error value.
    pub(crate) fn of<T: Send + 'static>(value: T) -> Self {
        Self {
            payload: Box::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wraps an already-erased error payload.
    pub(crate) fn from_erased(payload: AnyValue, type_name: &'static str) -> Self {
        Self { payload, type_name }
    }

    /// Name of the error type recorded at the erasure site.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Borrows the payload as `T` if the types match.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Recovers the payload as `T`, returning `self` unchanged on mismatch.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` when the payload is not a `T`.
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        let type_name = self.type_name;
        match self.payload.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(payload) => Err(Self { payload, type_name }),
        }
    }

    /// Consumes the wrapper, yielding the erased payload.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for TypedError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TypedError")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TypedError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "typed error ({})", self.type_name)
    }
}

// =============================================================================
// NoHandler
// =============================================================================

/// No capability handler was bound in the execution context, or every
/// handler in the chain rejected the capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoHandler {
    capability: &'static str,
}

impl NoHandler {
    pub(crate) const fn new(capability: &'static str) -> Self {
        Self { capability }
    }

    /// Type name of the capability nobody accepted.
    #[must_use]
    pub const fn capability(&self) -> &'static str {
        self.capability
    }
}

impl fmt::Display for NoHandler {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "no capability handler accepted {}",
            self.capability
        )
    }
}

impl StdError for NoHandler {}

// =============================================================================
// Panicked
// =============================================================================

/// A suspend thunk, generator body, or capability handler panicked.
///
/// Panics are the host-runtime failure mode that has no place in the typed
/// error channel; the payload message is captured and the panic is
/// converted into a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panicked {
    message: String,
}

impl Panicked {
    pub(crate) const fn new(message: String) -> Self {
        Self { message }
    }

    /// The stringified panic payload.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Panicked {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "effect panicked: {}", self.message)
    }
}

impl StdError for Panicked {}

// =============================================================================
// EffectError
// =============================================================================

/// The top error type.
///
/// Forking erases an effect's error type, so joined fibers, `zip_par`, and
/// `attempt` report failures as `EffectError`. Faults raised by the runtime
/// itself (missing handlers, panics) are `EffectError` values from the
/// start.
#[derive(Debug)]
pub enum EffectError {
    /// A typed domain error that crossed an erasure boundary.
    Typed(TypedError),
    /// No handler was bound for, or accepted, a performed capability.
    NoHandler(NoHandler),
    /// A thunk, generator, or handler panicked.
    Panicked(Panicked),
}

impl fmt::Display for EffectError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed(typed) => write!(formatter, "{typed}"),
            Self::NoHandler(missing) => write!(formatter, "{missing}"),
            Self::Panicked(panicked) => write!(formatter, "{panicked}"),
        }
    }
}

impl StdError for EffectError {}

// =============================================================================
// RunError
// =============================================================================

/// Terminal outcome of a failed run.
#[derive(Debug)]
pub enum RunError<E> {
    /// The effect failed through its typed error channel.
    Failed(E),
    /// The run was cancelled before producing a value.
    Cancelled(Cancelled),
    /// A failure outside the typed channel surfaced at the top.
    Fault(EffectError),
}

impl<E> RunError<E> {
    /// `true` when the run ended in cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The typed error, when the run failed through the typed channel.
    pub fn into_failed(self) -> Option<E> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RunError<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(error) => write!(formatter, "{error}"),
            Self::Cancelled(cancelled) => write!(formatter, "{cancelled}"),
            Self::Fault(fault) => write!(formatter, "{fault}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> StdError for RunError<E> {}

// =============================================================================
// Internal failure register
// =============================================================================

/// The interpreter's error register.
///
/// Cancellation is kept apart from every other failure so that frame
/// unwinding can give it the structural pass-through treatment.
pub(crate) enum Failure {
    Cancelled(Cancelled),
    Error(AnyValue),
}

impl fmt::Debug for Failure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled(cancelled) => formatter.debug_tuple("Cancelled").field(cancelled).finish(),
            Self::Error(_) => formatter.debug_tuple("Error").field(&"<erased>").finish(),
        }
    }
}

impl Failure {
    /// Erases a typed error into the register.
    pub(crate) fn from_error<T: Send + 'static>(error: T) -> Self {
        Self::Error(Box::new(error))
    }

    /// Raises a runtime fault.
    pub(crate) fn fault(fault: EffectError) -> Self {
        Self::Error(Box::new(fault))
    }
}

/// Widens an erased error to the top error type.
///
/// An erased `EffectError` passes through untouched; anything else is
/// wrapped as [`EffectError::Typed`] with the given type name.
pub(crate) fn widen_to_effect_error(payload: AnyValue, type_name: &'static str) -> EffectError {
    match payload.downcast::<EffectError>() {
        Ok(fault) => *fault,
        Err(payload) => EffectError::Typed(TypedError::from_erased(payload, type_name)),
    }
}

/// Converts a terminal [`Failure`] into the public run outcome.
pub(crate) fn run_error_from<E: 'static>(failure: Failure) -> RunError<E> {
    match failure {
        Failure::Cancelled(cancelled) => RunError::Cancelled(cancelled),
        Failure::Error(payload) => match payload.downcast::<E>() {
            Ok(error) => RunError::Failed(*error),
            Err(payload) => RunError::Fault(widen_to_effect_error(payload, "<erased>")),
        },
    }
}

/// Renders a panic payload the way `catch_unwind` delivers it.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
