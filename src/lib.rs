//! # filament
//!
//! A lazily evaluated effect runtime: programs are first-class immutable
//! descriptions ([`Effect`]) built from pure combinators, and a runtime
//! ([`EffectRuntime`]) supplies the execution machinery around them:
//!
//! - A **stack-safe trampoline interpreter** that evaluates arbitrarily
//!   deep compositions in constant native stack.
//! - **Fibers and scopes** for structured concurrency: forks are tracked
//!   by lexical scopes, cancelled on scope exit, and never outlive the
//!   scope that created them.
//! - **Capabilities and handlers**: side-effecting requests are plain
//!   data, interpreted by a handler resolved from the execution context,
//!   so interpretation is swappable and programs test without mocks.
//! - **Cooperative cancellation**: a structural signal observed at
//!   interpreter checkpoints, which recovery combinators cannot catch.
//!
//! ## Example
//!
//! ```rust
//! use filament::{Effect, EffectRuntime};
//!
//! let runtime = EffectRuntime::create();
//!
//! let program = Effect::<String, i32>::succeed(1)
//!     .flat_map(|x| Effect::succeed(x + 1))
//!     .flat_map(|x| Effect::succeed(x * 2))
//!     .map(|x| x + 10);
//!
//! assert_eq!(runtime.run(program).unwrap(), 14);
//! ```
//!
//! ## Parallelism
//!
//! ```rust
//! use filament::{Effect, EffectRuntime};
//!
//! let runtime = EffectRuntime::create();
//!
//! let hello = Effect::<String, &str>::succeed("Hello");
//! let world = Effect::<String, &str>::succeed("World");
//! let both = hello.zip_par(world, |a, b| format!("{a} {b}"));
//!
//! assert_eq!(runtime.run(both).unwrap(), "Hello World");
//! ```
//!
//! ## Feature Flags
//!
//! - `tokio` (default): the [`TokioExecutor`], dispatching effect tasks
//!   onto the blocking pool of a shared tokio runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod capability;
pub mod effect;
pub mod error;
pub mod runtime;

pub use capability::{
    compose, AnyCapability, Capability, CapabilityHandler, CapabilityRegistry, ComposedHandler,
    HandlerExt, HandlerOutcome,
};
pub use effect::{par2, par3, par4, Effect};
pub use error::{Cancelled, EffectError, NoHandler, Panicked, RunError, TypedError};
pub use runtime::context::ExecutionContext;
pub use runtime::executor::{Executor, Task, ThreadExecutor};
pub use runtime::fiber::{Fiber, FiberId};
pub use runtime::generator::GeneratorContext;
pub use runtime::scope::EffectScope;
pub use runtime::signal::InterruptSignal;
pub use runtime::{CancellationHandle, EffectRuntime};

#[cfg(feature = "tokio")]
pub use runtime::executor::TokioExecutor;

/// Prelude for convenient imports.
///
/// # Usage
///
/// ```rust
/// use filament::prelude::*;
/// ```
pub mod prelude {
    pub use crate::capability::{
        compose, AnyCapability, Capability, CapabilityHandler, CapabilityRegistry, HandlerExt,
        HandlerOutcome,
    };
    pub use crate::effect::{par2, par3, par4, Effect};
    pub use crate::error::{Cancelled, EffectError, RunError};
    pub use crate::runtime::executor::{Executor, ThreadExecutor};
    pub use crate::runtime::fiber::{Fiber, FiberId};
    pub use crate::runtime::generator::GeneratorContext;
    pub use crate::runtime::scope::EffectScope;
    pub use crate::runtime::{CancellationHandle, EffectRuntime};

    #[cfg(feature = "tokio")]
    pub use crate::runtime::executor::TokioExecutor;
}
