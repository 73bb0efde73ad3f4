//! # `annotated-telemetry`
//!
//! Declarative method instrumentation: mark a function with what should be recorded about it and
//! every call records it, with no telemetry code at the call site.
//!
//! ## Markers
//!
//! - `#[trace]` - wrap each call in a span, nested under the caller's span
//! - `#[customize_inner_span]` - rename and tag the span the call runs in
//! - `#[count]` - count calls, failures included
//! - `#[track_concurrency]` - gauge of calls in flight, with a high-water mark
//! - `#[time]` - record how long each call takes
//! - `#[histogram]` - record the numeric return value
//! - `#[gauge]` - set a gauge to the numeric return value
//!
//! ## Basic Usage
//!
//! Install a dispatcher with a [`Backend`](backend::Backend) once, then mark functions:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use annotated_telemetry::backend::InMemoryBackend;
//! use annotated_telemetry::{Dispatcher, count, histogram};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(InMemoryBackend::new());
//! Dispatcher::builder().backend(backend.clone()).set_global()?;
//!
//! #[histogram(name = "score", unit = "points")]
//! fn compute_score() -> f64 {
//!     0.93
//! }
//!
//! #[count(name = "risky.calls")]
//! fn risky_call() -> Result<(), String> {
//!     Err("unavailable".to_owned())
//! }
//!
//! assert_eq!(compute_score(), 0.93);
//! assert!(risky_call().is_err());
//!
//! assert_eq!(backend.histogram("score").unwrap().last(), Some(0.93));
//! assert_eq!(backend.counter("risky.calls").unwrap().count(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! Invalid markers, such as `#[histogram]` on a function that does not return a number, are
//! reported through `tracing` and dropped; the function itself keeps working.
//!
//! ## Without the macros
//!
//! [`BindingResolver`] turns [`MethodDeclaration`]s into [`Binding`]s and [`Dispatcher`] runs
//! them around a call, see [`Dispatcher::before`], [`Dispatcher::enter`] and [`Dispatcher::call`].

#![forbid(unsafe_code)]

pub mod advice;
pub mod backend;
pub mod binding;
pub mod builder;
pub mod global;
pub mod id;
#[doc(hidden)]
pub mod macro_helpers;
pub mod marker;
pub mod propagation;
pub mod recorder;
pub mod registry;
pub mod settings;
#[doc(hidden)]
pub mod test_helpers;

pub use advice::{Dispatcher, InvocationGuard, MethodGuard, Observe, Outcome, ReturnValue};
pub use annotated_telemetry_macros::{
    count, customize_inner_span, gauge, histogram, time, trace, track_concurrency,
};
pub use binding::{
    Binding, BindingResolver, BindingValidationError, InstrumentKey, MethodDeclaration,
    Resolution, ResolvedParams,
};
pub use global::SetGlobalError;
pub use id::{ExecutionContextId, SpanId};
pub use marker::{Marker, MarkerParams, MethodId, ReturnType, Tags, UnknownMarker};
pub use settings::{Settings, SettingsError};
