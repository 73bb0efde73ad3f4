//! The advice protocol run around every instrumented call.
//!
//! A weaver, or a hand-written proxy, calls [`Dispatcher::before`] immediately before the wrapped
//! body and [`Dispatcher::after`] immediately after it, on every exit path. The scoped forms
//! [`Dispatcher::enter`] and [`Dispatcher::enter_all`] pair the two automatically and report
//! [`Outcome::Unwound`] when the body panics.
//!
//! Instrumentation never changes what the wrapped body does: its return value and errors are
//! handed back untouched and panics keep propagating.

use core::fmt::Debug;
use std::mem;
use std::sync::Arc;

use crate::backend::{Backend, InstrumentCreationError};
use crate::binding::{Binding, BindingResolver, MethodDeclaration, Resolution};
use crate::builder::{Builder, state};
use crate::propagation::SpanContextPropagator;
use crate::recorder::{self, InvocationContext};
use crate::registry::InstrumentRegistry;
use crate::settings::Settings;

/// A value returned by an instrumented method, as far as the recorders care.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReturnValue {
    /// `i32`
    Int(i32),
    /// `i64`
    Long(i64),
    /// `f32`
    Float(f32),
    /// `f64`
    Double(f64),
    /// `()`
    Unit,
    /// Anything else.
    Opaque,
}

impl ReturnValue {
    /// The value as `f64`, for numeric values.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            ReturnValue::Int(value) => Some(f64::from(value)),
            ReturnValue::Long(value) => Some(value as f64),
            ReturnValue::Float(value) => Some(f64::from(value)),
            ReturnValue::Double(value) => Some(value),
            ReturnValue::Unit | ReturnValue::Opaque => None,
        }
    }
}

impl From<i32> for ReturnValue {
    fn from(value: i32) -> Self {
        ReturnValue::Int(value)
    }
}

impl From<i64> for ReturnValue {
    fn from(value: i64) -> Self {
        ReturnValue::Long(value)
    }
}

impl From<f32> for ReturnValue {
    fn from(value: f32) -> Self {
        ReturnValue::Float(value)
    }
}

impl From<f64> for ReturnValue {
    fn from(value: f64) -> Self {
        ReturnValue::Double(value)
    }
}

impl From<()> for ReturnValue {
    fn from((): ()) -> Self {
        ReturnValue::Unit
    }
}

/// How an instrumented call ended.
#[derive(Copy, Clone, Debug)]
pub enum Outcome<'a> {
    /// The call returned normally.
    Returned(ReturnValue),
    /// The call returned an error.
    Failed(&'a dyn Debug),
    /// The call panicked.
    Unwound,
}

impl Outcome<'_> {
    /// The returned number, if the call returned one.
    pub fn returned_number(&self) -> Option<f64> {
        match self {
            Outcome::Returned(value) => value.as_f64(),
            Outcome::Failed(_) | Outcome::Unwound => None,
        }
    }

    /// Whether the call failed or panicked.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Returned(_))
    }
}

/// Classifies a value returned from a wrapped body.
///
/// Used by [`Dispatcher::call`].
pub trait Observe {
    /// The outcome this value represents.
    fn outcome(&self) -> Outcome<'_>;
}

macro_rules! observe_number {
    ($($ty:ty),*) => {
        $(
            impl Observe for $ty {
                fn outcome(&self) -> Outcome<'_> {
                    Outcome::Returned(ReturnValue::from(*self))
                }
            }
        )*
    };
}

observe_number!(i32, i64, f32, f64, ());

impl<T, E: Debug> Observe for Result<T, E> {
    fn outcome(&self) -> Outcome<'_> {
        match self {
            Ok(_) => Outcome::Returned(ReturnValue::Opaque),
            Err(error) => Outcome::Failed(error),
        }
    }
}

macro_rules! observe_opaque {
    ($($ty:ty),*) => {
        $(
            impl Observe for $ty {
                fn outcome(&self) -> Outcome<'_> {
                    Outcome::Returned(ReturnValue::Opaque)
                }
            }
        )*
    };
}

observe_opaque!(String, bool);

impl<T> Observe for Option<T> {
    fn outcome(&self) -> Outcome<'_> {
        Outcome::Returned(ReturnValue::Opaque)
    }
}

impl<T> Observe for Vec<T> {
    fn outcome(&self) -> Outcome<'_> {
        Outcome::Returned(ReturnValue::Opaque)
    }
}

/// Runs the recorders of resolved bindings around method invocations.
///
/// Owns the instrument registry and the span context propagator, and writes to one [`Backend`].
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use annotated_telemetry::backend::InMemoryBackend;
/// use annotated_telemetry::{Dispatcher, Marker, MarkerParams, MethodDeclaration, MethodId, ReturnType};
///
/// let backend = Arc::new(InMemoryBackend::new());
/// let dispatcher = Dispatcher::builder().backend(backend.clone()).build();
///
/// let resolution = dispatcher.resolve([
///     MethodDeclaration::new(MethodId::new("app::Scores", "compute_score", ReturnType::Double))
///         .marker(Marker::Histogram, MarkerParams::default().name("score")),
/// ]);
/// let score = dispatcher.call(&resolution.bindings[0], || 0.93);
///
/// assert_eq!(score, 0.93);
/// assert_eq!(backend.histogram("score").unwrap().last(), Some(0.93));
/// ```
#[derive(Debug)]
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    settings: Settings,
    resolver: BindingResolver,
    registry: InstrumentRegistry,
    propagator: SpanContextPropagator,
}

impl Dispatcher {
    /// Creates a dispatcher writing to `backend`.
    pub fn new(backend: Arc<dyn Backend>, settings: Settings) -> Self {
        Self {
            resolver: BindingResolver::new(&settings),
            backend,
            settings,
            registry: InstrumentRegistry::new(),
            propagator: SpanContextPropagator::new(),
        }
    }

    /// Starts building a dispatcher.
    pub fn builder() -> Builder<state::NoBackend> {
        Builder::new()
    }

    /// The backend recorders write to.
    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    /// The settings this dispatcher was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The resolver configured from [`Self::settings`].
    pub fn resolver(&self) -> &BindingResolver {
        &self.resolver
    }

    /// The instruments created so far.
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    /// The active span tracking.
    pub fn propagator(&self) -> &SpanContextPropagator {
        &self.propagator
    }

    /// Resolves `declarations` with [`Self::resolver`].
    pub fn resolve<I>(&self, declarations: I) -> Resolution
    where
        I: IntoIterator<Item = MethodDeclaration>,
    {
        self.resolver.resolve(declarations)
    }

    /// Runs the before-hook of `binding`, creating its instrument on first use.
    ///
    /// On error nothing has been recorded and the call should proceed uninstrumented; the next
    /// call retries the creation.
    pub fn before(&self, binding: &Binding) -> Result<InvocationContext, InstrumentCreationError> {
        let instrument = self.registry.get_or_create(binding.key(), |key| {
            recorder::create_instrument(&*self.backend, key)
        })?;
        Ok(recorder::before(instrument, &self.propagator, &*self.backend))
    }

    /// Runs the after-hook for a call started with [`Self::before`].
    pub fn after(&self, context: InvocationContext, outcome: Outcome<'_>) {
        recorder::after(context, &outcome, &self.propagator, &*self.backend);
    }

    /// Runs the before-hook and returns a guard running the after-hook.
    ///
    /// A creation failure is logged and yields a guard that records nothing.
    pub fn enter(&self, binding: &Binding) -> InvocationGuard<'_> {
        let context = match self.before(binding) {
            Ok(context) => Some(context),
            Err(error) => {
                tracing::warn!(
                    method = %binding.method(),
                    marker = %binding.marker(),
                    %error,
                    "running call uninstrumented"
                );
                None
            }
        };

        InvocationGuard {
            dispatcher: self,
            context,
        }
    }

    /// Enters every binding of one method, in order.
    ///
    /// The after-hooks run in reverse order, so the first binding wraps all the others.
    pub fn enter_all(&self, bindings: &[Binding]) -> MethodGuard<'_> {
        MethodGuard {
            guards: bindings.iter().map(|binding| self.enter(binding)).collect(),
        }
    }

    /// Runs `body` instrumented by `binding` and returns its result.
    pub fn call<R, F>(&self, binding: &Binding, body: F) -> R
    where
        R: Observe,
        F: FnOnce() -> R,
    {
        let guard = self.enter(binding);
        let result = body();
        guard.complete(result.outcome());
        result
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(crate::backend::NopBackend), Settings::default())
    }
}

/// Runs the after-hook of one binding when the call ends.
///
/// Dropping the guard without [`complete`](Self::complete) records [`Outcome::Unwound`].
#[must_use = "dropping the guard ends the instrumented call"]
#[derive(Debug)]
pub struct InvocationGuard<'a> {
    dispatcher: &'a Dispatcher,
    context: Option<InvocationContext>,
}

impl InvocationGuard<'_> {
    /// Whether the before-hook ran, meaning the call is being recorded.
    pub fn is_recording(&self) -> bool {
        self.context.is_some()
    }

    /// Ends the call with `outcome`.
    pub fn complete(mut self, outcome: Outcome<'_>) {
        if let Some(context) = self.context.take() {
            self.dispatcher.after(context, outcome);
        }
    }
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.dispatcher.after(context, Outcome::Unwound);
        }
    }
}

/// The guards of every binding on one method.
#[must_use = "dropping the guard ends the instrumented call"]
#[derive(Debug)]
pub struct MethodGuard<'a> {
    guards: Vec<InvocationGuard<'a>>,
}

impl MethodGuard<'_> {
    /// Ends the call with `outcome`, last binding first.
    pub fn complete(mut self, outcome: Outcome<'_>) {
        for guard in mem::take(&mut self.guards).into_iter().rev() {
            guard.complete(outcome);
        }
    }
}

impl Drop for MethodGuard<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::backend::{InMemoryBackend, SpanStatus};
    use crate::marker::{Marker, MarkerParams, MethodId, ReturnType};
    use crate::test_helpers::format_span_tree;

    fn setup() -> (Arc<InMemoryBackend>, Dispatcher) {
        let backend = Arc::new(InMemoryBackend::new());
        let dispatcher = Dispatcher::builder().backend(backend.clone()).build();
        (backend, dispatcher)
    }

    fn bind(
        dispatcher: &Dispatcher,
        method: MethodId,
        markers: &[(Marker, MarkerParams)],
    ) -> Vec<Binding> {
        let mut declaration = MethodDeclaration::new(method);
        for (marker, params) in markers {
            declaration = declaration.marker(*marker, params.clone());
        }
        let resolution = dispatcher.resolve([declaration]);
        assert!(resolution.rejected.is_empty(), "{:?}", resolution.rejected);
        resolution.bindings
    }

    #[test]
    fn histogram_records_return_value() {
        let (backend, dispatcher) = setup();
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Scores", "compute_score", ReturnType::Double),
            &[(Marker::Histogram, MarkerParams::default().name("score"))],
        );

        let score = dispatcher.call(&bindings[0], || 0.87_f64);

        assert_eq!(score, 0.87);
        assert_eq!(backend.histogram("score").unwrap().last(), Some(0.87));
    }

    #[test]
    fn count_and_time_on_error() {
        let (backend, dispatcher) = setup();
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Client", "risky_call", ReturnType::other("Result<(), String>")),
            &[
                (Marker::Count, MarkerParams::default().name("risky.calls")),
                (Marker::Time, MarkerParams::default().name("risky.time")),
            ],
        );

        let guard = dispatcher.enter_all(&bindings);
        let result: Result<(), String> = Err("connection reset".to_owned());
        guard.complete(result.outcome());

        assert_eq!(result, Err("connection reset".to_owned()));
        assert_eq!(backend.counter("risky.calls").unwrap().count(), 1);
        assert_eq!(backend.timer("risky.time").unwrap().durations().len(), 1);
    }

    #[test]
    fn time_is_recorded_once_per_call() {
        let (backend, dispatcher) = setup();
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Jobs", "sleep", ReturnType::Unit),
            &[(Marker::Time, MarkerParams::default().name("sleep"))],
        );

        dispatcher.call(&bindings[0], || thread::sleep(Duration::from_millis(5)));
        dispatcher.call(&bindings[0], || ());

        let durations = backend.timer("sleep").unwrap().durations();
        assert_eq!(durations.len(), 2);
        assert!(durations[0] >= Duration::from_millis(5));
    }

    #[test]
    fn outer_trace_carries_inner_customization() {
        let (backend, dispatcher) = setup();
        let outer = bind(
            &dispatcher,
            MethodId::new("app::Orders", "handle", ReturnType::Unit),
            &[(Marker::Trace, MarkerParams::default().name("orders.handle"))],
        );
        let inner = bind(
            &dispatcher,
            MethodId::new("app::Orders", "load", ReturnType::Unit),
            &[(
                Marker::CustomizeInnerSpan,
                MarkerParams::default().name("orders.load").tag("table", "orders"),
            )],
        );

        dispatcher.call(&outer[0], || dispatcher.call(&inner[0], || ()));

        assert_eq!(
            format_span_tree(backend.take_spans()),
            indoc! {"
                orders.load [component=annotation, table=orders] ok
            "}
        );
    }

    #[test]
    fn nested_traces_form_a_tree() {
        let (backend, dispatcher) = setup();
        let outer = bind(
            &dispatcher,
            MethodId::new("app::Orders", "handle", ReturnType::Unit),
            &[(Marker::Trace, MarkerParams::default())],
        );
        let inner = bind(
            &dispatcher,
            MethodId::new("app::Orders", "load", ReturnType::other("Result<(), String>")),
            &[(Marker::Trace, MarkerParams::default().component("db"))],
        );

        dispatcher.call(&outer[0], || {
            let _ = dispatcher.call(&inner[0], || Err::<(), _>("timeout".to_owned()));
            assert_eq!(
                dispatcher.propagator().current_active(),
                backend.spans().first().map(|span| span.id)
            );
            dispatcher.call(&inner[0], || Ok::<_, String>(()))
        })
        .unwrap();

        assert_eq!(
            format_span_tree(backend.take_spans()),
            indoc! {r#"
                app::Orders.handle [component=annotation] ok
                    app::Orders.load [component=db, error=true, error.message="timeout"] error: "timeout"
                    app::Orders.load [component=db] ok
            "#}
        );
        assert_eq!(dispatcher.propagator().current_active(), None);
    }

    #[test]
    fn active_span_restored_after_panic() {
        let (backend, dispatcher) = setup();
        let outer = bind(
            &dispatcher,
            MethodId::new("app::Orders", "handle", ReturnType::Unit),
            &[(Marker::Trace, MarkerParams::default().name("outer"))],
        );
        let inner = bind(
            &dispatcher,
            MethodId::new("app::Orders", "explode", ReturnType::Unit),
            &[(Marker::Trace, MarkerParams::default().name("inner"))],
        );

        dispatcher.call(&outer[0], || {
            let outer_span = dispatcher.propagator().current_active();
            let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
                dispatcher.call::<(), _>(&inner[0], || panic!("boom"))
            }));
            assert!(panicked.is_err());
            assert_eq!(dispatcher.propagator().current_active(), outer_span);
        });

        let spans = backend.take_spans();
        let inner_span = spans.iter().find(|span| span.name == "inner").unwrap();
        assert_eq!(
            inner_span.status,
            Some(SpanStatus::Error {
                message: "panicked".to_owned()
            })
        );
        assert_eq!(dispatcher.propagator().current_active(), None);
    }

    #[test]
    fn concurrency_returns_to_zero_after_bursts() {
        const THREADS: usize = 8;

        let (backend, dispatcher) = setup();
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Jobs", "work", ReturnType::other("Result<(), String>")),
            &[(Marker::TrackConcurrency, MarkerParams::default().name("jobs.in_flight"))],
        );
        let barrier = Barrier::new(THREADS);

        thread::scope(|scope| {
            for index in 0..THREADS {
                let (dispatcher, bindings, barrier) = (&dispatcher, &bindings, &barrier);
                scope.spawn(move || {
                    let _ = dispatcher.call(&bindings[0], || {
                        barrier.wait();
                        if index % 2 == 0 {
                            Ok(())
                        } else {
                            Err("odd".to_owned())
                        }
                    });
                });
            }
        });

        let Some(crate::registry::Instrument::Concurrency(tracker)) =
            dispatcher.registry().get(bindings[0].key())
        else {
            panic!("expected a concurrency tracker");
        };
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.high_water_mark(), THREADS as i64);
        assert_eq!(backend.gauge("jobs.in_flight").unwrap().value(), Some(0.0));
    }

    #[test]
    fn concurrency_released_on_panic() {
        let (_, dispatcher) = setup();
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Jobs", "work", ReturnType::Unit),
            &[(Marker::TrackConcurrency, MarkerParams::default())],
        );

        let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatcher.call::<(), _>(&bindings[0], || panic!("boom"))
        }));
        assert!(panicked.is_err());

        let Some(crate::registry::Instrument::Concurrency(tracker)) =
            dispatcher.registry().get(bindings[0].key())
        else {
            panic!("expected a concurrency tracker");
        };
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.high_water_mark(), 1);
    }

    #[traced_test]
    #[test]
    fn failed_creation_is_retried_next_call() {
        let (backend, dispatcher) = setup();
        backend.reject_next("flaky", 1);
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Jobs", "flaky", ReturnType::Int),
            &[(Marker::Count, MarkerParams::default().name("flaky"))],
        );

        assert_eq!(dispatcher.call(&bindings[0], || 1), 1);
        assert!(backend.counter("flaky").is_none());
        assert!(logs_contain("running call uninstrumented"));

        assert_eq!(dispatcher.call(&bindings[0], || 2), 2);
        assert_eq!(backend.counter("flaky").unwrap().count(), 1);
        assert_eq!(backend.creations("flaky"), 1);
    }

    #[test]
    fn before_surfaces_creation_errors() {
        let (backend, dispatcher) = setup();
        backend.reject_next("flaky", 1);
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Jobs", "flaky", ReturnType::Int),
            &[(Marker::Gauge, MarkerParams::default().name("flaky"))],
        );

        assert!(matches!(
            dispatcher.before(&bindings[0]),
            Err(InstrumentCreationError::Rejected { .. })
        ));

        let context = dispatcher.before(&bindings[0]).unwrap();
        dispatcher.after(context, Outcome::Returned(ReturnValue::Int(4)));
        assert_eq!(backend.gauge("flaky").unwrap().value(), Some(4.0));
    }

    #[test]
    fn after_hooks_run_in_reverse() {
        let (backend, dispatcher) = setup();
        let bindings = bind(
            &dispatcher,
            MethodId::new("app::Orders", "handle", ReturnType::Unit),
            &[
                (Marker::Trace, MarkerParams::default().name("handle")),
                (
                    Marker::CustomizeInnerSpan,
                    MarkerParams::default().name("handle.custom"),
                ),
            ],
        );

        // The customizer entered after the trace sees the trace's span and runs first on exit.
        dispatcher.enter_all(&bindings).complete(Outcome::Returned(ReturnValue::Unit));

        let spans = backend.take_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "handle.custom");
        assert_eq!(spans[0].status, Some(SpanStatus::Ok));
    }

    #[test]
    fn observe_classifies_values() {
        assert_eq!(7_i32.outcome().returned_number(), Some(7.0));
        assert_eq!(2.5_f32.outcome().returned_number(), Some(2.5));
        assert!(Err::<i32, _>("no").outcome().is_failure());
        assert!(!Some(3).outcome().is_failure());
        assert_eq!(String::from("x").outcome().returned_number(), None);
        assert_eq!(ReturnValue::from(()).as_f64(), None);
        assert_eq!(ReturnValue::from(3_i64).as_f64(), Some(3.0));
    }
}
