//! Per-marker recording logic.
//!
//! Every marker has a creation step, run once per [`InstrumentKey`] by the registry, and a pair of
//! hooks run around each invocation. The before-hook turns the shared [`Instrument`] into an
//! [`InvocationContext`]; the after-hook consumes it together with the call's [`Outcome`].
//!
//! | Marker | Before | After |
//! |---|---|---|
//! | trace | start a child of the active span, activate it | restore the previous span, finish |
//! | customize_inner_span | capture the active span | rename and tag it |
//! | count | | increment |
//! | track_concurrency | in-flight + 1, raise peak, update gauge | in-flight - 1, update gauge |
//! | time | capture the start instant | record the elapsed time |
//! | histogram | | record a returned number |
//! | gauge | | set to a returned number |

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::advice::Outcome;
use crate::backend::{
    Backend, CounterInstrument, GaugeInstrument, HistogramInstrument, InstrumentCreationError,
    SpanStatus, TimerInstrument,
};
use crate::binding::InstrumentKey;
use crate::id::SpanId;
use crate::marker::{Marker, Tags};
use crate::propagation::{Activation, SpanContextPropagator};
use crate::registry::Instrument;

/// Operation name and tags applied to a span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanTemplate {
    /// Operation name.
    pub name: String,
    /// Tags set on the span.
    pub tags: Tags,
}

/// Name and tag overrides applied to the span a call runs in.
///
/// Without a name the span keeps its own and only the tags are applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanOverrides {
    /// Replacement operation name.
    pub name: Option<String>,
    /// Tags set on the span.
    pub tags: Tags,
}

/// In-flight bookkeeping for one concurrency-tracked method.
#[derive(Debug)]
pub struct ConcurrencyTracker {
    gauge: Arc<dyn GaugeInstrument>,
    in_flight: AtomicI64,
    peak: AtomicI64,
    /// Held across an update and its publication, so the gauge sees updates in order.
    publish: Mutex<()>,
}

impl ConcurrencyTracker {
    /// Creates a tracker reporting to `gauge`.
    pub fn new(gauge: Arc<dyn GaugeInstrument>) -> Self {
        Self {
            gauge,
            in_flight: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            publish: Mutex::new(()),
        }
    }

    /// Calls currently executing.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The largest number of calls ever observed executing at once.
    pub fn high_water_mark(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    fn enter(&self) {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        self.gauge.set(now as f64);
    }

    fn exit(&self) {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.gauge.set(now as f64);
    }
}

/// State carried from the before-hook to the after-hook of a single call.
#[derive(Debug)]
pub enum InvocationContext {
    /// A span was started and activated.
    Trace {
        /// The started span.
        span: SpanId,
        /// What was active before it.
        activation: Activation,
    },
    /// The span active at entry, if any, and the overrides to apply to it.
    CustomizeInnerSpan {
        /// Span to customize.
        target: Option<SpanId>,
        /// Overrides.
        overrides: Arc<SpanOverrides>,
    },
    /// A counter to increment on exit.
    Count(Arc<dyn CounterInstrument>),
    /// The call was counted as in flight.
    TrackConcurrency(Arc<ConcurrencyTracker>),
    /// A timer and the instant the call started.
    Time {
        /// Timer receiving the elapsed time.
        timer: Arc<dyn TimerInstrument>,
        /// Start of the call.
        started: Instant,
    },
    /// A histogram for the returned value.
    Histogram(Arc<dyn HistogramInstrument>),
    /// A gauge for the returned value.
    Gauge(Arc<dyn GaugeInstrument>),
}

/// Creates the instrument for `key` through `backend`.
pub(crate) fn create_instrument(
    backend: &dyn Backend,
    key: &InstrumentKey,
) -> Result<Instrument, InstrumentCreationError> {
    let params = key.params();
    let (name, tags) = (params.name.as_str(), &params.tags);

    Ok(match key.marker() {
        Marker::Trace => Instrument::Span(Arc::new(SpanTemplate {
            name: name.to_owned(),
            tags: tags.clone(),
        })),
        Marker::CustomizeInnerSpan => Instrument::SpanCustomizer(Arc::new(SpanOverrides {
            name: params.name_given.then(|| name.to_owned()),
            tags: tags.clone(),
        })),
        Marker::Count => Instrument::Counter(backend.create_counter(name, tags)?),
        Marker::TrackConcurrency => Instrument::Concurrency(Arc::new(ConcurrencyTracker::new(
            backend.create_gauge(name, tags)?,
        ))),
        Marker::Time => Instrument::Timer(backend.create_timer(name, tags)?),
        Marker::Histogram => Instrument::Histogram(backend.create_histogram(
            name,
            tags,
            params.unit.as_deref(),
        )?),
        Marker::Gauge => Instrument::Gauge(backend.create_gauge(name, tags)?),
    })
}

/// Runs the before-hook for `instrument`.
pub(crate) fn before(
    instrument: Instrument,
    propagator: &SpanContextPropagator,
    backend: &dyn Backend,
) -> InvocationContext {
    match instrument {
        Instrument::Span(template) => {
            let span = propagator.start(backend, &template.name, &template.tags);
            InvocationContext::Trace {
                span,
                activation: propagator.activate(span),
            }
        }
        Instrument::SpanCustomizer(overrides) => InvocationContext::CustomizeInnerSpan {
            target: propagator.current_active(),
            overrides,
        },
        Instrument::Counter(counter) => InvocationContext::Count(counter),
        Instrument::Concurrency(tracker) => {
            tracker.enter();
            InvocationContext::TrackConcurrency(tracker)
        }
        Instrument::Timer(timer) => InvocationContext::Time {
            timer,
            started: Instant::now(),
        },
        Instrument::Histogram(histogram) => InvocationContext::Histogram(histogram),
        Instrument::Gauge(gauge) => InvocationContext::Gauge(gauge),
    }
}

/// Runs the after-hook for `context`.
pub(crate) fn after(
    context: InvocationContext,
    outcome: &Outcome<'_>,
    propagator: &SpanContextPropagator,
    backend: &dyn Backend,
) {
    match context {
        InvocationContext::Trace { span, activation } => {
            propagator.restore(activation);
            propagator.finish(backend, span, span_status(outcome));
        }
        InvocationContext::CustomizeInnerSpan { target, overrides } => {
            let Some(span) = target else {
                return;
            };
            if let Some(name) = &overrides.name {
                backend.set_span_name(span, name);
            }
            for (key, value) in &overrides.tags {
                backend.set_span_tag(span, key, value);
            }
        }
        InvocationContext::Count(counter) => counter.increment(1),
        InvocationContext::TrackConcurrency(tracker) => tracker.exit(),
        InvocationContext::Time { timer, started } => timer.record(started.elapsed()),
        InvocationContext::Histogram(histogram) => {
            if let Some(value) = outcome.returned_number() {
                histogram.record(value);
            }
        }
        InvocationContext::Gauge(gauge) => {
            if let Some(value) = outcome.returned_number() {
                gauge.set(value);
            }
        }
    }
}

fn span_status(outcome: &Outcome<'_>) -> SpanStatus {
    match outcome {
        Outcome::Returned(_) => SpanStatus::Ok,
        Outcome::Failed(error) => SpanStatus::Error {
            message: format!("{error:?}"),
        },
        Outcome::Unwound => SpanStatus::Error {
            message: "panicked".to_owned(),
        },
    }
}
