//! The metrics and tracing backend the recorders write to.
//!
//! The [`Backend`] trait is the sink the engine needs: instrument factories plus span start,
//! finish and tagging. Storage and export are entirely the backend's concern.
//!
//! # Built-in backends
//!
//! - [`NopBackend`] - records nothing, used when no backend is configured
//! - [`InMemoryBackend`] - keeps everything in memory for inspection in tests

mod memory;

use core::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

pub use memory::{
    InMemoryBackend, MemoryCounter, MemoryGauge, MemoryHistogram, MemoryTimer, RecordedSpan,
};

use crate::SpanId;
use crate::marker::Tags;

/// A monotonically increasing counter.
pub trait CounterInstrument: Debug + Send + Sync {
    /// Adds `by` to the counter.
    fn increment(&self, by: u64);
}

/// A distribution of recorded values.
pub trait HistogramInstrument: Debug + Send + Sync {
    /// Records one value.
    fn record(&self, value: f64);
}

/// A value that is set rather than accumulated.
pub trait GaugeInstrument: Debug + Send + Sync {
    /// Sets the current value.
    fn set(&self, value: f64);
}

/// A distribution of durations.
pub trait TimerInstrument: Debug + Send + Sync {
    /// Records one elapsed duration.
    fn record(&self, elapsed: Duration);
}

/// The kind of metric instrument, used in conflict reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum InstrumentKind {
    /// [`CounterInstrument`]
    Counter,
    /// [`HistogramInstrument`]
    Histogram,
    /// [`GaugeInstrument`]
    Gauge,
    /// [`TimerInstrument`]
    Timer,
}

impl core::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::Histogram => "histogram",
            InstrumentKind::Gauge => "gauge",
            InstrumentKind::Timer => "timer",
        })
    }
}

/// How a span ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpanStatus {
    /// The traced call returned normally.
    Ok,
    /// The traced call failed.
    Error {
        /// Description of the failure.
        message: String,
    },
}

/// The error returned when a backend refuses to create an instrument.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InstrumentCreationError {
    /// The backend rejected the instrument.
    #[error("backend rejected instrument `{name}`: {reason}")]
    Rejected {
        /// Requested instrument name.
        name: String,
        /// Why the backend refused.
        reason: String,
    },

    /// An instrument with the same name and tags but another kind already exists.
    #[error("instrument `{name}` already exists as a {existing}, cannot create a {requested}")]
    KindConflict {
        /// Requested instrument name.
        name: String,
        /// Kind of the existing instrument.
        existing: InstrumentKind,
        /// Kind that was requested.
        requested: InstrumentKind,
    },
}

/// The telemetry sink used by the recorders.
///
/// All calls are synchronous from the engine's point of view and may come from any thread.
///
/// # Examples
///
/// ```rust
/// use annotated_telemetry::backend::{Backend, InMemoryBackend};
/// use annotated_telemetry::Tags;
///
/// let backend = InMemoryBackend::new();
/// let counter = backend.create_counter("jobs", &Tags::new()).unwrap();
/// counter.increment(2);
/// assert_eq!(backend.counter("jobs").unwrap().count(), 2);
/// ```
pub trait Backend: Debug + Send + Sync {
    /// Creates a counter.
    fn create_counter(
        &self,
        name: &str,
        tags: &Tags,
    ) -> Result<Arc<dyn CounterInstrument>, InstrumentCreationError>;

    /// Creates a histogram with an optional measurement unit.
    fn create_histogram(
        &self,
        name: &str,
        tags: &Tags,
        unit: Option<&str>,
    ) -> Result<Arc<dyn HistogramInstrument>, InstrumentCreationError>;

    /// Creates a gauge.
    fn create_gauge(
        &self,
        name: &str,
        tags: &Tags,
    ) -> Result<Arc<dyn GaugeInstrument>, InstrumentCreationError>;

    /// Creates a timer.
    fn create_timer(
        &self,
        name: &str,
        tags: &Tags,
    ) -> Result<Arc<dyn TimerInstrument>, InstrumentCreationError>;

    /// Starts a span, as a child of `parent` if given.
    fn start_span(&self, name: &str, parent: Option<SpanId>, tags: &Tags) -> SpanId;

    /// Finishes a span.
    fn finish_span(&self, span: SpanId, status: SpanStatus);

    /// Sets a tag on an unfinished span.
    fn set_span_tag(&self, span: SpanId, key: &str, value: &str);

    /// Renames an unfinished span.
    fn set_span_name(&self, span: SpanId, name: &str);
}

/// A backend that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopBackend;

#[derive(Debug)]
struct NopInstrument;

impl CounterInstrument for NopInstrument {
    fn increment(&self, _: u64) {}
}

impl HistogramInstrument for NopInstrument {
    fn record(&self, _: f64) {}
}

impl GaugeInstrument for NopInstrument {
    fn set(&self, _: f64) {}
}

impl TimerInstrument for NopInstrument {
    fn record(&self, _: Duration) {}
}

impl Backend for NopBackend {
    fn create_counter(
        &self,
        _: &str,
        _: &Tags,
    ) -> Result<Arc<dyn CounterInstrument>, InstrumentCreationError> {
        Ok(Arc::new(NopInstrument))
    }

    fn create_histogram(
        &self,
        _: &str,
        _: &Tags,
        _: Option<&str>,
    ) -> Result<Arc<dyn HistogramInstrument>, InstrumentCreationError> {
        Ok(Arc::new(NopInstrument))
    }

    fn create_gauge(
        &self,
        _: &str,
        _: &Tags,
    ) -> Result<Arc<dyn GaugeInstrument>, InstrumentCreationError> {
        Ok(Arc::new(NopInstrument))
    }

    fn create_timer(
        &self,
        _: &str,
        _: &Tags,
    ) -> Result<Arc<dyn TimerInstrument>, InstrumentCreationError> {
        Ok(Arc::new(NopInstrument))
    }

    fn start_span(&self, _: &str, _: Option<SpanId>, _: &Tags) -> SpanId {
        SpanId::next_id()
    }

    fn finish_span(&self, _: SpanId, _: SpanStatus) {}

    fn set_span_tag(&self, _: SpanId, _: &str, _: &str) {}

    fn set_span_name(&self, _: SpanId, _: &str) {}
}
