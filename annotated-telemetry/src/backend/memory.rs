use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    Backend, CounterInstrument, GaugeInstrument, HistogramInstrument, InstrumentCreationError,
    InstrumentKind, SpanStatus, TimerInstrument,
};
use crate::SpanId;
use crate::marker::Tags;

/// A backend that keeps every instrument and span in memory.
///
/// Useful for unit tests and integration tests that need to verify what was recorded.
/// Instruments are deduplicated by name, tags and kind the way a metrics registry would, so two
/// bindings asking for the same counter share it.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use annotated_telemetry::backend::{Backend, InMemoryBackend, SpanStatus};
/// use annotated_telemetry::Tags;
///
/// let backend = Arc::new(InMemoryBackend::new());
/// let span = backend.start_span("load", None, &Tags::new());
/// backend.finish_span(span, SpanStatus::Ok);
///
/// let spans = backend.take_spans();
/// assert_eq!(spans[0].name, "load");
/// assert_eq!(spans[0].status, Some(SpanStatus::Ok));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    instruments: BTreeMap<(String, Tags), Stored>,
    creations: BTreeMap<String, usize>,
    pending_rejections: BTreeMap<String, usize>,
    spans: Vec<RecordedSpan>,
}

#[derive(Debug, Clone)]
enum Stored {
    Counter(Arc<MemoryCounter>),
    Histogram(Arc<MemoryHistogram>),
    Gauge(Arc<MemoryGauge>),
    Timer(Arc<MemoryTimer>),
}

impl Stored {
    fn kind(&self) -> InstrumentKind {
        match self {
            Stored::Counter(_) => InstrumentKind::Counter,
            Stored::Histogram(_) => InstrumentKind::Histogram,
            Stored::Gauge(_) => InstrumentKind::Gauge,
            Stored::Timer(_) => InstrumentKind::Timer,
        }
    }
}

/// A span as recorded by [`InMemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpan {
    /// The span id.
    pub id: SpanId,
    /// The parent span, if it was started inside another one.
    pub parent: Option<SpanId>,
    /// Current operation name.
    pub name: String,
    /// Tags from creation and later updates.
    pub tags: Tags,
    /// `None` while the span is still open.
    pub status: Option<SpanStatus>,
}

impl RecordedSpan {
    /// Whether the span has been finished.
    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }
}

/// Counter kept by [`InMemoryBackend`].
#[derive(Debug, Default)]
pub struct MemoryCounter {
    count: AtomicU64,
}

impl MemoryCounter {
    /// Current count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl CounterInstrument for MemoryCounter {
    fn increment(&self, by: u64) {
        self.count.fetch_add(by, Ordering::AcqRel);
    }
}

/// Histogram kept by [`InMemoryBackend`].
#[derive(Debug, Default)]
pub struct MemoryHistogram {
    unit: Option<String>,
    values: Mutex<Vec<f64>>,
}

impl MemoryHistogram {
    /// The unit the histogram was created with.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Every recorded value, oldest first.
    pub fn values(&self) -> Vec<f64> {
        lock(&self.values).clone()
    }

    /// The most recently recorded value.
    pub fn last(&self) -> Option<f64> {
        lock(&self.values).last().copied()
    }
}

impl HistogramInstrument for MemoryHistogram {
    fn record(&self, value: f64) {
        lock(&self.values).push(value);
    }
}

/// Gauge kept by [`InMemoryBackend`].
#[derive(Debug, Default)]
pub struct MemoryGauge {
    history: Mutex<Vec<f64>>,
}

impl MemoryGauge {
    /// Current value, `None` if never set.
    pub fn value(&self) -> Option<f64> {
        lock(&self.history).last().copied()
    }

    /// Every value the gauge was set to, oldest first.
    pub fn history(&self) -> Vec<f64> {
        lock(&self.history).clone()
    }
}

impl GaugeInstrument for MemoryGauge {
    fn set(&self, value: f64) {
        lock(&self.history).push(value);
    }
}

/// Timer kept by [`InMemoryBackend`].
#[derive(Debug, Default)]
pub struct MemoryTimer {
    durations: Mutex<Vec<Duration>>,
}

impl MemoryTimer {
    /// Every recorded duration, oldest first.
    pub fn durations(&self) -> Vec<Duration> {
        lock(&self.durations).clone()
    }
}

impl TimerInstrument for MemoryTimer {
    fn record(&self, elapsed: Duration) {
        lock(&self.durations).push(elapsed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` creations of instruments called `name` fail.
    pub fn reject_next(&self, name: impl Into<String>, times: usize) {
        *lock(&self.state)
            .pending_rejections
            .entry(name.into())
            .or_default() += times;
    }

    /// How many times an instrument called `name` was successfully requested.
    pub fn creations(&self, name: &str) -> usize {
        lock(&self.state).creations.get(name).copied().unwrap_or(0)
    }

    /// The first counter called `name`, whatever its tags.
    pub fn counter(&self, name: &str) -> Option<Arc<MemoryCounter>> {
        self.find(name, |stored| match stored {
            Stored::Counter(counter) => Some(counter.clone()),
            _ => None,
        })
    }

    /// The first histogram called `name`, whatever its tags.
    pub fn histogram(&self, name: &str) -> Option<Arc<MemoryHistogram>> {
        self.find(name, |stored| match stored {
            Stored::Histogram(histogram) => Some(histogram.clone()),
            _ => None,
        })
    }

    /// The first gauge called `name`, whatever its tags.
    pub fn gauge(&self, name: &str) -> Option<Arc<MemoryGauge>> {
        self.find(name, |stored| match stored {
            Stored::Gauge(gauge) => Some(gauge.clone()),
            _ => None,
        })
    }

    /// The first timer called `name`, whatever its tags.
    pub fn timer(&self, name: &str) -> Option<Arc<MemoryTimer>> {
        self.find(name, |stored| match stored {
            Stored::Timer(timer) => Some(timer.clone()),
            _ => None,
        })
    }

    /// The tags of every instrument called `name`.
    pub fn tags_of(&self, name: &str) -> Vec<Tags> {
        lock(&self.state)
            .instruments
            .keys()
            .filter(|(existing, _)| existing == name)
            .map(|(_, tags)| tags.clone())
            .collect()
    }

    /// A snapshot of every span recorded so far, in start order.
    pub fn spans(&self) -> Vec<RecordedSpan> {
        lock(&self.state).spans.clone()
    }

    /// Removes and returns every span recorded so far, in start order.
    pub fn take_spans(&self) -> Vec<RecordedSpan> {
        core::mem::take(&mut lock(&self.state).spans)
    }

    fn find<T>(&self, name: &str, select: impl Fn(&Stored) -> Option<T>) -> Option<T> {
        lock(&self.state)
            .instruments
            .iter()
            .filter(|((existing, _), _)| existing == name)
            .find_map(|(_, stored)| select(stored))
    }

    /// Returns the instrument stored under `name` and `tags`, creating it if absent.
    ///
    /// `select` extracts the typed instrument of the requested `kind`; an existing instrument
    /// it does not match is a kind conflict.
    fn get_or_insert<T: Clone>(
        &self,
        name: &str,
        tags: &Tags,
        kind: InstrumentKind,
        select: impl Fn(&Stored) -> Option<T>,
        create: impl FnOnce() -> T,
        store: impl FnOnce(T) -> Stored,
    ) -> Result<T, InstrumentCreationError> {
        let mut state = lock(&self.state);

        if let Some(pending) = state.pending_rejections.get_mut(name)
            && *pending > 0
        {
            *pending -= 1;
            return Err(InstrumentCreationError::Rejected {
                name: name.to_owned(),
                reason: "rejected by test backend".to_owned(),
            });
        }

        let instrument = match state.instruments.get(&(name.to_owned(), tags.clone())) {
            Some(existing) => {
                select(existing).ok_or_else(|| InstrumentCreationError::KindConflict {
                    name: name.to_owned(),
                    existing: existing.kind(),
                    requested: kind,
                })?
            }
            None => {
                let instrument = create();
                state
                    .instruments
                    .insert((name.to_owned(), tags.clone()), store(instrument.clone()));
                instrument
            }
        };

        *state.creations.entry(name.to_owned()).or_default() += 1;
        Ok(instrument)
    }

    fn with_span(&self, span: SpanId, update: impl FnOnce(&mut RecordedSpan)) {
        if let Some(recorded) = lock(&self.state)
            .spans
            .iter_mut()
            .rev()
            .find(|recorded| recorded.id == span)
        {
            update(recorded);
        }
    }
}

impl Backend for InMemoryBackend {
    fn create_counter(
        &self,
        name: &str,
        tags: &Tags,
    ) -> Result<Arc<dyn CounterInstrument>, InstrumentCreationError> {
        let counter = self.get_or_insert(
            name,
            tags,
            InstrumentKind::Counter,
            |stored| match stored {
                Stored::Counter(counter) => Some(counter.clone()),
                _ => None,
            },
            Arc::default,
            Stored::Counter,
        )?;
        Ok(counter)
    }

    fn create_histogram(
        &self,
        name: &str,
        tags: &Tags,
        unit: Option<&str>,
    ) -> Result<Arc<dyn HistogramInstrument>, InstrumentCreationError> {
        let histogram = self.get_or_insert(
            name,
            tags,
            InstrumentKind::Histogram,
            |stored| match stored {
                Stored::Histogram(histogram) => Some(histogram.clone()),
                _ => None,
            },
            || {
                Arc::new(MemoryHistogram {
                    unit: unit.map(str::to_owned),
                    values: Mutex::default(),
                })
            },
            Stored::Histogram,
        )?;
        Ok(histogram)
    }

    fn create_gauge(
        &self,
        name: &str,
        tags: &Tags,
    ) -> Result<Arc<dyn GaugeInstrument>, InstrumentCreationError> {
        let gauge = self.get_or_insert(
            name,
            tags,
            InstrumentKind::Gauge,
            |stored| match stored {
                Stored::Gauge(gauge) => Some(gauge.clone()),
                _ => None,
            },
            Arc::default,
            Stored::Gauge,
        )?;
        Ok(gauge)
    }

    fn create_timer(
        &self,
        name: &str,
        tags: &Tags,
    ) -> Result<Arc<dyn TimerInstrument>, InstrumentCreationError> {
        let timer = self.get_or_insert(
            name,
            tags,
            InstrumentKind::Timer,
            |stored| match stored {
                Stored::Timer(timer) => Some(timer.clone()),
                _ => None,
            },
            Arc::default,
            Stored::Timer,
        )?;
        Ok(timer)
    }

    fn start_span(&self, name: &str, parent: Option<SpanId>, tags: &Tags) -> SpanId {
        let id = SpanId::next_id();
        lock(&self.state).spans.push(RecordedSpan {
            id,
            parent,
            name: name.to_owned(),
            tags: tags.clone(),
            status: None,
        });
        id
    }

    fn finish_span(&self, span: SpanId, status: SpanStatus) {
        self.with_span(span, |recorded| {
            if let SpanStatus::Error { message } = &status {
                recorded.tags.insert("error".to_owned(), "true".to_owned());
                recorded
                    .tags
                    .insert("error.message".to_owned(), message.clone());
            }
            recorded.status = Some(status);
        });
    }

    fn set_span_tag(&self, span: SpanId, key: &str, value: &str) {
        self.with_span(span, |recorded| {
            recorded.tags.insert(key.to_owned(), value.to_owned());
        });
    }

    fn set_span_name(&self, span: SpanId, name: &str) {
        self.with_span(span, |recorded| recorded.name = name.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn same_name_and_tags_share_instrument() {
        let backend = InMemoryBackend::new();
        let first = backend.create_counter("calls", &tags(&[("a", "1")])).unwrap();
        let second = backend.create_counter("calls", &tags(&[("a", "1")])).unwrap();
        first.increment(1);
        second.increment(1);

        assert_eq!(backend.counter("calls").unwrap().count(), 2);
        assert_eq!(backend.creations("calls"), 2);
    }

    #[test]
    fn different_tags_are_different_instruments() {
        let backend = InMemoryBackend::new();
        backend.create_counter("calls", &tags(&[("a", "1")])).unwrap();
        backend.create_counter("calls", &tags(&[("a", "2")])).unwrap();

        assert_eq!(backend.tags_of("calls").len(), 2);
    }

    #[test]
    fn kind_conflict_is_rejected() {
        let backend = InMemoryBackend::new();
        backend.create_counter("latency", &Tags::new()).unwrap();

        let error = backend.create_timer("latency", &Tags::new()).unwrap_err();
        assert_eq!(
            error,
            InstrumentCreationError::KindConflict {
                name: "latency".to_owned(),
                existing: InstrumentKind::Counter,
                requested: InstrumentKind::Timer,
            }
        );
        assert_eq!(
            error.to_string(),
            "instrument `latency` already exists as a counter, cannot create a timer"
        );
    }

    #[test]
    fn injected_rejections_are_consumed() {
        let backend = InMemoryBackend::new();
        backend.reject_next("flaky", 1);

        assert!(matches!(
            backend.create_gauge("flaky", &Tags::new()),
            Err(InstrumentCreationError::Rejected { .. })
        ));
        assert!(backend.create_gauge("flaky", &Tags::new()).is_ok());
        assert_eq!(backend.creations("flaky"), 1);
    }

    #[test]
    fn histogram_keeps_unit_and_values() {
        let backend = InMemoryBackend::new();
        let histogram = backend
            .create_histogram("size", &Tags::new(), Some("bytes"))
            .unwrap();
        histogram.record(1.0);
        histogram.record(3.5);

        let stored = backend.histogram("size").unwrap();
        assert_eq!(stored.unit(), Some("bytes"));
        assert_eq!(stored.values(), vec![1.0, 3.5]);
        assert_eq!(stored.last(), Some(3.5));
    }

    #[test]
    fn span_lifecycle() {
        let backend = InMemoryBackend::new();
        let parent = backend.start_span("outer", None, &tags(&[("component", "test")]));
        let child = backend.start_span("inner", Some(parent), &Tags::new());

        backend.set_span_tag(parent, "user", "42");
        backend.set_span_name(child, "renamed");
        backend.finish_span(
            child,
            SpanStatus::Error {
                message: "boom".to_owned(),
            },
        );

        let spans = backend.take_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].tags, tags(&[("component", "test"), ("user", "42")]));
        assert!(!spans[0].is_finished());
        assert_eq!(spans[1].name, "renamed");
        assert_eq!(spans[1].parent, Some(parent));
        assert_eq!(
            spans[1].tags,
            tags(&[("error", "true"), ("error.message", "boom")])
        );
        assert!(backend.spans().is_empty());
    }
}
