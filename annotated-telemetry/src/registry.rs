//! The instrument registry.
//!
//! Maps an [`InstrumentKey`] to the [`Instrument`] created for it. Every key owns a slot; the slot
//! is looked up under a short shard lock and creation is serialised on the slot alone, so callers
//! racing on one key never block callers using another key.
//!
//! A failed creation leaves the slot empty, the next caller retries.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;

use crate::backend::{
    CounterInstrument, GaugeInstrument, HistogramInstrument, InstrumentCreationError,
    TimerInstrument,
};
use crate::binding::InstrumentKey;
use crate::recorder::{ConcurrencyTracker, SpanOverrides, SpanTemplate};

/// An instrument shared by every invocation of a binding.
#[derive(Clone, Debug)]
pub enum Instrument {
    /// Span factory for [`Marker::Trace`][crate::Marker::Trace].
    Span(Arc<SpanTemplate>),
    /// Overrides for [`Marker::CustomizeInnerSpan`][crate::Marker::CustomizeInnerSpan].
    SpanCustomizer(Arc<SpanOverrides>),
    /// Backend counter for [`Marker::Count`][crate::Marker::Count].
    Counter(Arc<dyn CounterInstrument>),
    /// In-flight state for [`Marker::TrackConcurrency`][crate::Marker::TrackConcurrency].
    Concurrency(Arc<ConcurrencyTracker>),
    /// Backend timer for [`Marker::Time`][crate::Marker::Time].
    Timer(Arc<dyn TimerInstrument>),
    /// Backend histogram for [`Marker::Histogram`][crate::Marker::Histogram].
    Histogram(Arc<dyn HistogramInstrument>),
    /// Backend gauge for [`Marker::Gauge`][crate::Marker::Gauge].
    Gauge(Arc<dyn GaugeInstrument>),
}

impl Instrument {
    /// Returns `true` if both values are handles to the same instrument.
    pub fn same_as(&self, other: &Instrument) -> bool {
        match (self, other) {
            (Instrument::Span(a), Instrument::Span(b)) => Arc::ptr_eq(a, b),
            (Instrument::SpanCustomizer(a), Instrument::SpanCustomizer(b)) => Arc::ptr_eq(a, b),
            (Instrument::Counter(a), Instrument::Counter(b)) => Arc::ptr_eq(a, b),
            (Instrument::Concurrency(a), Instrument::Concurrency(b)) => Arc::ptr_eq(a, b),
            (Instrument::Timer(a), Instrument::Timer(b)) => Arc::ptr_eq(a, b),
            (Instrument::Histogram(a), Instrument::Histogram(b)) => Arc::ptr_eq(a, b),
            (Instrument::Gauge(a), Instrument::Gauge(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    instrument: OnceLock<Instrument>,
    creation: Mutex<()>,
}

/// Concurrency-safe cache of instruments, created lazily and kept for the registry's lifetime.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use annotated_telemetry::backend::{Backend, InMemoryBackend, InstrumentCreationError};
/// use annotated_telemetry::registry::{Instrument, InstrumentRegistry};
/// use annotated_telemetry::{
///     BindingResolver, InstrumentKey, Marker, MarkerParams, MethodDeclaration, MethodId,
///     ReturnType, Settings, Tags,
/// };
///
/// let backend = InMemoryBackend::new();
/// let resolution = BindingResolver::new(&Settings::default()).resolve([
///     MethodDeclaration::new(MethodId::new("app", "poll", ReturnType::Unit))
///         .marker(Marker::Count, MarkerParams::default().name("polls")),
/// ]);
/// let key = resolution.bindings[0].key();
///
/// let registry = InstrumentRegistry::new();
/// let create = |_: &InstrumentKey| -> Result<Instrument, InstrumentCreationError> {
///     Ok(Instrument::Counter(backend.create_counter("polls", &Tags::new())?))
/// };
/// let first = registry.get_or_create(key, create).unwrap();
/// let second = registry.get_or_create(key, create).unwrap();
/// assert!(first.same_as(&second));
/// assert_eq!(backend.creations("polls"), 1);
/// ```
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    slots: DashMap<InstrumentKey, Arc<Slot>>,
}

impl InstrumentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instrument for `key`, creating it with `factory` on first use.
    ///
    /// `factory` runs at most once per key across all concurrent callers. If it fails, the error
    /// is returned to this caller only and the key stays uncreated.
    pub fn get_or_create<F>(
        &self,
        key: &InstrumentKey,
        factory: F,
    ) -> Result<Instrument, InstrumentCreationError>
    where
        F: FnOnce(&InstrumentKey) -> Result<Instrument, InstrumentCreationError>,
    {
        if let Some(instrument) = self.get(key) {
            return Ok(instrument);
        }

        // Clone the slot out so the shard lock is released before creating.
        let slot = self.slots.entry(key.clone()).or_default().value().clone();

        // A factory that panicked left no instrument behind, so a poisoned lock is safe to reuse.
        let _creating = slot
            .creation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(instrument) = slot.instrument.get() {
            return Ok(instrument.clone());
        }

        let instrument = factory(key)?;
        tracing::debug!(
            method = %key.method(),
            marker = %key.marker(),
            name = %key.params().name,
            "created instrument"
        );
        Ok(slot.instrument.get_or_init(|| instrument).clone())
    }

    /// Returns the instrument for `key` if it has been created.
    pub fn get(&self, key: &InstrumentKey) -> Option<Instrument> {
        self.slots
            .get(key)
            .and_then(|slot| slot.instrument.get().cloned())
    }

    /// Number of created instruments.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.instrument.get().is_some())
            .count()
    }

    /// Returns `true` if no instrument has been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
