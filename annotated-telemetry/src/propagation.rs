//! Tracking of the active span per execution context.
//!
//! # Key Concepts
//!
//! - **Active span**: the span nested instrumented calls attach to, one per execution context
//! - **Activation**: the record of what was active before a span was activated, used to put it back
//!
//! Nested traced calls start their span as a child of [`SpanContextPropagator::current_active`]
//! and activate it; [`SpanContextPropagator::restore`] must run on every exit path so that a later
//! sibling call does not inherit a span that has already finished.
//!
//! ```rust
//! use annotated_telemetry::backend::{InMemoryBackend, SpanStatus};
//! use annotated_telemetry::propagation::SpanContextPropagator;
//! use annotated_telemetry::Tags;
//!
//! let backend = InMemoryBackend::new();
//! let propagator = SpanContextPropagator::new();
//!
//! let outer = propagator.start(&backend, "outer", &Tags::new());
//! let activation = propagator.activate(outer);
//! assert_eq!(propagator.current_active(), Some(outer));
//!
//! let inner = propagator.start(&backend, "inner", &Tags::new());
//! assert_eq!(backend.spans()[1].parent, Some(outer));
//! propagator.finish(&backend, inner, SpanStatus::Ok);
//!
//! propagator.restore(activation);
//! propagator.finish(&backend, outer, SpanStatus::Ok);
//! assert_eq!(propagator.current_active(), None);
//! ```

use core::marker::PhantomData;

use dashmap::DashMap;

use crate::backend::{Backend, SpanStatus};
use crate::id::{ExecutionContextId, SpanId};
use crate::marker::Tags;

/// Keeps the active span of every execution context.
#[derive(Debug, Default)]
pub struct SpanContextPropagator {
    active: DashMap<ExecutionContextId, SpanId>,
}

/// Proof that a span was activated, holding what was active before.
///
/// Pass it back to [`SpanContextPropagator::restore`] when the span's call exits.
#[must_use = "the previous span is only restored by `SpanContextPropagator::restore`"]
#[derive(Debug)]
pub struct Activation {
    context: ExecutionContextId,
    span: SpanId,
    previous: Option<SpanId>,
    _not_send: PhantomNotSend,
}

impl Activation {
    /// The activated span.
    pub fn span(&self) -> SpanId {
        self.span
    }

    /// The span that was active before, if any.
    pub fn previous(&self) -> Option<SpanId> {
        self.previous
    }
}

impl SpanContextPropagator {
    /// Creates a propagator with no active spans.
    pub fn new() -> Self {
        Self::default()
    }

    /// The active span of the calling execution context.
    pub fn current_active(&self) -> Option<SpanId> {
        self.active
            .get(&ExecutionContextId::current())
            .map(|span| *span)
    }

    /// Starts a span as a child of the currently active one, without activating it.
    pub fn start(&self, backend: &dyn Backend, name: &str, tags: &Tags) -> SpanId {
        backend.start_span(name, self.current_active(), tags)
    }

    /// Makes `span` the active span of the calling execution context.
    pub fn activate(&self, span: SpanId) -> Activation {
        let context = ExecutionContextId::current();
        let previous = self.active.insert(context, span);
        Activation {
            context,
            span,
            previous,
            _not_send: PhantomNotSend,
        }
    }

    /// Puts back whatever was active before `activation`.
    pub fn restore(&self, activation: Activation) {
        match activation.previous {
            Some(previous) => {
                self.active.insert(activation.context, previous);
            }
            None => {
                self.active.remove(&activation.context);
            }
        }
    }

    /// Finishes `span`.
    pub fn finish(&self, backend: &dyn Backend, span: SpanId, status: SpanStatus) {
        backend.finish_span(span, status);
    }
}

/// Makes [`Activation`] `!Send`: it has to be restored on the execution context that created it,
/// otherwise that context keeps a finished span active.
#[derive(Debug)]
struct PhantomNotSend {
    ghost: PhantomData<*mut ()>,
}

#[allow(non_upper_case_globals)]
const PhantomNotSend: PhantomNotSend = PhantomNotSend { ghost: PhantomData };

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::backend::InMemoryBackend;

    #[test]
    fn nothing_active_by_default() {
        let propagator = SpanContextPropagator::new();
        assert_eq!(propagator.current_active(), None);
    }

    #[test]
    fn nested_activation_restores_parent() {
        let backend = InMemoryBackend::new();
        let propagator = SpanContextPropagator::new();

        let outer = propagator.start(&backend, "outer", &Tags::new());
        let outer_activation = propagator.activate(outer);

        let inner = propagator.start(&backend, "inner", &Tags::new());
        let inner_activation = propagator.activate(inner);
        assert_eq!(inner_activation.previous(), Some(outer));
        assert_eq!(propagator.current_active(), Some(inner));

        propagator.restore(inner_activation);
        assert_eq!(propagator.current_active(), Some(outer));

        // A sibling started after the nested span finished hangs off the outer span.
        let sibling = propagator.start(&backend, "sibling", &Tags::new());
        propagator.restore(outer_activation);

        let spans = backend.take_spans();
        assert_eq!(spans[1].parent, Some(outer));
        assert_eq!(spans[2].id, sibling);
        assert_eq!(spans[2].parent, Some(outer));
        assert_eq!(propagator.current_active(), None);
    }

    #[test]
    fn contexts_are_independent() {
        let backend = InMemoryBackend::new();
        let propagator = SpanContextPropagator::new();

        let span = propagator.start(&backend, "main", &Tags::new());
        let activation = propagator.activate(span);

        thread::scope(|scope| {
            scope.spawn(|| {
                assert_eq!(propagator.current_active(), None);
                let other = propagator.start(&backend, "worker", &Tags::new());
                let activation = propagator.activate(other);
                assert_eq!(propagator.current_active(), Some(other));
                propagator.restore(activation);
            });
        });

        assert_eq!(propagator.current_active(), Some(span));
        propagator.restore(activation);

        let worker = backend
            .spans()
            .into_iter()
            .find(|recorded| recorded.name == "worker")
            .unwrap();
        assert_eq!(worker.parent, None);
    }
}
