//! Type-state builder for [`Dispatcher`].

use core::marker::PhantomData;
use std::sync::Arc;

use crate::advice::Dispatcher;
use crate::backend::Backend;
use crate::global::{self, SetGlobalError};
use crate::settings::Settings;

/// Type-state markers for builder
pub mod state {
    /// No backend configured yet.
    #[derive(Debug)]
    pub struct NoBackend;
    /// A backend is configured.
    #[derive(Debug)]
    pub struct WithBackend;
}

/// Builder for a [`Dispatcher`].
///
/// Uses type-state pattern to ensure a backend is configured at compile time.
/// Created via [`Dispatcher::builder`] and finalized with [`build`](Builder::build) or
/// [`set_global`](Builder::set_global).
///
/// ```rust
/// use std::sync::Arc;
///
/// use annotated_telemetry::backend::NopBackend;
/// use annotated_telemetry::{Dispatcher, Settings};
///
/// let dispatcher = Dispatcher::builder()
///     .settings(Settings {
///         component: "billing".to_owned(),
///         ..Settings::default()
///     })
///     .backend(Arc::new(NopBackend))
///     .build();
/// assert_eq!(dispatcher.settings().component, "billing");
/// ```
#[derive(Debug)]
#[must_use]
pub struct Builder<BACKEND> {
    backend: Option<Arc<dyn Backend>>,
    settings: Settings,
    _backend: PhantomData<BACKEND>,
}

impl Builder<state::NoBackend> {
    pub(crate) fn new() -> Self {
        Builder {
            backend: None,
            settings: Settings::default(),
            _backend: PhantomData,
        }
    }
}

impl<BACKEND> Builder<BACKEND> {
    /// Sets the backend recorders write to.
    pub fn backend(self, backend: Arc<dyn Backend>) -> Builder<state::WithBackend> {
        Builder {
            backend: Some(backend),
            settings: self.settings,
            _backend: PhantomData,
        }
    }

    /// Replaces the default [`Settings`].
    pub fn settings(self, settings: Settings) -> Self {
        Builder { settings, ..self }
    }
}

impl Builder<state::WithBackend> {
    /// Builds the dispatcher.
    pub fn build(self) -> Dispatcher {
        match self.backend {
            Some(backend) => Dispatcher::new(backend, self.settings),
            // Unreachable through the type-state API.
            None => Dispatcher::new(Arc::new(crate::backend::NopBackend), self.settings),
        }
    }

    /// Builds the dispatcher and installs it as the process-wide one.
    ///
    /// # Errors
    ///
    /// If a global dispatcher has already been set.
    pub fn set_global(self) -> Result<&'static Dispatcher, SetGlobalError> {
        global::set_dispatcher(self.build())
    }
}
