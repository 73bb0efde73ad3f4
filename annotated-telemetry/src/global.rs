//! Global dispatcher state and initialization.
//!
//! Woven functions look up the dispatcher here on every call. Until one is installed they run
//! uninstrumented.

use std::sync::OnceLock;

use crate::advice::Dispatcher;

static GLOBAL_DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();

/// Sets the global dispatcher instance.
///
/// # Errors
///
/// If a global dispatcher has already been set. `dispatcher` is dropped in that case.
pub fn set_dispatcher(dispatcher: Dispatcher) -> Result<&'static Dispatcher, SetGlobalError> {
    let mut installed = false;
    let global = GLOBAL_DISPATCHER.get_or_init(|| {
        installed = true;
        dispatcher
    });

    if installed {
        tracing::debug!(component = %global.settings().component, "installed global dispatcher");
        Ok(global)
    } else {
        Err(SetGlobalError(()))
    }
}

/// Returns the global dispatcher, if one has been set.
pub fn dispatcher() -> Option<&'static Dispatcher> {
    GLOBAL_DISPATCHER.get()
}

/// The type returned by [`set_dispatcher`] if the dispatcher has already been initialized.
#[derive(Debug, thiserror::Error)]
#[error("a global dispatcher has already been set")]
pub struct SetGlobalError(());
