//! Support code for the attribute macros. Not a public API.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use std::sync::OnceLock;

use crate::advice::{InvocationGuard, Observe, Outcome, ReturnValue};
use crate::binding::{Binding, MethodDeclaration};
use crate::global;
use crate::marker::{MethodId, ReturnType};

/// A binding resolved on the first call of a woven function.
///
/// Resolution waits until a global dispatcher is installed; calls made before that run
/// uninstrumented. Once resolved, a rejected marker stays unbound.
#[derive(Debug)]
pub struct LazyBinding {
    binding: OnceLock<Option<Binding>>,
}

impl LazyBinding {
    /// An unresolved binding.
    pub const fn new() -> Self {
        Self {
            binding: OnceLock::new(),
        }
    }

    /// Enters the call through the global dispatcher, if the binding is valid.
    pub fn enter(
        &'static self,
        declare: impl FnOnce() -> MethodDeclaration,
    ) -> Option<InvocationGuard<'static>> {
        let dispatcher = global::dispatcher()?;
        let binding = self
            .binding
            .get_or_init(|| dispatcher.resolve([declare()]).bindings.into_iter().next())
            .as_ref()?;
        Some(dispatcher.enter(binding))
    }
}

impl Default for LazyBinding {
    fn default() -> Self {
        Self::new()
    }
}

/// The method whose body contains the item `marker`.
///
/// `marker` is a function item declared directly in that body; its type name is the method path
/// plus one segment, with `{{closure}}` segments for each enclosing attribute.
pub fn enclosing_method<F>(_marker: &F, return_type: ReturnType) -> MethodId {
    let path = core::any::type_name::<F>();
    let path = path.rsplit_once("::").map_or(path, |(method, _)| method);
    MethodId::from_path(path, return_type)
}

/// A returned `Result`, classified with or without a `Debug` error type.
///
/// Woven code binds `&ResultOutcome::new(&result)` and calls `classify` on it with both
/// [`DebugErrorOutcome`] and [`OpaqueErrorOutcome`] in scope. Method resolution picks the
/// `Debug` implementation when the error type has one, and the type name fallback otherwise.
pub struct ResultOutcome<'a, T, E> {
    result: &'a Result<T, E>,
    unprintable: UnprintableError<E>,
}

impl<'a, T, E> ResultOutcome<'a, T, E> {
    /// Wraps a returned `Result`.
    pub fn new(result: &'a Result<T, E>) -> Self {
        Self {
            result,
            unprintable: UnprintableError(PhantomData),
        }
    }
}

impl<T, E> Debug for ResultOutcome<'_, T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultOutcome")
            .field("is_err", &self.result.is_err())
            .finish_non_exhaustive()
    }
}

/// Classifies results whose error implements `Debug`, keeping the error itself.
pub trait DebugErrorOutcome {
    /// The outcome of the call.
    fn classify(&self) -> Outcome<'_>;
}

impl<T, E: Debug> DebugErrorOutcome for ResultOutcome<'_, T, E> {
    fn classify(&self) -> Outcome<'_> {
        self.result.outcome()
    }
}

/// Classifies any other result, describing an error by its type name.
pub trait OpaqueErrorOutcome {
    /// The outcome of the call.
    fn classify(&self) -> Outcome<'_>;
}

impl<T, E> OpaqueErrorOutcome for &ResultOutcome<'_, T, E> {
    fn classify(&self) -> Outcome<'_> {
        match self.result {
            Ok(_) => Outcome::Returned(ReturnValue::Opaque),
            Err(_) => Outcome::Failed(&self.unprintable),
        }
    }
}

/// Stands in for an error that cannot be formatted.
struct UnprintableError<E>(PhantomData<fn() -> E>);

impl<E> Debug for UnprintableError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(core::any::type_name::<E>())
    }
}
