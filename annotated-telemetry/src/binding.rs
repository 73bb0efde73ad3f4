//! Resolution of declared markers into bindings.
//!
//! The [`BindingResolver`] runs once per method, validates every declared marker against the
//! method's signature and produces one [`Binding`] per valid marker. Invalid markers are reported
//! and dropped; they never stop the other markers from binding.

use std::sync::Arc;

use crate::marker::{Marker, MarkerParams, MethodId, Tags};
use crate::settings::Settings;

/// A method as seen by the resolver: its identity and every marker declared on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDeclaration {
    /// The method.
    pub method: MethodId,
    /// Declared markers with their static parameters, in declaration order.
    pub markers: Vec<(Marker, MarkerParams)>,
}

impl MethodDeclaration {
    /// A declaration without markers.
    pub fn new(method: MethodId) -> Self {
        Self {
            method,
            markers: Vec::new(),
        }
    }

    /// Adds a marker.
    pub fn marker(mut self, marker: Marker, params: MarkerParams) -> Self {
        self.markers.push((marker, params));
        self
    }
}

/// Marker parameters after template expansion and defaulting.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedParams {
    /// Instrument or operation name.
    pub name: String,
    /// Whether `name` was set on the marker rather than taken from a default template.
    pub name_given: bool,
    /// Tags with rendered values.
    pub tags: Tags,
    /// Measurement unit.
    pub unit: Option<String>,
}

/// The deterministic identity of an instrument.
///
/// Includes the method identity, so two methods with identical marker configuration never share
/// a key, while the same method and marker always produce the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    method: Arc<MethodId>,
    marker: Marker,
    params: ResolvedParams,
}

impl InstrumentKey {
    /// Builds the key for `marker` on `method` with `params`.
    pub fn new(method: Arc<MethodId>, marker: Marker, params: ResolvedParams) -> Self {
        Self {
            method,
            marker,
            params,
        }
    }

    /// The method part of the key.
    pub fn method(&self) -> &MethodId {
        &self.method
    }

    /// The marker part of the key.
    pub fn marker(&self) -> Marker {
        self.marker
    }

    /// The parameter part of the key.
    pub fn params(&self) -> &ResolvedParams {
        &self.params
    }
}

/// A valid association between a method and one marker.
///
/// Bindings are immutable once resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    key: InstrumentKey,
}

impl Binding {
    /// The bound method.
    pub fn method(&self) -> &MethodId {
        self.key.method()
    }

    /// The bound marker.
    pub fn marker(&self) -> Marker {
        self.key.marker()
    }

    /// Resolved name of the instrument or span.
    pub fn name(&self) -> &str {
        &self.key.params().name
    }

    /// Resolved tags.
    pub fn tags(&self) -> &Tags {
        &self.key.params().tags
    }

    /// Resolved unit.
    pub fn unit(&self) -> Option<&str> {
        self.key.params().unit.as_deref()
    }

    /// The registry key of this binding's instrument.
    pub fn key(&self) -> &InstrumentKey {
        &self.key
    }
}

/// The reason a declared marker could not be bound.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BindingValidationError {
    /// Histogram and gauge markers need an `i32`, `i64`, `f32` or `f64` return type.
    #[error("`{marker}` on `{method}` requires a numeric return type")]
    NonNumericReturnType {
        /// The method.
        method: MethodId,
        /// The marker.
        marker: Marker,
    },

    /// A unit was given to a marker that has no unit.
    #[error("`{marker}` on `{method}` does not take a unit")]
    UnitNotSupported {
        /// The method.
        method: MethodId,
        /// The marker.
        marker: Marker,
    },

    /// A component was given to a marker other than trace.
    #[error("`{marker}` on `{method}` does not take a component")]
    ComponentNotSupported {
        /// The method.
        method: MethodId,
        /// The marker.
        marker: Marker,
    },

    /// The same marker was declared more than once on one method.
    #[error("`{marker}` is declared more than once on `{method}`")]
    DuplicateMarker {
        /// The method.
        method: MethodId,
        /// The marker.
        marker: Marker,
    },

    /// The name template rendered to an empty string.
    #[error("`{marker}` on `{method}` has an empty name")]
    EmptyName {
        /// The method.
        method: MethodId,
        /// The marker.
        marker: Marker,
    },
}

/// The result of resolving a set of declarations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Valid bindings, in declaration order.
    pub bindings: Vec<Binding>,
    /// Markers that were dropped, in declaration order.
    pub rejected: Vec<BindingValidationError>,
}

/// Validates declared markers and produces bindings.
///
/// # Examples
///
/// ```rust
/// use annotated_telemetry::{
///     BindingResolver, Marker, MarkerParams, MethodDeclaration, MethodId, ReturnType, Settings,
/// };
///
/// let declaration = MethodDeclaration::new(MethodId::new("app::Report", "render", ReturnType::Unit))
///     .marker(Marker::Count, MarkerParams::default())
///     .marker(Marker::Histogram, MarkerParams::default());
///
/// let resolution = BindingResolver::new(&Settings::default()).resolve([declaration]);
/// assert_eq!(resolution.bindings.len(), 1);
/// assert_eq!(resolution.bindings[0].name(), "app::Report.render");
/// assert_eq!(resolution.rejected.len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct BindingResolver {
    component: String,
    default_metric_name: String,
    default_operation_name: String,
}

impl BindingResolver {
    /// Creates a resolver using the default name templates and component from `settings`.
    pub fn new(settings: &Settings) -> Self {
        Self {
            component: settings.component.clone(),
            default_metric_name: settings.default_metric_name.clone(),
            default_operation_name: settings.default_operation_name.clone(),
        }
    }

    /// Resolves every declaration.
    ///
    /// Rejected markers are logged and returned in [`Resolution::rejected`].
    pub fn resolve<I>(&self, declarations: I) -> Resolution
    where
        I: IntoIterator<Item = MethodDeclaration>,
    {
        let mut resolution = Resolution::default();

        for declaration in declarations {
            let method = Arc::new(declaration.method);
            let mut seen = Vec::with_capacity(declaration.markers.len());

            for (marker, params) in declaration.markers {
                let bound = if seen.contains(&marker) {
                    Err(BindingValidationError::DuplicateMarker {
                        method: MethodId::clone(&method),
                        marker,
                    })
                } else {
                    seen.push(marker);
                    self.bind(&method, marker, params)
                };

                match bound {
                    Ok(binding) => {
                        tracing::debug!(
                            method = %binding.method(),
                            marker = %marker,
                            name = binding.name(),
                            "bound marker"
                        );
                        resolution.bindings.push(binding);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "dropping marker binding");
                        resolution.rejected.push(error);
                    }
                }
            }
        }

        resolution
    }

    fn bind(
        &self,
        method: &Arc<MethodId>,
        marker: Marker,
        params: MarkerParams,
    ) -> Result<Binding, BindingValidationError> {
        if !marker.accepts(method) {
            return Err(BindingValidationError::NonNumericReturnType {
                method: MethodId::clone(method),
                marker,
            });
        }
        if params.unit.is_some() && !marker.accepts_unit() {
            return Err(BindingValidationError::UnitNotSupported {
                method: MethodId::clone(method),
                marker,
            });
        }
        if params.component.is_some() && !marker.accepts_component() {
            return Err(BindingValidationError::ComponentNotSupported {
                method: MethodId::clone(method),
                marker,
            });
        }

        let default_template = if marker.is_span_marker() {
            self.default_operation_name.as_str()
        } else {
            self.default_metric_name.as_str()
        };
        let template = params.name.as_deref().unwrap_or(default_template);
        let name = method.render(template);
        if name.is_empty() {
            return Err(BindingValidationError::EmptyName {
                method: MethodId::clone(method),
                marker,
            });
        }

        let mut tags: Tags = params
            .tags
            .iter()
            .map(|(key, value)| (key.clone(), method.render(value)))
            .collect();
        if marker == Marker::Trace {
            let component = params.component.as_deref().unwrap_or(self.component.as_str());
            tags.entry("component".to_owned())
                .or_insert_with(|| method.render(component));
        }

        let params = ResolvedParams {
            name_given: params.name.is_some(),
            name,
            tags,
            unit: params.unit,
        };

        Ok(Binding {
            key: InstrumentKey::new(method.clone(), marker, params),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;
    use tracing_test::traced_test;

    use super::*;
    use crate::marker::ReturnType;

    fn resolver() -> BindingResolver {
        BindingResolver::new(&Settings::default())
    }

    fn method(return_type: ReturnType) -> MethodId {
        MethodId::new("app::Scores", "compute", return_type)
    }

    #[test_case(Marker::Histogram, ReturnType::Double, true)]
    #[test_case(Marker::Histogram, ReturnType::Int, true)]
    #[test_case(Marker::Histogram, ReturnType::Unit, false)]
    #[test_case(Marker::Gauge, ReturnType::Long, true)]
    #[test_case(Marker::Gauge, ReturnType::other("Option<f64>"), false)]
    #[test_case(Marker::Count, ReturnType::other("String"), true)]
    #[test_case(Marker::Time, ReturnType::Unit, true)]
    fn numeric_validation(marker: Marker, return_type: ReturnType, valid: bool) {
        let declaration =
            MethodDeclaration::new(method(return_type)).marker(marker, MarkerParams::default());
        let resolution = resolver().resolve([declaration]);

        assert_eq!(resolution.bindings.len(), usize::from(valid));
        assert_eq!(resolution.rejected.len(), usize::from(!valid));
    }

    #[traced_test]
    #[test]
    fn invalid_binding_does_not_block_others() {
        let declarations = [
            MethodDeclaration::new(method(ReturnType::other("String")))
                .marker(Marker::Trace, MarkerParams::default())
                .marker(Marker::Gauge, MarkerParams::default())
                .marker(Marker::Count, MarkerParams::default()),
            MethodDeclaration::new(MethodId::new("app::Other", "run", ReturnType::Float))
                .marker(Marker::Histogram, MarkerParams::default()),
        ];

        let resolution = resolver().resolve(declarations);

        let bound = resolution
            .bindings
            .iter()
            .map(|binding| (binding.method().name.as_str(), binding.marker()))
            .collect::<Vec<_>>();
        assert_eq!(
            bound,
            vec![
                ("compute", Marker::Trace),
                ("compute", Marker::Count),
                ("run", Marker::Histogram),
            ]
        );
        assert_eq!(
            resolution.rejected,
            vec![BindingValidationError::NonNumericReturnType {
                method: method(ReturnType::other("String")),
                marker: Marker::Gauge,
            }]
        );
        assert!(logs_contain("dropping marker binding"));
        assert!(logs_contain("requires a numeric return type"));
    }

    #[test]
    fn default_names_and_templates() {
        let declaration = MethodDeclaration::new(method(ReturnType::Double))
            .marker(Marker::Time, MarkerParams::default())
            .marker(
                Marker::Histogram,
                MarkerParams::default()
                    .name("scores.{method}")
                    .tag("owner", "{simple_type}")
                    .unit("points"),
            )
            .marker(Marker::Trace, MarkerParams::default());

        let resolution = resolver().resolve([declaration]);
        let [time, histogram, trace] = resolution.bindings.as_slice() else {
            panic!("expected three bindings, got {:?}", resolution.bindings);
        };

        assert_eq!(time.name(), "app::Scores.compute");
        assert_eq!(histogram.name(), "scores.compute");
        assert_eq!(histogram.tags().get("owner").map(String::as_str), Some("Scores"));
        assert_eq!(histogram.unit(), Some("points"));
        assert_eq!(trace.name(), "app::Scores.compute");
        assert_eq!(
            trace.tags().get("component").map(String::as_str),
            Some("annotation")
        );
    }

    #[test]
    fn explicit_component_overrides_settings() {
        let declaration = MethodDeclaration::new(method(ReturnType::Unit)).marker(
            Marker::Trace,
            MarkerParams::default().component("payments"),
        );

        let resolution = resolver().resolve([declaration]);
        assert_eq!(
            resolution.bindings[0].tags().get("component").map(String::as_str),
            Some("payments")
        );
    }

    #[test]
    fn misplaced_parameters_are_rejected() {
        let declaration = MethodDeclaration::new(method(ReturnType::Int))
            .marker(Marker::Count, MarkerParams::default().unit("ms"))
            .marker(Marker::Gauge, MarkerParams::default().component("x"))
            .marker(Marker::Time, MarkerParams::default().name(""))
            .marker(Marker::Histogram, MarkerParams::default())
            .marker(Marker::Histogram, MarkerParams::default().name("again"));

        let resolution = resolver().resolve([declaration]);

        assert_eq!(resolution.bindings.len(), 1);
        assert_eq!(resolution.bindings[0].marker(), Marker::Histogram);
        assert!(matches!(
            resolution.rejected.as_slice(),
            [
                BindingValidationError::UnitNotSupported { .. },
                BindingValidationError::ComponentNotSupported { .. },
                BindingValidationError::EmptyName { .. },
                BindingValidationError::DuplicateMarker { .. },
            ]
        ));
    }

    #[test]
    fn keys_are_stable_and_distinct_per_method() {
        let declare = |name: &str| {
            MethodDeclaration::new(MethodId::new("app::Jobs", name, ReturnType::Unit))
                .marker(Marker::Count, MarkerParams::default().name("jobs"))
        };

        let first = resolver().resolve([declare("run")]);
        let again = resolver().resolve([declare("run")]);
        let other = resolver().resolve([declare("retry")]);

        assert_eq!(first.bindings[0].key(), again.bindings[0].key());
        assert_eq!(first.bindings[0].name(), other.bindings[0].name());
        assert_ne!(first.bindings[0].key(), other.bindings[0].key());
    }
}
