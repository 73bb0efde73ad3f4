//! The marker catalog.
//!
//! A [`Marker`] expresses one kind of instrumentation intent attached to a method. The catalog is
//! fixed: every marker has a recorder in [`crate::recorder`] and a compatibility predicate that the
//! [`BindingResolver`][crate::BindingResolver] checks once per method.
//!
//! # Examples
//!
//! ```rust
//! use annotated_telemetry::{Marker, MethodId, ReturnType};
//!
//! let method = MethodId::new("shop::Cart", "total", ReturnType::Double);
//! assert!(Marker::Histogram.accepts(&method));
//!
//! let method = MethodId::new("shop::Cart", "describe", ReturnType::other("String"));
//! assert!(!Marker::Gauge.accepts(&method));
//! ```

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tags attached to an instrument or span, ordered by key.
pub type Tags = BTreeMap<String, String>;

/// A recognized instrumentation marker.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    /// Wrap every call in a span.
    Trace,
    /// Rename or tag the span that is active when the method is called.
    CustomizeInnerSpan,
    /// Count calls, failed ones included.
    Count,
    /// Track how many calls are in flight.
    TrackConcurrency,
    /// Time every call.
    Time,
    /// Record the numeric return value into a histogram.
    Histogram,
    /// Set a gauge to the numeric return value.
    Gauge,
}

impl Marker {
    /// Every marker in the catalog.
    pub const ALL: [Marker; 7] = [
        Marker::Trace,
        Marker::CustomizeInnerSpan,
        Marker::Count,
        Marker::TrackConcurrency,
        Marker::Time,
        Marker::Histogram,
        Marker::Gauge,
    ];

    /// The snake_case name used in diagnostics and configuration.
    pub const fn name(self) -> &'static str {
        match self {
            Marker::Trace => "trace",
            Marker::CustomizeInnerSpan => "customize_inner_span",
            Marker::Count => "count",
            Marker::TrackConcurrency => "track_concurrency",
            Marker::Time => "time",
            Marker::Histogram => "histogram",
            Marker::Gauge => "gauge",
        }
    }

    /// Whether the marker records into a span rather than a metric.
    pub const fn is_span_marker(self) -> bool {
        matches!(self, Marker::Trace | Marker::CustomizeInnerSpan)
    }

    /// Whether the marker needs the method's return value.
    pub const fn requires_numeric_return(self) -> bool {
        matches!(self, Marker::Histogram | Marker::Gauge)
    }

    /// Whether the marker accepts a `unit` parameter.
    pub const fn accepts_unit(self) -> bool {
        self.requires_numeric_return()
    }

    /// Whether the marker accepts a `component` parameter.
    pub const fn accepts_component(self) -> bool {
        matches!(self, Marker::Trace)
    }

    /// Returns `true` if this marker can be bound to `method`.
    pub fn accepts(self, method: &MethodId) -> bool {
        !self.requires_numeric_return() || method.return_type.is_numeric()
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The error returned when parsing an unknown marker name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown marker `{0}`")]
pub struct UnknownMarker(pub String);

impl FromStr for Marker {
    type Err = UnknownMarker;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Marker::ALL
            .into_iter()
            .find(|marker| marker.name() == s)
            .ok_or_else(|| UnknownMarker(s.to_owned()))
    }
}

/// The return type of an instrumented method, as far as markers care about it.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    /// `i32`
    Int,
    /// `i64`
    Long,
    /// `f32`
    Float,
    /// `f64`
    Double,
    /// `()`
    Unit,
    /// Any other type, by name.
    Other(String),
}

impl ReturnType {
    /// Creates [`ReturnType::Other`].
    pub fn other(name: impl Into<String>) -> Self {
        ReturnType::Other(name.into())
    }

    /// Returns `true` for the types histogram and gauge markers can record.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ReturnType::Int | ReturnType::Long | ReturnType::Float | ReturnType::Double
        )
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnType::Int => f.write_str("i32"),
            ReturnType::Long => f.write_str("i64"),
            ReturnType::Float => f.write_str("f32"),
            ReturnType::Double => f.write_str("f64"),
            ReturnType::Unit => f.write_str("()"),
            ReturnType::Other(name) => f.write_str(name),
        }
    }
}

/// The identity of an instrumented method: declaring type plus signature.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MethodId {
    /// Path of the type (or module, for free functions) declaring the method.
    pub declaring_type: String,
    /// The method name.
    pub name: String,
    /// Parameter type names, in order.
    #[serde(default)]
    pub parameters: Vec<String>,
    /// The return type.
    pub return_type: ReturnType,
}

impl MethodId {
    /// Creates a method identity without parameters.
    pub fn new(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        return_type: ReturnType,
    ) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
            parameters: Vec::new(),
            return_type,
        }
    }

    /// Splits a full function path such as `crate::module::Type::method` into declaring type and
    /// method name.
    ///
    /// `{{closure}}` segments are dropped, so paths observed from inside closures resolve to the
    /// enclosing function.
    pub fn from_path(path: &str, return_type: ReturnType) -> Self {
        let cleaned = path
            .split("::")
            .filter(|segment| *segment != "{{closure}}")
            .collect::<Vec<_>>();

        match cleaned.split_last() {
            Some((name, [])) => Self::new("", *name, return_type),
            Some((name, declaring)) => Self::new(declaring.join("::"), *name, return_type),
            None => Self::new("", "", return_type),
        }
    }

    /// Sets the parameter type names.
    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    /// The simple name of the declaring type, without its module path.
    pub fn simple_type_name(&self) -> &str {
        self.declaring_type
            .rsplit("::")
            .next()
            .unwrap_or(&self.declaring_type)
    }

    /// `name(param, ...) -> ret`
    pub fn signature(&self) -> String {
        let mut signature = format!("{}({})", self.name, self.parameters.join(", "));
        if self.return_type != ReturnType::Unit {
            signature.push_str(" -> ");
            signature.push_str(&self.return_type.to_string());
        }
        signature
    }

    /// Expands `{type}`, `{simple_type}`, `{method}` and `{signature}` in `template`.
    ///
    /// Unknown placeholders are left as they are.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open..];
            let Some(close) = after.find('}') else {
                rendered.push_str(after);
                return rendered;
            };

            match &after[1..close] {
                "type" => rendered.push_str(&self.declaring_type),
                "simple_type" => rendered.push_str(self.simple_type_name()),
                "method" => rendered.push_str(&self.name),
                "signature" => rendered.push_str(&self.signature()),
                _ => rendered.push_str(&after[..=close]),
            }
            rest = &after[close + 1..];
        }

        rendered.push_str(rest);
        rendered
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.declaring_type.is_empty() {
            f.write_str(&self.signature())
        } else {
            write!(f, "{}::{}", self.declaring_type, self.signature())
        }
    }
}

/// Static configuration declared alongside a marker.
///
/// `name` and tag values are templates, see [`MethodId::render`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerParams {
    /// Instrument or operation name, defaults to the settings' template.
    pub name: Option<String>,
    /// Tags attached to the instrument or span.
    pub tags: Tags,
    /// Measurement unit, histogram and gauge only.
    pub unit: Option<String>,
    /// Component tag, trace only.
    pub component: Option<String>,
}

impl MarkerParams {
    /// Sets the name template.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a tag.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the unit.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Sets the component.
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(ReturnType::Int, true)]
    #[test_case(ReturnType::Long, true)]
    #[test_case(ReturnType::Float, true)]
    #[test_case(ReturnType::Double, true)]
    #[test_case(ReturnType::Unit, false)]
    #[test_case(ReturnType::other("String"), false)]
    #[test_case(ReturnType::other("u64"), false)]
    fn numeric_markers_check_return_type(return_type: ReturnType, accepted: bool) {
        let method = MethodId::new("app::Service", "call", return_type);
        assert_eq!(Marker::Histogram.accepts(&method), accepted);
        assert_eq!(Marker::Gauge.accepts(&method), accepted);
        assert!(Marker::Count.accepts(&method));
        assert!(Marker::Trace.accepts(&method));
    }

    #[test]
    fn marker_names_round_trip() {
        for marker in Marker::ALL {
            assert_eq!(marker.name().parse::<Marker>(), Ok(marker));
        }
        assert_eq!(
            "timer".parse::<Marker>(),
            Err(UnknownMarker("timer".to_owned()))
        );
    }

    #[test]
    fn from_path_strips_closures() {
        let method = MethodId::from_path(
            "app::orders::Service::{{closure}}::place::{{closure}}",
            ReturnType::Unit,
        );
        assert_eq!(method.declaring_type, "app::orders::Service");
        assert_eq!(method.name, "place");

        let method = MethodId::from_path("main", ReturnType::Unit);
        assert_eq!(method.declaring_type, "");
        assert_eq!(method.name, "main");
    }

    #[test]
    fn render_templates() {
        let method = MethodId::new("app::orders::Service", "place", ReturnType::Long)
            .with_parameters(["u64", "&str"]);

        assert_eq!(method.render("{type}.{method}"), "app::orders::Service.place");
        assert_eq!(method.render("{simple_type}-{method}"), "Service-place");
        assert_eq!(method.render("sig: {signature}"), "sig: place(u64, &str) -> i64");
        assert_eq!(method.render("{unknown}/{method}"), "{unknown}/place");
        assert_eq!(method.render("dangling {method"), "dangling {method");
        assert_eq!(method.render("plain"), "plain");
    }

    #[test]
    fn display_method() {
        let method =
            MethodId::new("app::Service", "call", ReturnType::Unit).with_parameters(["i32"]);
        assert_eq!(method.to_string(), "app::Service::call(i32)");
    }
}
