//! Engine-wide configuration.
//!
//! Settings can be built in code or loaded from JSON; every field has a default, so a partial
//! document only overrides what it names.
//!
//! ```rust
//! use annotated_telemetry::Settings;
//!
//! let settings = Settings::from_json(r#"{ "component": "billing" }"#).unwrap();
//! assert_eq!(settings.component, "billing");
//! assert_eq!(settings.default_metric_name, "{type}.{method}");
//! ```

use serde::{Deserialize, Serialize};

/// Configuration shared by the binding resolver and the recorders.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Value of the `component` tag on spans whose marker does not set one.
    pub component: String,
    /// Name template for metric markers declared without a name.
    pub default_metric_name: String,
    /// Operation name template for span markers declared without a name.
    pub default_operation_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            component: "annotation".to_owned(),
            default_metric_name: "{type}.{method}".to_owned(),
            default_operation_name: "{type}.{method}".to_owned(),
        }
    }
}

/// The error returned when settings fail to load.
#[derive(Debug, thiserror::Error)]
#[error("invalid settings")]
pub struct SettingsError(#[from] serde_json::Error);

impl Settings {
    /// Parses settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }
}
