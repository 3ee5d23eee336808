// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Per-instance configuration of a codec core.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name under which the software loopback library is registered by default.
pub const DEFAULT_LIBRARY_NAME: &str = "libomxil-loopback.so";

/// Default component for two-port (filter) elements.
pub const DEFAULT_FILTER_COMPONENT: &str = "OMX.loopback.filter";

/// Default component for single-port (sink) elements.
pub const DEFAULT_SINK_COMPONENT: &str = "OMX.loopback.sink";

/// Configuration of one core instance.
///
/// Every setting here applies to a single instance only. Two elements in the
/// same process may use different buffer-sharing policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Component to instantiate, e.g. `OMX.loopback.filter`.
    pub component_name: String,

    /// Implementation library the component is looked up in.
    pub library_name: String,

    /// Carry pipeline timestamps through the component.
    pub use_timestamps: bool,

    /// Allow direct component-to-component tunnels with a capable peer.
    pub tunneling: bool,

    /// Attach each input payload to a single header instead of copying it
    /// in slot-sized chunks.
    pub share_input_buffer: bool,

    /// Move output payloads to the pipeline instead of copying them.
    pub share_output_buffer: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            component_name: DEFAULT_FILTER_COMPONENT.to_string(),
            library_name: DEFAULT_LIBRARY_NAME.to_string(),
            use_timestamps: true,
            tunneling: true,
            share_input_buffer: false,
            share_output_buffer: false,
        }
    }
}

impl CoreConfig {
    /// Creates a default configuration for the given component.
    pub fn for_component(component_name: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            ..Self::default()
        }
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Other`] if the document is not valid JSON or a field
    /// has the wrong type.
    ///
    /// # Examples
    ///
    /// ```
    /// let config = omx::CoreConfig::from_json(r#"{"tunneling": false}"#).unwrap();
    /// assert!(!config.tunneling);
    /// assert!(config.use_timestamps);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Other(format!("invalid core config: {e}")))
    }

    /// Serializes the configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Other(format!("core config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = CoreConfig::from_json(r#"{"component_name": "OMX.loopback.sink"}"#).unwrap();
        assert_eq!(config.component_name, DEFAULT_SINK_COMPONENT);
        assert_eq!(config.library_name, DEFAULT_LIBRARY_NAME);
        assert!(config.tunneling);
        assert!(!config.share_input_buffer);
    }

    #[test]
    fn wrong_field_type_is_rejected() {
        let err = CoreConfig::from_json(r#"{"tunneling": "yes"}"#).unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }
}
