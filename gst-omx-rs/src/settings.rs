//! Settings shared by omxfilter and omxaudiosink
//!
//! Both elements expose the same properties, which map one to one onto an
//! [`omx::CoreConfig`]. The `config` property replaces all of them at once
//! from a JSON document.

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst::glib;
use gst::prelude::*;
use gstreamer as gst;
use omx::{Core, CoreConfig};
use uuid::Uuid;

/// Value of `core-id` while no core exists
pub(crate) const DEFAULT_CORE_ID: Uuid = Uuid::nil();

/// User-configurable settings of an element, applied at NULL->READY.
#[derive(Debug, Clone, Default)]
pub(crate) struct Settings {
    pub config: CoreConfig,
}

impl Settings {
    pub(crate) fn for_component(component_name: &str) -> Self {
        Settings {
            config: CoreConfig::for_component(component_name),
        }
    }

    /// Applies a property value by name.
    pub(crate) fn set(&mut self, name: &str, value: &glib::Value) -> Result<(), glib::BoolError> {
        let config = &mut self.config;
        match name {
            "component-name" => config.component_name = string(value)?,
            "library-name" => config.library_name = string(value)?,
            "use-timestamps" => config.use_timestamps = boolean(value)?,
            "tunneling" => config.tunneling = boolean(value)?,
            "share-input-buffer" => config.share_input_buffer = boolean(value)?,
            "share-output-buffer" => config.share_output_buffer = boolean(value)?,
            "config" => {
                let json = string(value)?;
                *config = CoreConfig::from_json(&json)
                    .map_err(|e| glib::bool_error!("Invalid core config: {}", e))?;
            }
            other => return Err(glib::bool_error!("Unknown property '{}'", other)),
        }
        Ok(())
    }

    /// Reads a property value by name. `core-id` is owned by the element.
    pub(crate) fn get(&self, name: &str) -> Option<glib::Value> {
        let config = &self.config;
        let value = match name {
            "component-name" => config.component_name.to_value(),
            "library-name" => config.library_name.to_value(),
            "use-timestamps" => config.use_timestamps.to_value(),
            "tunneling" => config.tunneling.to_value(),
            "share-input-buffer" => config.share_input_buffer.to_value(),
            "share-output-buffer" => config.share_output_buffer.to_value(),
            "config" => config.to_json().ok().to_value(),
            _ => return None,
        };
        Some(value)
    }

    /// Looks up the configured library and initialises a core on it.
    pub(crate) fn init_core(&self) -> Result<Core, gst::ErrorMessage> {
        let library = crate::library_registry()
            .get(&self.config.library_name)
            .map_err(|e| gst::error_msg!(gst::LibraryError::Init, ["{}", e]))?;
        let core = Core::new(self.config.clone());
        core.init(library).map_err(|e| {
            gst::error_msg!(
                gst::LibraryError::Init,
                [
                    "Failed to initialise {}: {}",
                    self.config.component_name,
                    e
                ]
            )
        })?;
        Ok(core)
    }
}

fn string(value: &glib::Value) -> Result<String, glib::BoolError> {
    value
        .get::<String>()
        .map_err(|e| glib::bool_error!("Expected a string: {}", e))
}

fn boolean(value: &glib::Value) -> Result<bool, glib::BoolError> {
    value
        .get::<bool>()
        .map_err(|e| glib::bool_error!("Expected a boolean: {}", e))
}

/// Property specs common to both elements.
pub(crate) fn properties(default_component: &str) -> Vec<glib::ParamSpec> {
    let defaults = CoreConfig::default();
    let nil_id = DEFAULT_CORE_ID.to_string();
    vec![
        glib::ParamSpecString::builder("component-name")
            .nick("Component Name")
            .blurb("Name of the component to instantiate")
            .default_value(default_component)
            .mutable_ready()
            .build(),
        glib::ParamSpecString::builder("library-name")
            .nick("Library Name")
            .blurb("Implementation library the component is looked up in")
            .default_value(defaults.library_name.as_str())
            .mutable_ready()
            .build(),
        glib::ParamSpecBoolean::builder("use-timestamps")
            .nick("Use Timestamps")
            .blurb("Carry buffer timestamps through the component")
            .default_value(defaults.use_timestamps)
            .mutable_ready()
            .build(),
        glib::ParamSpecBoolean::builder("tunneling")
            .nick("Tunneling")
            .blurb("Tunnel the component directly into a capable neighbour")
            .default_value(defaults.tunneling)
            .mutable_ready()
            .build(),
        glib::ParamSpecBoolean::builder("share-input-buffer")
            .nick("Share Input Buffer")
            .blurb("Hand whole input payloads to the component instead of copying them")
            .default_value(defaults.share_input_buffer)
            .mutable_ready()
            .build(),
        glib::ParamSpecBoolean::builder("share-output-buffer")
            .nick("Share Output Buffer")
            .blurb("Move output payloads into the pipeline instead of copying them")
            .default_value(defaults.share_output_buffer)
            .mutable_ready()
            .build(),
        glib::ParamSpecString::builder("config")
            .nick("Config")
            .blurb("Whole core configuration as JSON")
            .mutable_ready()
            .build(),
        glib::ParamSpecString::builder("core-id")
            .nick("Core ID")
            .blurb("Identity of the current core, as used in log output")
            .default_value(nil_id.as_str())
            .read_only()
            .build(),
    ]
}
