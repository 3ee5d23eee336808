//! GStreamer plugin for OpenMAX IL style codec components
//!
//! This crate wraps the [`omx`] core in two GStreamer elements:
//!
//! - **omxfilter**: a two-pad element driving a component with one input and
//!   one output port (decoder, encoder, converter)
//! - **omxaudiosink**: a sink driving a component with a single input port
//!
//! Neighbouring elements of this plugin that use the same implementation
//! library tunnel their components into each other when linked: buffers then
//! travel from component to component and never touch the pipeline.
//!
//! ## Implementation libraries
//! Components come from a process-wide [`LibraryRegistry`]. The software
//! loopback library is registered under
//! [`omx::config::DEFAULT_LIBRARY_NAME`] on first use; applications and tests
//! register further libraries through [`library_registry`].

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

// Copyright (C) 2017 Sebastian Dröge <sebastian@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// SPDX-License-Identifier: MIT OR Apache-2.0

// Allow non-Send fields in Send types (required for GStreamer's threading model)
// and unused doc comments (sometimes present in macro-generated code)
#![allow(clippy::non_send_fields_in_send_ty, unused_doc_comments)]

use std::sync::{Arc, LazyLock};

use gst::glib;
use gstreamer as gst;
use omx::LibraryRegistry;
use omx::loopback::LoopbackLibrary;

/// Audio sink element (single input port component)
pub mod omxaudiosink;

/// Filter element (input and output port component)
pub mod omxfilter;

/// Settings and properties shared by both elements
mod settings;

/// Buffer conversion between the pipeline and a core's ports
mod streaming;

/// Peer lookup and port signals between linked elements of this plugin
mod tunnel_peer;

static REGISTRY: LazyLock<LibraryRegistry> = LazyLock::new(|| {
    let registry = LibraryRegistry::new();
    if let Err(e) = registry.register(
        omx::config::DEFAULT_LIBRARY_NAME,
        Arc::new(LoopbackLibrary::new()),
    ) {
        tracing::error!("Failed to register the loopback library: {}", e);
    }
    registry
});

/// The registry elements look their `library-name` up in.
pub fn library_registry() -> &'static LibraryRegistry {
    &REGISTRY
}

/// Registers both elements with GStreamer.
fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    omxfilter::register(plugin)?;
    omxaudiosink::register(plugin)?;
    Ok(())
}

gst::plugin_define!(
    omxrs,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    concat!(env!("CARGO_PKG_VERSION"), "-", env!("COMMIT_ID")),
    "Apache-2.0",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);
