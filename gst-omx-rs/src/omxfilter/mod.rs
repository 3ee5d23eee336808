//! OpenMAX IL filter element
//!
//! `omxfilter` drives a component with one input and one output port.
//! Buffers arriving on the sink pad are fed to the input port; a task on the
//! src pad takes filled output buffers and pushes them downstream.
//!
//! ## Properties (set before READY state)
//! - `component-name`: component to instantiate (default `OMX.loopback.filter`)
//! - `library-name`: implementation library to look it up in
//! - `use-timestamps`: carry buffer timestamps through the component
//! - `tunneling`: tunnel into a neighbouring element of this plugin
//! - `core-id`: identity of the current core (read-only)
//!
//! ## Example Pipeline
//! ```bash
//! gst-launch-1.0 fakesrc num-buffers=100 ! omxfilter ! omxfilter ! fakesink
//! ```
//! The two filters tunnel into each other: no buffer passes between them
//! through the pipeline.

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

// Copyright (C) 2020 Sebastian Dröge <sebastian@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gstreamer as gst;
use omx::tunnel::{PortSignal, TunnelSide};

use crate::tunnel_peer::TunnelCapable;

/// Core implementation (properties, pads, state changes)
mod imp;

/// Runtime state (core and ports)
mod state;

glib::wrapper! {
    pub struct OmxFilter(ObjectSubclass<imp::OmxFilter>) @extends gst::Element, gst::Object;
}

impl TunnelCapable for OmxFilter {
    fn tunnel_side(&self, pad: &gst::Pad) -> Option<TunnelSide> {
        self.imp().tunnel_side(pad)
    }

    fn apply_port_signal(&self, signal: PortSignal) -> bool {
        self.imp().apply_port_signal(signal)
    }
}

/// Registers the omxfilter element with GStreamer.
pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "omxfilter",
        gst::Rank::NONE,
        OmxFilter::static_type(),
    )
}
