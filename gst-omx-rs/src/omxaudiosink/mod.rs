//! OpenMAX IL audio sink element
//!
//! `omxaudiosink` drives a component with a single input port, such as an
//! audio renderer. Raw interleaved audio arriving on the sink pad is fed to
//! the component once the element is PLAYING. End of stream is reported to
//! the application after the component has consumed everything.
//!
//! When the upstream neighbour is an `omxfilter` of the same library, the
//! input port is tunneled: audio goes from component to component and the
//! sink pad only carries events.
//!
//! ## Properties (set before READY state)
//! - `component-name`: component to instantiate (default `OMX.loopback.sink`)
//! - `library-name`: implementation library to look it up in
//! - `use-timestamps`: carry buffer timestamps into the component
//! - `tunneling`: accept a tunnel from the upstream element
//! - `core-id`: identity of the current core (read-only)
//!
//! ## Example Pipeline
//! ```bash
//! gst-launch-1.0 audiotestsrc num-buffers=50 ! \
//!     audio/x-raw,format=S16LE,rate=48000,channels=2 ! omxfilter ! omxaudiosink
//! ```

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
use gstreamer_base as gst_base;
use omx::tunnel::{PortSignal, TunnelSide};

use crate::tunnel_peer::TunnelCapable;

/// Core implementation (properties, state changes, BaseSink vfuncs)
mod imp;

/// Runtime state (core, input port, audio format)
mod state;

glib::wrapper! {
    pub struct OmxAudioSink(ObjectSubclass<imp::OmxAudioSink>) @extends gst_base::BaseSink, gst::Element, gst::Object;
}

impl TunnelCapable for OmxAudioSink {
    fn tunnel_side(&self, pad: &gst::Pad) -> Option<TunnelSide> {
        self.imp().tunnel_side(pad)
    }

    fn apply_port_signal(&self, signal: PortSignal) -> bool {
        self.imp().apply_port_signal(signal)
    }
}

/// Registers the omxaudiosink element with GStreamer.
pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "omxaudiosink",
        gst::Rank::NONE,
        OmxAudioSink::static_type(),
    )
}
