//! Runtime state of omxfilter
//!
//! `State` exists between NULL->READY and READY->NULL. It only holds cheap
//! handles, so the streaming functions clone it out of the lock and never
//! block while holding the context mutex.

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gstreamer as gst;
use omx::{Core, Port};

#[derive(Debug, Clone)]
pub(crate) struct State {
    pub core: Core,
    pub input: Port,
    pub output: Port,
}

impl State {
    /// Wraps an initialised two-port core.
    pub(crate) fn new(core: Core) -> Result<Self, omx::Error> {
        let input = core
            .input_port()
            .ok_or_else(|| omx::Error::Other("component has no input port".to_string()))?;
        let output = core
            .output_port()
            .ok_or_else(|| omx::Error::Other("component has no output port".to_string()))?;
        Ok(State {
            core,
            input,
            output,
        })
    }

    /// The port behind a pad of the given direction.
    pub(crate) fn port(&self, direction: gst::PadDirection) -> &Port {
        match direction {
            gst::PadDirection::Src => &self.output,
            _ => &self.input,
        }
    }
}

pub(crate) struct Context {
    /// Present between NULL->READY and READY->NULL
    pub state: Option<State>,

    /// Last result of pushing downstream, returned from the chain function
    pub flow: Result<gst::FlowSuccess, gst::FlowError>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            state: None,
            flow: Ok(gst::FlowSuccess::Ok),
        }
    }
}
