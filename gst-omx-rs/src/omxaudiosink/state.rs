//! Runtime state of omxaudiosink

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst_audio::AudioInfo;
use gstreamer_audio as gst_audio;
use omx::{Core, Port};

#[derive(Debug, Clone)]
pub(crate) struct State {
    pub core: Core,
    pub input: Port,

    /// Format of the incoming audio, known after caps negotiation
    pub info: Option<AudioInfo>,
}

impl State {
    /// Wraps an initialised core that has an input port.
    pub(crate) fn new(core: Core) -> Result<Self, omx::Error> {
        let input = core
            .input_port()
            .ok_or_else(|| omx::Error::Other("component has no input port".to_string()))?;
        Ok(State {
            core,
            input,
            info: None,
        })
    }
}

#[derive(Default)]
pub(crate) struct Context {
    /// Present between start() and stop()
    pub state: Option<State>,

    /// The core went to Executing in this PAUSED/PLAYING run
    pub started: bool,
}
