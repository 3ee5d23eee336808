//! Buffer conversion between the pipeline and a core's ports

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gstreamer as gst;
use omx::stream::{self, OutputPayload};
use omx::{Core, Port};

/// Feeds one pipeline buffer into the component's input port.
///
/// Tunneled ports take nothing from the pipeline and the buffer is dropped.
/// A non-fatal component refusal drops the buffer with a warning; streaming
/// goes on.
pub(crate) fn feed_buffer(
    cat: gst::DebugCategory,
    element: &gst::Element,
    core: &Core,
    input: &Port,
    buffer: &gst::Buffer,
) -> Result<gst::FlowSuccess, gst::FlowError> {
    if input.is_tunneled() {
        gst::log!(cat, obj = element, "Input port is tunneled, dropping {:?}", buffer);
        return Ok(gst::FlowSuccess::Ok);
    }

    let config = core.config();
    let timestamp = if config.use_timestamps {
        buffer.pts().map(|pts| stream::ticks_from_nanos(pts.nseconds()))
    } else {
        None
    };
    let map = buffer.map_readable().map_err(|_| {
        gst::element_error!(element, gst::CoreError::Failed, ["Failed to map buffer"]);
        gst::FlowError::Error
    })?;

    match stream::feed_input(input, map.as_slice(), timestamp, config.share_input_buffer) {
        Ok(released) => {
            gst::trace!(cat, obj = element, "Fed {} bytes in {} buffers", map.size(), released);
            Ok(gst::FlowSuccess::Ok)
        }
        Err(e) if e.is_flushing() => {
            gst::debug!(cat, obj = element, "Input port is flushing");
            Err(gst::FlowError::Flushing)
        }
        Err(omx::Error::Component(error)) if !error.is_fatal() => {
            gst::warning!(cat, obj = element, "Component refused input: {}", error);
            Ok(gst::FlowSuccess::Ok)
        }
        Err(e) => {
            gst::element_error!(
                element,
                gst::StreamError::Failed,
                ["Failed to feed the component: {}", e]
            );
            Err(gst::FlowError::Error)
        }
    }
}

/// Wraps an output payload in a pipeline buffer.
pub(crate) fn output_buffer(payload: OutputPayload, use_timestamps: bool) -> gst::Buffer {
    let timestamp = payload.timestamp;
    let mut buffer = gst::Buffer::from_mut_slice(payload.data);
    if use_timestamps {
        buffer
            .make_mut()
            .set_pts(gst::ClockTime::from_nseconds(stream::nanos_from_ticks(timestamp)));
    }
    buffer
}
