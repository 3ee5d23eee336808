//! Tunnel plumbing between linked elements of this plugin
//!
//! A pad's peer is only a candidate for tunneling if, after looking through
//! ghost and proxy pads, it belongs to an element of this plugin. Such
//! elements implement [`TunnelCapable`] on their wrapper types, which is how
//! one element reaches the other's core during negotiation.
//!
//! Port enable/disable requests for a tunneled peer go through the same
//! typed path. Elements in between that only forward events can still carry
//! them as custom events named after the [`PortSignal`].

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use std::sync::LazyLock;

use gst::prelude::*;
use gstreamer as gst;
use omx::Port;
use omx::tunnel::{self, Hop, PortSignal, TunnelOutcome, TunnelSide};

use crate::omxaudiosink::OmxAudioSink;
use crate::omxfilter::OmxFilter;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "omxtunnel",
        gst::DebugColorFlags::empty(),
        Some("OpenMAX IL tunnel negotiation"),
    )
});

/// An element whose pads can be tunneled.
pub(crate) trait TunnelCapable {
    /// The tunnel endpoint behind `pad`, or `None` while the element has no
    /// core.
    fn tunnel_side(&self, pad: &gst::Pad) -> Option<TunnelSide>;

    /// Applies a port signal from a linked peer. Returns `false` if the
    /// element could not act on it.
    fn apply_port_signal(&self, signal: PortSignal) -> bool;
}

fn tunnel_capable(element: &gst::Element) -> Option<&dyn TunnelCapable> {
    if let Some(filter) = element.downcast_ref::<OmxFilter>() {
        return Some(filter);
    }
    if let Some(sink) = element.downcast_ref::<OmxAudioSink>() {
        return Some(sink);
    }
    None
}

/// The pad data from `pad` actually reaches, with ghost and proxy pads
/// resolved.
pub(crate) fn real_peer(pad: &gst::Pad) -> Option<gst::Pad> {
    tunnel::resolve(pad.peer()?, |candidate| {
        if let Some(ghost) = candidate.downcast_ref::<gst::GhostPad>() {
            // Ghost pad of a bin we link into: continue at its target.
            match ghost.target() {
                Some(target) => Hop::Via(target),
                None => Hop::Unresolved,
            }
        } else if let Some(proxy) = candidate.downcast_ref::<gst::ProxyPad>() {
            // Internal pad of a ghost pad of our own bin: continue outside.
            match proxy.internal().and_then(|ghost| ghost.peer()) {
                Some(outside) => Hop::Via(outside),
                None => Hop::Unresolved,
            }
        } else {
            Hop::Endpoint(candidate.clone())
        }
    })
}

fn peer_element(pad: &gst::Pad) -> Option<(gst::Element, gst::Pad)> {
    let peer = real_peer(pad)?;
    let element = peer.parent_element()?;
    Some((element, peer))
}

/// Negotiates a tunnel between `local` and the element behind `pad`.
///
/// Returns `None` whenever the link stays a normal one: the peer is not an
/// element of this plugin, has no core yet, or refuses.
pub(crate) fn negotiate_with_peer(pad: &gst::Pad, local: &TunnelSide) -> Option<TunnelOutcome> {
    let (element, peer_pad) = peer_element(pad)?;
    let Some(capable) = tunnel_capable(&element) else {
        gst::debug!(CAT, obj = pad, "{} cannot tunnel", element.name());
        return None;
    };
    let Some(peer) = capable.tunnel_side(&peer_pad) else {
        gst::debug!(CAT, obj = pad, "{} has no core yet", element.name());
        return None;
    };

    match tunnel::negotiate(local, &peer) {
        Ok(outcome) => {
            gst::info!(CAT, obj = pad, "Tunnel with {}: {:?}", element.name(), outcome);
            Some(outcome)
        }
        Err(omx::Error::TunnelRefused(reason)) => {
            gst::debug!(CAT, obj = pad, "Not tunneling: {}", reason);
            None
        }
        Err(e) => {
            gst::warning!(CAT, obj = pad, "Tunnel negotiation failed: {}", e);
            None
        }
    }
}

/// Sends `signal` to the element behind `pad`.
pub(crate) fn signal_peer(pad: &gst::Pad, signal: PortSignal) {
    if let Some((element, _)) = peer_element(pad) {
        if let Some(capable) = tunnel_capable(&element) {
            if !capable.apply_port_signal(signal) {
                gst::debug!(CAT, obj = pad, "{} ignored {}", element.name(), signal);
            }
            return;
        }
    }

    let structure = gst::Structure::new_empty(signal.name());
    let event = if signal.is_downstream() {
        gst::event::CustomDownstreamOob::new(structure)
    } else {
        gst::event::CustomUpstream::new(structure)
    };
    if !pad.push_event(event) {
        gst::debug!(CAT, obj = pad, "Nobody handled {}", signal);
    }
}

/// The port signal carried by `event`, if it is one.
pub(crate) fn port_signal_of(event: &gst::EventRef) -> Option<PortSignal> {
    match event.view() {
        gst::EventView::CustomDownstream(_)
        | gst::EventView::CustomDownstreamOob(_)
        | gst::EventView::CustomUpstream(_) => {
            event.structure()?.name().as_str().parse().ok()
        }
        _ => None,
    }
}

/// Enables or disables a tunneled port and tells the peer to follow.
/// Ports that are not tunneled are left alone.
pub(crate) fn switch_tunneled_port(pad: &gst::Pad, port: &Port, enable: bool) -> omx::Result<()> {
    if !port.is_tunneled() {
        return Ok(());
    }
    if enable {
        port.enable()?;
    } else {
        port.disable()?;
    }
    signal_peer(pad, PortSignal::for_peer_of(port.direction(), enable));
    Ok(())
}

/// Applies a received `signal` to whichever of `input`/`output` it targets.
pub(crate) fn apply_signal(
    element: &gst::Element,
    signal: PortSignal,
    input: Option<&Port>,
    output: Option<&Port>,
) -> bool {
    let port = if signal.is_downstream() { input } else { output };
    let Some(port) = port else {
        return false;
    };
    if !port.is_tunneled() {
        gst::debug!(CAT, obj = element, "Ignoring {}, port {} is not tunneled", signal, port.index());
        return true;
    }
    let result = if signal.enables() {
        port.enable()
    } else {
        port.disable()
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            gst::warning!(CAT, obj = element, "Failed to apply {}: {}", signal, e);
            false
        }
    }
}
