// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Direct component-to-component tunnels.
//!
//! Two cores can exchange buffers directly, output port to input port, without
//! the pipeline in between. Both sides run [`negotiate`] when they are linked;
//! the handshake flags decide which of them issues the single connect call:
//!
//! - A side invoked by its peer (the responder) never connects.
//! - An initiator that finds the peer's flag clear runs the peer as responder
//!   and then connects.
//! - If both sides find the other's flag set, they started simultaneously:
//!   the output side connects and the input side defers.
//!
//! The connect itself is claimed with a compare-exchange on the output port's
//! tunneled flag, so the component sees at most one connect call per tunnel.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, trace, warn};

use crate::component::{Direction, State};
use crate::core::Core;
use crate::port::Port;
use crate::{Error, Result};

/// Upper bound on indirections followed by [`resolve`].
pub const MAX_HOPS: usize = 16;

/// Per-pad flag raised for the duration of a tunnel handshake.
#[derive(Debug, Default)]
pub struct Handshake(AtomicBool);

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Returns `false` if it was raised already, in which
    /// case ending it is up to whoever raised it.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a tunnel-capable element exposes for one of its pads.
#[derive(Clone)]
pub struct TunnelSide {
    pub core: Core,
    pub port: Port,
    pub handshake: Arc<Handshake>,
    /// Tunneling is enabled on this side.
    pub allowed: bool,
}

impl fmt::Debug for TunnelSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSide")
            .field("core", &self.core.id())
            .field("port", &self.port.index())
            .field("handshake", &self.handshake.is_set())
            .field("allowed", &self.allowed)
            .finish()
    }
}

/// Result of a successful [`negotiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// This side issued the connect call.
    Connected,
    /// The peer drives the connect call.
    Deferred,
    /// The port was tunneled before negotiation started.
    AlreadyTunneled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Negotiates a tunnel between `local` and `peer`.
///
/// # Errors
///
/// - [`Error::TunnelRefused`] if either side disallows tunneling, both ports
///   have the same direction, or the cores come from different libraries.
///   Callers fall back to a normal link.
/// - Errors of the port disable and connect calls.
pub fn negotiate(local: &TunnelSide, peer: &TunnelSide) -> Result<TunnelOutcome> {
    if local.port.is_tunneled() {
        trace!(core = %local.core.id(), port = local.port.index(), "Port already tunneled");
        return Ok(TunnelOutcome::AlreadyTunneled);
    }
    check_compatible(local, peer)?;
    drive(local, peer, Role::Initiator)
}

fn check_compatible(local: &TunnelSide, peer: &TunnelSide) -> Result<()> {
    if !local.allowed || !peer.allowed {
        return Err(Error::TunnelRefused("tunneling disabled".to_string()));
    }
    if local.port.direction() == peer.port.direction() {
        return Err(Error::TunnelRefused(format!(
            "both ports are {:?}",
            local.port.direction()
        )));
    }
    let local_library = local.core.library()?;
    let peer_library = peer.core.library()?;
    if !Arc::ptr_eq(&local_library, &peer_library) {
        return Err(Error::TunnelRefused(format!(
            "{} and {} are different libraries",
            local_library.name(),
            peer_library.name()
        )));
    }
    Ok(())
}

fn drive(local: &TunnelSide, peer: &TunnelSide, role: Role) -> Result<TunnelOutcome> {
    debug!(
        core = %local.core.id(),
        port = local.port.index(),
        ?role,
        "Negotiating tunnel"
    );
    local.core.release_port_buffers(&local.port)?;
    local.port.disable()?;

    let began = local.handshake.begin();
    let peer_driving = peer.handshake.is_set();
    let result = match role {
        Role::Responder => Ok(TunnelOutcome::Deferred),
        Role::Initiator if !peer_driving => {
            drive(peer, local, Role::Responder).and_then(|_| connect(local, peer))
        }
        Role::Initiator if local.port.direction() == Direction::Output => connect(local, peer),
        Role::Initiator => {
            debug!(
                core = %local.core.id(),
                port = local.port.index(),
                "Simultaneous handshake, deferring to output side"
            );
            Ok(TunnelOutcome::Deferred)
        }
    };
    if began {
        local.handshake.end();
    }
    result
}

fn connect(a: &TunnelSide, b: &TunnelSide) -> Result<TunnelOutcome> {
    let (output, input) = match a.port.direction() {
        Direction::Output => (a, b),
        Direction::Input => (b, a),
    };

    if !output.port.claim_tunnel() {
        debug!(core = %output.core.id(), "Tunnel already connected by peer");
        return Ok(TunnelOutcome::Deferred);
    }

    let library = output.core.library()?;
    let connected = output.core.component().and_then(|out_component| {
        let in_component = input.core.component()?;
        library.library().setup_tunnel(
            out_component.as_ref(),
            output.port.index(),
            in_component.as_ref(),
            input.port.index(),
        )
    });
    if let Err(e) = connected {
        warn!(core = %output.core.id(), "Tunnel setup failed: {}", e);
        output.port.clear_tunnel();
        return Err(e);
    }

    output.port.set_tunnel_partner(&input.port);
    input.port.set_tunnel_partner(&output.port);
    info!(
        out_core = %output.core.id(),
        out_port = output.port.index(),
        in_core = %input.core.id(),
        in_port = input.port.index(),
        "Tunnel established"
    );

    for side in [output, input] {
        if matches!(side.core.state(), State::Executing | State::Pause) {
            side.port.enable()?;
        }
    }
    Ok(TunnelOutcome::Connected)
}

/// Removes the tunnel `port` takes part in, on both ends.
///
/// Both ports fall back to pipeline-mediated buffer exchange afterwards.
pub fn unlink(port: &Port) -> Result<()> {
    let partner = port.tunnel_partner();
    let was_tunneled = port.is_tunneled();
    port.clear_tunnel();
    if let Some(partner) = &partner {
        partner.clear_tunnel();
    }
    if !was_tunneled {
        return Ok(());
    }

    let output = match port.direction() {
        Direction::Output => Some(port.clone()),
        Direction::Input => partner,
    };
    let Some(output) = output else {
        return Ok(());
    };
    let Some(core) = output.core() else {
        return Ok(());
    };
    info!(core = %core.id(), port = output.index(), "Tearing down tunnel");
    let library = core.library()?;
    let component = core.component()?;
    library
        .library()
        .teardown_tunnel(component.as_ref(), output.index())
}

/// Out-of-band port signals exchanged with a linked peer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSignal {
    /// Sent downstream: the receiver disables its input port.
    DisableInPort,
    /// Sent downstream: the receiver enables its input port.
    EnableInPort,
    /// Sent upstream: the receiver disables its output port.
    DisableOutPort,
    /// Sent upstream: the receiver enables its output port.
    EnableOutPort,
}

impl PortSignal {
    pub const ALL: [PortSignal; 4] = [
        PortSignal::DisableInPort,
        PortSignal::EnableInPort,
        PortSignal::DisableOutPort,
        PortSignal::EnableOutPort,
    ];

    /// Stable name, used as the structure name of custom events.
    pub fn name(self) -> &'static str {
        match self {
            PortSignal::DisableInPort => "omx-disable-in-port",
            PortSignal::EnableInPort => "omx-enable-in-port",
            PortSignal::DisableOutPort => "omx-disable-out-port",
            PortSignal::EnableOutPort => "omx-enable-out-port",
        }
    }

    /// `true` for signals that travel with the data, towards the input port.
    pub fn is_downstream(self) -> bool {
        matches!(self, PortSignal::DisableInPort | PortSignal::EnableInPort)
    }

    /// `true` for the enable variants.
    pub fn enables(self) -> bool {
        matches!(self, PortSignal::EnableInPort | PortSignal::EnableOutPort)
    }

    /// The signal a peer receives for a change of `direction` port on this side.
    pub fn for_peer_of(direction: Direction, enable: bool) -> PortSignal {
        match (direction, enable) {
            (Direction::Output, true) => PortSignal::EnableInPort,
            (Direction::Output, false) => PortSignal::DisableInPort,
            (Direction::Input, true) => PortSignal::EnableOutPort,
            (Direction::Input, false) => PortSignal::DisableOutPort,
        }
    }
}

impl fmt::Display for PortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PortSignal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PortSignal::ALL
            .into_iter()
            .find(|signal| signal.name() == s)
            .ok_or_else(|| Error::Other(format!("unknown port signal '{s}'")))
    }
}

/// One step of peer resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop<T> {
    /// `T` is the concrete endpoint.
    Endpoint(T),
    /// `T` is a pass-through; resolution continues from the contained value.
    Via(T),
    /// The chain ends without an endpoint.
    Unresolved,
}

/// Follows `step` from `start` until it yields an endpoint.
///
/// Returns `None` if the chain ends unresolved or exceeds [`MAX_HOPS`], which
/// also covers cycles.
///
/// # Examples
///
/// ```
/// use omx::tunnel::{Hop, resolve};
///
/// // 0 -> 1 -> 2 are pass-throughs, 3 is the endpoint.
/// let found = resolve(0u32, |n| if *n < 3 { Hop::Via(n + 1) } else { Hop::Endpoint(*n) });
/// assert_eq!(found, Some(3));
/// ```
pub fn resolve<T, F>(start: T, mut step: F) -> Option<T>
where
    F: FnMut(&T) -> Hop<T>,
{
    let mut current = start;
    for _ in 0..MAX_HOPS {
        match step(&current) {
            Hop::Endpoint(endpoint) => return Some(endpoint),
            Hop::Via(next) => current = next,
            Hop::Unresolved => return None,
        }
    }
    warn!("Peer resolution gave up after {} hops", MAX_HOPS);
    None
}
