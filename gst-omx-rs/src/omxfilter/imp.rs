//! omxfilter implementation
//!
//! The element maps its state changes onto the core's lifecycle:
//!
//! | Transition      | Core                                                  |
//! |-----------------|-------------------------------------------------------|
//! | NULL -> READY   | init, tunnel with linked peers, prepare (Idle)        |
//! | READY -> PAUSED | enable tunneled ports, start (Executing)              |
//! | PAUSED -> READY | mark ports done, stop the src task, stop (Idle)       |
//! | READY -> NULL   | disable tunneled ports, unload (Loaded), deinit       |
//!
//! Input arrives through the sink pad's chain function. Output leaves through
//! a task on the src pad, which only runs while the output port is linked
//! and not tunneled.

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

// Copyright (C) 2018 Sebastian Dröge <sebastian@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gstreamer as gst;
use omx::stream::OutputPayload;
use omx::tunnel::{self, Handshake, PortSignal, TunnelSide};
use omx::{BufferFlags, config};
use tracing::trace;

use crate::omxfilter;
use crate::omxfilter::state::{Context, State};
use crate::settings::{self, DEFAULT_CORE_ID, Settings};
use crate::{streaming, tunnel_peer};

/// Debug category of omxfilter. `GST_DEBUG=omxfilter:5` shows everything.
pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "omxfilter",
        gst::DebugColorFlags::empty(),
        Some("OpenMAX IL filter"),
    )
});

pub struct OmxFilter {
    sinkpad: gst::Pad,
    srcpad: gst::Pad,
    settings: Mutex<Settings>,
    context: Mutex<Context>,
    sink_handshake: Arc<Handshake>,
    src_handshake: Arc<Handshake>,
}

impl OmxFilter {
    fn context(&self) -> MutexGuard<'_, Context> {
        self.context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clones the runtime state out of the lock.
    fn snapshot(&self) -> Option<State> {
        self.context().state.clone()
    }

    fn handshake(&self, pad: &gst::Pad) -> Arc<Handshake> {
        if pad == &self.srcpad {
            self.src_handshake.clone()
        } else {
            self.sink_handshake.clone()
        }
    }

    fn local_side(&self, pad: &gst::Pad, state: &State) -> TunnelSide {
        TunnelSide {
            core: state.core.clone(),
            port: state.port(pad.direction()).clone(),
            handshake: self.handshake(pad),
            allowed: state.core.config().tunneling,
        }
    }

    pub(crate) fn tunnel_side(&self, pad: &gst::Pad) -> Option<TunnelSide> {
        let state = self.snapshot()?;
        Some(self.local_side(pad, &state))
    }

    pub(crate) fn apply_port_signal(&self, signal: PortSignal) -> bool {
        let Some(state) = self.snapshot() else {
            return false;
        };
        gst::debug!(CAT, imp = self, "Applying {}", signal);
        tunnel_peer::apply_signal(
            self.obj().upcast_ref(),
            signal,
            Some(&state.input),
            Some(&state.output),
        )
    }

    fn negotiate_tunnel(&self, pad: &gst::Pad, state: &State) {
        let local = self.local_side(pad, state);
        if tunnel_peer::negotiate_with_peer(pad, &local).is_some() {
            gst::info!(
                CAT,
                obj = pad,
                "Port {} tunneled: {}",
                local.port.index(),
                local.port.is_tunneled()
            );
        }
    }

    fn fail(&self, error: gst::ErrorMessage) -> gst::StateChangeError {
        self.post_error_message(error);
        gst::StateChangeError
    }

    /// NULL -> READY
    fn open(&self) -> Result<(), gst::ErrorMessage> {
        let settings = self
            .settings
            .lock()
            .map_err(|e| {
                gst::error_msg!(
                    gst::CoreError::Failed,
                    ["Failed to get settings mutex: {}", e]
                )
            })?
            .clone();

        let core = settings.init_core()?;
        let state = match State::new(core.clone()) {
            Ok(state) => state,
            Err(e) => {
                if let Err(release_error) = core.deinit() {
                    gst::warning!(
                        CAT,
                        imp = self,
                        "Failed to release the component: {}",
                        release_error
                    );
                }
                return Err(gst::error_msg!(
                    gst::LibraryError::Init,
                    ["{} is not a filter: {}", settings.config.component_name, e]
                ));
            }
        };
        {
            let element = self.obj().downgrade();
            core.set_settings_changed_hook(move |port| {
                if let Some(element) = element.upgrade() {
                    gst::info!(CAT, obj = element, "Port {} settings changed", port);
                }
            });
        }
        self.context().state = Some(state.clone());
        gst::info!(CAT, imp = self, "Core {} initialised", core.id());

        for pad in [&self.sinkpad, &self.srcpad] {
            if pad.is_linked() {
                state.port(pad.direction()).set_linked(true);
                self.negotiate_tunnel(pad, &state);
            }
        }

        if let Err(e) = core.prepare() {
            self.close();
            return Err(gst::error_msg!(
                gst::LibraryError::Settings,
                ["Failed to prepare the component: {}", e]
            ));
        }
        Ok(())
    }

    /// READY -> PAUSED
    fn activate(&self) -> Result<(), gst::ErrorMessage> {
        let state = self.snapshot().ok_or_else(|| {
            gst::error_msg!(gst::CoreError::StateChange, ["No core to start"])
        })?;
        for pad in [&self.sinkpad, &self.srcpad] {
            tunnel_peer::switch_tunneled_port(pad, state.port(pad.direction()), true).map_err(
                |e| gst::error_msg!(gst::CoreError::StateChange, ["Failed to enable port: {}", e]),
            )?;
        }
        state.core.start().map_err(|e| {
            gst::error_msg!(
                gst::CoreError::StateChange,
                ["Failed to start the component: {}", e]
            )
        })?;
        self.context().flow = Ok(gst::FlowSuccess::Ok);
        Ok(())
    }

    /// PAUSED -> READY, before the pads are deactivated
    fn unblock(&self) {
        if let Some(state) = self.snapshot() {
            state.input.mark_done();
            state.output.mark_done();
            // Releases an end-of-stream wait on the sink pad.
            state.core.set_done();
        }
    }

    /// PAUSED -> READY, after the pads are deactivated
    fn deactivate(&self) -> Result<(), gst::ErrorMessage> {
        let Some(state) = self.snapshot() else {
            return Ok(());
        };
        state.core.stop().map_err(|e| {
            gst::error_msg!(
                gst::CoreError::StateChange,
                ["Failed to stop the component: {}", e]
            )
        })
    }

    /// READY -> NULL
    fn close(&self) {
        let Some(state) = self.context().state.take() else {
            return;
        };
        for pad in [&self.sinkpad, &self.srcpad] {
            if let Err(e) = tunnel_peer::switch_tunneled_port(pad, state.port(pad.direction()), false)
            {
                gst::warning!(CAT, obj = pad, "Failed to disable tunneled port: {}", e);
            }
        }
        if let Err(e) = state.core.unload() {
            gst::warning!(CAT, imp = self, "Failed to unload the component: {}", e);
        }
        if let Err(e) = state.core.deinit() {
            gst::warning!(CAT, imp = self, "Failed to release the component: {}", e);
        }
        gst::info!(CAT, imp = self, "Core {} released", state.core.id());
    }

    fn link(
        &self,
        pad: &gst::Pad,
        peer: &gst::Pad,
    ) -> Result<gst::PadLinkSuccess, gst::PadLinkError> {
        gst::debug!(CAT, obj = pad, "Linked to {}", peer.name());
        if let Some(state) = self.snapshot() {
            state.port(pad.direction()).set_linked(true);
            self.negotiate_tunnel(pad, &state);
        }
        Ok(gst::PadLinkSuccess)
    }

    fn unlink(&self, pad: &gst::Pad) {
        gst::debug!(CAT, obj = pad, "Unlinked");
        if let Some(state) = self.snapshot() {
            let port = state.port(pad.direction());
            port.set_linked(false);
            if let Err(e) = tunnel::unlink(port) {
                gst::warning!(CAT, obj = pad, "Failed to tear down tunnel: {}", e);
            }
        }
    }

    fn sink_chain(
        &self,
        _pad: &gst::Pad,
        buffer: gst::Buffer,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let state = self.snapshot().ok_or(gst::FlowError::Flushing)?;
        match self.context().flow {
            Err(gst::FlowError::Flushing) | Ok(_) => {}
            Err(err) => return Err(err),
        }
        streaming::feed_buffer(
            *CAT,
            self.obj().upcast_ref(),
            &state.core,
            &state.input,
            &buffer,
        )
    }

    fn sink_event(&self, pad: &gst::Pad, event: gst::Event) -> bool {
        gst::log!(CAT, obj = pad, "Handling event {:?}", event);
        if let Some(signal) = tunnel_peer::port_signal_of(&event) {
            if signal.is_downstream() {
                return self.apply_port_signal(signal);
            }
        }

        match event.view() {
            gst::EventView::Eos(_) => self.sink_eos(event),
            gst::EventView::FlushStart(_) => self.flush_start(event),
            gst::EventView::FlushStop(_) => self.flush_stop(event),
            _ => gst::Pad::event_default(pad, Some(&*self.obj()), event),
        }
    }

    fn sink_eos(&self, event: gst::Event) -> bool {
        let Some(state) = self.snapshot() else {
            return self.srcpad.push_event(event);
        };

        // A tunneled input gets its end of stream through the tunnel.
        let drained = if state.input.is_tunneled() {
            state.core.wait_for_done()
        } else {
            state.core.drain(&state.input)
        };
        let forward = match drained {
            Ok(()) => {
                gst::debug!(CAT, imp = self, "Component drained");
                state.output.is_tunneled() || !self.srcpad.is_linked()
            }
            Err(e) if e.is_flushing() => {
                gst::debug!(CAT, imp = self, "Drain interrupted: {}", e);
                false
            }
            Err(e) => {
                gst::warning!(CAT, imp = self, "Failed to drain the component: {}", e);
                true
            }
        };

        // Otherwise the src task pushes it after the last output buffer.
        if forward {
            self.srcpad.push_event(event)
        } else {
            true
        }
    }

    fn flush_start(&self, event: gst::Event) -> bool {
        let state = self.snapshot();
        if let Some(state) = &state {
            state.input.set_flushing(true);
            state.output.set_flushing(true);
        }
        let forwarded = self.srcpad.push_event(event);
        if let Err(e) = self.srcpad.stop_task() {
            gst::warning!(CAT, imp = self, "Failed to stop task: {}", e);
        }
        if let Some(state) = &state {
            if let Err(e) = state.core.flush_all() {
                gst::warning!(CAT, imp = self, "Failed to flush the component: {}", e);
            }
        }
        forwarded
    }

    fn flush_stop(&self, event: gst::Event) -> bool {
        let forwarded = self.srcpad.push_event(event);
        if let Some(state) = self.snapshot() {
            state.input.set_flushing(false);
            state.output.set_flushing(false);
            self.context().flow = Ok(gst::FlowSuccess::Ok);
            self.start_task(&state);
        }
        forwarded
    }

    fn src_event(&self, pad: &gst::Pad, event: gst::Event) -> bool {
        gst::log!(CAT, obj = pad, "Handling event {:?}", event);
        if let Some(signal) = tunnel_peer::port_signal_of(&event) {
            if !signal.is_downstream() {
                return self.apply_port_signal(signal);
            }
        }
        gst::Pad::event_default(pad, Some(&*self.obj()), event)
    }

    fn src_activatemode(
        &self,
        pad: &gst::Pad,
        mode: gst::PadMode,
        active: bool,
    ) -> Result<(), gst::LoggableError> {
        if mode != gst::PadMode::Push {
            return Err(gst::loggable_error!(CAT, "Unsupported pad mode {:?}", mode));
        }
        if active {
            if let Some(state) = self.snapshot() {
                self.start_task(&state);
            }
        } else {
            gst::debug!(CAT, obj = pad, "Stopping task");
            pad.stop_task()
                .map_err(|e| gst::loggable_error!(CAT, "Failed to stop task: {}", e))?;
        }
        Ok(())
    }

    fn start_task(&self, state: &State) {
        if !self.srcpad.is_linked() || state.output.is_tunneled() {
            gst::debug!(CAT, imp = self, "No output task needed");
            return;
        }
        let element = self.obj().downgrade();
        let started = self.srcpad.start_task(move || {
            let Some(element) = element.upgrade() else {
                return;
            };
            element.imp().output_loop();
        });
        if let Err(e) = started {
            gst::element_imp_error!(self, gst::CoreError::Failed, ["Failed to start task: {}", e]);
        }
    }

    fn pause_task(&self, flow: Result<gst::FlowSuccess, gst::FlowError>) {
        self.context().flow = flow;
        if let Err(e) = self.srcpad.pause_task() {
            gst::warning!(CAT, imp = self, "Failed to pause task: {}", e);
        }
    }

    /// One iteration of the src pad task: one output buffer.
    fn output_loop(&self) {
        let Some(state) = self.snapshot() else {
            self.pause_task(Err(gst::FlowError::Flushing));
            return;
        };
        let mut buffer = match state.output.request_buffer() {
            Ok(buffer) => buffer,
            Err(e) => {
                gst::debug!(CAT, imp = self, "Output stopped: {}", e);
                self.pause_task(Err(gst::FlowError::Flushing));
                return;
            }
        };

        let config = state.core.config();
        let eos = buffer.flags.contains(BufferFlags::EOS);
        let payload = OutputPayload::take(&mut buffer, config.share_output_buffer);
        if let Err(e) = state.output.release_buffer(buffer) {
            if !e.is_flushing() {
                gst::warning!(CAT, imp = self, "Failed to return output buffer: {}", e);
            }
        }

        if let Some(payload) = payload {
            trace!(len = payload.data.len(), timestamp = payload.timestamp, "Pushing output");
            let outbuf = streaming::output_buffer(payload, config.use_timestamps);
            if let Err(err) = self.srcpad.push(outbuf) {
                match err {
                    gst::FlowError::Flushing | gst::FlowError::Eos => {
                        gst::debug!(CAT, imp = self, "Downstream returned {:?}", err);
                    }
                    _ => {
                        gst::element_imp_error!(
                            self,
                            gst::StreamError::Failed,
                            ["Streaming stopped, reason {:?}", err]
                        );
                        self.srcpad.push_event(gst::event::Eos::new());
                    }
                }
                self.pause_task(Err(err));
                return;
            }
        }

        if eos {
            gst::debug!(CAT, imp = self, "End of stream from the component");
            state.core.set_done();
            self.srcpad.push_event(gst::event::Eos::new());
            self.pause_task(Err(gst::FlowError::Eos));
        }
    }
}

#[glib::object_subclass]
impl ObjectSubclass for OmxFilter {
    const NAME: &'static str = "GstRsOmxFilter";
    type Type = omxfilter::OmxFilter;
    type ParentType = gst::Element;

    fn with_class(klass: &Self::Class) -> Self {
        let sinkpad = pad_builder(klass, "sink", gst::PadDirection::Sink)
            .chain_function(|pad, parent, buffer| {
                OmxFilter::catch_panic_pad_function(
                    parent,
                    || Err(gst::FlowError::Error),
                    |this| this.sink_chain(pad, buffer),
                )
            })
            .event_function(|pad, parent, event| {
                OmxFilter::catch_panic_pad_function(
                    parent,
                    || false,
                    |this| this.sink_event(pad, event),
                )
            })
            .link_function(|pad, parent, peer| {
                OmxFilter::catch_panic_pad_function(
                    parent,
                    || Err(gst::PadLinkError::Refused),
                    |this| this.link(pad, peer),
                )
            })
            .unlink_function(|pad, parent| {
                OmxFilter::catch_panic_pad_function(parent, || (), |this| this.unlink(pad))
            })
            .build();

        let srcpad = pad_builder(klass, "src", gst::PadDirection::Src)
            .event_function(|pad, parent, event| {
                OmxFilter::catch_panic_pad_function(
                    parent,
                    || false,
                    |this| this.src_event(pad, event),
                )
            })
            .activatemode_function(|pad, parent, mode, active| {
                OmxFilter::catch_panic_pad_function(
                    parent,
                    || Err(gst::loggable_error!(CAT, "Panic activating src pad")),
                    |this| this.src_activatemode(pad, mode, active),
                )
            })
            .link_function(|pad, parent, peer| {
                OmxFilter::catch_panic_pad_function(
                    parent,
                    || Err(gst::PadLinkError::Refused),
                    |this| this.link(pad, peer),
                )
            })
            .unlink_function(|pad, parent| {
                OmxFilter::catch_panic_pad_function(parent, || (), |this| this.unlink(pad))
            })
            .build();

        OmxFilter {
            sinkpad,
            srcpad,
            settings: Mutex::new(Settings::for_component(config::DEFAULT_FILTER_COMPONENT)),
            context: Mutex::new(Context::default()),
            sink_handshake: Arc::new(Handshake::new()),
            src_handshake: Arc::new(Handshake::new()),
        }
    }
}

fn pad_builder(
    klass: &<OmxFilter as ObjectSubclass>::Class,
    name: &str,
    direction: gst::PadDirection,
) -> gst::PadBuilder<gst::Pad> {
    match klass.pad_template(name) {
        Some(templ) => gst::Pad::builder_from_template(&templ),
        None => gst::Pad::builder(direction).name(name),
    }
}

impl ObjectImpl for OmxFilter {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> =
            LazyLock::new(|| settings::properties(config::DEFAULT_FILTER_COMPONENT));
        PROPERTIES.as_ref()
    }

    fn constructed(&self) {
        #[cfg(feature = "tracing")]
        {
            use tracing_subscriber::filter::LevelFilter;
            use tracing_subscriber::util::SubscriberInitExt;

            let _ = tracing_subscriber::fmt()
                .compact()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(false)
                .with_max_level(LevelFilter::TRACE)
                .with_ansi(true)
                .finish()
                .try_init();
        }

        self.parent_constructed();

        let obj = self.obj();
        if let Err(e) = obj.add_pad(&self.sinkpad) {
            gst::error!(CAT, imp = self, "Failed to add sink pad: {}", e);
        }
        if let Err(e) = obj.add_pad(&self.srcpad) {
            gst::error!(CAT, imp = self, "Failed to add src pad: {}", e);
        }
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        if let Ok(mut settings) = self.settings.lock() {
            match settings.set(pspec.name(), value) {
                Ok(()) => gst::info!(CAT, imp = self, "Set {} to {:?}", pspec.name(), value),
                Err(e) => gst::error!(CAT, imp = self, "Failed to set {}: {}", pspec.name(), e),
            }
        } else {
            gst::error!(
                CAT,
                imp = self,
                "Settings mutex poisoned, property change ignored"
            );
        }
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        if pspec.name() == "core-id" {
            let id = self.snapshot().map_or(DEFAULT_CORE_ID, |state| state.core.id());
            return id.to_string().to_value();
        }
        if let Ok(settings) = self.settings.lock() {
            settings.get(pspec.name()).unwrap_or_else(|| {
                gst::error!(CAT, imp = self, "Unknown property {}", pspec.name());
                glib::Value::from(&"")
            })
        } else {
            gst::error!(CAT, imp = self, "Settings mutex poisoned");
            glib::Value::from(&"")
        }
    }
}

impl GstObjectImpl for OmxFilter {}

impl ElementImpl for OmxFilter {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "OpenMAX IL Filter",
                "Filter/Codec",
                "Runs buffers through an OpenMAX IL style codec component",
                "Contributors to the Media eXchange Layer project",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Result<Vec<gst::PadTemplate>, glib::BoolError>> =
            LazyLock::new(|| {
                let caps = gst::Caps::new_any();
                let sink_pad_template = gst::PadTemplate::new(
                    "sink",
                    gst::PadDirection::Sink,
                    gst::PadPresence::Always,
                    &caps,
                )?;
                let src_pad_template = gst::PadTemplate::new(
                    "src",
                    gst::PadDirection::Src,
                    gst::PadPresence::Always,
                    &caps,
                )?;
                Ok(vec![sink_pad_template, src_pad_template])
            });

        match PAD_TEMPLATES.as_ref() {
            Ok(templates) => templates,
            Err(err) => {
                trace!("Failed to create pad templates: {:?}", err);
                &[]
            }
        }
    }

    fn change_state(
        &self,
        transition: gst::StateChange,
    ) -> Result<gst::StateChangeSuccess, gst::StateChangeError> {
        gst::debug!(CAT, imp = self, "Changing state {:?}", transition);
        match transition {
            gst::StateChange::NullToReady => self.open().map_err(|e| self.fail(e))?,
            gst::StateChange::ReadyToPaused => self.activate().map_err(|e| self.fail(e))?,
            gst::StateChange::PausedToReady => self.unblock(),
            _ => (),
        }

        let success = self.parent_change_state(transition)?;

        match transition {
            gst::StateChange::PausedToReady => self.deactivate().map_err(|e| self.fail(e))?,
            gst::StateChange::ReadyToNull => self.close(),
            _ => (),
        }
        Ok(success)
    }
}
