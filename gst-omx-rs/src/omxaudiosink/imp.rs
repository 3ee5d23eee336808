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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_base::prelude::*;
use gst_base::subclass::prelude::*;
use gstreamer as gst;
use gstreamer_audio as gst_audio;
use gstreamer_base as gst_base;
use omx::tunnel::{Handshake, PortSignal, TunnelSide};
use omx::{BufferFlags, Event, config};
use tracing::trace;

use crate::omxaudiosink;
use crate::omxaudiosink::state::{Context, State};
use crate::settings::{self, DEFAULT_CORE_ID, Settings};
use crate::{streaming, tunnel_peer};

/// Debug category of omxaudiosink. `GST_DEBUG=omxaudiosink:5` shows everything.
pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "omxaudiosink",
        gst::DebugColorFlags::empty(),
        Some("OpenMAX IL audio sink"),
    )
});

/// Main element implementation struct.
///
/// GStreamer calls into it from the application thread (state changes,
/// properties), the streaming thread (render, events) and the component's
/// callback thread (event hook), so all mutable state sits behind locks or
/// atomics.
pub struct OmxAudioSink {
    /// User-configurable properties
    settings: Mutex<Settings>,

    /// Core and input port, between start() and stop()
    context: Mutex<Context>,

    /// Tunnel negotiation guard of the sink pad
    handshake: Arc<Handshake>,

    /// An end-of-stream drain is waiting on the core
    draining: AtomicBool,

    /// The event hook posted EOS for this run
    eos_posted: AtomicBool,
}

impl Default for OmxAudioSink {
    fn default() -> Self {
        OmxAudioSink {
            settings: Mutex::new(Settings::for_component(config::DEFAULT_SINK_COMPONENT)),
            context: Mutex::new(Context::default()),
            handshake: Arc::new(Handshake::new()),
            draining: AtomicBool::new(false),
            eos_posted: AtomicBool::new(false),
        }
    }
}

impl OmxAudioSink {
    fn context(&self) -> MutexGuard<'_, Context> {
        self.context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Option<State> {
        self.context().state.clone()
    }

    fn sinkpad(&self) -> Option<gst::Pad> {
        self.obj().static_pad("sink")
    }

    pub(crate) fn tunnel_side(&self, _pad: &gst::Pad) -> Option<TunnelSide> {
        let state = self.snapshot()?;
        Some(TunnelSide {
            allowed: state.core.config().tunneling,
            core: state.core,
            port: state.input,
            handshake: self.handshake.clone(),
        })
    }

    pub(crate) fn apply_port_signal(&self, signal: PortSignal) -> bool {
        let Some(state) = self.snapshot() else {
            return false;
        };
        gst::debug!(CAT, imp = self, "Applying {}", signal);
        tunnel_peer::apply_signal(self.obj().upcast_ref(), signal, Some(&state.input), None)
    }

    /// Posts EOS on the bus, once per run.
    fn post_eos(&self) {
        if self.eos_posted.swap(true, Ordering::SeqCst) {
            return;
        }
        gst::info!(CAT, imp = self, "Component reached end of stream");
        let obj = self.obj();
        if let Err(e) = obj.post_message(gst::message::Eos::builder().src(&*obj).build()) {
            gst::warning!(CAT, imp = self, "Failed to post EOS: {}", e);
        }
    }

    /// Reacts to component events on the callback thread.
    fn on_component_event(&self, event: &Event) {
        let Event::BufferFlag { port, flags } = *event else {
            return;
        };
        if !flags.contains(BufferFlags::EOS) {
            return;
        }
        // Nothing upstream will send EOS through the pipeline in time when
        // the data arrives through a tunnel.
        if let Some(state) = self.snapshot() {
            if state.input.index() == port && state.input.is_tunneled() {
                self.post_eos();
            }
        }
    }

    /// Waits until everything fed so far has been consumed.
    fn drain(&self) {
        let Some(state) = self.snapshot() else {
            return;
        };
        self.draining.store(true, Ordering::SeqCst);
        let drained = if state.input.is_tunneled() {
            state.core.wait_for_done()
        } else {
            state.core.drain(&state.input)
        };
        self.draining.store(false, Ordering::SeqCst);

        match drained {
            Ok(()) => gst::debug!(CAT, imp = self, "Component drained"),
            Err(e) if e.is_flushing() => {
                gst::debug!(CAT, imp = self, "Drain interrupted: {}", e)
            }
            Err(e) => gst::element_imp_error!(
                self,
                gst::StreamError::Failed,
                ["Failed to drain the component: {}", e]
            ),
        }
    }

    fn fail(&self, error: gst::ErrorMessage) -> gst::StateChangeError {
        self.post_error_message(error);
        gst::StateChangeError
    }

    /// READY -> PAUSED: tunneled input enabled, core paused.
    fn pause_core(&self) -> Result<(), gst::ErrorMessage> {
        let state = self.snapshot().ok_or_else(|| {
            gst::error_msg!(gst::CoreError::StateChange, ["No core to pause"])
        })?;
        if let Some(pad) = self.sinkpad() {
            tunnel_peer::switch_tunneled_port(&pad, &state.input, true).map_err(|e| {
                gst::error_msg!(gst::CoreError::StateChange, ["Failed to enable port: {}", e])
            })?;
        }
        // No buffer ever prerolls a tunneled sink.
        self.obj().set_async(!state.input.is_tunneled());
        self.eos_posted.store(false, Ordering::SeqCst);
        state.core.pause().map_err(|e| {
            gst::error_msg!(
                gst::CoreError::StateChange,
                ["Failed to pause the component: {}", e]
            )
        })
    }

    /// PAUSED -> PLAYING: Executing, input buffers handed out on the first run.
    fn play_core(&self) -> Result<(), gst::ErrorMessage> {
        let (state, started) = {
            let mut context = self.context();
            let Some(state) = context.state.clone() else {
                return Ok(());
            };
            (state, std::mem::replace(&mut context.started, true))
        };
        let played = if started {
            state.core.resume()
        } else {
            state.core.start()
        };
        played.map_err(|e| {
            gst::error_msg!(
                gst::CoreError::StateChange,
                ["Failed to run the component: {}", e]
            )
        })
    }

    /// PAUSED -> READY, after the streaming thread is stopped.
    fn idle_core(&self) -> Result<(), gst::ErrorMessage> {
        let state = {
            let mut context = self.context();
            context.started = false;
            context.state.clone()
        };
        let Some(state) = state else {
            return Ok(());
        };
        state.core.stop().map_err(|e| {
            gst::error_msg!(
                gst::CoreError::StateChange,
                ["Failed to stop the component: {}", e]
            )
        })
    }
}

/// Registers this type as a GLib object subclass.
#[glib::object_subclass]
impl ObjectSubclass for OmxAudioSink {
    const NAME: &'static str = "GstRsOmxAudioSink";
    type Type = omxaudiosink::OmxAudioSink;
    type ParentType = gst_base::BaseSink;
}

impl ObjectImpl for OmxAudioSink {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> =
            LazyLock::new(|| settings::properties(config::DEFAULT_SINK_COMPONENT));
        PROPERTIES.as_ref()
    }

    /// Called after the object is constructed.
    ///
    /// Sets up tracing when the `tracing` feature is enabled.
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

impl GstObjectImpl for OmxAudioSink {}

impl ElementImpl for OmxAudioSink {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "OpenMAX IL Audio Sink",
                "Sink/Audio",
                "Renders raw audio through an OpenMAX IL style component",
                "Contributors to the Media eXchange Layer project",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    /// One always sink pad for interleaved raw audio of any format.
    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Result<Vec<gst::PadTemplate>, glib::BoolError>> =
            LazyLock::new(|| {
                let caps = gst_audio::AudioCapsBuilder::new_interleaved().build();
                let sink_pad_template = gst::PadTemplate::new(
                    "sink",
                    gst::PadDirection::Sink,
                    gst::PadPresence::Always,
                    &caps,
                )?;

                Ok(vec![sink_pad_template])
            });

        match PAD_TEMPLATES.as_ref() {
            Ok(templates) => templates,
            Err(err) => {
                trace!("Failed to create pad templates: {:?}", err);
                &[]
            }
        }
    }

    /// Follows the pipeline state with the component state.
    ///
    /// The component sits in Pause while the element is PAUSED and only
    /// executes while PLAYING. The core is created and released by
    /// [`BaseSinkImpl::start`] and [`BaseSinkImpl::stop`].
    fn change_state(
        &self,
        transition: gst::StateChange,
    ) -> Result<gst::StateChangeSuccess, gst::StateChangeError> {
        gst::debug!(CAT, imp = self, "Changing state {:?}", transition);
        match transition {
            // start() ran during NULL->READY.
            gst::StateChange::ReadyToPaused => self.pause_core().map_err(|e| self.fail(e))?,
            gst::StateChange::PausedToPlaying => self.play_core().map_err(|e| self.fail(e))?,
            gst::StateChange::PausedToReady => {
                if let Some(state) = self.snapshot() {
                    state.input.mark_done();
                }
            }
            _ => (),
        }

        let success = self.parent_change_state(transition)?;

        match transition {
            gst::StateChange::PlayingToPaused => {
                if let Some(state) = self.snapshot() {
                    if let Err(e) = state.core.pause() {
                        gst::warning!(CAT, imp = self, "Failed to pause the component: {}", e);
                    }
                }
            }
            gst::StateChange::PausedToReady => self.idle_core().map_err(|e| self.fail(e))?,
            _ => (),
        }
        Ok(success)
    }
}

impl BaseSinkImpl for OmxAudioSink {
    /// Called on NULL->READY.
    ///
    /// Instantiates the component, tunnels it with an upstream element that
    /// already has a core, and brings it to Idle.
    fn start(&self) -> Result<(), gst::ErrorMessage> {
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
                    ["{} cannot render: {}", settings.config.component_name, e]
                ));
            }
        };
        {
            let element = self.obj().downgrade();
            core.set_event_hook(move |event| {
                if let Some(element) = element.upgrade() {
                    element.imp().on_component_event(event);
                }
            });
        }
        {
            let mut context = self.context();
            context.state = Some(state.clone());
            context.started = false;
        }
        gst::info!(CAT, imp = self, "Core {} initialised", core.id());

        if let Some(pad) = self.sinkpad() {
            if pad.is_linked() {
                state.input.set_linked(true);
                let local = TunnelSide {
                    core: core.clone(),
                    port: state.input.clone(),
                    handshake: self.handshake.clone(),
                    allowed: core.config().tunneling,
                };
                tunnel_peer::negotiate_with_peer(&pad, &local);
            }
        }

        if let Err(e) = core.prepare() {
            // The base class does not call stop() for a failed start().
            if let Err(stop_error) = self.stop() {
                gst::warning!(CAT, imp = self, "Failed to clean up after start: {}", stop_error);
            }
            return Err(gst::error_msg!(
                gst::LibraryError::Settings,
                ["Failed to prepare the component: {}", e]
            ));
        }
        Ok(())
    }

    /// Called on READY->NULL.
    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        let Some(state) = self.context().state.take() else {
            return Ok(());
        };
        if let Some(pad) = self.sinkpad() {
            if let Err(e) = tunnel_peer::switch_tunneled_port(&pad, &state.input, false) {
                gst::warning!(CAT, imp = self, "Failed to disable tunneled port: {}", e);
            }
        }
        if let Err(e) = state.core.flush_all() {
            gst::warning!(CAT, imp = self, "Failed to flush the component: {}", e);
        }
        if let Err(e) = state.core.unload() {
            gst::warning!(CAT, imp = self, "Failed to unload the component: {}", e);
        }
        state.core.deinit().map_err(|e| {
            gst::error_msg!(
                gst::LibraryError::Shutdown,
                ["Failed to release the component: {}", e]
            )
        })?;
        gst::info!(CAT, imp = self, "Core {} released", state.core.id());
        Ok(())
    }

    /// Feeds one buffer to the input port. Only called while PLAYING.
    fn render(&self, buffer: &gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
        let state = self.snapshot().ok_or(gst::FlowError::Flushing)?;
        if let Some(info) = &state.info {
            gst::trace!(
                CAT,
                imp = self,
                "Rendering {} frames",
                buffer.size() / info.bpf().max(1) as usize
            );
        }
        streaming::feed_buffer(
            *CAT,
            self.obj().upcast_ref(),
            &state.core,
            &state.input,
            buffer,
        )
    }

    /// Handles port signals and drains the component on EOS before the
    /// base class posts the EOS message.
    fn event(&self, event: gst::Event) -> bool {
        if let Some(signal) = tunnel_peer::port_signal_of(&event) {
            if signal.is_downstream() {
                return self.apply_port_signal(signal);
            }
        }

        match event.view() {
            gst::EventView::Eos(_) => self.drain(),
            gst::EventView::FlushStop(_) => {
                if let Some(state) = self.snapshot() {
                    if let Err(e) = state.core.flush_port(&state.input) {
                        gst::warning!(CAT, imp = self, "Failed to flush input: {}", e);
                    }
                }
            }
            _ => (),
        }
        self.parent_event(event)
    }

    fn set_caps(&self, caps: &gst::Caps) -> Result<(), gst::LoggableError> {
        let info = gst_audio::AudioInfo::from_caps(caps)
            .map_err(|e| gst::loggable_error!(CAT, "Invalid audio caps: {}", e))?;
        gst::info!(
            CAT,
            imp = self,
            "Audio format {:?}, {} Hz, {} channels",
            info.format(),
            info.rate(),
            info.channels()
        );

        let mut context = self.context();
        let state = context
            .state
            .as_mut()
            .ok_or(gst::loggable_error!(CAT, "Caps before start"))?;
        state.info = Some(info);
        Ok(())
    }

    /// Releases a render blocked on the input port, and a running drain.
    fn unlock(&self) -> Result<(), gst::ErrorMessage> {
        gst::debug!(CAT, imp = self, "Unlocking");
        if let Some(state) = self.snapshot() {
            state.input.set_flushing(true);
            if self.draining.load(Ordering::SeqCst) {
                state.core.set_done();
            }
        }
        Ok(())
    }

    fn unlock_stop(&self) -> Result<(), gst::ErrorMessage> {
        gst::debug!(CAT, imp = self, "Unlock stop");
        if let Some(state) = self.snapshot() {
            state.input.set_flushing(false);
        }
        Ok(())
    }
}
