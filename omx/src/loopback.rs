// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! A software implementation library.
//!
//! [`LoopbackLibrary`] provides two components that behave like a vendor
//! codec as far as the core can tell: commands complete asynchronously on a
//! worker thread, buffers travel through `empty_this_buffer` and
//! `fill_this_buffer`, and output ports can be tunneled to another loopback
//! component. The "codec" copies input payloads to the output unchanged.
//!
//! - `OMX.loopback.filter`: port 0 input, port 1 output.
//! - `OMX.loopback.sink`: port 0 input; payloads are consumed.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, trace, warn};

use crate::component::{
    BufferFlags, BufferHeader, BufferRejected, Callbacks, Command, Completion, Component,
    Direction, Event, Library, PortDefinition, PortSelector, State,
};
use crate::config::{DEFAULT_FILTER_COMPONENT, DEFAULT_SINK_COMPONENT};
use crate::{ComponentError, Error, Result};

/// Behaviour knobs, mostly for injecting failures in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackOptions {
    pub buffer_count: usize,
    pub buffer_size: usize,
    /// Report a non-fatal error instead of completing a change to this state.
    pub fail_transition: Option<State>,
    /// Report a fatal error instead of completing a change to this state.
    pub fatal_transition: Option<State>,
    /// Refuse every buffer handed to a component.
    pub reject_buffers: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            buffer_size: 4096,
            fail_transition: None,
            fatal_transition: None,
            reject_buffers: false,
        }
    }
}

/// The loopback implementation library.
#[derive(Debug, Default)]
pub struct LoopbackLibrary {
    options: LoopbackOptions,
    init_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
}

impl LoopbackLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Number of times the library was initialised.
    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Number of tunnels set up so far.
    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of tunnels torn down so far.
    pub fn teardown_count(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }
}

fn downcast(component: &dyn Component) -> Result<&LoopbackComponent> {
    component
        .as_any()
        .downcast_ref::<LoopbackComponent>()
        .ok_or_else(|| Error::TunnelRefused("peer is not a loopback component".to_string()))
}

impl Library for LoopbackLibrary {
    fn name(&self) -> &str {
        "loopback"
    }

    fn init(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn get_handle(
        &self,
        component_name: &str,
        callbacks: Arc<dyn Callbacks>,
    ) -> Result<Arc<dyn Component>> {
        let port_count = match component_name {
            DEFAULT_FILTER_COMPONENT => 2,
            DEFAULT_SINK_COMPONENT => 1,
            other => return Err(Error::ComponentNotFound(other.to_string())),
        };
        let component = LoopbackComponent::spawn(
            component_name,
            port_count,
            self.options.clone(),
            callbacks,
        )?;
        Ok(Arc::new(component))
    }

    fn setup_tunnel(
        &self,
        output: &dyn Component,
        out_port: u32,
        input: &dyn Component,
        in_port: u32,
    ) -> Result<()> {
        let output = downcast(output)?;
        let input = downcast(input)?;
        if output.direction(out_port) != Some(Direction::Output)
            || input.direction(in_port) != Some(Direction::Input)
        {
            return Err(Error::TunnelRefused(format!(
                "ports {out_port} -> {in_port} do not form an output/input pair"
            )));
        }
        input.post(Message::SetTunneledIn {
            port: in_port,
            tunneled: true,
        })?;
        output.post(Message::SetTunnelOut {
            port: out_port,
            peer: Some(TunnelTarget {
                sender: input.sender()?,
                port: in_port,
            }),
        })?;
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        debug!(
            output = %output.name,
            out_port,
            input = %input.name,
            in_port,
            "Loopback tunnel connected"
        );
        Ok(())
    }

    fn teardown_tunnel(&self, output: &dyn Component, out_port: u32) -> Result<()> {
        let output = downcast(output)?;
        output.post(Message::SetTunnelOut {
            port: out_port,
            peer: None,
        })?;
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TunnelTarget {
    sender: Sender<Message>,
    port: u32,
}

enum Message {
    Command(Command),
    Empty(BufferHeader),
    Fill(BufferHeader),
    Allocated(u32),
    Freed(u32),
    TunnelData {
        port: u32,
        data: Vec<u8>,
        flags: BufferFlags,
        timestamp: i64,
    },
    SetTunnelOut {
        port: u32,
        peer: Option<TunnelTarget>,
    },
    SetTunneledIn {
        port: u32,
        tunneled: bool,
    },
    Shutdown,
}

/// A loopback component instance, served by its own worker thread.
pub struct LoopbackComponent {
    name: String,
    definitions: Vec<PortDefinition>,
    options: LoopbackOptions,
    sender: Mutex<Sender<Message>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl LoopbackComponent {
    fn spawn(
        name: &str,
        port_count: u32,
        options: LoopbackOptions,
        callbacks: Arc<dyn Callbacks>,
    ) -> Result<Self> {
        let definitions: Vec<PortDefinition> = (0..port_count)
            .map(|index| PortDefinition {
                index,
                direction: if index == 0 {
                    Direction::Input
                } else {
                    Direction::Output
                },
                buffer_count: options.buffer_count,
                buffer_size: options.buffer_size,
                enabled: true,
            })
            .collect();

        let (sender, receiver) = mpsc::channel();
        let worker = Worker {
            name: name.to_string(),
            callbacks,
            options: options.clone(),
            state: State::Loaded,
            pending: None,
            ports: definitions
                .iter()
                .map(|definition| PortRuntime {
                    definition: definition.clone(),
                    enabled: definition.enabled,
                    tunneled: false,
                    allocated: 0,
                })
                .collect(),
            inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            tunnel_out: None,
        };
        let handle = thread::Builder::new()
            .name(format!("loopback:{name}"))
            .spawn(move || worker.run(receiver))
            .map_err(|e| Error::Other(format!("failed to spawn loopback worker: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            definitions,
            options,
            sender: Mutex::new(sender),
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    fn direction(&self, port: u32) -> Option<Direction> {
        self.definitions
            .get(port as usize)
            .map(|definition| definition.direction)
    }

    fn sender(&self) -> Result<Sender<Message>> {
        self.sender
            .lock()
            .map(|sender| sender.clone())
            .map_err(|e| Error::Other(format!("loopback sender poisoned: {e}")))
    }

    fn post(&self, message: Message) -> Result<()> {
        self.sender()?
            .send(message)
            .map_err(|_| Error::Other(format!("loopback worker {} has stopped", self.name)))
    }

    fn check_port(&self, port: u32) -> Result<()> {
        if (port as usize) < self.definitions.len() {
            Ok(())
        } else {
            Err(Error::Component(ComponentError::BadParameter))
        }
    }
}

impl Component for LoopbackComponent {
    fn send_command(&self, command: Command) -> Result<()> {
        match command {
            Command::PortEnable(port) | Command::PortDisable(port) => self.check_port(port)?,
            Command::Flush(PortSelector::Port(port)) => self.check_port(port)?,
            _ => {}
        }
        self.post(Message::Command(command))
    }

    fn port_count(&self) -> u32 {
        self.definitions.len() as u32
    }

    fn port_definition(&self, index: u32) -> Result<PortDefinition> {
        self.definitions
            .get(index as usize)
            .cloned()
            .ok_or(Error::Component(ComponentError::BadParameter))
    }

    fn allocate_buffer(&self, port_index: u32, slot: usize, size: usize) -> Result<BufferHeader> {
        self.check_port(port_index)?;
        self.post(Message::Allocated(port_index))?;
        Ok(BufferHeader::new(port_index, slot, size))
    }

    fn free_buffer(&self, buffer: BufferHeader) -> Result<()> {
        self.post(Message::Freed(buffer.port_index))
    }

    fn empty_this_buffer(
        &self,
        buffer: BufferHeader,
    ) -> core::result::Result<(), BufferRejected> {
        if self.options.reject_buffers || self.direction(buffer.port_index) != Some(Direction::Input)
        {
            return Err(BufferRejected {
                error: ComponentError::BadParameter,
                buffer,
            });
        }
        self.forward(Message::Empty, buffer)
    }

    fn fill_this_buffer(&self, buffer: BufferHeader) -> core::result::Result<(), BufferRejected> {
        if self.options.reject_buffers
            || self.direction(buffer.port_index) != Some(Direction::Output)
        {
            return Err(BufferRejected {
                error: ComponentError::BadParameter,
                buffer,
            });
        }
        self.forward(Message::Fill, buffer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LoopbackComponent {
    fn forward(
        &self,
        wrap: fn(BufferHeader) -> Message,
        buffer: BufferHeader,
    ) -> core::result::Result<(), BufferRejected> {
        let rejected = |buffer| BufferRejected {
            error: ComponentError::InvalidState,
            buffer,
        };
        let sender = match self.sender() {
            Ok(sender) => sender,
            Err(_) => return Err(rejected(buffer)),
        };
        if let Err(mpsc::SendError(Message::Empty(buffer) | Message::Fill(buffer))) =
            sender.send(wrap(buffer))
        {
            return Err(rejected(buffer));
        }
        Ok(())
    }
}

impl Drop for LoopbackComponent {
    fn drop(&mut self) {
        let _ = self.post(Message::Shutdown);
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            // The last reference may go away on the worker thread itself,
            // inside a callback.
            if thread::current().id() == self.worker_id {
                return;
            }
            if handle.join().is_err() {
                error!(component = %self.name, "Loopback worker panicked");
            }
        }
    }
}

struct PortRuntime {
    definition: PortDefinition,
    enabled: bool,
    tunneled: bool,
    allocated: usize,
}

impl PortRuntime {
    /// Ports that need client buffers before the component can leave Loaded.
    fn needs_buffers(&self) -> bool {
        self.enabled && !self.tunneled
    }
}

enum Input {
    Buffer(BufferHeader),
    Tunnel {
        data: Vec<u8>,
        flags: BufferFlags,
        timestamp: i64,
    },
}

struct Worker {
    name: String,
    callbacks: Arc<dyn Callbacks>,
    options: LoopbackOptions,
    state: State,
    pending: Option<State>,
    ports: Vec<PortRuntime>,
    inputs: VecDeque<Input>,
    outputs: VecDeque<BufferHeader>,
    tunnel_out: Option<TunnelTarget>,
}

impl Worker {
    fn run(mut self, receiver: Receiver<Message>) {
        debug!(component = %self.name, "Loopback worker started");
        while let Ok(message) = receiver.recv() {
            match message {
                Message::Command(command) => self.command(command),
                Message::Empty(buffer) => {
                    self.inputs.push_back(Input::Buffer(buffer));
                    self.process();
                }
                Message::Fill(buffer) => {
                    self.outputs.push_back(buffer);
                    self.process();
                }
                Message::Allocated(port) => {
                    if let Some(runtime) = self.ports.get_mut(port as usize) {
                        runtime.allocated += 1;
                    }
                    self.check_population();
                }
                Message::Freed(port) => {
                    if let Some(runtime) = self.ports.get_mut(port as usize) {
                        runtime.allocated = runtime.allocated.saturating_sub(1);
                    }
                    self.check_population();
                }
                Message::TunnelData {
                    port,
                    data,
                    flags,
                    timestamp,
                } => {
                    trace!(component = %self.name, port, len = data.len(), "Tunnel data");
                    self.inputs.push_back(Input::Tunnel {
                        data,
                        flags,
                        timestamp,
                    });
                    self.process();
                }
                Message::SetTunnelOut { port, peer } => {
                    if let Some(runtime) = self.ports.get_mut(port as usize) {
                        runtime.tunneled = peer.is_some();
                    }
                    self.tunnel_out = peer;
                    self.process();
                }
                Message::SetTunneledIn { port, tunneled } => {
                    if let Some(runtime) = self.ports.get_mut(port as usize) {
                        runtime.tunneled = tunneled;
                    }
                }
                Message::Shutdown => break,
            }
        }
        debug!(component = %self.name, "Loopback worker stopped");
    }

    fn event(&self, event: Event) {
        self.callbacks.event(event);
    }

    fn error(&self, error: ComponentError, port: Option<u32>) {
        self.event(Event::Error { error, port });
    }

    fn complete(&self, completion: Completion) {
        self.event(Event::CmdComplete(completion));
    }

    fn command(&mut self, command: Command) {
        trace!(component = %self.name, ?command, "Command");
        match command {
            Command::StateSet(target) => self.set_state(target),
            Command::Flush(PortSelector::All) => {
                for port in 0..self.ports.len() as u32 {
                    self.return_held(port);
                    self.complete(Completion::Flush(port));
                }
            }
            Command::Flush(PortSelector::Port(port)) => {
                self.return_held(port);
                self.complete(Completion::Flush(port));
            }
            Command::PortDisable(port) => {
                self.return_held(port);
                if let Some(runtime) = self.ports.get_mut(port as usize) {
                    runtime.enabled = false;
                }
                self.complete(Completion::PortDisable(port));
                self.check_population();
            }
            Command::PortEnable(port) => {
                if let Some(runtime) = self.ports.get_mut(port as usize) {
                    runtime.enabled = true;
                }
                self.complete(Completion::PortEnable(port));
                self.process();
            }
        }
    }

    fn set_state(&mut self, target: State) {
        if target == self.state {
            self.error(ComponentError::SameState, None);
            return;
        }
        if self.state == State::FatalError || !self.state.can_transition_to(target) {
            self.error(ComponentError::IncorrectStateTransition, None);
            return;
        }
        if self.options.fail_transition == Some(target) {
            warn!(component = %self.name, ?target, "Injected transition failure");
            self.error(ComponentError::IncorrectStateTransition, None);
            return;
        }
        if self.options.fatal_transition == Some(target) {
            warn!(component = %self.name, ?target, "Injected fatal error");
            self.state = State::FatalError;
            self.error(ComponentError::Hardware, None);
            return;
        }

        match (self.state, target) {
            (State::Loaded, State::Idle) | (State::Idle, State::Loaded) => {
                self.pending = Some(target);
                self.check_population();
            }
            (State::Executing | State::Pause, State::Idle) => {
                for port in 0..self.ports.len() as u32 {
                    self.return_held(port);
                }
                self.state = State::Idle;
                self.complete(Completion::StateSet(State::Idle));
            }
            _ => {
                self.state = target;
                self.complete(Completion::StateSet(target));
                self.process();
            }
        }
    }

    fn check_population(&mut self) {
        let done = match self.pending {
            Some(State::Idle) => self
                .ports
                .iter()
                .filter(|port| port.needs_buffers())
                .all(|port| port.allocated >= port.definition.buffer_count),
            Some(State::Loaded) => self
                .ports
                .iter()
                .filter(|port| port.needs_buffers())
                .all(|port| port.allocated == 0),
            _ => false,
        };
        if let (true, Some(target)) = (done, self.pending) {
            self.pending = None;
            self.state = target;
            self.complete(Completion::StateSet(target));
        }
    }

    /// Hands every buffer held for `port` back to the client.
    fn return_held(&mut self, port: u32) {
        match self.ports.get(port as usize).map(|p| p.definition.direction) {
            Some(Direction::Input) => {
                for input in std::mem::take(&mut self.inputs) {
                    if let Input::Buffer(mut buffer) = input {
                        buffer.filled_len = 0;
                        self.callbacks.empty_buffer_done(buffer);
                    }
                }
            }
            Some(Direction::Output) => {
                for mut buffer in std::mem::take(&mut self.outputs) {
                    buffer.filled_len = 0;
                    self.callbacks.fill_buffer_done(buffer);
                }
            }
            None => self.error(ComponentError::BadParameter, Some(port)),
        }
    }

    fn output_port(&self) -> Option<&PortRuntime> {
        self.ports
            .iter()
            .find(|port| port.definition.direction == Direction::Output)
    }

    fn process(&mut self) {
        if self.state != State::Executing {
            return;
        }
        loop {
            let Some(front) = self.inputs.front() else {
                return;
            };
            let (data, flags, timestamp) = match front {
                Input::Buffer(buffer) => (buffer.payload().to_vec(), buffer.flags, buffer.timestamp),
                Input::Tunnel {
                    data,
                    flags,
                    timestamp,
                } => (data.clone(), *flags, *timestamp),
            };

            match self.output_port().map(|port| (port.definition.index, port.enabled)) {
                None => {
                    trace!(component = %self.name, len = data.len(), "Consumed");
                    self.consume_front();
                    if flags.contains(BufferFlags::EOS) {
                        self.event(Event::BufferFlag { port: 0, flags });
                    }
                }
                Some((out_port, _)) if self.tunnel_out.is_some() => {
                    if let Some(target) = &self.tunnel_out {
                        let sent = target.sender.send(Message::TunnelData {
                            port: target.port,
                            data,
                            flags,
                            timestamp,
                        });
                        if sent.is_err() {
                            warn!(component = %self.name, "Tunnel peer has stopped");
                        }
                    }
                    self.consume_front();
                    if flags.contains(BufferFlags::EOS) {
                        self.event(Event::BufferFlag {
                            port: out_port,
                            flags,
                        });
                    }
                }
                Some((_, false)) => return,
                Some((out_port, true)) => {
                    let Some(mut output) = self.outputs.pop_front() else {
                        return;
                    };
                    if output.data.len() < data.len() {
                        output.data.resize(data.len(), 0);
                    }
                    output.data[..data.len()].copy_from_slice(&data);
                    output.offset = 0;
                    output.filled_len = data.len();
                    output.flags = flags;
                    output.timestamp = timestamp;
                    self.consume_front();
                    self.callbacks.fill_buffer_done(output);
                    if flags.contains(BufferFlags::EOS) {
                        self.event(Event::BufferFlag {
                            port: out_port,
                            flags,
                        });
                    }
                }
            }
        }
    }

    /// Drops the front input, handing its buffer back to the client.
    fn consume_front(&mut self) {
        if let Some(Input::Buffer(mut buffer)) = self.inputs.pop_front() {
            buffer.filled_len = 0;
            buffer.flags = BufferFlags::empty();
            self.callbacks.empty_buffer_done(buffer);
        }
    }
}
