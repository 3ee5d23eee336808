// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Common utilities shared across integration tests.
//!
//! [`ScriptedComponent`] records every command and buffer it receives and
//! only reports completions when told to, so tests decide exactly which
//! event arrives when. In [`Mode::Auto`] it completes every command right
//! away, from its own thread, like a well-behaved component would;
//! [`Mode::Delayed`] does the same after a pause, like a slow one.

#![allow(dead_code)]

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use omx::{
    BufferFlags, BufferHeader, BufferRejected, Callbacks, Command, Completion, Component,
    ComponentError, Core, CoreConfig, Direction, Error, Event, Library, LibraryHandle,
    PortDefinition, PortSelector, Result,
};

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

/// Initializes a tracing subscriber with an INFO default, respecting `RUST_LOG`.
pub fn setup_logging() {
    LOG_ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Polls `condition` until it holds, panicking after five seconds.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The test delivers every event itself.
    Manual,
    /// Commands complete immediately on a helper thread.
    Auto,
    /// Commands complete on a helper thread after the given delay.
    Delayed(Duration),
}

/// What a component saw of a buffer it handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Returned {
    pub port_index: u32,
    pub slot: usize,
    pub flags: BufferFlags,
    pub payload: Vec<u8>,
}

impl Returned {
    fn of(buffer: &BufferHeader) -> Self {
        Self {
            port_index: buffer.port_index,
            slot: buffer.slot,
            flags: buffer.flags,
            payload: buffer.payload().to_vec(),
        }
    }

    /// A fresh header for the same slot, as a misbehaving component would
    /// return it a second time.
    pub fn replay(&self, size: usize) -> BufferHeader {
        BufferHeader::new(self.port_index, self.slot, size)
    }
}

pub fn filter_ports() -> Vec<PortDefinition> {
    vec![
        PortDefinition {
            index: 0,
            direction: Direction::Input,
            buffer_count: 2,
            buffer_size: 16,
            enabled: true,
        },
        PortDefinition {
            index: 1,
            direction: Direction::Output,
            buffer_count: 2,
            buffer_size: 16,
            enabled: true,
        },
    ]
}

pub fn sink_ports() -> Vec<PortDefinition> {
    vec![PortDefinition {
        index: 0,
        direction: Direction::Input,
        buffer_count: 3,
        buffer_size: 16,
        enabled: true,
    }]
}

/// A component whose behaviour is driven by the test.
pub struct ScriptedComponent {
    mode: Mode,
    ports: Vec<PortDefinition>,
    callbacks: Arc<dyn Callbacks>,
    commands: Mutex<Vec<Command>>,
    held: Mutex<VecDeque<BufferHeader>>,
    allocated: AtomicUsize,
    freed: AtomicUsize,
    disables_completed: AtomicUsize,
    this: Weak<ScriptedComponent>,
}

impl ScriptedComponent {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count_commands(&self, command: Command) -> usize {
        self.commands().iter().filter(|c| **c == command).count()
    }

    /// Blocks until `command` has been received `times` times.
    pub fn wait_for_command(&self, command: Command, times: usize) {
        wait_until(&format!("{command:?} x{times}"), || {
            self.count_commands(command) >= times
        });
    }

    /// Delivers an event as if from the component's own thread.
    pub fn deliver(&self, event: Event) {
        self.callbacks.event(event);
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    /// Hands the oldest held buffer back through the matching callback,
    /// optionally with new flags and payload length.
    pub fn return_buffer(&self, edit: impl FnOnce(&mut BufferHeader)) -> Returned {
        let mut buffer = self
            .held
            .lock()
            .unwrap()
            .pop_front()
            .expect("component holds no buffer");
        edit(&mut buffer);
        let returned = Returned::of(&buffer);
        match self.ports[buffer.port_index as usize].direction {
            Direction::Input => self.callbacks.empty_buffer_done(buffer),
            Direction::Output => self.callbacks.fill_buffer_done(buffer),
        }
        returned
    }

    /// Passes `buffer` to the done callback of its port, held or not.
    pub fn deliver_buffer(&self, buffer: BufferHeader) {
        match self.ports[buffer.port_index as usize].direction {
            Direction::Input => self.callbacks.empty_buffer_done(buffer),
            Direction::Output => self.callbacks.fill_buffer_done(buffer),
        }
    }

    /// Hands every held buffer of `port` back.
    pub fn return_all(&self, port: u32) {
        let buffers: Vec<BufferHeader> = {
            let mut held = self.held.lock().unwrap();
            let (returned, kept): (Vec<_>, Vec<_>) =
                held.drain(..).partition(|b| b.port_index == port);
            held.extend(kept);
            returned
        };
        for mut buffer in buffers {
            buffer.filled_len = 0;
            match self.ports[port as usize].direction {
                Direction::Input => self.callbacks.empty_buffer_done(buffer),
                Direction::Output => self.callbacks.fill_buffer_done(buffer),
            }
        }
    }

    /// Number of port-disable completions delivered so far.
    pub fn disables_completed(&self) -> usize {
        self.disables_completed.load(Ordering::SeqCst)
    }

    fn complete_later(self: &Arc<Self>, completions: Vec<Completion>, delay: Duration) {
        let component = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            for completion in completions {
                if matches!(completion, Completion::PortDisable(_)) {
                    component.disables_completed.fetch_add(1, Ordering::SeqCst);
                }
                component.callbacks.event(Event::CmdComplete(completion));
            }
        });
    }
}

impl Component for ScriptedComponent {
    fn send_command(&self, command: Command) -> Result<()> {
        self.commands.lock().unwrap().push(command);
        let delay = match self.mode {
            Mode::Manual => return Ok(()),
            Mode::Auto => Duration::ZERO,
            Mode::Delayed(delay) => delay,
        };
        let completions = match command {
            Command::StateSet(state) => vec![Completion::StateSet(state)],
            Command::Flush(PortSelector::Port(port)) => vec![Completion::Flush(port)],
            Command::Flush(PortSelector::All) => {
                self.ports.iter().map(|p| Completion::Flush(p.index)).collect()
            }
            Command::PortDisable(port) => vec![Completion::PortDisable(port)],
            Command::PortEnable(port) => vec![Completion::PortEnable(port)],
        };
        if let Some(this) = self.this.upgrade() {
            this.complete_later(completions, delay);
        }
        Ok(())
    }

    fn port_count(&self) -> u32 {
        self.ports.len() as u32
    }

    fn port_definition(&self, index: u32) -> Result<PortDefinition> {
        self.ports
            .get(index as usize)
            .cloned()
            .ok_or(Error::Component(ComponentError::BadParameter))
    }

    fn allocate_buffer(&self, port_index: u32, slot: usize, size: usize) -> Result<BufferHeader> {
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(BufferHeader::new(port_index, slot, size))
    }

    fn free_buffer(&self, _buffer: BufferHeader) -> Result<()> {
        self.freed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn empty_this_buffer(
        &self,
        buffer: BufferHeader,
    ) -> std::result::Result<(), BufferRejected> {
        self.held.lock().unwrap().push_back(buffer);
        Ok(())
    }

    fn fill_this_buffer(&self, buffer: BufferHeader) -> std::result::Result<(), BufferRejected> {
        self.held.lock().unwrap().push_back(buffer);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A library handing out [`ScriptedComponent`]s.
pub struct ScriptedLibrary {
    mode: Mode,
    ports: Vec<PortDefinition>,
    created: Mutex<Vec<Arc<ScriptedComponent>>>,
    tunnels: AtomicUsize,
    /// Port-disable completions delivered, across all components, at each
    /// connect call.
    disables_at_connect: Mutex<Vec<usize>>,
}

impl ScriptedLibrary {
    pub fn new(mode: Mode, ports: Vec<PortDefinition>) -> Arc<Self> {
        Arc::new(Self {
            mode,
            ports,
            created: Mutex::new(Vec::new()),
            tunnels: AtomicUsize::new(0),
            disables_at_connect: Mutex::new(Vec::new()),
        })
    }

    /// The most recently created component.
    pub fn last(&self) -> Arc<ScriptedComponent> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no component created")
    }

    pub fn components(&self) -> Vec<Arc<ScriptedComponent>> {
        self.created.lock().unwrap().clone()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    pub fn disables_at_connect(&self) -> Vec<usize> {
        self.disables_at_connect.lock().unwrap().clone()
    }
}

impl Library for ScriptedLibrary {
    fn name(&self) -> &str {
        "scripted"
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn get_handle(
        &self,
        _component_name: &str,
        callbacks: Arc<dyn Callbacks>,
    ) -> Result<Arc<dyn Component>> {
        let component = Arc::new_cyclic(|this| ScriptedComponent {
            mode: self.mode,
            ports: self.ports.clone(),
            callbacks,
            commands: Mutex::new(Vec::new()),
            held: Mutex::new(VecDeque::new()),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            disables_completed: AtomicUsize::new(0),
            this: this.clone(),
        });
        self.created.lock().unwrap().push(component.clone());
        Ok(component)
    }

    fn setup_tunnel(
        &self,
        _output: &dyn Component,
        _out_port: u32,
        _input: &dyn Component,
        _in_port: u32,
    ) -> Result<()> {
        let disables = self
            .components()
            .iter()
            .map(|component| component.disables_completed())
            .sum();
        self.disables_at_connect.lock().unwrap().push(disables);
        // Widen the window in which a second connect could sneak in.
        thread::sleep(Duration::from_millis(5));
        self.tunnels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn teardown_tunnel(&self, _output: &dyn Component, _out_port: u32) -> Result<()> {
        Ok(())
    }
}

/// Creates an initialised core backed by a fresh scripted component.
pub fn scripted_core(
    mode: Mode,
    ports: Vec<PortDefinition>,
) -> (Core, Arc<ScriptedComponent>, Arc<ScriptedLibrary>) {
    setup_logging();
    let library = ScriptedLibrary::new(mode, ports);
    let core = Core::new(CoreConfig::for_component("OMX.scripted"));
    core.init(LibraryHandle::new(library.clone()))
        .expect("init scripted core");
    let component = library.last();
    (core, component, library)
}

/// Brings an auto-completing core to Executing with all buffers handed out.
pub fn executing_core(ports: Vec<PortDefinition>) -> (Core, Arc<ScriptedComponent>) {
    let (core, component, _library) = scripted_core(Mode::Auto, ports);
    core.prepare().expect("prepare");
    core.start().expect("start");
    (core, component)
}
