// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Component lifecycle and event routing.
//!
//! A [`Core`] owns one component instance, its ports and the semaphores that
//! turn the component's asynchronous completions into blocking calls. The
//! component's callback thread enters through [`CoreCallbacks`], which routes
//! each event to the waiter it completes.
//!
//! ```text
//!  pipeline thread                      component callback thread
//!  ───────────────                      ─────────────────────────
//!  change_state(Idle)
//!    send StateSet(Idle) ───────────►
//!    state_sem.down()  (blocks)
//!                                       event(CmdComplete(StateSet(Idle)))
//!                                         state = Idle
//!                      ◄─────────────────  state_sem.up()
//!    check last error
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::component::{
    BufferFlags, BufferHeader, Callbacks, Command, Completion, Component, Direction, Event,
    LibraryHandle, PortSelector, State,
};
use crate::config::CoreConfig;
use crate::port::Port;
use crate::sem::Semaphore;
use crate::{ComponentError, Error, Result};

/// Hook invoked on the callback thread for every event, after routing.
pub type EventHook = Arc<dyn Fn(&Event) + Send + Sync>;

/// Hook invoked on the callback thread when a port's settings change.
pub type SettingsChangedHook = Arc<dyn Fn(u32) + Send + Sync>;

struct CoreInner {
    state: State,
    pending: Option<State>,
    /// The waiter of the pending transition has already been woken.
    released: bool,
    last_error: Option<ComponentError>,
    error_serial: u64,
    done: bool,
    waiting_done: bool,
    library: Option<Arc<LibraryHandle>>,
    component: Option<Arc<dyn Component>>,
    ports: Vec<Port>,
}

pub(crate) struct CoreShared {
    id: Uuid,
    config: CoreConfig,
    inner: Mutex<CoreInner>,
    state_sem: Semaphore,
    done_sem: Semaphore,
    event_hook: Mutex<Option<EventHook>>,
    settings_hook: Mutex<Option<SettingsChangedHook>>,
}

impl CoreShared {
    fn lock(&self) -> MutexGuard<'_, CoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn component(&self) -> Result<Arc<dyn Component>> {
        self.lock()
            .component
            .clone()
            .ok_or_else(|| Error::InvalidState("core is not initialised".to_string()))
    }

    pub(crate) fn send_command(&self, command: Command) -> Result<()> {
        let component = self.component()?;
        trace!(core = %self.id, ?command, "Sending command");
        component.send_command(command)
    }

    /// Current error serial. Compare with [`CoreShared::error_since`] after a
    /// wait to learn whether an error arrived meanwhile.
    pub(crate) fn error_mark(&self) -> u64 {
        self.lock().error_serial
    }

    pub(crate) fn error_since(&self, mark: u64) -> Option<ComponentError> {
        let inner = self.lock();
        if inner.error_serial != mark {
            inner.last_error
        } else {
            None
        }
    }

    /// Stores an error. Fatal errors move the core to [`State::FatalError`].
    pub(crate) fn record_error(&self, error: ComponentError, port: Option<u32>) {
        let mut inner = self.lock();
        inner.last_error = Some(error);
        inner.error_serial += 1;
        if error.is_fatal() && inner.state != State::FatalError {
            error!(core = %self.id, %error, ?port, "Fatal component error");
            inner.state = State::FatalError;
        } else {
            warn!(core = %self.id, %error, ?port, "Component error");
        }
    }

    /// Marks the pending transition's waiter as woken. Returns `false` if
    /// there is no such waiter or it has been woken already.
    fn take_transition_waiter(&self) -> bool {
        let mut inner = self.lock();
        let wake = inner.pending.is_some() && !inner.released;
        if wake {
            inner.released = true;
        }
        wake
    }

    fn port(&self, index: u32) -> Option<Port> {
        self.lock()
            .ports
            .iter()
            .find(|port| port.index() == index)
            .cloned()
    }

    fn set_done(&self) {
        let mut inner = self.lock();
        if inner.done {
            return;
        }
        inner.done = true;
        drop(inner);
        debug!(core = %self.id, "Processing finished");
        self.done_sem.up();
    }

    fn dispatch(&self, event: Event) {
        trace!(core = %self.id, ?event, "Event");
        match event {
            Event::CmdComplete(Completion::StateSet(state)) => {
                let mut inner = self.lock();
                if inner.state == State::FatalError {
                    warn!(core = %self.id, ?state, "State change after fatal error ignored");
                } else if inner.pending == Some(state) && !inner.released {
                    inner.state = state;
                    inner.released = true;
                    drop(inner);
                    debug!(core = %self.id, ?state, "State changed");
                    self.state_sem.up();
                } else {
                    warn!(
                        core = %self.id,
                        ?state,
                        pending = ?inner.pending,
                        "Unsolicited state change"
                    );
                    inner.state = state;
                }
            }
            Event::CmdComplete(Completion::PortEnable(index))
            | Event::CmdComplete(Completion::PortDisable(index)) => match self.port(index) {
                Some(port) => port.complete_state_command(),
                None => warn!(core = %self.id, port = index, "Completion for unknown port"),
            },
            Event::CmdComplete(Completion::Flush(index)) => match self.port(index) {
                Some(port) => port.complete_flush(),
                None => warn!(core = %self.id, port = index, "Flush completion for unknown port"),
            },
            Event::Error { error, port } => {
                self.record_error(error, port);
                if self.take_transition_waiter() {
                    self.state_sem.up();
                }
                let ports = self.lock().ports.clone();
                for p in ports
                    .iter()
                    .filter(|p| port.is_none_or(|index| index == p.index()))
                {
                    p.fail_pending();
                }
                // Any error ends a wait for end of stream.
                let release_done = {
                    let mut inner = self.lock();
                    let release = inner.waiting_done && !inner.done;
                    if release {
                        inner.waiting_done = false;
                    }
                    release
                };
                if release_done {
                    self.done_sem.up();
                }
            }
            Event::BufferFlag { port, flags } => {
                if flags.contains(BufferFlags::EOS) {
                    let (direction, has_output) = {
                        let inner = self.lock();
                        let direction = inner
                            .ports
                            .iter()
                            .find(|p| p.index() == port)
                            .map(|p| p.direction());
                        let has_output =
                            inner.ports.iter().any(|p| p.direction() == Direction::Output);
                        (direction, has_output)
                    };
                    match direction {
                        Some(Direction::Output) => self.set_done(),
                        Some(Direction::Input) if !has_output => self.set_done(),
                        Some(Direction::Input) => {
                            trace!(core = %self.id, port, "End of stream entered the component")
                        }
                        None => warn!(core = %self.id, port, "Buffer flag on unknown port"),
                    }
                }
            }
            Event::PortSettingsChanged { port } => {
                info!(core = %self.id, port, "Port settings changed");
                let hook = self
                    .settings_hook
                    .lock()
                    .ok()
                    .and_then(|hook| hook.clone());
                if let Some(hook) = hook {
                    hook(port);
                }
            }
        }

        let hook = self.event_hook.lock().ok().and_then(|hook| hook.clone());
        if let Some(hook) = hook {
            hook(&event);
        }
    }

    fn buffer_done(&self, buffer: BufferHeader) {
        match self.port(buffer.port_index) {
            Some(port) => port.buffer_returned(buffer),
            None => warn!(
                core = %self.id,
                port = buffer.port_index,
                "Buffer returned for unknown port, dropping it"
            ),
        }
    }
}

/// Entry point of the component's callback thread into a core.
///
/// Holds the core weakly, so a component that outlives its core only drops
/// late events.
pub(crate) struct CoreCallbacks {
    core: std::sync::Weak<CoreShared>,
}

impl Callbacks for CoreCallbacks {
    fn event(&self, event: Event) {
        if let Some(core) = self.core.upgrade() {
            core.dispatch(event);
        }
    }

    fn empty_buffer_done(&self, buffer: BufferHeader) {
        if let Some(core) = self.core.upgrade() {
            core.buffer_done(buffer);
        }
    }

    fn fill_buffer_done(&self, buffer: BufferHeader) {
        if let Some(core) = self.core.upgrade() {
            core.buffer_done(buffer);
        }
    }
}

/// One codec component instance and its lifecycle.
///
/// The core is created unloaded; [`Core::init`] acquires a component from an
/// implementation library and [`Core::deinit`] gives it back. The same core
/// can go through any number of such cycles.
///
/// All state-changing methods block the calling thread until the component
/// reports completion, so at most one transition is pending per core.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use omx::{Core, CoreConfig, LibraryHandle, loopback::LoopbackLibrary};
///
/// # fn main() -> Result<(), omx::Error> {
/// let library = LibraryHandle::new(Arc::new(LoopbackLibrary::new()));
/// let core = Core::new(CoreConfig::for_component("OMX.loopback.filter"));
///
/// core.init(library)?;
/// core.prepare()?; // Loaded -> Idle, buffers allocated
/// core.start()?; // Idle -> Executing, buffers handed out
///
/// let input = core.input_port().expect("filter has an input port");
/// let mut buffer = input.request_buffer()?;
/// buffer.data[..5].copy_from_slice(b"hello");
/// buffer.filled_len = 5;
/// input.release_buffer(buffer)?;
///
/// core.drain(&input)?; // send end of stream and wait for it on the output
/// core.stop()?;
/// core.unload()?;
/// core.deinit()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Core {
    shared: Arc<CoreShared>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("id", &self.shared.id)
            .field("component", &self.shared.config.component_name)
            .field("state", &self.state())
            .finish()
    }
}

impl Core {
    /// Creates an unloaded core.
    pub fn new(config: CoreConfig) -> Self {
        let id = Uuid::new_v4();
        debug!(core = %id, component = %config.component_name, "Creating core");
        Self {
            shared: Arc::new(CoreShared {
                id,
                config,
                inner: Mutex::new(CoreInner {
                    state: State::Loaded,
                    pending: None,
                    released: false,
                    last_error: None,
                    error_serial: 0,
                    done: false,
                    waiting_done: false,
                    library: None,
                    component: None,
                    ports: Vec::new(),
                }),
                state_sem: Semaphore::new(),
                done_sem: Semaphore::new(),
                event_hook: Mutex::new(None),
                settings_hook: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<CoreShared>) -> Self {
        Self { shared }
    }

    /// Identity used in log output.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    pub fn state(&self) -> State {
        self.shared.lock().state
    }

    /// The most recent error reported by the component, if any.
    pub fn last_error(&self) -> Option<ComponentError> {
        self.shared.lock().last_error
    }

    pub fn is_initialised(&self) -> bool {
        self.shared.lock().component.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().done
    }

    /// Returns `true` if both handles refer to the same core.
    pub fn same_core(&self, other: &Core) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn ports(&self) -> Vec<Port> {
        self.shared.lock().ports.clone()
    }

    pub fn port(&self, index: u32) -> Option<Port> {
        self.shared.port(index)
    }

    /// The first input port.
    pub fn input_port(&self) -> Option<Port> {
        self.port_with_direction(Direction::Input)
    }

    /// The first output port. Sinks have none.
    pub fn output_port(&self) -> Option<Port> {
        self.port_with_direction(Direction::Output)
    }

    fn port_with_direction(&self, direction: Direction) -> Option<Port> {
        self.shared
            .lock()
            .ports
            .iter()
            .find(|port| port.direction() == direction)
            .cloned()
    }

    pub(crate) fn component(&self) -> Result<Arc<dyn Component>> {
        self.shared.component()
    }

    pub(crate) fn library(&self) -> Result<Arc<LibraryHandle>> {
        self.shared
            .lock()
            .library
            .clone()
            .ok_or_else(|| Error::InvalidState("core is not initialised".to_string()))
    }

    /// Installs a hook called for every component event.
    pub fn set_event_hook(&self, hook: impl Fn(&Event) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.event_hook.lock() {
            *slot = Some(Arc::new(hook));
        }
    }

    /// Installs a hook called when the component reports new port settings.
    pub fn set_settings_changed_hook(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.settings_hook.lock() {
            *slot = Some(Arc::new(hook));
        }
    }

    /// Acquires a component from `library` and sets up its ports.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the core already holds a component.
    /// - Errors of the library's `init` and `get_handle`.
    /// - [`Error::Allocation`] if a port reports zero buffers or zero size.
    pub fn init(&self, library: Arc<LibraryHandle>) -> Result<()> {
        if self.is_initialised() {
            return Err(Error::InvalidState("core is already initialised".to_string()));
        }
        library.acquire()?;

        let callbacks = Arc::new(CoreCallbacks {
            core: Arc::downgrade(&self.shared),
        });
        let setup = library
            .library()
            .get_handle(&self.shared.config.component_name, callbacks)
            .and_then(|component| {
                let ports = (0..component.port_count())
                    .map(|index| {
                        let definition = component.port_definition(index)?;
                        Port::new(&definition, self.shared.id, Arc::downgrade(&self.shared))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((component, ports))
            });

        let (component, ports) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                if let Err(release_error) = library.release() {
                    error!(core = %self.shared.id, "Failed to release library: {}", release_error);
                }
                return Err(e);
            }
        };

        info!(
            core = %self.shared.id,
            component = %self.shared.config.component_name,
            library = library.name(),
            ports = ports.len(),
            "Component acquired"
        );

        self.shared.state_sem.reset();
        self.shared.done_sem.reset();
        let mut inner = self.shared.lock();
        inner.state = State::Loaded;
        inner.pending = None;
        inner.last_error = None;
        inner.done = false;
        inner.waiting_done = false;
        inner.library = Some(library);
        inner.component = Some(component);
        inner.ports = ports;
        Ok(())
    }

    /// Releases the component and the library client.
    ///
    /// Wakes every thread still blocked on the core. Does nothing if the core
    /// is not initialised.
    pub fn deinit(&self) -> Result<()> {
        let (library, component, state) = {
            let mut inner = self.shared.lock();
            let state = inner.state;
            inner.pending = None;
            inner.state = State::Loaded;
            (inner.library.take(), inner.component.take(), state)
        };
        let Some(component) = component else {
            return Ok(());
        };
        if !matches!(state, State::Loaded | State::FatalError) {
            warn!(core = %self.shared.id, ?state, "Releasing component that is not loaded");
        }
        self.shutdown();
        let ports = std::mem::take(&mut self.shared.lock().ports);
        drop(ports);
        drop(component);
        info!(core = %self.shared.id, "Component released");
        match library {
            Some(library) => library.release(),
            None => Ok(()),
        }
    }

    /// Wakes every blocked waiter of this core with a cancellation or a
    /// flushing result.
    pub fn shutdown(&self) {
        debug!(core = %self.shared.id, "Shutting down waiters");
        self.shared.state_sem.tear_down();
        self.shared.done_sem.tear_down();
        for port in self.ports() {
            port.tear_down();
        }
    }

    /// Requests a state change and blocks until the component completes it.
    ///
    /// # Errors
    ///
    /// - [`Error::Transition`] if the change is illegal from the current
    ///   state, the core is in [`State::FatalError`], or the component
    ///   reports an error before completing.
    /// - [`Error::InvalidState`] if the core is not initialised.
    /// - [`Error::Cancelled`] if the core is shut down while waiting.
    pub fn change_state(&self, target: State) -> Result<()> {
        let mark = self.request_transition(target)?;
        self.await_transition(target, mark)
    }

    fn request_transition(&self, target: State) -> Result<u64> {
        let (component, mark) = {
            let mut inner = self.shared.lock();
            if inner.state == State::FatalError {
                return Err(Error::Transition {
                    target,
                    reason: "component is in fatal error".to_string(),
                });
            }
            if let Some(pending) = inner.pending {
                return Err(Error::InvalidState(format!(
                    "transition to {pending:?} still pending"
                )));
            }
            if !inner.state.can_transition_to(target) {
                return Err(Error::Transition {
                    target,
                    reason: format!("illegal from {:?}", inner.state),
                });
            }
            let component = inner
                .component
                .clone()
                .ok_or_else(|| Error::InvalidState("core is not initialised".to_string()))?;
            inner.pending = Some(target);
            inner.released = false;
            (component, inner.error_serial)
        };

        info!(core = %self.shared.id, from = ?self.state(), to = ?target, "Changing state");
        if let Err(e) = component.send_command(Command::StateSet(target)) {
            self.shared.lock().pending = None;
            return Err(Error::Transition {
                target,
                reason: e.to_string(),
            });
        }
        Ok(mark)
    }

    fn await_transition(&self, target: State, mark: u64) -> Result<()> {
        let waited = self.shared.state_sem.down();
        let mut inner = self.shared.lock();
        inner.pending = None;
        waited?;
        if inner.error_serial != mark {
            let reason = inner
                .last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::Transition { target, reason });
        }
        if inner.state != target {
            return Err(Error::Transition {
                target,
                reason: format!("component reports {:?}", inner.state),
            });
        }
        Ok(())
    }

    /// Loaded → Idle, allocating buffers on every enabled, non-tunneled port
    /// while the transition is pending.
    pub fn prepare(&self) -> Result<()> {
        let mark = self.request_transition(State::Idle)?;
        let component = self.component()?;
        for port in self.ports() {
            if port.is_enabled() && !port.is_tunneled() {
                if let Err(e) = port.allocate(component.as_ref()) {
                    error!(core = %self.shared.id, port = port.index(), "Allocation failed: {}", e);
                    self.shared.lock().pending = None;
                    return Err(e);
                }
            }
        }
        self.await_transition(State::Idle, mark)
    }

    /// Idle → Executing, then hands input slots to the pipeline and output
    /// slots to the component.
    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.shared.lock();
            inner.done = false;
            inner.waiting_done = false;
        }
        self.shared.done_sem.reset();
        self.change_state(State::Executing)?;
        let component = self.component()?;
        for port in self.ports() {
            port.reset_streaming();
            if port.is_enabled() && !port.is_tunneled() {
                port.hand_out(component.as_ref())?;
            }
        }
        Ok(())
    }

    /// Executing → Pause, or Idle → Pause.
    pub fn pause(&self) -> Result<()> {
        self.change_state(State::Pause)
    }

    /// Pause → Executing.
    pub fn resume(&self) -> Result<()> {
        self.change_state(State::Executing)
    }

    /// Executing or Pause → Idle. The component returns every buffer it holds.
    pub fn stop(&self) -> Result<()> {
        match self.state() {
            State::Executing | State::Pause => self.change_state(State::Idle),
            _ => Ok(()),
        }
    }

    /// Idle → Loaded, freeing every buffer while the transition is pending.
    pub fn unload(&self) -> Result<()> {
        if self.state() != State::Idle {
            return Err(Error::Transition {
                target: State::Loaded,
                reason: format!("illegal from {:?}", self.state()),
            });
        }
        let mark = self.request_transition(State::Loaded)?;
        let component = self.component()?;
        for port in self.ports() {
            if let Err(e) = port.free_all(component.as_ref()) {
                warn!(core = %self.shared.id, port = port.index(), "Freeing failed: {}", e);
            }
        }
        self.await_transition(State::Loaded, mark)
    }

    /// Frees the buffers of one port, e.g. before it is tunneled.
    pub fn release_port_buffers(&self, port: &Port) -> Result<()> {
        let component = self.component()?;
        port.free_all(component.as_ref())
    }

    /// Flushes one port and waits for the component to return its buffers.
    pub fn flush_port(&self, port: &Port) -> Result<()> {
        debug!(core = %self.shared.id, port = port.index(), "Flushing port");
        port.flush()
    }

    /// Flushes every port, waiting once per port.
    pub fn flush_all(&self) -> Result<()> {
        let ports = self.ports();
        if ports.is_empty() {
            return Ok(());
        }
        debug!(core = %self.shared.id, "Flushing all ports");
        let mark = self.shared.error_mark();
        for port in &ports {
            port.expect_flush();
        }
        if let Err(e) = self.shared.send_command(Command::Flush(PortSelector::All)) {
            for port in &ports {
                port.abandon_flush();
            }
            return Err(e);
        }
        let mut result = Ok(());
        for port in &ports {
            if let Err(e) = port.wait_flush(&self.shared, mark) {
                result = Err(e);
            }
        }
        result
    }

    /// Signals that processing has finished. Idempotent.
    pub fn set_done(&self) {
        self.shared.set_done();
    }

    /// Blocks until processing has finished.
    ///
    /// Returns immediately if it already has.
    ///
    /// # Errors
    ///
    /// - [`Error::Component`] if a component error released the wait, or the
    ///   core was in [`State::FatalError`] already. Streaming may go on after
    ///   a non-fatal error; the caller decides whether to wait again.
    /// - [`Error::Cancelled`] if the core is shut down while waiting.
    pub fn wait_for_done(&self) -> Result<()> {
        {
            let mut inner = self.shared.lock();
            if inner.done {
                return Ok(());
            }
            if inner.state == State::FatalError {
                return Err(inner
                    .last_error
                    .map(Error::Component)
                    .unwrap_or(Error::Cancelled));
            }
            inner.waiting_done = true;
        }
        debug!(core = %self.shared.id, "Waiting for processing to finish");
        let waited = self.shared.done_sem.down();
        let mut inner = self.shared.lock();
        inner.waiting_done = false;
        waited?;
        if inner.done {
            Ok(())
        } else {
            Err(inner
                .last_error
                .map(Error::Component)
                .unwrap_or(Error::Cancelled))
        }
    }

    /// Sends an end-of-stream buffer into `input` and marks the port done.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Flushing`] if no input buffer can be obtained.
    pub fn send_eos(&self, input: &Port) -> Result<()> {
        let mut buffer = input.request_buffer()?;
        input.mark_done();
        buffer.offset = 0;
        buffer.filled_len = 0;
        buffer.flags.insert(BufferFlags::EOS);
        debug!(core = %self.shared.id, port = input.index(), "Sending end of stream");
        input.release_buffer(buffer)
    }

    /// Sends end of stream into `input` and waits until the component has
    /// reported it on the output side.
    pub fn drain(&self, input: &Port) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        self.send_eos(input)?;
        self.wait_for_done()
    }
}
