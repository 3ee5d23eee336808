// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The vendor component interface.
//!
//! A codec component is an external service driven through commands that
//! complete asynchronously via an event callback, plus per-port buffer
//! exchange. This module defines that boundary as traits, so the core can be
//! driven by any implementation: a hardware vendor's library wrapper, the
//! software [`crate::loopback`] component, or a scripted test double.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{debug, info};

use crate::{ComponentError, Error, Result};

/// Vendor timestamps are expressed in ticks of this many per second.
pub const TICKS_PER_SECOND: i64 = 1_000_000;

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Loaded,
    Idle,
    Executing,
    Pause,
    /// Absorbing state entered after an unrecoverable component error.
    FatalError,
}

impl State {
    /// Returns `true` if the component accepts a change from `self` to `target`.
    pub fn can_transition_to(self, target: State) -> bool {
        use State::*;
        matches!(
            (self, target),
            (Loaded, Idle)
                | (Idle, Loaded)
                | (Idle, Executing)
                | (Idle, Pause)
                | (Executing, Pause)
                | (Executing, Idle)
                | (Pause, Executing)
                | (Pause, Idle)
        )
    }
}

/// Direction of a port, seen from the component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// Port selector for flush commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSelector {
    Port(u32),
    All,
}

/// Commands sent to a component. All of them complete asynchronously with
/// an [`Event::CmdComplete`] or an [`Event::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StateSet(State),
    Flush(PortSelector),
    PortDisable(u32),
    PortEnable(u32),
}

/// The command a [`Event::CmdComplete`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    StateSet(State),
    /// One completion per flushed port, even for [`PortSelector::All`].
    Flush(u32),
    PortDisable(u32),
    PortEnable(u32),
}

/// Events delivered on the component's callback thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CmdComplete(Completion),
    Error {
        error: ComponentError,
        port: Option<u32>,
    },
    BufferFlag {
        port: u32,
        flags: BufferFlags,
    },
    PortSettingsChanged {
        port: u32,
    },
}

bitflags! {
    /// Per-buffer flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Last buffer of the stream.
        const EOS = 0x0001;
        /// The buffer ends a frame.
        const END_OF_FRAME = 0x0010;
        /// Codec configuration data rather than media.
        const CODEC_CONFIG = 0x0080;
    }
}

/// Static description of a component port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDefinition {
    pub index: u32,
    pub direction: Direction,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub enabled: bool,
}

/// A buffer slot header.
///
/// Headers are owned values: whoever holds the header owns the slot. Handing
/// a header to the component (or getting it back from a callback) moves it,
/// so a slot cannot be written by both sides at once.
#[derive(PartialEq, Eq)]
pub struct BufferHeader {
    pub port_index: u32,
    /// Slot number within the port, stable for the lifetime of the allocation.
    pub slot: usize,
    pub data: Vec<u8>,
    pub offset: usize,
    pub filled_len: usize,
    pub flags: BufferFlags,
    /// Presentation time in [`TICKS_PER_SECOND`] units.
    pub timestamp: i64,
}

impl BufferHeader {
    /// Creates an empty header with `size` bytes of storage.
    pub fn new(port_index: u32, slot: usize, size: usize) -> Self {
        Self {
            port_index,
            slot,
            data: vec![0; size],
            offset: 0,
            filled_len: 0,
            flags: BufferFlags::empty(),
            timestamp: 0,
        }
    }

    /// Allocated size of the payload storage.
    pub fn alloc_len(&self) -> usize {
        self.data.len()
    }

    /// The filled part of the payload.
    pub fn payload(&self) -> &[u8] {
        let end = (self.offset + self.filled_len).min(self.data.len());
        &self.data[self.offset.min(end)..end]
    }

    /// Clears length, offset, flags and timestamp before the slot is reused.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.filled_len = 0;
        self.flags = BufferFlags::empty();
        self.timestamp = 0;
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("port_index", &self.port_index)
            .field("slot", &self.slot)
            .field("alloc_len", &self.data.len())
            .field("offset", &self.offset)
            .field("filled_len", &self.filled_len)
            .field("flags", &self.flags)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// A buffer the component refused to accept. The header goes back to the
/// caller so the slot is not lost.
#[derive(Debug)]
pub struct BufferRejected {
    pub error: ComponentError,
    pub buffer: BufferHeader,
}

/// Callbacks the component invokes from its own thread.
pub trait Callbacks: Send + Sync {
    fn event(&self, event: Event);

    /// An input buffer has been consumed and is handed back.
    fn empty_buffer_done(&self, buffer: BufferHeader);

    /// An output buffer has been filled and is handed back.
    fn fill_buffer_done(&self, buffer: BufferHeader);
}

/// A codec component instance.
pub trait Component: Send + Sync {
    /// Issues a command. Completion is reported through [`Callbacks::event`].
    fn send_command(&self, command: Command) -> Result<()>;

    fn port_count(&self) -> u32;

    fn port_definition(&self, index: u32) -> Result<PortDefinition>;

    fn allocate_buffer(&self, port_index: u32, slot: usize, size: usize) -> Result<BufferHeader>;

    fn free_buffer(&self, buffer: BufferHeader) -> Result<()>;

    /// Hands a filled input buffer to the component.
    fn empty_this_buffer(&self, buffer: BufferHeader)
    -> core::result::Result<(), BufferRejected>;

    /// Hands an empty output buffer to the component.
    fn fill_this_buffer(&self, buffer: BufferHeader) -> core::result::Result<(), BufferRejected>;

    /// Allows a [`Library`] to recover its concrete component type.
    fn as_any(&self) -> &dyn Any;
}

/// A vendor implementation library, able to create components and tunnel
/// them together.
pub trait Library: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> Result<()>;

    fn deinit(&self) -> Result<()>;

    fn get_handle(
        &self,
        component_name: &str,
        callbacks: Arc<dyn Callbacks>,
    ) -> Result<Arc<dyn Component>>;

    /// Connects `output`'s port directly to `input`'s port.
    fn setup_tunnel(
        &self,
        output: &dyn Component,
        out_port: u32,
        input: &dyn Component,
        in_port: u32,
    ) -> Result<()>;

    /// Removes a tunnel set up from `output`'s port.
    fn teardown_tunnel(&self, output: &dyn Component, out_port: u32) -> Result<()>;
}

/// A library shared between cores, initialised while it has clients.
pub struct LibraryHandle {
    library: Arc<dyn Library>,
    client_count: Mutex<usize>,
}

impl LibraryHandle {
    pub fn new(library: Arc<dyn Library>) -> Arc<Self> {
        Arc::new(Self {
            library,
            client_count: Mutex::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.library.name()
    }

    pub fn library(&self) -> &Arc<dyn Library> {
        &self.library
    }

    /// Registers a client, initialising the library for the first one.
    ///
    /// # Errors
    ///
    /// Propagates the library's initialisation error; the client is not
    /// counted in that case.
    pub fn acquire(&self) -> Result<()> {
        let mut count = self
            .client_count
            .lock()
            .map_err(|e| Error::Other(format!("library client count poisoned: {e}")))?;
        if *count == 0 {
            info!(library = self.name(), "Initialising implementation library");
            self.library.init()?;
        }
        *count += 1;
        Ok(())
    }

    /// Drops a client, deinitialising the library after the last one.
    pub fn release(&self) -> Result<()> {
        let mut count = self
            .client_count
            .lock()
            .map_err(|e| Error::Other(format!("library client count poisoned: {e}")))?;
        match *count {
            0 => Err(Error::InvalidState(format!(
                "library {} released without clients",
                self.name()
            ))),
            1 => {
                *count = 0;
                info!(library = self.name(), "Deinitialising implementation library");
                self.library.deinit()
            }
            _ => {
                *count -= 1;
                Ok(())
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.client_count.lock().map(|count| *count).unwrap_or(0)
    }
}

/// Name-to-library lookup used in place of dynamic loading.
#[derive(Default)]
pub struct LibraryRegistry {
    libraries: Mutex<HashMap<String, Arc<LibraryHandle>>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `library` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, library: Arc<dyn Library>) -> Result<()> {
        let name = name.into();
        debug!(%name, "Registering implementation library");
        self.libraries
            .lock()
            .map_err(|e| Error::Other(format!("library registry poisoned: {e}")))?
            .insert(name, LibraryHandle::new(library));
        Ok(())
    }

    /// Looks up a library by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LibraryNotFound`] if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<LibraryHandle>> {
        self.libraries
            .lock()
            .map_err(|e| Error::Other(format!("library registry poisoned: {e}")))?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::LibraryNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_graph_rejects_skipping_idle() {
        assert!(State::Loaded.can_transition_to(State::Idle));
        assert!(!State::Loaded.can_transition_to(State::Executing));
        assert!(!State::Executing.can_transition_to(State::Loaded));
        assert!(!State::FatalError.can_transition_to(State::Idle));
        assert!(!State::Idle.can_transition_to(State::Idle));
    }

    #[test]
    fn buffer_flags_compose() {
        let mut flags = BufferFlags::EOS | BufferFlags::END_OF_FRAME;
        assert!(flags.contains(BufferFlags::EOS));
        flags.remove(BufferFlags::EOS);
        assert!(!flags.contains(BufferFlags::EOS));
        assert!(flags.contains(BufferFlags::END_OF_FRAME));
    }

    #[test]
    fn payload_is_clamped_to_storage() {
        let mut header = BufferHeader::new(0, 0, 8);
        header.offset = 4;
        header.filled_len = 10;
        assert_eq!(header.payload().len(), 4);
    }
}
