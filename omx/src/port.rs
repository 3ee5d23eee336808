// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Component ports and their buffer slots.
//!
//! A [`Port`] owns the bookkeeping for the buffer slots of one directional
//! endpoint of a component. Pipeline threads claim buffers with
//! [`Port::request_buffer`] and hand them back with [`Port::release_buffer`];
//! the component's callback thread returns them into the ready queue.
//!
//! Every slot is in exactly one [`SlotState`] at a time. The header itself is
//! an owned value, so whichever side holds it is the only one that can touch
//! the payload.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::component::{
    BufferHeader, Command, Component, Direction, PortDefinition, PortSelector,
};
use crate::core::{Core, CoreShared};
use crate::sem::Semaphore;
use crate::{Error, Result};

/// Ownership state of a buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Allocated and parked in the port, not handed to anybody.
    Free,
    /// In the ready queue, waiting for a pipeline thread to claim it.
    Queued,
    /// Claimed by a pipeline thread through [`Port::request_buffer`].
    WithPipeline,
    /// Handed to the component, not yet returned.
    WithCodec,
}

#[derive(Debug, Default)]
struct SlotTable {
    states: Vec<SlotState>,
    parked: Vec<BufferHeader>,
    ready: VecDeque<BufferHeader>,
    flushing: bool,
    done: bool,
}

#[derive(Debug, Default)]
struct PendingCommands {
    state: usize,
    flush: usize,
}

pub(crate) struct PortShared {
    index: u32,
    direction: Direction,
    buffer_count: usize,
    buffer_size: usize,
    core_id: Uuid,
    core: Weak<CoreShared>,
    slots: Mutex<SlotTable>,
    ready: Condvar,
    enabled: AtomicBool,
    tunneled: AtomicBool,
    linked: AtomicBool,
    partner: Mutex<Weak<PortShared>>,
    /// Held across an enable or disable, from the command until its completion.
    command: Mutex<()>,
    pending: Mutex<PendingCommands>,
    state_sem: Semaphore,
    flush_sem: Semaphore,
}

/// A directional buffer-exchange endpoint of a component.
///
/// Ports are created by [`Core::init`] from the component's port definitions
/// and are cheap to clone; clones refer to the same port.
#[derive(Clone)]
pub struct Port {
    shared: Arc<PortShared>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("index", &self.shared.index)
            .field("direction", &self.shared.direction)
            .field("enabled", &self.is_enabled())
            .field("tunneled", &self.is_tunneled())
            .field("linked", &self.is_linked())
            .finish()
    }
}

impl Port {
    /// Creates the port described by `definition`.
    ///
    /// The streaming queue starts out flushing; it opens when the core starts
    /// or the port is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the component reports zero slots or a
    /// zero slot size.
    pub(crate) fn new(
        definition: &PortDefinition,
        core_id: Uuid,
        core: Weak<CoreShared>,
    ) -> Result<Self> {
        if definition.buffer_count == 0 || definition.buffer_size == 0 {
            return Err(Error::Allocation(format!(
                "port {} reports {} buffers of {} bytes",
                definition.index, definition.buffer_count, definition.buffer_size
            )));
        }
        debug!(
            core = %core_id,
            port = definition.index,
            direction = ?definition.direction,
            buffers = definition.buffer_count,
            size = definition.buffer_size,
            "Setting up port"
        );
        Ok(Self {
            shared: Arc::new(PortShared {
                index: definition.index,
                direction: definition.direction,
                buffer_count: definition.buffer_count,
                buffer_size: definition.buffer_size,
                core_id,
                core,
                slots: Mutex::new(SlotTable {
                    flushing: true,
                    ..SlotTable::default()
                }),
                ready: Condvar::new(),
                enabled: AtomicBool::new(definition.enabled),
                tunneled: AtomicBool::new(false),
                linked: AtomicBool::new(false),
                partner: Mutex::new(Weak::new()),
                command: Mutex::new(()),
                pending: Mutex::new(PendingCommands::default()),
                state_sem: Semaphore::new(),
                flush_sem: Semaphore::new(),
            }),
        })
    }

    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Number of buffer slots the component asked for.
    pub fn slot_count(&self) -> usize {
        self.shared.buffer_count
    }

    /// Byte size of each slot.
    pub fn slot_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Number of slots currently allocated.
    pub fn allocated(&self) -> usize {
        self.slots().states.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn is_tunneled(&self) -> bool {
        self.shared.tunneled.load(Ordering::SeqCst)
    }

    pub fn is_linked(&self) -> bool {
        self.shared.linked.load(Ordering::SeqCst)
    }

    pub fn set_linked(&self, linked: bool) {
        self.shared.linked.store(linked, Ordering::SeqCst);
    }

    /// The core this port belongs to, if it is still alive.
    pub fn core(&self) -> Option<Core> {
        self.shared.core.upgrade().map(Core::from_shared)
    }

    /// Returns `true` if both handles refer to the same port.
    pub fn same_port(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of buffers waiting in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.slots().ready.len()
    }

    /// Ownership state of a slot, or `None` if the slot is not allocated.
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots().states.get(slot).copied()
    }

    pub fn is_done(&self) -> bool {
        self.slots().done
    }

    pub fn is_flushing(&self) -> bool {
        self.slots().flushing
    }

    fn slots(&self) -> MutexGuard<'_, SlotTable> {
        // Slot states are updated in single assignments, a poisoned table is
        // still consistent.
        self.shared
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn command_lock(&self) -> MutexGuard<'_, ()> {
        self.shared
            .command
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, PendingCommands> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn core_shared(&self) -> Result<Arc<CoreShared>> {
        self.shared
            .core
            .upgrade()
            .ok_or_else(|| Error::InvalidState("core has been dropped".to_string()))
    }

    /// Blocks until a buffer is ready and claims it for the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Flushing`] if the port is done, disabled or flushing,
    /// now or while waiting. Callers treat this as "stop streaming".
    pub fn request_buffer(&self) -> Result<BufferHeader> {
        let mut slots = self.slots();
        loop {
            if slots.done || slots.flushing {
                trace!(core = %self.shared.core_id, port = self.index(), "Request while flushing");
                return Err(Error::Flushing);
            }
            if let Some(buffer) = slots.ready.pop_front() {
                match slots.states.get_mut(buffer.slot) {
                    Some(state) if *state == SlotState::Queued => {
                        *state = SlotState::WithPipeline;
                        trace!(
                            core = %self.shared.core_id,
                            port = self.index(),
                            slot = buffer.slot,
                            "Buffer claimed"
                        );
                        return Ok(buffer);
                    }
                    other => {
                        error!(
                            core = %self.shared.core_id,
                            port = self.index(),
                            slot = buffer.slot,
                            state = ?other,
                            "Dropping queued buffer in unexpected state"
                        );
                        continue;
                    }
                }
            }
            slots = self
                .shared
                .ready
                .wait(slots)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Hands a claimed buffer back to the component.
    ///
    /// Input buffers are passed to the component to be emptied, output buffers
    /// to be filled. The caller must not keep a copy of the header around.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferProtocol`] if the slot was not claimed through
    ///   [`Port::request_buffer`]; the buffer is dropped and the slot table is
    ///   left untouched.
    /// - [`Error::Component`] if the component rejects the buffer; the error
    ///   is recorded on the core and the buffer goes back to the ready queue.
    pub fn release_buffer(&self, mut buffer: BufferHeader) -> Result<()> {
        let core = self.core_shared()?;
        let component = core.component()?;

        {
            let mut slots = self.slots();
            let state = slots.states.get(buffer.slot).copied();
            if buffer.port_index != self.index() || state != Some(SlotState::WithPipeline) {
                warn!(
                    core = %self.shared.core_id,
                    port = self.index(),
                    buffer_port = buffer.port_index,
                    slot = buffer.slot,
                    state = ?state,
                    "Release of a buffer that was not requested, dropping it"
                );
                return Err(Error::BufferProtocol(format!(
                    "release of slot {} on port {} in state {:?}",
                    buffer.slot,
                    self.index(),
                    state
                )));
            }
            slots.states[buffer.slot] = SlotState::WithCodec;
        }

        let slot = buffer.slot;
        let result = match self.direction() {
            Direction::Input => component.empty_this_buffer(buffer),
            Direction::Output => {
                buffer.reset();
                component.fill_this_buffer(buffer)
            }
        };

        match result {
            Ok(()) => {
                trace!(core = %self.shared.core_id, port = self.index(), slot, "Buffer released");
                Ok(())
            }
            Err(rejected) => {
                warn!(
                    core = %self.shared.core_id,
                    port = self.index(),
                    slot,
                    error = %rejected.error,
                    "Component rejected buffer"
                );
                core.record_error(rejected.error, Some(self.index()));
                self.enqueue(rejected.buffer);
                Err(Error::Component(rejected.error))
            }
        }
    }

    /// Enables the port on the component and waits for the completion.
    ///
    /// Does nothing if the port is already enabled. A concurrent enable or
    /// disable of the same port is waited for first. The port stays disabled
    /// if the command fails.
    pub fn enable(&self) -> Result<()> {
        let _command = self.command_lock();
        if self.is_enabled() {
            trace!(core = %self.shared.core_id, port = self.index(), "Port already enabled");
            return Ok(());
        }
        debug!(core = %self.shared.core_id, port = self.index(), "Enabling port");
        self.run_state_command(Command::PortEnable(self.index()))?;
        self.shared.enabled.store(true, Ordering::SeqCst);
        self.set_flushing(false);
        Ok(())
    }

    /// Disables the port on the component and waits for the completion.
    ///
    /// Blocked [`Port::request_buffer`] calls return [`Error::Flushing`]. Does
    /// nothing, and waits for nothing, if the port is already disabled. A
    /// concurrent enable or disable of the same port is waited for first. The
    /// port stays enabled, with its queue as before, if the command fails.
    pub fn disable(&self) -> Result<()> {
        let _command = self.command_lock();
        if !self.is_enabled() {
            trace!(core = %self.shared.core_id, port = self.index(), "Port already disabled");
            return Ok(());
        }
        debug!(core = %self.shared.core_id, port = self.index(), "Disabling port");
        let was_flushing = std::mem::replace(&mut self.slots().flushing, true);
        self.shared.ready.notify_all();
        if let Err(e) = self.run_state_command(Command::PortDisable(self.index())) {
            warn!(core = %self.shared.core_id, port = self.index(), "Disabling port failed: {}", e);
            self.set_flushing(was_flushing);
            return Err(e);
        }
        self.shared.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn run_state_command(&self, command: Command) -> Result<()> {
        let core = self.core_shared()?;
        let mark = core.error_mark();
        self.pending().state += 1;
        if let Err(e) = core.send_command(command) {
            self.pending().state -= 1;
            return Err(e);
        }
        self.shared.state_sem.down()?;
        match core.error_since(mark) {
            Some(error) => Err(Error::Component(error)),
            None => Ok(()),
        }
    }

    /// Flushes the port on the component and waits for the completion.
    pub(crate) fn flush(&self) -> Result<()> {
        let core = self.core_shared()?;
        let mark = core.error_mark();
        self.expect_flush();
        if let Err(e) = core.send_command(Command::Flush(PortSelector::Port(self.index()))) {
            self.abandon_flush();
            return Err(e);
        }
        self.wait_flush(&core, mark)
    }

    pub(crate) fn expect_flush(&self) {
        self.pending().flush += 1;
    }

    /// Forgets a flush that was expected but never issued.
    pub(crate) fn abandon_flush(&self) {
        let mut pending = self.pending();
        pending.flush = pending.flush.saturating_sub(1);
    }

    pub(crate) fn wait_flush(&self, core: &CoreShared, mark: u64) -> Result<()> {
        self.shared.flush_sem.down()?;
        match core.error_since(mark) {
            Some(error) => Err(Error::Component(error)),
            None => Ok(()),
        }
    }

    /// Sets the terminal flag. Every current and future
    /// [`Port::request_buffer`] returns [`Error::Flushing`].
    pub fn mark_done(&self) {
        let mut slots = self.slots();
        slots.done = true;
        self.shared.ready.notify_all();
    }

    /// Opens or closes the streaming queue without talking to the component.
    pub fn set_flushing(&self, flushing: bool) {
        let mut slots = self.slots();
        slots.flushing = flushing;
        if flushing {
            self.shared.ready.notify_all();
        }
    }

    /// Clears the done and flushing flags before a new streaming run.
    pub(crate) fn reset_streaming(&self) {
        let mut slots = self.slots();
        slots.done = false;
        slots.flushing = false;
    }

    /// Puts a buffer returned by the component into the ready queue.
    pub(crate) fn buffer_returned(&self, buffer: BufferHeader) {
        let mut slots = self.slots();
        match slots.states.get(buffer.slot).copied() {
            Some(SlotState::WithCodec) => {}
            other => {
                error!(
                    core = %self.shared.core_id,
                    port = self.index(),
                    slot = buffer.slot,
                    state = ?other,
                    "Component returned a buffer it did not own, dropping it"
                );
                return;
            }
        }
        slots.states[buffer.slot] = SlotState::Queued;
        slots.ready.push_back(buffer);
        self.shared.ready.notify_one();
    }

    fn enqueue(&self, buffer: BufferHeader) {
        let mut slots = self.slots();
        if let Some(state) = slots.states.get_mut(buffer.slot) {
            *state = SlotState::Queued;
            slots.ready.push_back(buffer);
            self.shared.ready.notify_one();
        }
    }

    /// Allocates every slot on the component. Slots start out [`SlotState::Free`].
    pub(crate) fn allocate(&self, component: &dyn Component) -> Result<()> {
        let mut slots = self.slots();
        if !slots.states.is_empty() {
            return Ok(());
        }
        for slot in 0..self.slot_count() {
            let buffer = component
                .allocate_buffer(self.index(), slot, self.slot_size())
                .map_err(|e| {
                    Error::Allocation(format!("port {} slot {}: {}", self.index(), slot, e))
                })?;
            slots.states.push(SlotState::Free);
            slots.parked.push(buffer);
        }
        debug!(
            core = %self.shared.core_id,
            port = self.index(),
            count = slots.states.len(),
            "Buffers allocated"
        );
        Ok(())
    }

    /// Frees every slot the port currently holds.
    ///
    /// Slots still owned by the component or a pipeline thread cannot be
    /// freed here; they are logged and forgotten.
    pub(crate) fn free_all(&self, component: &dyn Component) -> Result<()> {
        let buffers: Vec<BufferHeader> = {
            let mut slots = self.slots();
            let outstanding = slots
                .states
                .iter()
                .filter(|s| matches!(s, SlotState::WithCodec | SlotState::WithPipeline))
                .count();
            if outstanding > 0 {
                warn!(
                    core = %self.shared.core_id,
                    port = self.index(),
                    outstanding,
                    "Freeing port with buffers still in flight"
                );
            }
            slots.states.clear();
            let mut buffers: Vec<BufferHeader> = slots.parked.drain(..).collect();
            buffers.extend(slots.ready.drain(..));
            buffers
        };
        if buffers.is_empty() {
            return Ok(());
        }
        debug!(
            core = %self.shared.core_id,
            port = self.index(),
            count = buffers.len(),
            "Freeing buffers"
        );
        let mut result = Ok(());
        for buffer in buffers {
            if let Err(e) = component.free_buffer(buffer) {
                error!(core = %self.shared.core_id, port = self.index(), "Failed to free buffer: {}", e);
                result = Err(e);
            }
        }
        result
    }

    /// Distributes all slots held by the port for a streaming run: input
    /// slots go to the ready queue, output slots to the component to be
    /// filled.
    pub(crate) fn hand_out(&self, component: &dyn Component) -> Result<()> {
        let buffers: Vec<BufferHeader> = {
            let mut slots = self.slots();
            let mut buffers: Vec<BufferHeader> = slots.parked.drain(..).collect();
            buffers.extend(slots.ready.drain(..));
            buffers.sort_by_key(|b| b.slot);
            match self.direction() {
                Direction::Input => {
                    for mut buffer in buffers {
                        buffer.reset();
                        slots.states[buffer.slot] = SlotState::Queued;
                        slots.ready.push_back(buffer);
                    }
                    self.shared.ready.notify_all();
                    return Ok(());
                }
                Direction::Output => {
                    for buffer in &buffers {
                        slots.states[buffer.slot] = SlotState::WithCodec;
                    }
                    buffers
                }
            }
        };
        for mut buffer in buffers {
            buffer.reset();
            if let Err(rejected) = component.fill_this_buffer(buffer) {
                warn!(
                    core = %self.shared.core_id,
                    port = self.index(),
                    error = %rejected.error,
                    "Component rejected output buffer"
                );
                self.enqueue(rejected.buffer);
            }
        }
        Ok(())
    }

    /// Consumes one pending enable/disable completion.
    pub(crate) fn complete_state_command(&self) {
        let mut pending = self.pending();
        if pending.state == 0 {
            warn!(core = %self.shared.core_id, port = self.index(), "Unexpected port state completion");
            return;
        }
        pending.state -= 1;
        self.shared.state_sem.up();
    }

    /// Consumes one pending flush completion.
    pub(crate) fn complete_flush(&self) {
        let mut pending = self.pending();
        if pending.flush == 0 {
            warn!(core = %self.shared.core_id, port = self.index(), "Unexpected flush completion");
            return;
        }
        pending.flush -= 1;
        self.shared.flush_sem.up();
    }

    /// Releases every waiter of a pending command after an error.
    pub(crate) fn fail_pending(&self) {
        let mut pending = self.pending();
        for _ in 0..pending.state {
            self.shared.state_sem.up();
        }
        for _ in 0..pending.flush {
            self.shared.flush_sem.up();
        }
        *pending = PendingCommands::default();
    }

    /// Wakes every thread blocked on this port, for good.
    pub(crate) fn tear_down(&self) {
        self.mark_done();
        self.shared.state_sem.tear_down();
        self.shared.flush_sem.tear_down();
    }

    /// Marks the port tunneled, unless it already is. Returns `true` for the
    /// caller that won the claim.
    pub(crate) fn claim_tunnel(&self) -> bool {
        self.shared
            .tunneled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn set_tunnel_partner(&self, partner: &Port) {
        self.shared.tunneled.store(true, Ordering::SeqCst);
        self.shared.linked.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.shared.partner.lock() {
            *slot = Arc::downgrade(&partner.shared);
        }
    }

    pub(crate) fn tunnel_partner(&self) -> Option<Port> {
        self.shared
            .partner
            .lock()
            .ok()
            .and_then(|partner| partner.upgrade())
            .map(|shared| Port { shared })
    }

    pub(crate) fn clear_tunnel(&self) {
        self.shared.tunneled.store(false, Ordering::SeqCst);
        self.shared.linked.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.shared.partner.lock() {
            *slot = Weak::new();
        }
    }
}
