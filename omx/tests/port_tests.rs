// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Port buffer exchange and the counted port-state protocol.
//!
//! Runs against a scripted component so every completion is under the
//! test's control.

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::{Mode, executing_core, filter_ports, scripted_core, sink_ports};
use omx::{BufferHeader, Command, Completion, ComponentError, Error, Event, SlotState};

/// Enabling and disabling each wait for their own completion.
#[test]
fn disable_and_enable_wait_for_their_completion() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());
    let output = core.output_port().unwrap();
    assert!(output.is_enabled());

    let responder = {
        let component = component.clone();
        thread::spawn(move || {
            component.wait_for_command(Command::PortDisable(1), 1);
            component.deliver(Event::CmdComplete(Completion::PortDisable(1)));
            component.wait_for_command(Command::PortEnable(1), 1);
            component.deliver(Event::CmdComplete(Completion::PortEnable(1)));
        })
    };

    output.disable().unwrap();
    assert!(!output.is_enabled());
    assert!(output.is_flushing());

    output.enable().unwrap();
    assert!(output.is_enabled());
    assert!(!output.is_flushing());
    responder.join().unwrap();
}

/// A second disable on an already disabled port issues no command and does
/// not wait for a completion that will never come.
#[test]
fn disable_is_issued_once() {
    let (core, component, _library) = scripted_core(Mode::Auto, filter_ports());
    let input = core.input_port().unwrap();

    input.disable().unwrap();
    input.disable().unwrap();
    assert_eq!(component.count_commands(Command::PortDisable(0)), 1);

    input.enable().unwrap();
    input.enable().unwrap();
    assert_eq!(component.count_commands(Command::PortEnable(0)), 1);
}

/// Completions on one port never release a waiter on the other.
#[test]
fn completions_stay_on_their_port() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());
    let input = core.input_port().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let result = input.disable();
        done_tx.send(()).unwrap();
        result
    });
    component.wait_for_command(Command::PortDisable(0), 1);

    // Belongs to port 1, which has nothing pending: logged and dropped.
    component.deliver(Event::CmdComplete(Completion::PortDisable(1)));
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

    component.deliver(Event::CmdComplete(Completion::PortDisable(0)));
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    waiter.join().unwrap().unwrap();
}

/// A disable racing one already in flight on the same port returns only
/// after the component has completed the first.
#[test]
fn concurrent_disable_waits_for_the_pending_one() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());
    let input = core.input_port().unwrap();

    let first = {
        let input = input.clone();
        thread::spawn(move || input.disable())
    };
    component.wait_for_command(Command::PortDisable(0), 1);

    let (done_tx, done_rx) = mpsc::channel();
    let second = {
        let input = input.clone();
        thread::spawn(move || {
            let result = input.disable();
            done_tx.send(()).unwrap();
            result
        })
    };
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(input.is_enabled());

    component.deliver(Event::CmdComplete(Completion::PortDisable(0)));
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    assert!(!input.is_enabled());
    assert_eq!(component.count_commands(Command::PortDisable(0)), 1);
}

/// A port command that fails leaves the port as it was.
#[test]
fn failed_port_command_keeps_previous_state() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());
    let input = core.input_port().unwrap();
    input.set_flushing(false);

    let disabling = {
        let input = input.clone();
        thread::spawn(move || input.disable())
    };
    component.wait_for_command(Command::PortDisable(0), 1);
    component.deliver(Event::Error {
        error: ComponentError::PortUnpopulated,
        port: Some(0),
    });
    assert!(matches!(
        disabling.join().unwrap(),
        Err(Error::Component(ComponentError::PortUnpopulated))
    ));
    assert!(input.is_enabled());
    assert!(!input.is_flushing());

    let disabling = {
        let input = input.clone();
        thread::spawn(move || input.disable())
    };
    component.wait_for_command(Command::PortDisable(0), 2);
    component.deliver(Event::CmdComplete(Completion::PortDisable(0)));
    disabling.join().unwrap().unwrap();
    assert!(!input.is_enabled());

    // Without a component the enable cannot be sent.
    core.deinit().unwrap();
    assert!(matches!(input.enable(), Err(Error::InvalidState(_))));
    assert!(!input.is_enabled());
    assert_eq!(component.count_commands(Command::PortEnable(0)), 0);
}

#[test]
fn request_release_round_trip() {
    let (core, component) = executing_core(sink_ports());
    let input = core.input_port().unwrap();
    assert_eq!(input.allocated(), 3);
    assert_eq!(input.ready_len(), 3);

    let mut buffer = input.request_buffer().unwrap();
    let slot = buffer.slot;
    assert_eq!(input.slot_state(slot), Some(SlotState::WithPipeline));
    assert_eq!(input.ready_len(), 2);

    buffer.data[..4].copy_from_slice(b"data");
    buffer.filled_len = 4;
    input.release_buffer(buffer).unwrap();
    assert_eq!(input.slot_state(slot), Some(SlotState::WithCodec));
    assert_eq!(component.held(), 1);

    let seen = component.return_buffer(|_| {});
    assert_eq!(seen.payload, b"data");
    assert_eq!(input.slot_state(slot), Some(SlotState::Queued));
    assert_eq!(input.ready_len(), 3);
}

/// The ready queue never holds more buffers than the port has slots.
#[test]
fn ready_queue_is_bounded_by_slot_count() {
    let (core, component) = executing_core(sink_ports());
    let input = core.input_port().unwrap();

    for _ in 0..10 {
        let buffer = input.request_buffer().unwrap();
        input.release_buffer(buffer).unwrap();
        component.return_all(0);
        assert!(input.ready_len() <= input.slot_count());
    }
    assert_eq!(input.ready_len(), input.slot_count());
}

#[test]
fn release_without_request_is_rejected() {
    let (core, component) = executing_core(sink_ports());
    let input = core.input_port().unwrap();

    let forged = BufferHeader::new(0, 0, 16);
    match input.release_buffer(forged) {
        Err(Error::BufferProtocol(_)) => {}
        other => panic!("expected a buffer protocol error, got {other:?}"),
    }
    assert_eq!(input.slot_state(0), Some(SlotState::Queued));
    assert_eq!(component.held(), 0);
}

/// A buffer returned twice by the component is dropped the second time.
#[test]
fn duplicate_return_is_dropped() {
    let (core, component) = executing_core(sink_ports());
    let input = core.input_port().unwrap();

    let buffer = input.request_buffer().unwrap();
    input.release_buffer(buffer).unwrap();
    let returned = component.return_buffer(|_| {});
    assert_eq!(input.ready_len(), 3);

    // The same slot handed back a second time.
    component.deliver_buffer(returned.replay(input.slot_size()));
    assert_eq!(input.ready_len(), 3);
}

#[test]
fn mark_done_unblocks_waiting_requester() {
    let (core, _component) = executing_core(sink_ports());
    let input = core.input_port().unwrap();

    let held: Vec<_> = (0..3).map(|_| input.request_buffer().unwrap()).collect();
    assert_eq!(input.ready_len(), 0);

    let blocked = {
        let input = input.clone();
        thread::spawn(move || input.request_buffer())
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!blocked.is_finished());

    input.mark_done();
    let result = blocked.join().unwrap();
    assert!(matches!(result, Err(Error::Flushing)));
    assert!(input.request_buffer().unwrap_err().is_flushing());
    drop(held);
}

#[test]
fn disabling_unblocks_waiting_requester() {
    let (core, _component) = executing_core(sink_ports());
    let input = core.input_port().unwrap();
    let _held: Vec<_> = (0..3).map(|_| input.request_buffer().unwrap()).collect();

    let blocked = {
        let input = input.clone();
        thread::spawn(move || input.request_buffer())
    };
    thread::sleep(Duration::from_millis(20));

    input.disable().unwrap();
    assert!(matches!(blocked.join().unwrap(), Err(Error::Flushing)));
}

/// Output buffers go straight to the component when streaming starts.
#[test]
fn output_slots_start_with_the_component() {
    let (core, component) = executing_core(filter_ports());
    let output = core.output_port().unwrap();
    assert_eq!(output.ready_len(), 0);
    assert_eq!(output.slot_state(0), Some(SlotState::WithCodec));
    assert_eq!(output.slot_state(1), Some(SlotState::WithCodec));
    assert_eq!(component.held(), 2);

    let filled = component.return_buffer(|buffer| {
        buffer.data[..3].copy_from_slice(b"out");
        buffer.filled_len = 3;
    });
    assert_eq!(filled.port_index, 1);

    let mut buffer = output.request_buffer().unwrap();
    assert_eq!(buffer.payload(), b"out");
    buffer.filled_len = 0;
    output.release_buffer(buffer).unwrap();
    assert_eq!(component.held(), 2);
}
