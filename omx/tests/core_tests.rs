// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Core state machine and event routing.
//!
//! # Test Coverage
//!
//! - Blocking state transitions completed from the callback thread
//! - Errors releasing a pending transition without hanging or double-waking
//! - End-of-stream detection on the output side, exactly once
//! - Fatal errors refusing further transitions
//! - Any error releasing a thread waiting for end of stream
//! - Port setup refusing components that report empty ports
//! - Reuse of one core across several init/deinit cycles

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{
    Mode, ScriptedLibrary, executing_core, filter_ports, scripted_core, setup_logging, sink_ports,
    wait_until,
};
use omx::{
    BufferFlags, Command, Completion, ComponentError, Core, CoreConfig, Error, Event,
    LibraryHandle, State,
};

#[test]
fn transition_completes_from_callback_thread() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());
    assert_eq!(core.state(), State::Loaded);

    let responder = {
        let component = component.clone();
        thread::spawn(move || {
            component.wait_for_command(Command::StateSet(State::Idle), 1);
            thread::sleep(Duration::from_millis(10));
            component.deliver(Event::CmdComplete(Completion::StateSet(State::Idle)));
        })
    };

    core.change_state(State::Idle).unwrap();
    assert_eq!(core.state(), State::Idle);
    responder.join().unwrap();
}

#[test]
fn illegal_transition_is_refused_without_a_command() {
    let (core, component, _library) = scripted_core(Mode::Auto, filter_ports());
    match core.change_state(State::Executing) {
        Err(Error::Transition { target, .. }) => assert_eq!(target, State::Executing),
        other => panic!("expected a transition error, got {other:?}"),
    }
    assert!(component.commands().is_empty());
}

/// An error in place of the completion fails the transition instead of
/// leaving the caller blocked. A late completion for the same transition
/// must not leave a token behind for the next one.
#[test]
fn failed_transition_does_not_hang_or_leak_a_wakeup() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());

    let responder = {
        let component = component.clone();
        thread::spawn(move || {
            component.wait_for_command(Command::StateSet(State::Idle), 1);
            component.deliver(Event::Error {
                error: ComponentError::Undefined,
                port: None,
            });
            component.deliver(Event::CmdComplete(Completion::StateSet(State::Idle)));
        })
    };

    let result = core.change_state(State::Idle);
    assert!(matches!(result, Err(Error::Transition { target: State::Idle, .. })));
    assert_eq!(core.last_error(), Some(ComponentError::Undefined));
    responder.join().unwrap();
    wait_until("late completion", || core.state() == State::Idle);

    // The next transition really waits for its own completion.
    let responder = {
        let component = component.clone();
        thread::spawn(move || {
            component.wait_for_command(Command::StateSet(State::Executing), 1);
            thread::sleep(Duration::from_millis(20));
            component.deliver(Event::CmdComplete(Completion::StateSet(State::Executing)));
        })
    };
    core.change_state(State::Executing).unwrap();
    assert_eq!(core.state(), State::Executing);
    responder.join().unwrap();
}

#[test]
fn port_error_fails_pending_port_command() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());
    let output = core.output_port().unwrap();

    let responder = {
        let component = component.clone();
        thread::spawn(move || {
            component.wait_for_command(Command::PortDisable(1), 1);
            component.deliver(Event::Error {
                error: ComponentError::PortUnpopulated,
                port: Some(1),
            });
        })
    };

    match output.disable() {
        Err(Error::Component(ComponentError::PortUnpopulated)) => {}
        other => panic!("expected the port error, got {other:?}"),
    }
    responder.join().unwrap();
    assert_eq!(core.state(), State::Loaded);
}

#[test]
fn prepare_allocates_and_unload_frees() {
    let (core, component, _library) = scripted_core(Mode::Auto, filter_ports());

    core.prepare().unwrap();
    assert_eq!(core.state(), State::Idle);
    assert_eq!(component.allocated(), 4);
    for port in core.ports() {
        assert_eq!(port.allocated(), port.slot_count());
    }

    core.unload().unwrap();
    assert_eq!(core.state(), State::Loaded);
    assert_eq!(component.freed(), 4);
    for port in core.ports() {
        assert_eq!(port.allocated(), 0);
    }
}

/// Only the end-of-stream flag on the output port finishes a filter, and
/// a repeated flag is ignored.
#[test]
fn eos_is_detected_on_the_output_side_once() {
    let (core, component) = executing_core(filter_ports());

    let waiter = {
        let core = core.clone();
        thread::spawn(move || core.wait_for_done())
    };

    component.deliver(Event::BufferFlag {
        port: 0,
        flags: BufferFlags::EOS,
    });
    thread::sleep(Duration::from_millis(20));
    assert!(!core.is_done());
    assert!(!waiter.is_finished());

    component.deliver(Event::BufferFlag {
        port: 1,
        flags: BufferFlags::EOS,
    });
    waiter.join().unwrap().unwrap();
    assert!(core.is_done());

    component.deliver(Event::BufferFlag {
        port: 1,
        flags: BufferFlags::EOS | BufferFlags::END_OF_FRAME,
    });
    core.wait_for_done().unwrap();
}

#[test]
fn sink_finishes_on_input_eos() {
    let (core, component) = executing_core(sink_ports());
    component.deliver(Event::BufferFlag {
        port: 0,
        flags: BufferFlags::EOS,
    });
    core.wait_for_done().unwrap();
}

#[test]
fn drain_sends_eos_and_waits() {
    let (core, component) = executing_core(filter_ports());
    let input = core.input_port().unwrap();

    let responder = {
        let component = component.clone();
        thread::spawn(move || {
            wait_until("eos buffer", || component.held() == 3);
            let eos = component.return_buffer(|_| {});
            assert_eq!(eos.port_index, 1);
            let eos = component.return_buffer(|_| {});
            assert_eq!(eos.port_index, 1);
            let eos = component.return_buffer(|_| {});
            assert!(eos.flags.contains(BufferFlags::EOS));
            component.deliver(Event::BufferFlag {
                port: 1,
                flags: BufferFlags::EOS,
            });
        })
    };

    core.drain(&input).unwrap();
    assert!(input.is_done());
    assert!(input.request_buffer().unwrap_err().is_flushing());
    responder.join().unwrap();
}

#[test]
fn fatal_error_refuses_transitions_and_releases_done_waiter() {
    let (core, component) = executing_core(filter_ports());

    let waiter = {
        let core = core.clone();
        thread::spawn(move || core.wait_for_done())
    };
    thread::sleep(Duration::from_millis(20));

    component.deliver(Event::Error {
        error: ComponentError::Hardware,
        port: None,
    });
    assert_eq!(core.state(), State::FatalError);
    assert!(matches!(
        waiter.join().unwrap(),
        Err(Error::Component(ComponentError::Hardware))
    ));

    let before = component.commands().len();
    assert!(matches!(
        core.change_state(State::Idle),
        Err(Error::Transition { .. })
    ));
    assert_eq!(component.commands().len(), before);

    // A late completion does not revive the core.
    component.deliver(Event::CmdComplete(Completion::StateSet(State::Idle)));
    assert_eq!(core.state(), State::FatalError);

    core.deinit().unwrap();
    assert_eq!(core.state(), State::Loaded);
}

/// A non-fatal error releases a thread waiting for end of stream, but the
/// core keeps streaming and a later end of stream still finishes it.
#[test]
fn non_fatal_error_releases_done_waiter_and_keeps_streaming() {
    let (core, component) = executing_core(filter_ports());
    let input = core.input_port().unwrap();

    let waiter = {
        let core = core.clone();
        thread::spawn(move || core.wait_for_done())
    };
    thread::sleep(Duration::from_millis(20));

    component.deliver(Event::Error {
        error: ComponentError::StreamCorrupt,
        port: Some(1),
    });
    assert!(matches!(
        waiter.join().unwrap(),
        Err(Error::Component(ComponentError::StreamCorrupt))
    ));
    assert_eq!(core.state(), State::Executing);
    assert_eq!(core.last_error(), Some(ComponentError::StreamCorrupt));
    assert!(!core.is_done());

    let buffer = input.request_buffer().unwrap();
    input.release_buffer(buffer).unwrap();

    component.deliver(Event::BufferFlag {
        port: 1,
        flags: BufferFlags::EOS,
    });
    core.wait_for_done().unwrap();
}

#[test]
fn hooks_see_routed_events() {
    let (core, component, _library) = scripted_core(Mode::Auto, filter_ports());
    let events = Arc::new(Mutex::new(Vec::new()));
    let settings = Arc::new(AtomicUsize::new(0));
    {
        let events = events.clone();
        core.set_event_hook(move |event| events.lock().unwrap().push(*event));
        let settings = settings.clone();
        core.set_settings_changed_hook(move |port| {
            settings.fetch_add(port as usize + 1, Ordering::SeqCst);
        });
    }

    component.deliver(Event::PortSettingsChanged { port: 1 });
    core.prepare().unwrap();

    assert_eq!(settings.load(Ordering::SeqCst), 2);
    assert_eq!(core.state(), State::Idle);
    // The hook runs after routing, possibly after prepare returned.
    wait_until("completion hook", || events.lock().unwrap().len() == 2);
    let events = events.lock().unwrap();
    assert_eq!(events[0], Event::PortSettingsChanged { port: 1 });
    assert_eq!(
        events[1],
        Event::CmdComplete(Completion::StateSet(State::Idle))
    );
}

#[test]
fn empty_port_fails_init_and_releases_library() {
    setup_logging();
    let mut ports = filter_ports();
    ports[1].buffer_count = 0;
    let library = ScriptedLibrary::new(Mode::Auto, ports);
    let handle = LibraryHandle::new(library);
    let core = Core::new(CoreConfig::for_component("OMX.scripted"));

    assert!(matches!(
        core.init(handle.clone()),
        Err(Error::Allocation(_))
    ));
    assert!(!core.is_initialised());
    assert_eq!(handle.client_count(), 0);
}

#[test]
fn core_is_reusable_across_init_cycles() {
    setup_logging();
    let library = ScriptedLibrary::new(Mode::Auto, filter_ports());
    let handle = LibraryHandle::new(library.clone());
    let core = Core::new(CoreConfig::for_component("OMX.scripted"));

    for _ in 0..3 {
        core.init(handle.clone()).unwrap();
        assert_eq!(handle.client_count(), 1);
        let component = library.last();

        core.prepare().unwrap();
        core.start().unwrap();
        core.stop().unwrap();
        component.return_all(0);
        component.return_all(1);
        core.unload().unwrap();
        assert_eq!(component.allocated(), component.freed());

        core.deinit().unwrap();
        assert!(!core.is_initialised());
        assert_eq!(handle.client_count(), 0);
    }

    assert!(matches!(
        core.change_state(State::Idle),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn deinit_wakes_blocked_waiters() {
    let (core, component, _library) = scripted_core(Mode::Manual, filter_ports());

    let waiter = {
        let core = core.clone();
        thread::spawn(move || core.change_state(State::Idle))
    };
    component.wait_for_command(Command::StateSet(State::Idle), 1);

    core.shutdown();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled)));
    core.deinit().unwrap();
}
