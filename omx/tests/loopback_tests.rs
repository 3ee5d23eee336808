// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end runs against the loopback implementation library.
//!
//! # Test Coverage
//!
//! - Payloads and timestamps through a filter, finished by draining
//! - End of stream on a sink
//! - Filter tunneled into a sink, bypassing the pipeline
//! - Flushing a component that holds buffers
//! - Injected transition failures, fatal errors and buffer rejection

mod common;

use std::sync::Arc;
use std::thread;

use common::setup_logging;
use omx::loopback::{LoopbackLibrary, LoopbackOptions};
use omx::stream::{self, OutputPayload};
use omx::tunnel::{self, Handshake, TunnelOutcome, TunnelSide};
use omx::{
    BufferFlags, ComponentError, Core, CoreConfig, Error, LibraryHandle, LibraryRegistry, Port,
    State, config,
};

fn loopback(options: LoopbackOptions) -> (Arc<LoopbackLibrary>, Arc<LibraryHandle>) {
    setup_logging();
    let library = Arc::new(LoopbackLibrary::with_options(options));
    let handle = LibraryHandle::new(library.clone());
    (library, handle)
}

fn small() -> LoopbackOptions {
    LoopbackOptions {
        buffer_count: 4,
        buffer_size: 8,
        ..LoopbackOptions::default()
    }
}

fn filter(handle: &Arc<LibraryHandle>) -> Core {
    let core = Core::new(CoreConfig::for_component(config::DEFAULT_FILTER_COMPONENT));
    core.init(handle.clone()).unwrap();
    core
}

fn sink(handle: &Arc<LibraryHandle>) -> Core {
    let core = Core::new(CoreConfig::for_component(config::DEFAULT_SINK_COMPONENT));
    core.init(handle.clone()).unwrap();
    core
}

/// Reads the output port until the end-of-stream buffer shows up.
fn collect_output(output: Port) -> thread::JoinHandle<Vec<OutputPayload>> {
    thread::spawn(move || {
        let mut payloads = Vec::new();
        loop {
            let mut buffer = match output.request_buffer() {
                Ok(buffer) => buffer,
                Err(_) => break,
            };
            let eos = buffer.flags.contains(BufferFlags::EOS);
            if let Some(payload) = OutputPayload::take(&mut buffer, false) {
                payloads.push(payload);
            }
            output.release_buffer(buffer).unwrap();
            if eos {
                break;
            }
        }
        payloads
    })
}

fn shut_down(core: &Core) {
    core.stop().unwrap();
    core.unload().unwrap();
    core.deinit().unwrap();
}

#[test]
fn filter_copies_payloads_until_drained() {
    let (library, handle) = loopback(small());
    let core = filter(&handle);
    core.prepare().unwrap();
    core.start().unwrap();
    let input = core.input_port().unwrap();
    let reader = collect_output(core.output_port().unwrap());

    assert_eq!(
        stream::feed_input(&input, b"hello", Some(10), false).unwrap(),
        1
    );
    // Larger than one slot: split over two buffers.
    assert_eq!(
        stream::feed_input(&input, b"loopback world", Some(20), false).unwrap(),
        2
    );
    core.drain(&input).unwrap();
    assert!(core.is_done());

    let payloads = reader.join().unwrap();
    let data: Vec<&[u8]> = payloads.iter().map(|p| p.data.as_slice()).collect();
    let expected: [&[u8]; 3] = [b"hello", b"loopback", b" world"];
    assert_eq!(data, expected);
    let timestamps: Vec<i64> = payloads.iter().map(|p| p.timestamp).collect();
    assert_eq!(timestamps, [10, 20, 20]);

    shut_down(&core);
    assert_eq!(library.init_count(), 1);
    assert_eq!(handle.client_count(), 0);
}

#[test]
fn shared_input_attaches_whole_payload() {
    let (_library, handle) = loopback(small());
    let core = filter(&handle);
    core.prepare().unwrap();
    core.start().unwrap();
    let input = core.input_port().unwrap();
    let reader = collect_output(core.output_port().unwrap());

    assert_eq!(
        stream::feed_input(&input, b"larger than a slot", None, true).unwrap(),
        1
    );
    core.drain(&input).unwrap();

    let payloads = reader.join().unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].data, b"larger than a slot");
    shut_down(&core);
}

#[test]
fn sink_finishes_on_eos() {
    let (_library, handle) = loopback(small());
    let core = sink(&handle);
    assert!(core.output_port().is_none());
    core.prepare().unwrap();
    core.start().unwrap();
    let input = core.input_port().unwrap();

    for _ in 0..10 {
        stream::feed_input(&input, b"frame", None, false).unwrap();
    }
    core.drain(&input).unwrap();
    assert!(core.is_done());
    assert!(matches!(
        stream::feed_input(&input, b"late", None, false),
        Err(Error::Flushing)
    ));
    shut_down(&core);
}

#[test]
fn core_restarts_after_eos() {
    let (_library, handle) = loopback(small());
    let core = sink(&handle);
    core.prepare().unwrap();

    for _ in 0..2 {
        core.start().unwrap();
        assert!(!core.is_done());
        let input = core.input_port().unwrap();
        stream::feed_input(&input, b"frame", None, false).unwrap();
        core.drain(&input).unwrap();
        core.stop().unwrap();
    }
    core.unload().unwrap();
    core.deinit().unwrap();
}

#[test]
fn filter_tunnels_into_sink() {
    let (library, handle) = loopback(small());
    let upstream = filter(&handle);
    let downstream = sink(&handle);

    let output = TunnelSide {
        core: upstream.clone(),
        port: upstream.output_port().unwrap(),
        handshake: Arc::new(Handshake::new()),
        allowed: true,
    };
    let input = TunnelSide {
        core: downstream.clone(),
        port: downstream.input_port().unwrap(),
        handshake: Arc::new(Handshake::new()),
        allowed: true,
    };
    assert_eq!(
        tunnel::negotiate(&input, &output).unwrap(),
        TunnelOutcome::Connected
    );
    assert_eq!(library.connect_count(), 1);

    for core in [&downstream, &upstream] {
        core.prepare().unwrap();
        core.start().unwrap();
    }
    output.port.enable().unwrap();
    input.port.enable().unwrap();
    assert_eq!(output.port.allocated(), 0);
    assert_eq!(input.port.allocated(), 0);

    // The pipeline has no business with the tunneled ports.
    assert_eq!(
        stream::feed_input(&input.port, b"ignored", None, false).unwrap(),
        0
    );

    let source = upstream.input_port().unwrap();
    stream::feed_input(&source, b"through the tunnel", Some(5), false).unwrap();
    upstream.drain(&source).unwrap();
    downstream.wait_for_done().unwrap();

    for core in [&upstream, &downstream] {
        core.stop().unwrap();
    }
    tunnel::unlink(&output.port).unwrap();
    assert_eq!(library.teardown_count(), 1);
    assert!(!input.port.is_tunneled());

    for core in [&upstream, &downstream] {
        core.unload().unwrap();
        core.deinit().unwrap();
    }
    assert_eq!(handle.client_count(), 0);
}

#[test]
fn flush_returns_held_buffers() {
    let (_library, handle) = loopback(small());
    let core = filter(&handle);
    core.prepare().unwrap();
    core.start().unwrap();
    let input = core.input_port().unwrap();
    let output = core.output_port().unwrap();

    // Four inputs fill the four output buffers, two more stay with the
    // component for lack of output space.
    for _ in 0..6 {
        stream::feed_input(&input, b"data", None, false).unwrap();
    }

    core.flush_all().unwrap();
    assert_eq!(input.ready_len(), 4);
    assert_eq!(output.ready_len(), 4);

    core.flush_port(&input).unwrap();
    assert_eq!(input.ready_len(), 4);
    shut_down(&core);
}

#[test]
fn injected_transition_failure_is_reported() {
    let (_library, handle) = loopback(LoopbackOptions {
        fail_transition: Some(State::Executing),
        ..small()
    });
    let core = filter(&handle);
    core.prepare().unwrap();

    match core.start() {
        Err(Error::Transition { target, .. }) => assert_eq!(target, State::Executing),
        other => panic!("expected a transition error, got {other:?}"),
    }
    assert_eq!(core.state(), State::Idle);
    assert_eq!(
        core.last_error(),
        Some(ComponentError::IncorrectStateTransition)
    );

    core.unload().unwrap();
    core.deinit().unwrap();
}

#[test]
fn injected_fatal_error_is_absorbing() {
    let (_library, handle) = loopback(LoopbackOptions {
        fatal_transition: Some(State::Idle),
        ..small()
    });
    let core = filter(&handle);

    assert!(core.prepare().is_err());
    assert_eq!(core.state(), State::FatalError);
    assert!(matches!(
        core.change_state(State::Idle),
        Err(Error::Transition { .. })
    ));
    assert!(core.wait_for_done().is_err());
    core.deinit().unwrap();
    assert_eq!(handle.client_count(), 0);
}

#[test]
fn rejected_buffer_degrades_without_teardown() {
    let (_library, handle) = loopback(LoopbackOptions {
        reject_buffers: true,
        ..small()
    });
    let core = sink(&handle);
    core.prepare().unwrap();
    core.start().unwrap();
    let input = core.input_port().unwrap();

    match stream::feed_input(&input, b"refused", None, false) {
        Err(Error::Component(ComponentError::BadParameter)) => {}
        other => panic!("expected the rejection, got {other:?}"),
    }
    assert_eq!(core.state(), State::Executing);
    // The rejected buffer is claimable again.
    assert_eq!(input.ready_len(), input.slot_count());
    shut_down(&core);
}

#[test]
fn unknown_component_releases_library() {
    let (library, handle) = loopback(small());
    let core = Core::new(CoreConfig::for_component("OMX.loopback.nope"));
    assert!(matches!(
        core.init(handle.clone()),
        Err(Error::ComponentNotFound(_))
    ));
    assert_eq!(library.init_count(), 1);
    assert_eq!(handle.client_count(), 0);
    assert!(!core.is_initialised());
}

#[test]
fn registry_resolves_libraries_by_name() {
    setup_logging();
    let registry = LibraryRegistry::new();
    registry
        .register(config::DEFAULT_LIBRARY_NAME, Arc::new(LoopbackLibrary::new()))
        .unwrap();

    let first = registry.get(config::DEFAULT_LIBRARY_NAME).unwrap();
    let second = registry.get(config::DEFAULT_LIBRARY_NAME).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.name(), "loopback");
    assert!(matches!(
        registry.get("libmissing.so"),
        Err(Error::LibraryNotFound(_))
    ));
}

#[test]
fn config_round_trips_through_json() {
    let config = CoreConfig {
        share_output_buffer: true,
        tunneling: false,
        ..CoreConfig::for_component(config::DEFAULT_SINK_COMPONENT)
    };
    let json = config.to_json().unwrap();
    assert_eq!(CoreConfig::from_json(&json).unwrap(), config);

    let partial = CoreConfig::from_json(r#"{"component_name": "OMX.vendor.dec"}"#).unwrap();
    assert_eq!(partial.component_name, "OMX.vendor.dec");
    assert_eq!(partial.library_name, config::DEFAULT_LIBRARY_NAME);
    assert!(partial.use_timestamps);

    assert!(CoreConfig::from_json(r#"{"tunneling": "yes"}"#).is_err());
}
