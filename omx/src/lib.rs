// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! # omx - codec component bridge core
//!
//! Safe, blocking Rust interface to codec components that expose an
//! asynchronous, callback-driven, port-based buffer-exchange protocol in the
//! style of OpenMAX IL.
//!
//! ## Overview
//!
//! A vendor component completes every command asynchronously on its own
//! callback thread. This crate turns those completions into blocking calls
//! that pipeline threads can make, and manages the buffer slots exchanged
//! across the component boundary.
//!
//! ### Key Concepts
//!
//! - **Component**: the vendor codec instance, behind the [`Component`] trait
//! - **Library**: creates components and tunnels them ([`Library`], [`LibraryRegistry`])
//! - **Core**: one component and its lifecycle ([`Core`])
//! - **Port**: a directional buffer endpoint with a blocking ready queue ([`Port`])
//! - **Tunnel**: direct buffer exchange between two components ([`tunnel`])
//!
//! ## Architecture
//!
//! ```text
//!          pipeline threads                    component thread
//!  ┌────────────────────────────┐         ┌──────────────────────┐
//!  │ change_state / enable ...  │──cmd──► │                      │
//!  │   (block on Semaphore)     │◄─event──│  Callbacks (router)  │
//!  │ Port::request_buffer       │◄─done───│                      │
//!  │ Port::release_buffer       │──buf──► │                      │
//!  └────────────────────────────┘         └──────────────────────┘
//! ```
//!
//! ## Examples
//!
//! ### Pushing data through the loopback filter
//!
//! ```no_run
//! use std::sync::Arc;
//! use omx::{Core, CoreConfig, LibraryHandle, loopback::LoopbackLibrary, stream};
//!
//! # fn main() -> Result<(), omx::Error> {
//! let library = LibraryHandle::new(Arc::new(LoopbackLibrary::new()));
//! let core = Core::new(CoreConfig::for_component("OMX.loopback.filter"));
//! core.init(library)?;
//! core.prepare()?;
//! core.start()?;
//!
//! let input = core.input_port().unwrap();
//! let output = core.output_port().unwrap();
//! stream::feed_input(&input, b"payload", Some(0), false)?;
//!
//! let mut buffer = output.request_buffer()?;
//! let payload = stream::OutputPayload::take(&mut buffer, false);
//! output.release_buffer(buffer)?;
//! assert_eq!(payload.map(|p| p.data), Some(b"payload".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! [`Core`] and [`Port`] are cheap to clone, `Send + Sync`, and meant to be
//! shared between the pipeline's threads and the component's callback thread.
//! State transitions are serialized by blocking: a caller waits for its own
//! completion before the next transition can be requested.

mod component;
mod core;
mod error;
mod port;
mod sem;

pub mod config;
pub mod loopback;
pub mod stream;
pub mod tunnel;

pub use component::{
    BufferFlags, BufferHeader, BufferRejected, Callbacks, Command, Completion, Component,
    Direction, Event, Library, LibraryHandle, LibraryRegistry, PortDefinition, PortSelector,
    State, TICKS_PER_SECOND,
};
pub use config::CoreConfig;
pub use self::core::{Core, EventHook, SettingsChangedHook};
pub use error::{ComponentError, Error, Result};
pub use port::{Port, SlotState};
pub use sem::Semaphore;
