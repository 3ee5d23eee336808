// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for codec bridge operations.
//!
//! This module defines the error types returned by the core, mapping the
//! vendor component's error codes to idiomatic Rust error enums.

use crate::component::State;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Error codes reported by a vendor component through its event callback.
///
/// These mirror the component's own error taxonomy. Only a few of them are
/// unrecoverable, see [`ComponentError::is_fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ComponentError {
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("undefined error")]
    Undefined,
    #[error("bad parameter")]
    BadParameter,
    #[error("not implemented")]
    NotImplemented,
    #[error("buffer underflow")]
    Underflow,
    #[error("buffer overflow")]
    Overflow,
    #[error("hardware failure")]
    Hardware,
    #[error("component is in an invalid state")]
    InvalidState,
    #[error("corrupt stream")]
    StreamCorrupt,
    #[error("component is already in the requested state")]
    SameState,
    #[error("incorrect state transition")]
    IncorrectStateTransition,
    #[error("operation not allowed in the current state")]
    IncorrectStateOperation,
    #[error("port is not populated")]
    PortUnpopulated,
    #[error("resources lost")]
    ResourcesLost,
    #[error("timeout")]
    Timeout,
}

impl ComponentError {
    /// Returns `true` for errors after which the component cannot be used
    /// anymore and the core moves to [`State::FatalError`].
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ComponentError::Hardware | ComponentError::InvalidState | ComponentError::ResourcesLost
        )
    }
}

/// Errors that can occur when driving a codec component.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The component rejected or failed a requested state change.
    #[error("Transition to {target:?} failed: {reason}")]
    Transition { target: State, reason: String },

    /// Port or buffer setup failed.
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// A buffer was handed over in a state that does not allow it, e.g. a
    /// release without a matching request.
    #[error("Buffer protocol violation: {0}")]
    BufferProtocol(String),

    /// The port is draining or disabled. Not a failure: streaming should stop.
    #[error("Port is flushing")]
    Flushing,

    /// The peer cannot or will not tunnel. Callers fall back to normal linking.
    #[error("Tunnel refused: {0}")]
    TunnelRefused(String),

    /// An error code reported by the component.
    #[error("Component error: {0}")]
    Component(#[from] ComponentError),

    /// A blocking wait was woken by a shutdown rather than by a completion.
    #[error("Wait cancelled by shutdown")]
    Cancelled,

    /// The operation is not allowed in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No implementation library is registered under the given name.
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    /// The implementation library does not provide the requested component.
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// A generic error for failures not covered by the other variants.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Returns `true` if this is the flushing signal rather than a failure.
    ///
    /// Streaming loops use this to stop quietly when a port is drained.
    pub fn is_flushing(&self) -> bool {
        matches!(self, Error::Flushing | Error::Cancelled)
    }
}
