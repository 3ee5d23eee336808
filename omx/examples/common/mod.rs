// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Common utilities shared across examples.

use std::sync::Arc;

use omx::loopback::{LoopbackLibrary, LoopbackOptions};
use omx::{LibraryRegistry, config::DEFAULT_LIBRARY_NAME};

/// Initializes tracing subscriber for examples.
///
/// Configures logging to stdout with an INFO level filter, respecting the
/// `RUST_LOG` environment variable for custom log levels.
pub fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

/// A registry holding the loopback library under its default name.
pub fn loopback_registry(options: LoopbackOptions) -> Result<LibraryRegistry, omx::Error> {
    let registry = LibraryRegistry::new();
    registry.register(
        DEFAULT_LIBRARY_NAME,
        Arc::new(LoopbackLibrary::with_options(options)),
    )?;
    Ok(registry)
}
