// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Pushes generated frames through the loopback filter component.
//!
//! Without `--tunnel` the filter's output is read back on a second thread,
//! the way a pipeline's source pad task would. With `--tunnel` the filter is
//! tunneled into a loopback sink and the output never leaves the components.
//!
//! ```text
//! cargo run --example loopback -- --frames 50 --frame-size 6000
//! cargo run --example loopback -- --tunnel
//! ```

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use omx::loopback::LoopbackOptions;
use omx::stream::{self, OutputPayload};
use omx::tunnel::{self, Handshake, TunnelSide};
use omx::{BufferFlags, Core, CoreConfig, Error, Port, config};
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "Push frames through the loopback codec components")]
struct Opts {
    /// Number of frames to push.
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Size of each frame in bytes.
    #[arg(long, default_value_t = 1024)]
    frame_size: usize,

    /// Buffers per port.
    #[arg(long, default_value_t = 4)]
    buffers: usize,

    /// Byte size of each buffer.
    #[arg(long, default_value_t = 4096)]
    buffer_size: usize,

    /// Frame duration in milliseconds, used for timestamps.
    #[arg(long, default_value_t = 40)]
    frame_ms: u64,

    /// Tunnel the filter into a loopback sink instead of reading its output.
    #[arg(long)]
    tunnel: bool,

    /// Core configuration as a JSON file.
    #[arg(long, env = "OMX_CORE_CONFIG")]
    config: Option<PathBuf>,
}

fn read_config(path: Option<&PathBuf>) -> Result<CoreConfig, Error> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| {
                Error::Other(format!("failed to read {}: {}", path.display(), e))
            })?;
            CoreConfig::from_json(&json)
        }
        None => Ok(CoreConfig::default()),
    }
}

/// Drains the output port until end of stream. Returns frames and bytes read.
fn read_output(output: Port, share: bool) -> thread::JoinHandle<(u64, usize)> {
    thread::spawn(move || {
        let (mut frames, mut bytes) = (0, 0);
        while let Ok(mut buffer) = output.request_buffer() {
            let eos = buffer.flags.contains(BufferFlags::EOS);
            if let Some(payload) = OutputPayload::take(&mut buffer, share) {
                frames += 1;
                bytes += payload.data.len();
            }
            if output.release_buffer(buffer).is_err() || eos {
                break;
            }
        }
        (frames, bytes)
    })
}

fn main() -> Result<(), Error> {
    common::setup_logging();
    let opts = Opts::parse();
    let config = read_config(opts.config.as_ref())?;

    let registry = common::loopback_registry(LoopbackOptions {
        buffer_count: opts.buffers,
        buffer_size: opts.buffer_size,
        ..LoopbackOptions::default()
    })?;
    let library = registry.get(&config.library_name)?;

    let filter = Core::new(config.clone());
    filter.init(library.clone())?;

    let tunneled = if opts.tunnel && config.tunneling {
        let sink = Core::new(CoreConfig {
            component_name: config::DEFAULT_SINK_COMPONENT.to_string(),
            ..config.clone()
        });
        sink.init(library)?;
        let output = TunnelSide {
            core: filter.clone(),
            port: filter
                .output_port()
                .ok_or_else(|| Error::Other("filter has no output port".to_string()))?,
            handshake: Arc::new(Handshake::new()),
            allowed: true,
        };
        let input = TunnelSide {
            core: sink.clone(),
            port: sink
                .input_port()
                .ok_or_else(|| Error::Other("sink has no input port".to_string()))?,
            handshake: Arc::new(Handshake::new()),
            allowed: true,
        };
        let outcome = tunnel::negotiate(&output, &input)?;
        info!(?outcome, "Tunnel negotiated");
        Some((sink, output.port))
    } else {
        None
    };

    if let Some((sink, _)) = &tunneled {
        sink.prepare()?;
        sink.start()?;
    }
    filter.prepare()?;
    filter.start()?;
    if let Some((sink, out_port)) = &tunneled {
        out_port.enable()?;
        if let Some(in_port) = sink.input_port() {
            in_port.enable()?;
        }
    }

    let input = filter
        .input_port()
        .ok_or_else(|| Error::Other("filter has no input port".to_string()))?;
    let reader = match (&tunneled, filter.output_port()) {
        (None, Some(output)) => Some(read_output(output, config.share_output_buffer)),
        _ => None,
    };

    let started = Instant::now();
    let frame: Vec<u8> = (0..opts.frame_size).map(|i| (i % 251) as u8).collect();
    for n in 0..opts.frames {
        let timestamp = config
            .use_timestamps
            .then(|| stream::ticks_from_nanos(n * opts.frame_ms * 1_000_000));
        stream::feed_input(&input, &frame, timestamp, config.share_input_buffer)?;
    }
    filter.drain(&input)?;
    if let Some((sink, _)) = &tunneled {
        sink.wait_for_done()?;
    }
    let elapsed = started.elapsed();

    match reader.map(|reader| reader.join()) {
        Some(Ok((frames, bytes))) => info!(
            frames,
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Output read back"
        ),
        Some(Err(_)) => return Err(Error::Other("output reader panicked".to_string())),
        None => info!(
            frames = opts.frames,
            elapsed_ms = elapsed.as_millis() as u64,
            "Frames consumed through the tunnel"
        ),
    }

    filter.stop()?;
    if let Some((sink, out_port)) = &tunneled {
        sink.stop()?;
        tunnel::unlink(out_port)?;
        sink.unload()?;
        sink.deinit()?;
    }
    filter.unload()?;
    filter.deinit()?;
    Ok(())
}
