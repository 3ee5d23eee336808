// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Moving payloads between a pipeline and a core's ports.
//!
//! [`feed_input`] is the data-sink side (a chain function): it splits a
//! payload over as many input buffers as needed. [`OutputPayload`] is the
//! data-source side: it takes the filled part out of an output buffer before
//! the buffer goes back to the component.

use tracing::trace;

use crate::component::{BufferHeader, TICKS_PER_SECOND};
use crate::port::Port;
use crate::{Error, Result};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Converts nanoseconds to component ticks.
pub fn ticks_from_nanos(nanos: u64) -> i64 {
    (nanos as i128 * TICKS_PER_SECOND as i128 / NANOS_PER_SECOND as i128) as i64
}

/// Converts component ticks to nanoseconds. Negative ticks clamp to zero.
pub fn nanos_from_ticks(ticks: i64) -> u64 {
    if ticks <= 0 {
        return 0;
    }
    (ticks as i128 * NANOS_PER_SECOND as i128 / TICKS_PER_SECOND as i128) as u64
}

/// Pushes `data` into `input`.
///
/// Without `share`, the payload is copied into slot-sized chunks, one input
/// buffer each. With `share`, the whole payload is attached to a single
/// buffer. Every buffer carries `timestamp`.
///
/// Returns the number of buffers released. A tunneled port takes no data
/// from the pipeline, and an empty payload needs no buffer; both return
/// `Ok(0)`.
///
/// # Errors
///
/// Returns [`Error::Flushing`] as soon as the port stops streaming;
/// the part of the payload fed so far stays with the component.
pub fn feed_input(input: &Port, data: &[u8], timestamp: Option<i64>, share: bool) -> Result<usize> {
    if input.is_tunneled() || data.is_empty() {
        return Ok(0);
    }

    let mut offset = 0;
    let mut released = 0;
    loop {
        let mut buffer = input.request_buffer()?;
        let remaining = &data[offset..];

        let len = if share {
            buffer.data = remaining.to_vec();
            remaining.len()
        } else {
            let len = remaining.len().min(buffer.alloc_len());
            if len == 0 {
                return Err(Error::BufferProtocol(format!(
                    "input slot {} has no storage",
                    buffer.slot
                )));
            }
            buffer.data[..len].copy_from_slice(&remaining[..len]);
            len
        };
        buffer.offset = 0;
        buffer.filled_len = len;
        if let Some(timestamp) = timestamp {
            buffer.timestamp = timestamp;
        }
        trace!(port = input.index(), slot = buffer.slot, len, "Feeding input");

        input.release_buffer(buffer)?;
        released += 1;
        offset += len;
        if offset >= data.len() {
            return Ok(released);
        }
    }
}

/// The filled part of an output buffer, detached from the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPayload {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

impl OutputPayload {
    /// Takes the payload out of `buffer`, or `None` if it is empty.
    ///
    /// Without `share` the bytes are copied. With `share` the storage itself
    /// moves out and the buffer gets fresh storage of the same size, so no
    /// payload byte is copied.
    pub fn take(buffer: &mut BufferHeader, share: bool) -> Option<Self> {
        if buffer.filled_len == 0 {
            return None;
        }
        let timestamp = buffer.timestamp;
        let data = if share {
            let alloc_len = buffer.alloc_len();
            let mut data = std::mem::replace(&mut buffer.data, vec![0; alloc_len]);
            let end = (buffer.offset + buffer.filled_len).min(data.len());
            data.truncate(end);
            data.drain(..buffer.offset.min(end));
            data
        } else {
            buffer.payload().to_vec()
        };
        buffer.offset = 0;
        buffer.filled_len = 0;
        Some(Self { data, timestamp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion() {
        assert_eq!(ticks_from_nanos(1_000_000_000), TICKS_PER_SECOND);
        assert_eq!(ticks_from_nanos(1_500), 1);
        assert_eq!(nanos_from_ticks(TICKS_PER_SECOND), 1_000_000_000);
        assert_eq!(nanos_from_ticks(-5), 0);
    }

    #[test]
    fn take_copies_filled_region() {
        let mut buffer = BufferHeader::new(1, 0, 8);
        buffer.data.copy_from_slice(b"..abcd..");
        buffer.offset = 2;
        buffer.filled_len = 4;
        buffer.timestamp = 42;

        let payload = OutputPayload::take(&mut buffer, false).unwrap();
        assert_eq!(payload.data, b"abcd");
        assert_eq!(payload.timestamp, 42);
        assert_eq!(buffer.filled_len, 0);
        assert_eq!(buffer.data, b"..abcd..");
    }

    #[test]
    fn shared_take_moves_storage_out() {
        let mut buffer = BufferHeader::new(1, 0, 8);
        buffer.data.copy_from_slice(b"..abcd..");
        buffer.offset = 2;
        buffer.filled_len = 4;

        let payload = OutputPayload::take(&mut buffer, true).unwrap();
        assert_eq!(payload.data, b"abcd");
        assert_eq!(buffer.alloc_len(), 8);
        assert_eq!(buffer.data, vec![0; 8]);
    }

    #[test]
    fn empty_buffer_has_no_payload() {
        let mut buffer = BufferHeader::new(1, 0, 8);
        assert!(OutputPayload::take(&mut buffer, false).is_none());
    }
}
