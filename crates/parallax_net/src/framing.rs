//! # Frame Compression
//!
//! Finished bit streams leave the server as
//! `<u32 msg_type><u64 frame_index><lz4 body>`. The body uses the
//! size-prepended LZ4 block format so the receiver can size its output
//! buffer before inflating.
//!
//! Frames are cut eagerly: after every record the scheduler asks
//! [`maybe_flush_buffer`] whether the worst-case compressed size has
//! crossed the bound, which keeps each datagram under MTU without
//! compressing twice.

use thiserror::Error;

use crate::bits::MessageBuffer;
use crate::transport::{PacketSink, Reliability};
use crate::{FLUSH_COMPRESS_BOUND, MAX_INFLATED_SIZE, SYNC_CHANNEL};

/// Errors raised while inflating an inbound frame body.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The body was shorter than its own length prefix.
    #[error("truncated frame body")]
    Truncated,

    /// The length prefix claimed more than the accepted bound.
    #[error("inflated size {0} exceeds bound")]
    TooLarge(usize),

    /// The LZ4 stream itself was invalid.
    #[error("lz4: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
}

/// Terminates, compresses, and sends a non-empty bit stream.
///
/// Appends the 3-bit end tag, prefixes `msg_type` and `frame_index`,
/// and resets the cursor so the buffer can be reused for the next
/// frame. Empty buffers are left alone.
pub fn flush_buffer(
    buffer: &mut MessageBuffer,
    msg_type: u32,
    frame_index: u64,
    sink: &dyn PacketSink,
) {
    if buffer.data_length() == 0 {
        return;
    }

    buffer.write(3, 7);

    let payload = &buffer.bytes()[..buffer.data_length()];
    let compressed = lz4_flex::compress_prepend_size(payload);

    let mut out = Vec::with_capacity(12 + compressed.len());
    out.extend_from_slice(&msg_type.to_le_bytes());
    out.extend_from_slice(&frame_index.to_le_bytes());
    out.extend_from_slice(&compressed);

    tracing::trace!(len = out.len(), msg_type, "flushing frame");

    sink.send_packet(SYNC_CHANNEL, &out, Reliability::Unreliable);

    buffer.set_current_bit(0);
}

/// Flushes when the worst-case compressed size crosses the MTU bound.
pub fn maybe_flush_buffer(
    buffer: &mut MessageBuffer,
    msg_type: u32,
    frame_index: u64,
    sink: &dyn PacketSink,
) {
    if lz4_flex::block::get_maximum_output_size(buffer.data_length()) > FLUSH_COMPRESS_BOUND {
        flush_buffer(buffer, msg_type, frame_index, sink);
    }
}

/// Inflates an inbound frame body, rejecting oversized claims before
/// allocating.
pub fn decompress_body(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() < 4 {
        return Err(FrameError::Truncated);
    }

    let claimed = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    if claimed > MAX_INFLATED_SIZE {
        return Err(FrameError::TooLarge(claimed));
    }

    Ok(lz4_flex::decompress_size_prepended(body)?)
}
