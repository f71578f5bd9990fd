//! # Parallax Net
//!
//! Wire-level plumbing for the parallax host, shared by the state core
//! and by tooling that needs to speak the same framing.
//!
//! ## Contents
//!
//! - **Bit stream**: [`MessageBuffer`], a fixed-capacity bit-packed
//!   buffer with cursor save/restore (the unit every replication frame
//!   is assembled in).
//! - **Byte stream**: [`ByteBuffer`]/[`ByteReader`] for the plain
//!   little-endian control messages.
//! - **Tags**: [`wire_hash`] and the `MSG_*`/`NET_*` constants.
//! - **Framing**: LZ4 compression of finished bit streams plus the
//!   flush-on-bound helpers.
//! - **Transport seam**: [`PacketSink`], [`Reliability`], [`PeerStats`].
//!
//! This crate knows nothing about entities, clients, or the world; it
//! only moves bits.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod bits;
pub mod bytes;
pub mod framing;
pub mod hash;
pub mod transport;

pub use bits::MessageBuffer;
pub use bytes::{ByteBuffer, ByteReader};
pub use framing::{decompress_body, flush_buffer, maybe_flush_buffer, FrameError};
pub use hash::wire_hash;
pub use transport::{PacketSink, PeerStats, Reliability};

/// Channel every game-state message travels on.
pub const SYNC_CHANNEL: u8 = 1;

/// Worst-case compressed size above which an in-flight frame is cut.
///
/// Keeps each sent datagram comfortably under a 1500-byte MTU after
/// the 12-byte frame header.
pub const FLUSH_COMPRESS_BOUND: usize = 1100;

/// Upper bound accepted for any decompressed inbound payload.
pub const MAX_INFLATED_SIZE: usize = 16384;
