//! # Transport Seam
//!
//! The state core never touches sockets. It hands finished payloads to
//! a [`PacketSink`] and reads link quality from [`PeerStats`]; the host
//! wires both to its actual transport.

use std::sync::atomic::{AtomicU32, Ordering};

/// Delivery guarantee requested for a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reliability {
    /// Fire and forget.
    Unreliable,
    /// Delivered at least once.
    Reliable,
    /// Delivered at least once, and replayed to clients that connect
    /// mid-stream.
    ReliableReplayed,
}

/// Outbound packet seam implemented by the host transport.
pub trait PacketSink: Send + Sync {
    /// Queues a payload for delivery. Must not block the caller.
    fn send_packet(&self, channel: u8, payload: &[u8], reliability: Reliability);
}

/// Link-quality figures for a connected peer.
///
/// Updated by the transport from whatever RTT estimator it runs;
/// read by the replication scheduler to derive resend throttles.
#[derive(Debug, Default)]
pub struct PeerStats {
    ping_ms: AtomicU32,
    ping_variance_ms: AtomicU32,
}

impl PeerStats {
    /// Creates stats with the given initial estimates.
    #[must_use]
    pub fn new(ping_ms: u32, ping_variance_ms: u32) -> Self {
        Self {
            ping_ms: AtomicU32::new(ping_ms),
            ping_variance_ms: AtomicU32::new(ping_variance_ms),
        }
    }

    /// Current smoothed round-trip time in milliseconds.
    #[inline]
    #[must_use]
    pub fn ping_ms(&self) -> u32 {
        self.ping_ms.load(Ordering::Relaxed)
    }

    /// Current round-trip variance in milliseconds.
    #[inline]
    #[must_use]
    pub fn ping_variance_ms(&self) -> u32 {
        self.ping_variance_ms.load(Ordering::Relaxed)
    }

    /// Stores fresh estimates.
    pub fn update(&self, ping_ms: u32, ping_variance_ms: u32) {
        self.ping_ms.store(ping_ms, Ordering::Relaxed);
        self.ping_variance_ms.store(ping_variance_ms, Ordering::Relaxed);
    }

    /// Minimum interval between re-sending unacked state to this peer.
    ///
    /// `max(1, ping * 3 - variance)` milliseconds: slow links get more
    /// slack, jittery links slightly less so acks in flight get a
    /// chance to land.
    #[must_use]
    pub fn resend_delay_ms(&self) -> u64 {
        let delay = i64::from(self.ping_ms()) * 3 - i64::from(self.ping_variance_ms());
        delay.max(1) as u64
    }
}
