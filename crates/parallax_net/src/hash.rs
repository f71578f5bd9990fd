//! # Wire Tags
//!
//! Every message carries a 4-byte tag derived from its name with the
//! Jenkins one-at-a-time hash, so the handler table stays stable across
//! builds without a central id registry.

/// Jenkins one-at-a-time hash of a message name.
#[must_use]
pub const fn wire_hash(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0;
    let mut i = 0;

    while i < bytes.len() {
        hash = hash.wrapping_add(bytes[i] as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
        i += 1;
    }

    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// Server → client: compressed clone frame.
pub const MSG_PACKED_CLONES: u32 = wire_hash("msgPackedClones");
/// Server → client: compressed ack frame.
pub const MSG_PACKED_ACKS: u32 = wire_hash("msgPackedAcks");
/// Server → client: object-id grant.
pub const MSG_OBJECT_IDS: u32 = wire_hash("msgObjectIds");
/// Server → client: world-grid ownership delta or snapshot.
pub const MSG_WORLD_GRID: u32 = wire_hash("msgWorldGrid");
/// Server → client: time-sync response.
pub const MSG_TIME_SYNC: u32 = wire_hash("msgTimeSync");
/// Client → server: time-sync request.
pub const MSG_TIME_SYNC_REQ: u32 = wire_hash("msgTimeSyncReq");
/// Relayed opaque game event, both directions.
pub const MSG_NET_GAME_EVENT: u32 = wire_hash("msgNetGameEvent");
/// Client → server: request a batch of object ids.
pub const MSG_REQUEST_OBJECT_IDS: u32 = wire_hash("msgRequestObjectIds");
/// Client → server: coarse per-frame ack.
pub const MSG_GAME_STATE_ACK: u32 = wire_hash("gameStateAck");
/// Client → server: compressed clone stream.
pub const NET_CLONES: u32 = wire_hash("netClones");
/// Client → server: compressed ack stream.
pub const NET_ACKS: u32 = wire_hash("netAcks");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_distinct_tags() {
        let tags = [
            MSG_PACKED_CLONES,
            MSG_PACKED_ACKS,
            MSG_OBJECT_IDS,
            MSG_WORLD_GRID,
            MSG_TIME_SYNC,
            MSG_TIME_SYNC_REQ,
            MSG_NET_GAME_EVENT,
            MSG_REQUEST_OBJECT_IDS,
            MSG_GAME_STATE_ACK,
            NET_CLONES,
            NET_ACKS,
        ];

        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_stable_across_calls() {
        assert_eq!(wire_hash("netClones"), wire_hash("netClones"));
        assert_ne!(wire_hash("netClones"), wire_hash("netclones"));
    }
}
