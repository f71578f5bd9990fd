//! # Clients
//!
//! Per-connection replication state and the registry the scheduler
//! iterates. The transport owns connection lifecycle; this module only
//! tracks what replication needs to know about each connection.
//!
//! ## Locking
//!
//! All mutable per-client state lives behind one mutex
//! ([`Client::data`]), taken after the entity-level locks and before
//! the id-pool mutex. `pending_removals` sits outside the mutex on
//! purpose: the removal-emit command reads it lock-free from a worker
//! thread, and a one-frame-stale read only delays or duplicates a
//! removal record.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use glam::Mat4;
use parking_lot::{Mutex, MutexGuard, RwLock};

use parallax_net::{
    flush_buffer, hash::MSG_PACKED_ACKS, maybe_flush_buffer, MessageBuffer, PacketSink, PeerStats,
    Reliability,
};

use crate::bitset::AtomicIdBitset;
use crate::entity::SyncEntityState;
use crate::ACK_BUFFER_BYTES;

/// Mutable replication state of one client.
pub struct GameStateClientData {
    /// Pending ack bit stream, flushed opportunistically and at tick
    /// start.
    pub ack_buffer: MessageBuffer,
    /// Object ids currently allocated to this client.
    pub object_ids: BTreeSet<u16>,
    /// The client's own player entity.
    pub player_entity: Weak<SyncEntityState>,
    /// Present once the first clone packet has arrived.
    pub player_id: Option<u8>,
    /// True while an outbound frame for this client is in flight.
    pub syncing: bool,
    /// View matrix derived from the player's camera block.
    pub view_matrix: Mat4,
    /// Which object ids were written in which frame, for coarse acks.
    pub ids_for_game_state: HashMap<u64, Vec<u16>>,
    /// Timestamp the client will attach to its next acks.
    pub ack_ts: u32,
    /// Timestamp applied to inbound mutations.
    pub sync_ts: u32,
    /// Highest frame the client has coarsely acknowledged.
    pub sync_frame_index: u64,
}

impl Default for GameStateClientData {
    fn default() -> Self {
        Self {
            ack_buffer: MessageBuffer::new(ACK_BUFFER_BYTES),
            object_ids: BTreeSet::new(),
            player_entity: Weak::new(),
            player_id: None,
            syncing: false,
            view_matrix: Mat4::IDENTITY,
            ids_for_game_state: HashMap::new(),
            ack_ts: 0,
            sync_ts: 0,
            sync_frame_index: 0,
        }
    }
}

/// A connected client as replication sees it.
pub struct Client {
    net_id: u16,
    slot_id: Option<u8>,
    name: String,
    sink: Arc<dyn PacketSink>,
    peer: PeerStats,
    pending_removals: AtomicIdBitset,
    data: Mutex<GameStateClientData>,
}

impl Client {
    /// Creates a client bound to a transport sink. `slot_id` is `None`
    /// for connections that never entered the world.
    #[must_use]
    pub fn new(
        net_id: u16,
        slot_id: Option<u8>,
        name: impl Into<String>,
        sink: Arc<dyn PacketSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            net_id,
            slot_id,
            name: name.into(),
            sink,
            peer: PeerStats::default(),
            pending_removals: AtomicIdBitset::new(),
            data: Mutex::new(GameStateClientData::default()),
        })
    }

    /// Transport-level id, unique per connection.
    #[inline]
    #[must_use]
    pub const fn net_id(&self) -> u16 {
        self.net_id
    }

    /// World slot, the index into every ack matrix.
    #[inline]
    #[must_use]
    pub const fn slot_id(&self) -> Option<u8> {
        self.slot_id
    }

    /// Display name, used in logs only.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link-quality figures for this connection.
    #[inline]
    #[must_use]
    pub const fn peer(&self) -> &PeerStats {
        &self.peer
    }

    /// Object ids owed a removal record.
    #[inline]
    #[must_use]
    pub const fn pending_removals(&self) -> &AtomicIdBitset {
        &self.pending_removals
    }

    /// Locks the client's replication state.
    pub fn data(&self) -> MutexGuard<'_, GameStateClientData> {
        self.data.lock()
    }

    /// Flushes any pending acks to the transport.
    pub fn flush_acks(&self) {
        let mut data = self.data();
        flush_buffer(&mut data.ack_buffer, MSG_PACKED_ACKS, 0, &*self.sink);
    }

    /// Flushes pending acks if they are close to the frame bound.
    pub fn maybe_flush_acks(&self) {
        let mut data = self.data();
        maybe_flush_buffer(&mut data.ack_buffer, MSG_PACKED_ACKS, 0, &*self.sink);
    }
}

impl PacketSink for Client {
    fn send_packet(&self, channel: u8, payload: &[u8], reliability: Reliability) {
        self.sink.send_packet(channel, payload, reliability);
    }
}

/// All connected clients, iterated every tick.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<BTreeMap<u16, Arc<Client>>>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client, replacing any previous connection with the same
    /// net id.
    pub fn register(&self, client: Arc<Client>) {
        self.clients.write().insert(client.net_id(), client);
    }

    /// Removes and returns a client.
    pub fn remove(&self, net_id: u16) -> Option<Arc<Client>> {
        self.clients.write().remove(&net_id)
    }

    /// Looks a client up by net id.
    #[must_use]
    pub fn get_by_net_id(&self, net_id: u16) -> Option<Arc<Client>> {
        self.clients.read_recursive().get(&net_id).cloned()
    }

    /// Calls `f` for every client, in net-id order.
    ///
    /// Reentrant: `f` may itself call back into the registry.
    pub fn for_all_clients(&self, mut f: impl FnMut(&Arc<Client>)) {
        let clients: Vec<Arc<Client>> =
            self.clients.read_recursive().values().cloned().collect();
        for client in &clients {
            f(client);
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read_recursive().len()
    }

    /// Returns true when no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) struct NullSink;

    impl PacketSink for NullSink {
        fn send_packet(&self, _: u8, _: &[u8], _: Reliability) {}
    }

    pub(crate) fn test_client(net_id: u16, slot_id: Option<u8>) -> Arc<Client> {
        Client::new(net_id, slot_id, format!("client{net_id}"), Arc::new(NullSink))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_registry_lookup_and_order() {
        let registry = ClientRegistry::new();
        registry.register(test_client(7, Some(1)));
        registry.register(test_client(3, Some(0)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_by_net_id(7).unwrap().net_id(), 7);
        assert!(registry.get_by_net_id(9).is_none());

        let mut order = Vec::new();
        registry.for_all_clients(|c| order.push(c.net_id()));
        assert_eq!(order, vec![3, 7]);

        assert!(registry.remove(3).is_some());
        assert!(registry.remove(3).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_is_reentrant() {
        let registry = ClientRegistry::new();
        registry.register(test_client(1, Some(0)));
        registry.register(test_client(2, Some(1)));

        let mut pairs = 0;
        registry.for_all_clients(|a| {
            registry.for_all_clients(|b| {
                if a.net_id() != b.net_id() {
                    pairs += 1;
                }
            });
        });
        assert_eq!(pairs, 2);
    }

    #[test]
    fn test_client_data_defaults() {
        let client = test_client(5, Some(2));
        let data = client.data();

        assert!(data.player_id.is_none());
        assert!(!data.syncing);
        assert!(data.object_ids.is_empty());
        assert!(data.player_entity.upgrade().is_none());
    }
}
