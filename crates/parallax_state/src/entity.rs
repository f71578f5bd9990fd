//! # Entities
//!
//! The canonical server-side record of one replicated object, plus the
//! 13-bit-id handle scheme shared with the wire format.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::client::Client;
use crate::tree::{make_sync_tree, SyncTree};
use crate::MAX_CLIENTS;

/// Entity categories carried as a 4-bit tag in create records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetObjEntityType {
    /// Ground vehicle.
    Automobile = 0,
    /// Two-wheeler.
    Bike = 1,
    /// Watercraft.
    Boat = 2,
    /// Animated world door.
    Door = 3,
    /// Helicopter.
    Heli = 4,
    /// Generic prop.
    Object = 5,
    /// Non-player character.
    Ped = 6,
    /// Collectible.
    Pickup = 7,
    /// Pickup spawn point.
    PickupPlacement = 8,
    /// Fixed-wing aircraft.
    Plane = 9,
    /// Submersible.
    Submarine = 10,
    /// A connected player's avatar.
    Player = 11,
    /// Towed trailer.
    Trailer = 12,
    /// Rail vehicle.
    Train = 13,
}

impl NetObjEntityType {
    /// Decodes the 4-bit wire tag.
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Automobile,
            1 => Self::Bike,
            2 => Self::Boat,
            3 => Self::Door,
            4 => Self::Heli,
            5 => Self::Object,
            6 => Self::Ped,
            7 => Self::Pickup,
            8 => Self::PickupPlacement,
            9 => Self::Plane,
            10 => Self::Submarine,
            11 => Self::Player,
            12 => Self::Trailer,
            13 => Self::Train,
            _ => return None,
        })
    }

    /// Vehicle types carry a seat table and keep their replicas alive
    /// while a player is aboard.
    #[must_use]
    pub const fn is_vehicle(self) -> bool {
        matches!(
            self,
            Self::Automobile
                | Self::Bike
                | Self::Boat
                | Self::Heli
                | Self::Plane
                | Self::Submarine
                | Self::Trailer
                | Self::Train
        )
    }
}

/// Composes an entity handle: the allocating player in the high half,
/// the 13-bit object id in the low 16 bits.
#[inline]
#[must_use]
pub const fn make_entity_handle(player_id: u8, object_id: u16) -> u32 {
    ((player_id as u32 + 1) << 16) | object_id as u32
}

/// One live entity.
///
/// The strong owner is the entity store's list; every other reference
/// (id index, player-entity backlinks, in-flight commands) is weak or
/// transient. Ack matrices and sync timers are atomics because the
/// scheduler's worker commands race the ingest thread on them by
/// design; a stale read costs one redundant resend at worst.
pub struct SyncEntityState {
    /// `((player_id + 1) << 16) | object_id`.
    pub handle: u32,
    /// Wire type, fixed at creation.
    pub entity_type: NetObjEntityType,
    /// The client currently authoritative for this entity.
    pub client: RwLock<Weak<Client>>,
    /// The entity's parser/serializer.
    pub sync_tree: Mutex<Box<dyn SyncTree>>,
    /// Last inbound client time.
    pub timestamp: AtomicU32,
    /// Last server frame that touched the entity.
    pub frame_index: AtomicU64,
    /// Bit per slot: has the client acknowledged the create?
    pub acked_creation: crate::bitset::SlotBitset,
    /// Bit per slot: has the creation been retracted by culling?
    pub did_deletion: crate::bitset::SlotBitset,
    /// Per-slot time (ms) of the last successful sync write.
    pub last_syncs: [AtomicU64; MAX_CLIENTS],
    /// Per-slot time (ms) any update was last queued.
    pub last_resends: [AtomicU64; MAX_CLIENTS],
    /// Script-handle pool slot, allocated lazily.
    pub guid: Mutex<Option<u32>>,
    /// Set once at removal start; later removals are no-ops.
    pub deleting: AtomicBool,
}

impl SyncEntityState {
    /// Creates an entity owned by `owner` with the standard sync tree
    /// for its type.
    #[must_use]
    pub fn new(
        owner: &Arc<Client>,
        entity_type: NetObjEntityType,
        handle: u32,
        frame_index: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            entity_type,
            client: RwLock::new(Arc::downgrade(owner)),
            sync_tree: Mutex::new(make_sync_tree(entity_type)),
            timestamp: AtomicU32::new(0),
            frame_index: AtomicU64::new(frame_index),
            acked_creation: crate::bitset::SlotBitset::new(),
            did_deletion: crate::bitset::SlotBitset::new(),
            last_syncs: std::array::from_fn(|_| AtomicU64::new(0)),
            last_resends: std::array::from_fn(|_| AtomicU64::new(0)),
            guid: Mutex::new(None),
            deleting: AtomicBool::new(false),
        })
    }

    /// The 13-bit wire id.
    #[inline]
    #[must_use]
    pub const fn object_id(&self) -> u16 {
        (self.handle & 0xFFFF) as u16
    }

    /// Upgrades the owner reference.
    #[must_use]
    pub fn owner(&self) -> Option<Arc<Client>> {
        self.client.read().upgrade()
    }

    /// Clears the resend timers for every slot, making the entity
    /// eligible for immediate re-send.
    pub fn reset_last_resends(&self) {
        for slot in &self.last_resends {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Clears both sync and resend timers for every slot.
    pub fn reset_sync_timers(&self) {
        for slot in &self.last_syncs {
            slot.store(0, Ordering::Relaxed);
        }
        self.reset_last_resends();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::test_client;

    #[test]
    fn test_handle_composition() {
        let handle = make_entity_handle(0, 1);
        assert_eq!(handle, 0x0001_0001);
        assert_eq!(handle & 0xFFFF, 1);

        let handle = make_entity_handle(5, 8191);
        assert_eq!(handle >> 16, 6);
        assert_eq!(handle & 0xFFFF, 8191);
    }

    #[test]
    fn test_type_wire_roundtrip() {
        for raw in 0..=13u8 {
            let ty = NetObjEntityType::from_wire(raw).unwrap();
            assert_eq!(ty as u8, raw);
        }
        assert!(NetObjEntityType::from_wire(14).is_none());
        assert!(NetObjEntityType::from_wire(15).is_none());
    }

    #[test]
    fn test_vehicle_classification() {
        assert!(NetObjEntityType::Automobile.is_vehicle());
        assert!(NetObjEntityType::Train.is_vehicle());
        assert!(!NetObjEntityType::Ped.is_vehicle());
        assert!(!NetObjEntityType::Player.is_vehicle());
        assert!(!NetObjEntityType::Door.is_vehicle());
    }

    #[test]
    fn test_owner_weakness() {
        let client = test_client(1, Some(0));
        let entity = SyncEntityState::new(
            &client,
            NetObjEntityType::Object,
            make_entity_handle(0, 10),
            0,
        );

        assert!(entity.owner().is_some());
        drop(client);
        assert!(entity.owner().is_none());
    }

    #[test]
    fn test_timer_reset() {
        let client = test_client(1, Some(0));
        let entity =
            SyncEntityState::new(&client, NetObjEntityType::Object, make_entity_handle(0, 2), 0);

        entity.last_syncs[3].store(100, Ordering::Relaxed);
        entity.last_resends[3].store(100, Ordering::Relaxed);

        entity.reset_sync_timers();
        assert_eq!(entity.last_syncs[3].load(Ordering::Relaxed), 0);
        assert_eq!(entity.last_resends[3].load(Ordering::Relaxed), 0);
    }
}
