//! # Sync Trees
//!
//! Every entity carries a sync tree: a small composite of nodes that
//! know how to parse themselves from an inbound payload, serialize the
//! un-acknowledged subset for a given client, and track per-node
//! freshness (`frame_index`) and per-slot acknowledgement.
//!
//! The scheduler and ingest path only speak [`SyncTree`]; the concrete
//! node layout behind it is free to change per entity type.
//!
//! ## Wire shape
//!
//! Nodes serialize in a fixed per-type order, each as
//! `<1-bit present><fields>`. A create carries every node; a sync
//! carries only nodes the target slot has not acknowledged.

use glam::Vec3;
use thiserror::Error;

use parallax_net::MessageBuffer;

use crate::bitset::SlotBitset;
use crate::entity::NetObjEntityType;

/// Seats tracked per vehicle.
pub const MAX_VEHICLE_SEATS: usize = 16;

/// Raised when a payload ends mid-node.
#[derive(Error, Debug)]
#[error("sync tree payload ended mid-node")]
pub struct TreeParseError;

/// Per-node replication bookkeeping.
#[derive(Debug, Default)]
pub struct SyncNodeState {
    /// Server frame that last dirtied this node.
    pub frame_index: u64,
    /// Client slots that have acknowledged the node at its current
    /// frame.
    pub acked_players: SlotBitset,
}

/// Camera block synced on player entities.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlayerCameraData {
    /// 0 = pedestrian position, 1 = free cam, 2 = pedestrian + offset.
    pub cam_mode: u8,
    /// Free-cam position, used in mode 1.
    pub free_cam_pos: [f32; 3],
    /// Offset from the pedestrian, used in mode 2.
    pub cam_off: [f32; 3],
    /// Pitch angle (radians).
    pub camera_x: f32,
    /// Heading angle (radians).
    pub camera_z: f32,
}

/// Seat table synced on vehicle entities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VehicleGameStateData {
    /// Object id of the ped in each seat, 0 = vacant.
    pub occupants: [u16; MAX_VEHICLE_SEATS],
    /// Bit per seat holding a player-controlled ped.
    pub player_occupants: u16,
}

impl Default for VehicleGameStateData {
    fn default() -> Self {
        Self {
            occupants: [0; MAX_VEHICLE_SEATS],
            player_occupants: 0,
        }
    }
}

impl VehicleGameStateData {
    /// Returns true when any seat holds a player.
    #[inline]
    #[must_use]
    pub fn has_player_occupants(&self) -> bool {
        self.player_occupants != 0
    }

    /// Marks a seat as player-occupied.
    #[inline]
    pub fn set_player_occupant(&mut self, seat: usize) {
        if seat < MAX_VEHICLE_SEATS {
            self.player_occupants |= 1 << seat;
        }
    }

    /// Clears the player bit for a seat.
    #[inline]
    pub fn reset_player_occupant(&mut self, seat: usize) {
        if seat < MAX_VEHICLE_SEATS {
            self.player_occupants &= !(1 << seat);
        }
    }
}

/// Seat linkage synced on ped and player entities. `-1` means "none".
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PedGameStateData {
    /// Vehicle the ped currently occupies.
    pub cur_vehicle: i32,
    /// Seat within that vehicle.
    pub cur_vehicle_seat: i32,
    /// Shadow of `cur_vehicle` from the previous occupant pass.
    pub last_vehicle: i32,
    /// Shadow of `cur_vehicle_seat` from the previous occupant pass.
    pub last_vehicle_seat: i32,
}

impl Default for PedGameStateData {
    fn default() -> Self {
        Self {
            cur_vehicle: -1,
            cur_vehicle_seat: -1,
            last_vehicle: -1,
            last_vehicle_seat: -1,
        }
    }
}

/// Inbound parse context.
pub struct SyncParseState {
    /// The decompressed node payload.
    pub buffer: MessageBuffer,
    /// 1 = create, 2 = sync.
    pub parsing_type: u8,
    /// Client time attached to the mutation.
    pub timestamp: u32,
    /// Server frame performing the parse; stamped on dirtied nodes.
    pub frame_index: u64,
}

/// Outbound serialize context.
pub struct SyncUnparseState<'a> {
    /// Destination scratch buffer.
    pub buffer: &'a mut MessageBuffer,
    /// 1 = create, 2 = sync.
    pub sync_type: u8,
    /// Slot of the client the payload is for.
    pub target_slot: usize,
}

/// The per-entity parser/serializer seam.
pub trait SyncTree: Send {
    /// Applies an inbound payload. Dirtied nodes take the parse frame
    /// and drop their acks.
    fn parse(&mut self, state: &mut SyncParseState) -> Result<(), TreeParseError>;

    /// Serializes the subset relevant to `state.target_slot`. Returns
    /// false when there is nothing to send.
    fn unparse(&mut self, state: &mut SyncUnparseState<'_>) -> bool;

    /// Visits every node until the visitor returns false.
    fn visit(&mut self, visitor: &mut dyn FnMut(&mut SyncNodeState) -> bool);

    /// Last synced position.
    fn position(&self) -> [f32; 3];

    /// Camera block, if this tree carries one.
    fn player_camera(&self) -> Option<PlayerCameraData>;

    /// Seat table, if this tree carries one.
    fn vehicle_game_state(&self) -> Option<VehicleGameStateData>;

    /// Mutable seat table for occupant bookkeeping.
    fn vehicle_game_state_mut(&mut self) -> Option<&mut VehicleGameStateData>;

    /// Seat linkage, if this tree carries one.
    fn ped_game_state(&self) -> Option<PedGameStateData>;

    /// Mutable seat linkage for occupant bookkeeping.
    fn ped_game_state_mut(&mut self) -> Option<&mut PedGameStateData>;
}

/// Focus position of a player entity: the synced position, overridden
/// by the camera block according to its mode.
#[must_use]
pub fn focus_position(tree: &dyn SyncTree) -> Vec3 {
    let pos = Vec3::from(tree.position());

    let Some(cam) = tree.player_camera() else {
        return pos;
    };

    match cam.cam_mode {
        1 => Vec3::from(cam.free_cam_pos),
        2 => pos + Vec3::from(cam.cam_off),
        _ => pos,
    }
}

enum NodePayload {
    Position([f32; 3]),
    Camera(PlayerCameraData),
    VehicleState(VehicleGameStateData),
    PedState(PedGameStateData),
}

struct TreeNode {
    state: SyncNodeState,
    payload: NodePayload,
}

/// The standard node layout: position on everything, a camera on
/// players, a seat table on vehicles, seat linkage on peds and
/// players.
pub struct StandardSyncTree {
    nodes: Vec<TreeNode>,
}

/// Builds the standard tree for an entity type.
#[must_use]
pub fn make_sync_tree(entity_type: NetObjEntityType) -> Box<dyn SyncTree> {
    let mut nodes = vec![TreeNode {
        state: SyncNodeState::default(),
        payload: NodePayload::Position([0.0; 3]),
    }];

    if entity_type == NetObjEntityType::Player {
        nodes.push(TreeNode {
            state: SyncNodeState::default(),
            payload: NodePayload::Camera(PlayerCameraData::default()),
        });
    }

    if entity_type.is_vehicle() {
        nodes.push(TreeNode {
            state: SyncNodeState::default(),
            payload: NodePayload::VehicleState(VehicleGameStateData::default()),
        });
    }

    if matches!(entity_type, NetObjEntityType::Ped | NetObjEntityType::Player) {
        nodes.push(TreeNode {
            state: SyncNodeState::default(),
            payload: NodePayload::PedState(PedGameStateData::default()),
        });
    }

    Box::new(StandardSyncTree { nodes })
}

fn read_f32(buffer: &mut MessageBuffer) -> Result<f32, TreeParseError> {
    buffer.read(32).map(f32::from_bits).ok_or(TreeParseError)
}

fn read_bit(buffer: &mut MessageBuffer) -> Result<bool, TreeParseError> {
    buffer.read(1).map(|b| b != 0).ok_or(TreeParseError)
}

impl NodePayload {
    fn parse(&mut self, buffer: &mut MessageBuffer) -> Result<(), TreeParseError> {
        match self {
            NodePayload::Position(pos) => {
                for axis in pos.iter_mut() {
                    *axis = read_f32(buffer)?;
                }
            }
            NodePayload::Camera(cam) => {
                cam.cam_mode = buffer.read(2).ok_or(TreeParseError)? as u8;
                for axis in cam.free_cam_pos.iter_mut() {
                    *axis = read_f32(buffer)?;
                }
                for axis in cam.cam_off.iter_mut() {
                    *axis = read_f32(buffer)?;
                }
                cam.camera_x = read_f32(buffer)?;
                cam.camera_z = read_f32(buffer)?;
            }
            NodePayload::VehicleState(veh) => {
                let mask = buffer.read(MAX_VEHICLE_SEATS).ok_or(TreeParseError)? as u16;
                for seat in 0..MAX_VEHICLE_SEATS {
                    if mask & (1 << seat) != 0 {
                        veh.occupants[seat] = buffer.read(13).ok_or(TreeParseError)? as u16;
                    } else {
                        veh.occupants[seat] = 0;
                    }
                }
                veh.player_occupants =
                    buffer.read(MAX_VEHICLE_SEATS).ok_or(TreeParseError)? as u16;
            }
            NodePayload::PedState(ped) => {
                if read_bit(buffer)? {
                    ped.cur_vehicle = buffer.read(13).ok_or(TreeParseError)? as i32;
                    ped.cur_vehicle_seat = buffer.read(5).ok_or(TreeParseError)? as i32;
                } else {
                    ped.cur_vehicle = -1;
                    ped.cur_vehicle_seat = -1;
                }
            }
        }
        Ok(())
    }

    fn unparse(&self, buffer: &mut MessageBuffer) -> bool {
        match self {
            NodePayload::Position(pos) => pos
                .iter()
                .all(|axis| buffer.write(32, axis.to_bits())),
            NodePayload::Camera(cam) => {
                buffer.write(2, u32::from(cam.cam_mode))
                    && cam.free_cam_pos.iter().all(|a| buffer.write(32, a.to_bits()))
                    && cam.cam_off.iter().all(|a| buffer.write(32, a.to_bits()))
                    && buffer.write(32, cam.camera_x.to_bits())
                    && buffer.write(32, cam.camera_z.to_bits())
            }
            NodePayload::VehicleState(veh) => {
                let mut mask = 0u32;
                for (seat, &occupant) in veh.occupants.iter().enumerate() {
                    if occupant != 0 {
                        mask |= 1 << seat;
                    }
                }

                if !buffer.write(MAX_VEHICLE_SEATS, mask) {
                    return false;
                }
                for &occupant in veh.occupants.iter().filter(|&&o| o != 0) {
                    if !buffer.write(13, u32::from(occupant)) {
                        return false;
                    }
                }
                buffer.write(MAX_VEHICLE_SEATS, u32::from(veh.player_occupants))
            }
            NodePayload::PedState(ped) => {
                let in_vehicle =
                    ped.cur_vehicle >= 0 && (ped.cur_vehicle_seat as usize) < MAX_VEHICLE_SEATS;

                if !buffer.write(1, u32::from(in_vehicle)) {
                    return false;
                }
                if in_vehicle {
                    return buffer.write(13, ped.cur_vehicle as u32)
                        && buffer.write(5, ped.cur_vehicle_seat as u32);
                }
                true
            }
        }
    }
}

impl SyncTree for StandardSyncTree {
    fn parse(&mut self, state: &mut SyncParseState) -> Result<(), TreeParseError> {
        for node in &mut self.nodes {
            if !read_bit(&mut state.buffer)? {
                continue;
            }

            node.payload.parse(&mut state.buffer)?;
            node.state.frame_index = state.frame_index;
            node.state.acked_players.reset_all();
        }
        Ok(())
    }

    fn unparse(&mut self, state: &mut SyncUnparseState<'_>) -> bool {
        let mut wrote_any = false;

        for node in &self.nodes {
            let wanted =
                state.sync_type == 1 || !node.state.acked_players.test(state.target_slot);

            if !state.buffer.write(1, u32::from(wanted)) {
                return wrote_any;
            }
            if wanted {
                if !node.payload.unparse(state.buffer) {
                    return wrote_any;
                }
                wrote_any = true;
            }
        }

        wrote_any
    }

    fn visit(&mut self, visitor: &mut dyn FnMut(&mut SyncNodeState) -> bool) {
        for node in &mut self.nodes {
            if !visitor(&mut node.state) {
                break;
            }
        }
    }

    fn position(&self) -> [f32; 3] {
        for node in &self.nodes {
            if let NodePayload::Position(pos) = &node.payload {
                return *pos;
            }
        }
        [0.0; 3]
    }

    fn player_camera(&self) -> Option<PlayerCameraData> {
        self.nodes.iter().find_map(|n| match &n.payload {
            NodePayload::Camera(cam) => Some(*cam),
            _ => None,
        })
    }

    fn vehicle_game_state(&self) -> Option<VehicleGameStateData> {
        self.nodes.iter().find_map(|n| match &n.payload {
            NodePayload::VehicleState(veh) => Some(*veh),
            _ => None,
        })
    }

    fn vehicle_game_state_mut(&mut self) -> Option<&mut VehicleGameStateData> {
        self.nodes.iter_mut().find_map(|n| match &mut n.payload {
            NodePayload::VehicleState(veh) => Some(veh),
            _ => None,
        })
    }

    fn ped_game_state(&self) -> Option<PedGameStateData> {
        self.nodes.iter().find_map(|n| match &n.payload {
            NodePayload::PedState(ped) => Some(*ped),
            _ => None,
        })
    }

    fn ped_game_state_mut(&mut self) -> Option<&mut PedGameStateData> {
        self.nodes.iter_mut().find_map(|n| match &mut n.payload {
            NodePayload::PedState(ped) => Some(ped),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_unparse(tree: &mut dyn SyncTree, sync_type: u8, slot: usize) -> Vec<u8> {
        let mut buffer = MessageBuffer::new(1200);
        let mut state = SyncUnparseState {
            buffer: &mut buffer,
            sync_type,
            target_slot: slot,
        };
        assert!(tree.unparse(&mut state));
        let len = buffer.current_bit() / 8 + 1;
        buffer.bytes()[..len].to_vec()
    }

    fn parse_into(tree: &mut dyn SyncTree, payload: &[u8], parsing_type: u8, frame: u64) {
        let mut state = SyncParseState {
            buffer: MessageBuffer::from_bytes(payload),
            parsing_type,
            timestamp: 0,
            frame_index: frame,
        };
        tree.parse(&mut state).unwrap();
    }

    #[test]
    fn test_player_tree_roundtrip() {
        let mut source = make_sync_tree(NetObjEntityType::Player);

        // seed state via a parse of a hand-built payload
        let mut payload = MessageBuffer::new(256);
        // position node
        payload.write(1, 1);
        for axis in [10.0f32, 20.0, 30.0] {
            payload.write(32, axis.to_bits());
        }
        // camera node: mode 1, free cam at (1,2,3)
        payload.write(1, 1);
        payload.write(2, 1);
        for axis in [1.0f32, 2.0, 3.0] {
            payload.write(32, axis.to_bits());
        }
        for axis in [0.0f32, 0.0, 0.0] {
            payload.write(32, axis.to_bits());
        }
        payload.write(32, 0.5f32.to_bits());
        payload.write(32, 1.5f32.to_bits());
        // ped state node: not in a vehicle
        payload.write(1, 1);
        payload.write(1, 0);

        let bytes = payload.bytes()[..payload.data_length()].to_vec();
        parse_into(&mut *source, &bytes, 1, 7);

        assert_eq!(source.position(), [10.0, 20.0, 30.0]);
        let cam = source.player_camera().unwrap();
        assert_eq!(cam.cam_mode, 1);
        assert_eq!(cam.free_cam_pos, [1.0, 2.0, 3.0]);

        // focus position follows the free cam in mode 1
        assert_eq!(focus_position(&*source), Vec3::new(1.0, 2.0, 3.0));

        // a create unparse feeds an identical replica
        let wire = full_unparse(&mut *source, 1, 0);
        let mut replica = make_sync_tree(NetObjEntityType::Player);
        parse_into(&mut *replica, &wire, 1, 8);

        assert_eq!(replica.position(), [10.0, 20.0, 30.0]);
        assert_eq!(replica.player_camera().unwrap(), cam);
    }

    #[test]
    fn test_sync_skips_acked_nodes() {
        let mut tree = make_sync_tree(NetObjEntityType::Automobile);

        // everything acked by slot 3: nothing to send
        tree.visit(&mut |node| {
            node.acked_players.set(3);
            true
        });

        let mut buffer = MessageBuffer::new(1200);
        let mut state = SyncUnparseState {
            buffer: &mut buffer,
            sync_type: 2,
            target_slot: 3,
        };
        assert!(!tree.unparse(&mut state));

        // a different slot still gets the full payload
        let mut buffer = MessageBuffer::new(1200);
        let mut state = SyncUnparseState {
            buffer: &mut buffer,
            sync_type: 2,
            target_slot: 4,
        };
        assert!(tree.unparse(&mut state));
    }

    #[test]
    fn test_parse_stamps_frame_and_clears_acks() {
        let mut tree = make_sync_tree(NetObjEntityType::Object);
        tree.visit(&mut |node| {
            node.acked_players.set(0);
            true
        });

        let wire = full_unparse(&mut *tree, 1, 0);
        parse_into(&mut *tree, &wire, 2, 41);

        tree.visit(&mut |node| {
            assert_eq!(node.frame_index, 41);
            assert!(!node.acked_players.test(0));
            true
        });
    }

    #[test]
    fn test_vehicle_seat_roundtrip() {
        let mut tree = make_sync_tree(NetObjEntityType::Boat);
        {
            let veh = tree.vehicle_game_state_mut().unwrap();
            veh.occupants[0] = 150;
            veh.occupants[7] = 44;
            veh.set_player_occupant(0);
        }

        let wire = full_unparse(&mut *tree, 1, 0);
        let mut replica = make_sync_tree(NetObjEntityType::Boat);
        parse_into(&mut *replica, &wire, 1, 1);

        let veh = replica.vehicle_game_state().unwrap();
        assert_eq!(veh.occupants[0], 150);
        assert_eq!(veh.occupants[7], 44);
        assert_eq!(veh.occupants[1], 0);
        assert!(veh.has_player_occupants());
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut tree = make_sync_tree(NetObjEntityType::Object);
        let mut state = SyncParseState {
            buffer: MessageBuffer::from_bytes(&[0xFF]),
            parsing_type: 1,
            timestamp: 0,
            frame_index: 0,
        };
        assert!(tree.parse(&mut state).is_err());
    }
}
