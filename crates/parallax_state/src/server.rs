//! # Server Game State
//!
//! The authoritative core: owns the entity table and, once per network
//! tick, decides for every connected client which entities to create,
//! sync, or remove on that client's replica, assembling the decisions
//! into compressed bit-packed frames on the worker pool.
//!
//! ## Per-tick flow
//!
//! 1. finalize removals deferred from the previous frame
//! 2. stamp the frame on every entity
//! 3. refresh world-grid claims and occupant/camera bookkeeping
//! 4. snapshot `(entity, position, vehicle state, owner)` under the
//!    shared list lock, detaching the per-client work from it
//! 5. per client: flush acks, gate on `syncing`, build the command
//!    list (time marker, creates/syncs under cadence throttles,
//!    pending removals), submit to the worker pool
//! 6. advance the frame index

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use parking_lot::Mutex;

use parallax_net::{ByteBuffer, MessageBuffer, PacketSink, Reliability};
use parallax_net::hash::{MSG_OBJECT_IDS, MSG_WORLD_GRID};

use crate::client::{Client, ClientRegistry};
use crate::commands::{SyncCommandList, SyncCommandState};
use crate::config::SyncConfig;
use crate::entity::{NetObjEntityType, SyncEntityState};
use crate::events::{GameEventSink, EVENT_ENTITY_REMOVED};
use crate::log::ReplicationLog;
use crate::math::{build_view_matrix, is_in_frustum};
use crate::object_ids::{encode_gap_runs, ObjectIdPool};
use crate::script_handles::ScriptHandlePool;
use crate::store::EntityStore;
use crate::tree::{focus_position, SyncUnparseState, VehicleGameStateData, MAX_VEHICLE_SEATS};
use crate::workers::WorkerPool;
use crate::world_grid::WorldGrid;
use crate::{MAX_CLONE_PAYLOAD_BYTES, SCRATCH_BUFFER_BYTES};

use parallax_net::SYNC_CHANNEL;

/// Entities beyond this XY distance from a client's focus are not
/// created on that client.
const CREATE_RADIUS: f32 = 350.0;

/// Orphans farther than this from every remaining player are deleted
/// instead of rehomed.
const REHOME_RADIUS: f32 = 300.0;

/// Base interval between syncs of one entity to one client.
const SYNC_DELAY_BASE_MS: u64 = 50;

/// Interval for entities outside the client's view frustum.
const SYNC_DELAY_OFFSCREEN_MS: u64 = 150;

/// Interval beyond 250 units.
const SYNC_DELAY_FAR_MS: u64 = 250;

/// Interval beyond 500 units.
const SYNC_DELAY_DISTANT_MS: u64 = 500;

/// Frames a coarse-ack record is kept before being pruned.
const GAME_STATE_ACK_WINDOW: u64 = 100;

fn frustum_radius(entity_type: NetObjEntityType) -> f32 {
    match entity_type {
        NetObjEntityType::Ped | NetObjEntityType::Player => 2.5,
        NetObjEntityType::Heli | NetObjEntityType::Boat | NetObjEntityType::Plane => 15.0,
        _ => 5.0,
    }
}

/// The authoritative game-state component.
pub struct ServerGameState {
    pub(crate) config: SyncConfig,
    pub(crate) store: EntityStore,
    pub(crate) object_ids: Mutex<ObjectIdPool>,
    pub(crate) world_grid: Mutex<WorldGrid>,
    pub(crate) script_handles: Mutex<ScriptHandlePool>,
    pub(crate) frame_index: AtomicU64,
    pub(crate) workers: WorkerPool,
    pub(crate) events: Arc<dyn GameEventSink>,
    pub(crate) log: ReplicationLog,
    pub(crate) deferred_removals: Mutex<Vec<u16>>,
    start: Instant,
}

impl ServerGameState {
    /// Creates the component with the given configuration and event
    /// sink.
    #[must_use]
    pub fn new(config: SyncConfig, events: Arc<dyn GameEventSink>) -> Self {
        let log = ReplicationLog::new(config.log_file.as_deref());
        let workers = WorkerPool::new(config.workers);

        Self {
            config,
            store: EntityStore::new(),
            object_ids: Mutex::new(ObjectIdPool::new()),
            world_grid: Mutex::new(WorldGrid::new()),
            script_handles: Mutex::new(ScriptHandlePool::new()),
            frame_index: AtomicU64::new(0),
            workers,
            events,
            log,
            deferred_removals: Mutex::new(Vec::new()),
            start: Instant::now(),
        }
    }

    /// The active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Milliseconds since the component was created.
    #[inline]
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Current server frame.
    #[inline]
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::Relaxed)
    }

    /// Number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.store.len()
    }

    /// Looks an entity up by wire id.
    #[must_use]
    pub fn get_entity(&self, object_id: u16) -> Option<Arc<SyncEntityState>> {
        self.store.get(object_id)
    }

    /// Looks an entity up by its script handle.
    #[must_use]
    pub fn get_entity_by_script_handle(&self, script_handle: u32) -> Option<Arc<SyncEntityState>> {
        let slot = ScriptHandlePool::slot_of(script_handle);
        let handle = self.script_handles.lock().entity_handle_at(slot)?;
        self.store.get((handle & 0xFFFF) as u16)
    }

    /// Finds or allocates the entity's stable script handle.
    ///
    /// Returns 0 when the pool is exhausted.
    #[must_use]
    pub fn make_script_handle(&self, entity: &Arc<SyncEntityState>) -> u32 {
        let mut guid = entity.guid.lock();

        if guid.is_none() {
            *guid = self.script_handles.lock().allocate_for(entity.handle);
        }

        guid.map(ScriptHandlePool::script_handle).unwrap_or(0)
    }

    /// Runs one replication frame for every connected client.
    pub fn tick(&self, registry: &ClientRegistry) {
        for object_id in std::mem::take(&mut *self.deferred_removals.lock()) {
            self.finalize_removal(object_id);
        }

        let frame_index = self.frame_index();
        self.store.stamp_frames(frame_index);

        self.update_world_grid(registry);
        self.update_entities();

        // detach per-client work from the list lock
        let relevant: Vec<(
            Arc<SyncEntityState>,
            Vec3,
            Option<VehicleGameStateData>,
            Option<Arc<Client>>,
        )> = self.store.with_list(|list| {
            list.iter()
                .map(|entity| {
                    let tree = entity.sync_tree.lock();
                    let position = Vec3::from(tree.position());
                    let vehicle_data = if entity.entity_type.is_vehicle() {
                        tree.vehicle_game_state()
                    } else {
                        None
                    };
                    drop(tree);

                    (entity.clone(), position, vehicle_data, entity.owner())
                })
                .collect()
        });

        let now = self.now_ms();

        registry.for_all_clients(|client| {
            self.tick_client(client, &relevant, frame_index, now);
        });

        self.frame_index.fetch_add(1, Ordering::Relaxed);
    }

    fn tick_client(
        &self,
        client: &Arc<Client>,
        relevant: &[(
            Arc<SyncEntityState>,
            Vec3,
            Option<VehicleGameStateData>,
            Option<Arc<Client>>,
        )],
        frame_index: u64,
        now: u64,
    ) {
        let Some(slot_id) = client.slot_id() else {
            return;
        };
        let slot = slot_id as usize;

        {
            let data = client.data();
            if data.player_id.is_none() {
                return;
            }
        }

        client.flush_acks();

        {
            let mut data = client.data();
            if data.syncing {
                // previous frame still in flight, drop this one
                return;
            }
            data.syncing = true;
        }

        let mut list = SyncCommandList::new(client.clone(), frame_index);

        list.push(Box::new(move |state: &mut SyncCommandState| {
            state.clone_buffer.write(3, 5);
            state.clone_buffer.write(32, (now & 0xFFFF_FFFF) as u32);
            state.clone_buffer.write(32, (now >> 32) as u32);
            state.maybe_flush();
        }));

        let resend_delay = client.peer().resend_delay_ms();

        let player_entity = client.data().player_entity.upgrade();
        let player_pos = player_entity
            .as_ref()
            .map(|entity| focus_position(&**entity.sync_tree.lock()));
        let view_matrix = client.data().view_matrix;

        for (entity, entity_pos, vehicle_data, entity_client) in relevant {
            let Some(entity_client) = entity_client else {
                continue;
            };

            let has_created = entity.acked_creation.test(slot);

            let mut should_be_created = !self.config.distance_culling;

            // players always carry their own entities
            if client.net_id() == entity_client.net_id() {
                should_be_created = true;
            }

            if !should_be_created {
                match player_pos {
                    Some(focus) => {
                        let dx = entity_pos.x - focus.x;
                        let dy = entity_pos.y - focus.y;

                        if dx * dx + dy * dy < CREATE_RADIUS * CREATE_RADIUS {
                            should_be_created = true;
                        }
                    }
                    // without a player entity there is nothing to cull against
                    None => should_be_created = true,
                }
            }

            if !should_be_created {
                if entity.entity_type == NetObjEntityType::Player {
                    should_be_created = true;
                } else if entity.entity_type.is_vehicle() {
                    if let Some(vehicle) = vehicle_data {
                        if vehicle.has_player_occupants() {
                            should_be_created = true;
                        }
                    }
                }
            }

            let mut sync_delay = SYNC_DELAY_BASE_MS;

            if self.config.radius_frequency {
                if !is_in_frustum(*entity_pos, frustum_radius(entity.entity_type), &view_matrix) {
                    sync_delay = SYNC_DELAY_OFFSCREEN_MS;
                }

                if let Some(focus) = player_pos {
                    let dist = focus.distance_squared(*entity_pos);

                    if dist > 500.0 * 500.0 {
                        sync_delay = SYNC_DELAY_DISTANT_MS;
                    } else if dist > 250.0 * 250.0 {
                        sync_delay = SYNC_DELAY_FAR_MS;
                    }
                }
            }

            if should_be_created {
                let sync_type = if !has_created || entity.did_deletion.test(slot) {
                    self.log.write_with(|| {
                        format!(
                            "tick: {}creating object {} for {}",
                            if has_created { "re" } else { "" },
                            entity.object_id(),
                            client.net_id()
                        )
                    });
                    1u8
                } else {
                    2u8
                };

                let mut should_send = true;

                let last_resend = entity.last_resends[slot].load(Ordering::Relaxed);
                if last_resend != 0 && now.saturating_sub(last_resend) < resend_delay {
                    self.log.write_with(|| {
                        format!(
                            "tick: skipping resend for object {} (delay {}ms)",
                            entity.object_id(),
                            resend_delay
                        )
                    });
                    should_send = false;
                }

                if sync_type == 2 && should_send {
                    let last_sync = entity.last_syncs[slot].load(Ordering::Relaxed);
                    if now.saturating_sub(last_sync) < sync_delay {
                        self.log.write_with(|| {
                            format!(
                                "tick: skipping sync for object {} (delay {}ms)",
                                entity.object_id(),
                                sync_delay
                            )
                        });
                        should_send = false;
                    }
                }

                if should_send {
                    let entity = entity.clone();
                    let owner = entity_client.clone();

                    list.push(Box::new(move |state: &mut SyncCommandState| {
                        write_clone_record(state, &entity, &owner, sync_type, now);
                    }));
                }
            } else if has_created {
                self.log.write_with(|| {
                    format!(
                        "tick: distance-culling object {} for {}",
                        entity.object_id(),
                        client.net_id()
                    )
                });

                client.pending_removals().set(entity.object_id());
                entity.acked_creation.reset(slot);
                entity.did_deletion.set(slot);
            }
        }

        // the bitset is read without the client lock; a stale bit only
        // duplicates or delays a removal record
        list.push(Box::new(|state: &mut SyncCommandState| {
            let client = state.client.clone();
            client.pending_removals().for_each_set(|object_id| {
                state.clone_buffer.write(3, 3);
                state.clone_buffer.write(13, u32::from(object_id));
                state.maybe_flush();
            });
        }));

        let job_client = client.clone();
        let submitted = self.workers.try_post(Box::new(move || {
            list.execute();
            job_client.data().syncing = false;
        }));

        if !submitted {
            tracing::warn!(net_id = client.net_id(), "worker pool full, dropping frame");
            // release the gate so the next frame can try again
            client.data().syncing = false;
        }

        let mut data = client.data();
        data.ids_for_game_state
            .retain(|&frame, _| frame + GAME_STATE_ACK_WINDOW >= frame_index);
    }

    /// Recomputes camera view matrices and vehicle seat occupancy from
    /// the freshly parsed trees.
    pub(crate) fn update_entities(&self) {
        let entities: Vec<Arc<SyncEntityState>> =
            self.store.with_list(|list| list.to_vec());

        for entity in &entities {
            if entity.entity_type == NetObjEntityType::Player {
                if let Some(client) = entity.owner() {
                    let (position, camera) = {
                        let tree = entity.sync_tree.lock();
                        (Vec3::from(tree.position()), tree.player_camera())
                    };

                    if let Some(camera) = camera {
                        let translation = match camera.cam_mode {
                            1 => Vec3::from(camera.free_cam_pos),
                            2 => position + Vec3::from(camera.cam_off),
                            _ => position,
                        };

                        client.data().view_matrix =
                            build_view_matrix(translation, camera.camera_x, camera.camera_z);
                    }
                }
            }

            if matches!(
                entity.entity_type,
                NetObjEntityType::Ped | NetObjEntityType::Player
            ) {
                self.update_occupancy(entity);
            }
        }
    }

    fn update_occupancy(&self, entity: &Arc<SyncEntityState>) {
        let ped_id = entity.object_id();

        let Some(ped_state) = entity.sync_tree.lock().ped_game_state() else {
            return;
        };

        if ped_state.last_vehicle == ped_state.cur_vehicle
            && ped_state.last_vehicle_seat == ped_state.cur_vehicle_seat
        {
            return;
        }

        // vacate the old seat if it still names this ped
        if ped_state.last_vehicle >= 0 {
            if let Some(vehicle) = self.store.get(ped_state.last_vehicle as u16) {
                let seat = ped_state.last_vehicle_seat;
                let mut tree = vehicle.sync_tree.lock();

                if let Some(state) = tree.vehicle_game_state_mut() {
                    if (0..MAX_VEHICLE_SEATS as i32).contains(&seat)
                        && state.occupants[seat as usize] == ped_id
                    {
                        state.occupants[seat as usize] = 0;
                        state.reset_player_occupant(seat as usize);
                    }
                }
            }
        }

        // claim the new seat if vacant
        if ped_state.cur_vehicle >= 0 {
            if let Some(vehicle) = self.store.get(ped_state.cur_vehicle as u16) {
                let seat = ped_state.cur_vehicle_seat;
                let mut tree = vehicle.sync_tree.lock();

                if let Some(state) = tree.vehicle_game_state_mut() {
                    if (0..MAX_VEHICLE_SEATS as i32).contains(&seat)
                        && state.occupants[seat as usize] == 0
                    {
                        state.occupants[seat as usize] = ped_id;

                        if entity.entity_type == NetObjEntityType::Player {
                            state.set_player_occupant(seat as usize);
                        }
                    }
                }
            }
        }

        let mut tree = entity.sync_tree.lock();
        if let Some(state) = tree.ped_game_state_mut() {
            state.last_vehicle = state.cur_vehicle;
            state.last_vehicle_seat = state.cur_vehicle_seat;
        }
    }

    /// Refreshes every client's world-grid claims, broadcasting
    /// changed entries.
    pub(crate) fn update_world_grid(&self, registry: &ClientRegistry) {
        registry.for_all_clients(|client| {
            let Some(slot_id) = client.slot_id() else {
                return;
            };

            let Some(player_entity) = client.data().player_entity.upgrade() else {
                return;
            };

            let focus = focus_position(&**player_entity.sync_tree.lock());

            let changed = self.world_grid.lock().update_for_slot(slot_id, focus);
            for flat_index in changed {
                self.send_world_grid(Some(flat_index), None, registry);
            }
        });
    }

    /// Sends one grid entry (or the whole table) to one client (or
    /// everyone).
    pub(crate) fn send_world_grid(
        &self,
        entry: Option<usize>,
        client: Option<&Arc<Client>>,
        registry: &ClientRegistry,
    ) {
        let mut message = ByteBuffer::new();
        message.write_u32(MSG_WORLD_GRID);

        {
            let grid = self.world_grid.lock();
            let bytes = grid.as_bytes();

            let (base, length) = match entry {
                Some(flat_index) => (flat_index * 3, 3usize),
                None => (0, bytes.len()),
            };

            message.write_u16(base as u16);
            message.write_u16(length as u16);
            message.write_bytes(&bytes[base..base + length]);
        }

        let payload = message.into_vec();

        match client {
            Some(client) => {
                client.send_packet(SYNC_CHANNEL, &payload, Reliability::ReliableReplayed);
            }
            None => registry.for_all_clients(|client| {
                client.send_packet(SYNC_CHANNEL, &payload, Reliability::ReliableReplayed);
            }),
        }
    }

    /// Grants a batch of object ids to a client as gap/length runs.
    pub fn send_object_ids(&self, client: &Arc<Client>, count: usize) {
        let ids = {
            let mut data = client.data();
            let mut pool = self.object_ids.lock();

            let ids = pool.allocate(count);
            for &id in &ids {
                data.object_ids.insert(id);
            }
            ids
        };

        let pairs = encode_gap_runs(&ids);

        let mut message = ByteBuffer::new();
        message.write_u32(MSG_OBJECT_IDS);
        message.write_u16(pairs.len() as u16);
        for (gap, length) in pairs {
            message.write_u16(gap);
            message.write_u16(length);
        }

        client.send_packet(SYNC_CHANNEL, &message.into_vec(), Reliability::ReliableReplayed);
    }

    /// Begins removal of an entity at the request of `client` (or on
    /// its behalf after a drop). Idempotent.
    pub fn remove_clone(&self, client: &Arc<Client>, object_id: u16, registry: &ClientRegistry) {
        self.log.write_with(|| {
            format!("remove: client {} deleting object {}", client.net_id(), object_id)
        });

        let Some(entity) = self.store.get(object_id) else {
            return;
        };

        if entity.deleting.swap(true, Ordering::SeqCst) {
            return;
        }

        self.on_clone_remove(&entity);

        // every other client owes the removal record
        registry.for_all_clients(|target| {
            if target.net_id() != client.net_id() {
                target.pending_removals().set(object_id);
            }
        });

        // scripts see the event this frame; the table entry goes away
        // at the start of the next tick
        self.deferred_removals.lock().push(object_id);
    }

    fn on_clone_remove(&self, entity: &Arc<SyncEntityState>) {
        let script_handle = self.make_script_handle(entity);
        self.events.queue_event(EVENT_ENTITY_REMOVED, script_handle);

        // vacate the seat this ped occupied
        if matches!(
            entity.entity_type,
            NetObjEntityType::Ped | NetObjEntityType::Player
        ) {
            let ped_id = entity.object_id();
            let ped_state = entity.sync_tree.lock().ped_game_state();

            if let Some(ped_state) = ped_state {
                if ped_state.cur_vehicle >= 0 {
                    if let Some(vehicle) = self.store.get(ped_state.cur_vehicle as u16) {
                        let seat = ped_state.cur_vehicle_seat;
                        let mut tree = vehicle.sync_tree.lock();

                        if let Some(state) = tree.vehicle_game_state_mut() {
                            if (0..MAX_VEHICLE_SEATS as i32).contains(&seat)
                                && state.occupants[seat as usize] == ped_id
                            {
                                state.occupants[seat as usize] = 0;
                                state.reset_player_occupant(seat as usize);
                            }
                        }
                    }
                }
            }
        }

        let object_id = entity.object_id();
        let stolen = self.object_ids.lock().release_if_stolen(object_id);

        if stolen {
            if let Some(owner) = entity.owner() {
                owner.data().object_ids.remove(&object_id);
            }
        }
    }

    pub(crate) fn finalize_removal(&self, object_id: u16) {
        self.object_ids.lock().release_used(object_id);

        if let Some(entity) = self.store.remove(object_id) {
            if let Some(slot) = entity.guid.lock().take() {
                self.script_handles.lock().free(slot);
            }
        }
    }

    /// Migrates authority over an entity to `target`.
    pub fn reassign_entity(&self, handle: u32, target: &Arc<Client>) {
        let object_id = (handle & 0xFFFF) as u16;

        let Some(entity) = self.store.get(object_id) else {
            return;
        };

        let old_owner = {
            let mut owner = entity.client.write();
            std::mem::replace(&mut *owner, Arc::downgrade(target)).upgrade()
        };

        self.log.write_with(|| {
            format!(
                "reassign: obj id {}, old client {}, new client {}",
                object_id,
                old_owner.as_ref().map_or(-1, |c| i32::from(c.net_id())),
                target.net_id()
            )
        });

        if let Some(old_owner) = &old_owner {
            old_owner.data().object_ids.remove(&object_id);
        }

        target.data().object_ids.insert(object_id);

        // on removal the id returns to the global pool, not to whoever
        // happened to own it last
        self.object_ids.lock().mark_stolen(object_id);

        // resync everything to everyone immediately so ownership
        // changes propagate without cadence delays
        entity.reset_sync_timers();

        let next_frame = self.frame_index() + 1;
        entity.sync_tree.lock().visit(&mut |node| {
            node.frame_index = next_frame;
            node.acked_players.reset_all();
            true
        });
    }

    /// Tears down a departed client: releases its grid claims, rehomes
    /// or deletes its entities, returns its object ids, and clears its
    /// ack bits everywhere.
    pub fn handle_client_drop(&self, client: &Arc<Client>, registry: &ClientRegistry) {
        if !self.config.enabled {
            return;
        }

        self.log.write_with(|| {
            format!("drop: client {} leaving, reassigning entities", client.net_id())
        });

        if let Some(slot_id) = client.slot_id() {
            let changed = self.world_grid.lock().release_slot(slot_id);
            for flat_index in changed {
                self.send_world_grid(Some(flat_index), None, registry);
            }
        }

        let mut to_erase: Vec<u16> = Vec::new();

        self.store.with_list(|list| {
            for entity in list {
                let owned_elsewhere = entity
                    .owner()
                    .is_some_and(|owner| owner.net_id() != client.net_id());

                if owned_elsewhere {
                    continue;
                }

                let position = Vec3::from(entity.sync_tree.lock().position());

                let mut candidates: Vec<(f32, Arc<Client>)> = Vec::new();

                registry.for_all_clients(|target| {
                    if target.net_id() == client.net_id() || target.slot_id().is_none() {
                        return;
                    }

                    let mut distance = f32::MAX;

                    let player = target.data().player_entity.upgrade();
                    if let Some(player) = player {
                        let focus = focus_position(&**player.sync_tree.lock());
                        distance = focus.distance_squared(position);
                    }

                    candidates.push((distance, target.clone()));
                });

                candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

                // a player's entity leaves with its player
                if entity.entity_type == NetObjEntityType::Player {
                    candidates.clear();
                }

                match candidates.first() {
                    Some((distance, heir)) if *distance < REHOME_RADIUS * REHOME_RADIUS => {
                        self.log.write_with(|| {
                            format!(
                                "drop: reassigning entity {} from {} to {}",
                                entity.object_id(),
                                client.name(),
                                heir.name()
                            )
                        });
                        self.reassign_entity(entity.handle, heir);
                    }
                    _ => {
                        self.log.write_with(|| {
                            format!("drop: no candidates for entity {}, deleting", entity.object_id())
                        });
                        to_erase.push(entity.object_id());
                    }
                }
            }
        });

        for object_id in to_erase {
            self.remove_clone(client, object_id, registry);
        }

        {
            let data = client.data();
            let mut pool = self.object_ids.lock();
            for &object_id in &data.object_ids {
                pool.release_sent(object_id);
            }
        }

        if let Some(slot_id) = client.slot_id() {
            let slot = slot_id as usize;

            self.store.with_list(|list| {
                for entity in list {
                    entity.acked_creation.reset(slot);
                    entity.sync_tree.lock().visit(&mut |node| {
                        node.acked_players.reset(slot);
                        true
                    });
                }
            });
        }
    }

    /// Formats the object-id utilization dump, globally and per
    /// client.
    #[must_use]
    pub fn dump_object_ids(&self, registry: &ClientRegistry) -> String {
        use std::fmt::Write;

        let (used, sent) = {
            let pool = self.object_ids.lock();
            (pool.used_count(), pool.sent_count())
        };

        let mut out = String::new();
        let percent = if sent > 0 {
            used as f32 / sent as f32 * 100.0
        } else {
            0.0
        };
        let _ = writeln!(
            out,
            "GLOBAL: {used}/{sent} object IDs used/sent ({percent:.2} percent)"
        );

        registry.for_all_clients(|client| {
            let data = client.data();
            let live = data
                .object_ids
                .iter()
                .filter(|&&id| self.store.get(id).is_some())
                .count();
            let total = data.object_ids.len();
            let percent = if total > 0 {
                live as f32 / total as f32 * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "{}: {live}/{total} object IDs used/sent ({percent:.2} percent)",
                client.name()
            );
        });

        out
    }
}

/// Serializes one entity into a client's frame: unparse into the
/// thread-local scratch buffer, then `<tag><id><owner><type?>
/// <timestamp><len><payload>` with rollback-and-flush on overflow.
fn write_clone_record(
    state: &mut SyncCommandState,
    entity: &Arc<SyncEntityState>,
    owner: &Arc<Client>,
    sync_type: u8,
    now: u64,
) {
    let Some(slot_id) = state.client.slot_id() else {
        return;
    };
    let slot = slot_id as usize;

    thread_local! {
        static SCRATCH: RefCell<MessageBuffer> =
            RefCell::new(MessageBuffer::new(SCRATCH_BUFFER_BYTES));
    }

    SCRATCH.with(|scratch| {
        let mut scratch = scratch.borrow_mut();
        scratch.set_current_bit(0);

        let wrote_data = {
            let mut unparse = SyncUnparseState {
                buffer: &mut scratch,
                sync_type,
                target_slot: slot,
            };
            entity.sync_tree.lock().unparse(&mut unparse)
        };

        if !wrote_data {
            return;
        }

        let length = (scratch.current_bit() / 8 + 1).min(SCRATCH_BUFFER_BYTES);
        if length > MAX_CLONE_PAYLOAD_BYTES {
            return;
        }

        let start_bit = state.clone_buffer.current_bit();

        state
            .client
            .data()
            .ids_for_game_state
            .entry(state.frame_index)
            .or_default()
            .push(entity.object_id());

        state.clone_buffer.write(3, u32::from(sync_type));
        state.clone_buffer.write(13, u32::from(entity.object_id()));
        state.clone_buffer.write(16, u32::from(owner.net_id()));

        if sync_type == 1 {
            state.clone_buffer.write(4, entity.entity_type as u32);
        }

        state
            .clone_buffer
            .write(32, entity.timestamp.load(Ordering::Relaxed));
        state.clone_buffer.write(12, length as u32);

        if !state
            .clone_buffer
            .write_bits(&scratch.bytes()[..length], length * 8)
        {
            // oversize: roll the record back and cut the frame here
            state.clone_buffer.set_current_bit(start_bit);
            state.flush();
        } else {
            entity.last_syncs[slot].store(now, Ordering::Relaxed);
            entity.last_resends[slot].store(now, Ordering::Relaxed);
        }

        state.maybe_flush();
    });
}
