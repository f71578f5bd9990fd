//! # Ingest Pipeline
//!
//! Inbound packets arrive as `<u32 tag><body>`; clone and ack streams
//! carry an LZ4 body of 3-bit-tagged sub-records, everything else is a
//! plain byte body. Malformed input is logged and dropped — a client
//! can corrupt its own replica, never the server.
//!
//! Acks for processed records accumulate in the client's ack buffer
//! and flush opportunistically as the compressed bound approaches; the
//! remainder leaves at the next tick.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use parallax_net::hash::{
    MSG_GAME_STATE_ACK, MSG_NET_GAME_EVENT, MSG_PACKED_ACKS, MSG_REQUEST_OBJECT_IDS,
    MSG_TIME_SYNC, MSG_TIME_SYNC_REQ, NET_ACKS, NET_CLONES,
};
use parallax_net::{
    decompress_body, maybe_flush_buffer, ByteBuffer, ByteReader, MessageBuffer, PacketSink,
    Reliability, SYNC_CHANNEL,
};

use crate::client::{Client, ClientRegistry};
use crate::entity::{make_entity_handle, NetObjEntityType, SyncEntityState};
use crate::events::EVENT_ENTITY_CREATED;
use crate::server::ServerGameState;
use crate::tree::SyncParseState;

/// Ids requested by a client in one batch.
const OBJECT_ID_BATCH: usize = 32;

/// Structural failures that end parsing of a clone stream.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The stream ended in the middle of a record.
    #[error("clone stream ended mid-record")]
    ShortRead,

    /// A create carried an entity type tag outside the known range.
    #[error("unknown entity type tag {0}")]
    UnknownEntityType(u32),
}

impl ServerGameState {
    /// Routes one inbound packet from `client`.
    pub fn handle_packet(&self, client: &Arc<Client>, registry: &ClientRegistry, packet: &[u8]) {
        let mut reader = ByteReader::new(packet);

        let Some(msg_type) = reader.read_u32() else {
            return;
        };

        match msg_type {
            tag if tag == NET_CLONES || tag == NET_ACKS => {
                if !self.config.enabled {
                    return;
                }

                let body = match decompress_body(reader.read_rest()) {
                    Ok(body) => body,
                    Err(error) => {
                        tracing::warn!(net_id = client.net_id(), %error, "bad clone body");
                        return;
                    }
                };

                if tag == NET_CLONES {
                    self.parse_clone_packet(client, registry, &body);
                } else {
                    self.parse_ack_packet(client, &body);
                }
            }
            tag if tag == MSG_REQUEST_OBJECT_IDS => {
                self.send_object_ids(client, OBJECT_ID_BATCH);
            }
            tag if tag == MSG_GAME_STATE_ACK => {
                self.handle_game_state_ack(client, &mut reader);
            }
            tag if tag == MSG_TIME_SYNC_REQ => {
                self.handle_time_sync_request(client, &mut reader);
            }
            tag if tag == MSG_NET_GAME_EVENT => {
                self.relay_net_game_event(client, &mut reader, registry);
            }
            other => {
                tracing::debug!(net_id = client.net_id(), tag = other, "unhandled message");
            }
        }
    }

    fn parse_clone_packet(&self, client: &Arc<Client>, registry: &ClientRegistry, body: &[u8]) {
        let mut msg = MessageBuffer::from_bytes(body);

        // take the ack buffer out so record handlers can append
        // without holding the client lock across entity work
        let mut ack = std::mem::replace(
            &mut client.data().ack_buffer,
            MessageBuffer::new(0),
        );

        let mut creates = 0u32;
        let mut syncs = 0u32;
        let mut removes = 0u32;

        while !msg.is_at_end() {
            let Some(tag) = msg.read(3) else {
                break;
            };

            let result = match tag {
                1 => {
                    creates += 1;
                    self.process_clone_create(client, registry, &mut msg, &mut ack)
                }
                2 => {
                    syncs += 1;
                    self.process_clone_sync(client, registry, &mut msg, &mut ack)
                }
                3 => {
                    removes += 1;
                    self.process_clone_remove(client, registry, &mut msg, &mut ack)
                }
                4 => self.process_clone_takeover(client, registry, &mut msg),
                5 => self.process_set_timestamp(client, &mut msg, &mut ack),
                7 => break,
                other => {
                    tracing::debug!(net_id = client.net_id(), tag = other, "unknown clone record");
                    break;
                }
            };

            if let Err(error) = result {
                tracing::warn!(net_id = client.net_id(), %error, "ending clone parse");
                break;
            }
        }

        tracing::trace!(net_id = client.net_id(), creates, syncs, removes, "clone stream parsed");

        client.data().ack_buffer = ack;
    }

    fn process_clone_create(
        &self,
        client: &Arc<Client>,
        registry: &ClientRegistry,
        msg: &mut MessageBuffer,
        ack: &mut MessageBuffer,
    ) -> Result<(), IngestError> {
        let mut object_id = 0u16;
        let applied = self.process_clone_record(client, registry, msg, 1, &mut object_id)?;

        if applied {
            self.object_ids.lock().mark_used(object_id);
        }

        ack.write(3, 1);
        ack.write(13, u32::from(object_id));
        maybe_flush_buffer(ack, MSG_PACKED_ACKS, 0, &**client);

        self.log.write_with(|| {
            format!("create: cl {}, id {}", client.net_id(), object_id)
        });

        Ok(())
    }

    fn process_clone_sync(
        &self,
        client: &Arc<Client>,
        registry: &ClientRegistry,
        msg: &mut MessageBuffer,
        ack: &mut MessageBuffer,
    ) -> Result<(), IngestError> {
        let mut object_id = 0u16;
        self.process_clone_record(client, registry, msg, 2, &mut object_id)?;

        ack.write(3, 2);
        ack.write(13, u32::from(object_id));
        maybe_flush_buffer(ack, MSG_PACKED_ACKS, 0, &**client);

        self.log.write_with(|| {
            format!("sync: cl {}, id {}", client.net_id(), object_id)
        });

        Ok(())
    }

    fn process_clone_remove(
        &self,
        client: &Arc<Client>,
        registry: &ClientRegistry,
        msg: &mut MessageBuffer,
        ack: &mut MessageBuffer,
    ) -> Result<(), IngestError> {
        let object_id = msg.read(13).ok_or(IngestError::ShortRead)? as u16;

        // ack the remove whether or not it is accepted
        ack.write(3, 3);
        ack.write(13, u32::from(object_id));
        maybe_flush_buffer(ack, MSG_PACKED_ACKS, 0, &**client);

        if let Some(entity) = self.store.get(object_id) {
            if let Some(owner) = entity.owner() {
                if owner.net_id() != client.net_id() {
                    self.log.write_with(|| {
                        format!("remove: wrong owner for {object_id}")
                    });
                    return Ok(());
                }
            }
        }

        self.remove_clone(client, object_id, registry);
        Ok(())
    }

    fn process_clone_takeover(
        &self,
        client: &Arc<Client>,
        registry: &ClientRegistry,
        msg: &mut MessageBuffer,
    ) -> Result<(), IngestError> {
        let target_net_id = msg.read(16).ok_or(IngestError::ShortRead)? as u16;
        let object_id = msg.read(13).ok_or(IngestError::ShortRead)? as u16;

        let Some(entity) = self.store.get(object_id) else {
            return Ok(());
        };

        let target = if target_net_id != 0 {
            match registry.get_by_net_id(target_net_id) {
                Some(target) => target,
                None => return Ok(()),
            }
        } else {
            client.clone()
        };

        if let Some(owner) = entity.owner() {
            // already owned by the requested target
            if owner.net_id() == target.net_id() {
                return Ok(());
            }

            // only the current owner may give an entity away
            if owner.net_id() != client.net_id() {
                self.log.write_with(|| {
                    format!(
                        "takeover: rejecting migration of {} to {} submitted by {}",
                        object_id,
                        target.net_id(),
                        client.net_id()
                    )
                });
                return Ok(());
            }
        }

        self.log.write_with(|| {
            format!("takeover: migrating {} to {}", object_id, target.net_id())
        });

        self.reassign_entity(entity.handle, &target);
        Ok(())
    }

    fn process_set_timestamp(
        &self,
        client: &Arc<Client>,
        msg: &mut MessageBuffer,
        ack: &mut MessageBuffer,
    ) -> Result<(), IngestError> {
        let new_ts = msg.read(32).ok_or(IngestError::ShortRead)?;

        // echo so the client knows which timestamp later acks carry
        ack.write(3, 5);
        ack.write(32, new_ts);
        maybe_flush_buffer(ack, MSG_PACKED_ACKS, 0, &**client);

        let mut data = client.data();
        if new_ts > data.ack_ts {
            data.ack_ts = new_ts;
            data.sync_ts = new_ts;
        }

        Ok(())
    }

    /// Shared body of create and sync records. Returns whether the
    /// record mutated an entity; `out_object_id` is set as soon as the
    /// id is read so rejected records still ack.
    fn process_clone_record(
        &self,
        client: &Arc<Client>,
        registry: &ClientRegistry,
        msg: &mut MessageBuffer,
        parsing_type: u8,
        out_object_id: &mut u16,
    ) -> Result<bool, IngestError> {
        let object_id = msg.read(13).ok_or(IngestError::ShortRead)? as u16;
        *out_object_id = object_id;

        let object_type = if parsing_type == 1 {
            let raw = msg.read(4).ok_or(IngestError::ShortRead)?;
            Some(
                NetObjEntityType::from_wire(raw as u8)
                    .ok_or(IngestError::UnknownEntityType(raw))?,
            )
        } else {
            None
        };

        let length = msg.read(12).ok_or(IngestError::ShortRead)? as usize;

        let timestamp = {
            let mut data = client.data();
            if data.player_id.is_none() {
                data.player_id = Some(0);
            }
            data.sync_ts
        };

        let mut payload = vec![0u8; length];
        if !msg.read_bits(&mut payload, length * 8) {
            return Err(IngestError::ShortRead);
        }

        let Some(slot_id) = client.slot_id() else {
            return Ok(false);
        };
        let slot = slot_id as usize;

        let frame_index = self.frame_index();

        let existing = self.store.get(object_id);
        let valid = existing.as_ref().is_some_and(|e| e.owner().is_some());

        let mut created_here = false;

        let entity = if parsing_type == 1 {
            if valid {
                let entity = existing.expect("valid implies present");

                if object_type != Some(entity.entity_type) {
                    let owner_net = entity.owner().map_or(-1, |c| i32::from(c.net_id()));
                    self.log.write_with(|| {
                        format!(
                            "create: client {} tried to create entity {} ({:?}), already owned by {} ({:?})",
                            client.net_id(),
                            object_id,
                            object_type,
                            owner_net,
                            entity.entity_type
                        )
                    });
                    tracing::warn!(
                        net_id = client.net_id(),
                        object_id,
                        "duplicate create with conflicting type"
                    );
                }

                return Ok(false);
            }

            let entity = SyncEntityState::new(
                client,
                object_type.expect("create carries a type"),
                make_entity_handle(0, object_id),
                frame_index,
            );
            self.store.insert(entity.clone());
            created_here = true;
            entity
        } else {
            match existing {
                Some(entity) if valid => entity,
                _ => {
                    self.log.write_with(|| format!("sync: wrong entity ({object_id})"));
                    return Ok(false);
                }
            }
        };

        entity.did_deletion.reset(slot);
        entity.acked_creation.set(slot);

        let Some(owner) = entity.owner() else {
            return Ok(false);
        };
        if owner.net_id() != client.net_id() {
            self.log.write_with(|| format!("clone: wrong owner ({object_id})"));
            return Ok(false);
        }

        entity.timestamp.store(timestamp, Ordering::Relaxed);

        {
            let mut parse_state = SyncParseState {
                buffer: MessageBuffer::from_bytes(&payload),
                parsing_type,
                timestamp,
                frame_index,
            };

            let mut tree = entity.sync_tree.lock();
            if let Err(error) = tree.parse(&mut parse_state) {
                tracing::debug!(object_id, %error, "dropping malformed clone payload");
                return Ok(false);
            }

            entity.reset_last_resends();

            if parsing_type == 1 {
                tree.visit(&mut |node| {
                    node.acked_players.reset_all();
                    true
                });
            }
        }

        if entity.entity_type == NetObjEntityType::Player {
            let first_player_entity = {
                let mut data = client.data();
                let was_empty = data.player_entity.upgrade().is_none();
                data.player_entity = Arc::downgrade(&entity);
                was_empty
            };

            // a fresh player needs the whole ownership map once
            if first_player_entity {
                self.send_world_grid(None, Some(client), registry);
            }
        }

        if created_here {
            let script_handle = self.make_script_handle(&entity);
            self.events.queue_event(EVENT_ENTITY_CREATED, script_handle);

            // the id may still be queued for removal from its previous
            // life on any client; a fresh create supersedes that
            registry.for_all_clients(|other| {
                other.pending_removals().reset(object_id);
            });
        }

        Ok(true)
    }

    fn parse_ack_packet(&self, client: &Arc<Client>, body: &[u8]) {
        let Some(slot_id) = client.slot_id() else {
            return;
        };
        let slot = slot_id as usize;

        let mut msg = MessageBuffer::from_bytes(body);

        while !msg.is_at_end() {
            match msg.read(3) {
                Some(1) => {
                    let Some(object_id) = msg.read(13) else {
                        return;
                    };

                    if let Some(entity) = self.store.get(object_id as u16) {
                        entity.sync_tree.lock().visit(&mut |node| {
                            node.acked_players.set(slot);
                            true
                        });

                        entity.did_deletion.reset(slot);
                        entity.acked_creation.set(slot);
                    }
                }
                Some(3) => {
                    let Some(object_id) = msg.read(13) else {
                        return;
                    };
                    client.pending_removals().reset(object_id as u16);
                }
                _ => return, // end tag or unknown
            }
        }
    }

    fn handle_game_state_ack(&self, client: &Arc<Client>, reader: &mut ByteReader<'_>) {
        let Some(frame_index) = reader.read_u64() else {
            return;
        };
        let Some(ignore_count) = reader.read_u8() else {
            return;
        };

        let mut ignored = HashSet::new();
        for _ in 0..ignore_count {
            let Some(object_id) = reader.read_u16() else {
                return;
            };
            ignored.insert(make_entity_handle(0, object_id));
        }

        let Some(slot_id) = client.slot_id() else {
            return;
        };
        let slot = slot_id as usize;

        let sent_ids = client.data().ids_for_game_state.remove(&frame_index);

        if let Some(sent_ids) = sent_ids {
            for object_id in sent_ids {
                let Some(entity) = self.store.get(object_id) else {
                    continue;
                };

                if !entity.acked_creation.test(slot) || entity.did_deletion.test(slot) {
                    continue;
                }

                if ignored.contains(&entity.handle) {
                    continue;
                }

                entity.sync_tree.lock().visit(&mut |node| {
                    if node.frame_index <= frame_index {
                        node.acked_players.set(slot);
                    }
                    true
                });
            }
        }

        client.data().sync_frame_index = frame_index;
    }

    fn handle_time_sync_request(&self, client: &Arc<Client>, reader: &mut ByteReader<'_>) {
        let Some(request_time) = reader.read_u32() else {
            return;
        };
        let Some(request_sequence) = reader.read_u32() else {
            return;
        };

        let mut message = ByteBuffer::new();
        message.write_u32(MSG_TIME_SYNC);
        message.write_u32(request_time);
        message.write_u32(request_sequence);
        message.write_u32((self.now_ms() & 0xFFFF_FFFF) as u32);

        client.send_packet(SYNC_CHANNEL, &message.into_vec(), Reliability::ReliableReplayed);
    }

    fn relay_net_game_event(
        &self,
        client: &Arc<Client>,
        reader: &mut ByteReader<'_>,
        registry: &ClientRegistry,
    ) {
        let Some(target_count) = reader.read_u8() else {
            return;
        };

        let mut targets = Vec::with_capacity(target_count as usize);
        for _ in 0..target_count {
            let Some(net_id) = reader.read_u16() else {
                return;
            };
            targets.push(net_id);
        }

        let mut message = ByteBuffer::new();
        message.write_u32(MSG_NET_GAME_EVENT);
        message.write_u16(client.net_id());
        message.write_bytes(reader.read_rest());

        let payload = message.into_vec();

        for net_id in targets {
            if let Some(target) = registry.get_by_net_id(net_id) {
                target.send_packet(SYNC_CHANNEL, &payload, Reliability::Reliable);
            }
        }
    }
}
