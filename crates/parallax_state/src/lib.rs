//! # Parallax State
//!
//! The authoritative game-state synchronization core of the parallax
//! host. Clients stream entity updates in; this crate owns the
//! canonical entity table and streams interest-filtered, bit-packed
//! delta frames back out to every connected client.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      SERVER GAME STATE                         │
//! ├────────────────────────────────────────────────────────────────┤
//! │  ingest                 tick (≥30Hz)              workers      │
//! │  ┌─────────────┐        ┌──────────────┐        ┌──────────┐   │
//! │  │ decompress  │        │ world grid   │        │ assemble │   │
//! │  │ bit-parse   │───────▶│ occupants    │───────▶│ compress │   │
//! │  │ mutate+ack  │        │ per-client   │  cmd   │ send     │   │
//! │  └─────────────┘        │ filtering    │  list  └──────────┘   │
//! │                         └──────────────┘                       │
//! │        entity store ── object ids ── world grid ── handles     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The hot structures are lock-scoped narrowly: a reader-preference
//! list lock for iteration, a per-entity owner lock, one mutex per
//! client's replication state, and a single mutex over the object-id
//! bitsets. See each module for the locking contract.

pub mod bitset;
pub mod client;
pub mod commands;
pub mod config;
pub mod entity;
pub mod events;
pub mod ingest;
pub mod log;
pub mod math;
pub mod object_ids;
pub mod script_handles;
pub mod server;
pub mod store;
pub mod tree;
pub mod workers;
pub mod world_grid;

pub use client::{Client, ClientRegistry, GameStateClientData};
pub use config::SyncConfig;
pub use entity::{make_entity_handle, NetObjEntityType, SyncEntityState};
pub use events::{GameEventSink, NullEventSink, RecordingEventSink};
pub use server::ServerGameState;

/// Number of client slots; one bit per slot in every ack matrix.
pub const MAX_CLIENTS: usize = 64;

/// Size of the 13-bit object-id space. Valid ids are `1..MAX_OBJECT_ID`.
pub const MAX_OBJECT_ID: usize = 1 << 13;

/// Capacity of the per-client ack bit stream.
pub const ACK_BUFFER_BYTES: usize = 16384;

/// Capacity of the per-frame clone bit stream.
pub const CLONE_BUFFER_BYTES: usize = 16384;

/// Capacity of the per-entity serialization scratch buffer.
pub const SCRATCH_BUFFER_BYTES: usize = 1200;

/// Entity payloads longer than this are never written to a frame.
pub const MAX_CLONE_PAYLOAD_BYTES: usize = 4096;
