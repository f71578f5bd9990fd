//! # Object-Id Allocation
//!
//! Three bitsets over the 13-bit id space, all guarded by one mutex:
//!
//! - `sent`: granted to some client
//! - `used`: a create for the id has been parsed
//! - `stolen`: ownership migrated away from the original allocator, so
//!   on removal the id returns to the global pool instead of staying
//!   with that client
//!
//! Grants travel as gap/length run pairs so a fresh client's batch of
//! mostly-consecutive ids costs a handful of bytes.

use crate::bitset::IdBitset;
use crate::MAX_OBJECT_ID;

/// Global object-id state.
#[derive(Default)]
pub struct ObjectIdPool {
    sent: IdBitset,
    used: IdBitset,
    stolen: IdBitset,
}

impl ObjectIdPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants up to `count` free ids, scanning upward from id 1.
    ///
    /// Stops short when the space is exhausted.
    pub fn allocate(&mut self, count: usize) -> Vec<u16> {
        let mut ids = Vec::with_capacity(count);
        let mut id = 1usize;

        for _ in 0..count {
            while id < MAX_OBJECT_ID && (self.sent.test(id as u16) || self.used.test(id as u16)) {
                id += 1;
            }

            if id >= MAX_OBJECT_ID {
                tracing::warn!("object id space exhausted");
                break;
            }

            self.sent.set(id as u16);
            ids.push(id as u16);
            id += 1;
        }

        ids
    }

    /// Records that a create for `id` was parsed.
    pub fn mark_used(&mut self, id: u16) {
        self.used.set(id);
    }

    /// Records the removal of the entity using `id`.
    pub fn release_used(&mut self, id: u16) {
        self.used.reset(id);
    }

    /// Marks an id as migrated away from its allocator.
    pub fn mark_stolen(&mut self, id: u16) {
        self.stolen.set(id);
    }

    /// On removal of a stolen id, returns it to the global pool.
    ///
    /// Returns true when the id was stolen, in which case the caller
    /// must also drop it from the last owner's allocation set.
    pub fn release_if_stolen(&mut self, id: u16) -> bool {
        if !self.stolen.test(id) {
            return false;
        }
        self.sent.reset(id);
        self.stolen.reset(id);
        true
    }

    /// Returns a departing client's id to the pool.
    pub fn release_sent(&mut self, id: u16) {
        self.sent.reset(id);
    }

    /// Tests the `sent` bit.
    #[must_use]
    pub fn is_sent(&self, id: u16) -> bool {
        self.sent.test(id)
    }

    /// Tests the `used` bit.
    #[must_use]
    pub fn is_used(&self, id: u16) -> bool {
        self.used.test(id)
    }

    /// Tests the `stolen` bit.
    #[must_use]
    pub fn is_stolen(&self, id: u16) -> bool {
        self.stolen.test(id)
    }

    /// Number of ids granted to clients.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.count()
    }

    /// Number of ids with a live create.
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.used.count()
    }
}

/// Encodes an ascending id list as `(gap, run_length)` pairs.
///
/// `gap` is measured from two past the previous run's end, so adjacent
/// runs can never produce a negative gap; `run_length` counts the
/// consecutive successors of the run's first id.
#[must_use]
pub fn encode_gap_runs(ids: &[u16]) -> Vec<(u16, u16)> {
    let mut pairs = Vec::new();
    let mut last: i32 = -1;
    let mut i = 0usize;

    while i < ids.len() {
        let gap = i32::from(ids[i]) - 2 - last;
        let mut len = 0u16;

        while i + 1 < ids.len() && ids[i + 1] == ids[i] + 1 {
            i += 1;
            len += 1;
        }

        last = i32::from(ids[i]);
        pairs.push((gap as u16, len));
        i += 1;
    }

    pairs
}

/// Decodes `(gap, run_length)` pairs back into the id list.
#[must_use]
pub fn decode_gap_runs(pairs: &[(u16, u16)]) -> Vec<u16> {
    let mut ids = Vec::new();
    let mut last: i32 = -1;

    for &(gap, len) in pairs {
        let first = last + 2 + i32::from(gap);
        for id in first..=first + i32::from(len) {
            ids.push(id as u16);
        }
        last = first + i32::from(len);
    }

    ids
}
