//! # Entity Store
//!
//! Two indexes kept in step: the ordered entity list, which holds the
//! only strong references, and the id-to-weak-handle table for O(1)
//! lookup by wire id.
//!
//! ## Locking
//!
//! The list lock is reader-preference so the tick can iterate while
//! lookups proceed. Where both locks are needed (insert/remove) the id
//! lock nests strictly inside the list lock; readers may take either
//! lock alone.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::entity::SyncEntityState;
use crate::MAX_OBJECT_ID;

/// Canonical entity collection.
pub struct EntityStore {
    list: RwLock<Vec<Arc<SyncEntityState>>>,
    by_id: Mutex<Vec<Weak<SyncEntityState>>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    /// Creates an empty store covering the whole id space.
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            by_id: Mutex::new(vec![Weak::new(); MAX_OBJECT_ID]),
        }
    }

    /// Looks an entity up by wire id.
    #[must_use]
    pub fn get(&self, object_id: u16) -> Option<Arc<SyncEntityState>> {
        if object_id as usize >= MAX_OBJECT_ID {
            return None;
        }
        self.by_id.lock()[object_id as usize].upgrade()
    }

    /// Inserts a new entity into both indexes.
    pub fn insert(&self, entity: Arc<SyncEntityState>) {
        let mut list = self.list.write();
        list.push(entity.clone());

        let mut by_id = self.by_id.lock();
        by_id[entity.object_id() as usize] = Arc::downgrade(&entity);
    }

    /// Removes the entity with the given wire id from both indexes,
    /// returning it.
    pub fn remove(&self, object_id: u16) -> Option<Arc<SyncEntityState>> {
        let mut list = self.list.write();

        let index = list.iter().position(|e| e.object_id() == object_id)?;
        let entity = list.remove(index);

        let mut by_id = self.by_id.lock();
        by_id[object_id as usize] = Weak::new();

        Some(entity)
    }

    /// Runs `f` under the shared list lock.
    pub fn with_list<R>(&self, f: impl FnOnce(&[Arc<SyncEntityState>]) -> R) -> R {
        let list = self.list.read();
        f(&list)
    }

    /// Stamps the current frame on every entity.
    pub fn stamp_frames(&self, frame_index: u64) {
        let list = self.list.read();
        for entity in list.iter() {
            entity
                .frame_index
                .store(frame_index, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Returns true when the store holds no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
