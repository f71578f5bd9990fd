//! # Script Handles
//!
//! Stable small integers naming entities to the scripting layer,
//! allocated from a fixed pool separate from the wire id space. A
//! handle survives ownership migrations and id reuse games; it dies
//! with the entity.

/// Handles are pool slots offset into a range scripts recognize.
pub const SCRIPT_HANDLE_BASE: u32 = 0x20000;

/// Pool capacity.
pub const SCRIPT_HANDLE_POOL_SIZE: usize = 1500;

/// Fixed pool mapping slots to entity handles.
pub struct ScriptHandlePool {
    slots: Vec<Option<u32>>,
}

impl Default for ScriptHandlePool {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHandlePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![None; SCRIPT_HANDLE_POOL_SIZE],
        }
    }

    /// Finds or allocates the slot for an entity handle.
    ///
    /// The scan for an existing binding keeps handles stable when an
    /// entity is re-registered (a temporary made permanent). Returns
    /// `None` when the pool is full.
    pub fn allocate_for(&mut self, entity_handle: u32) -> Option<u32> {
        // reuse an existing binding first
        for (slot, bound) in self.slots.iter().enumerate() {
            if *bound == Some(entity_handle) {
                return Some(slot as u32);
            }
        }

        for (slot, bound) in self.slots.iter_mut().enumerate() {
            if bound.is_none() {
                *bound = Some(entity_handle);
                return Some(slot as u32);
            }
        }

        tracing::warn!("script handle pool exhausted");
        None
    }

    /// Frees a slot.
    pub fn free(&mut self, slot: u32) {
        if let Some(bound) = self.slots.get_mut(slot as usize) {
            *bound = None;
        }
    }

    /// The entity handle bound to a slot.
    #[must_use]
    pub fn entity_handle_at(&self, slot: u32) -> Option<u32> {
        self.slots.get(slot as usize).copied().flatten()
    }

    /// Converts a pool slot into the script-visible handle.
    #[inline]
    #[must_use]
    pub const fn script_handle(slot: u32) -> u32 {
        slot + SCRIPT_HANDLE_BASE
    }

    /// Converts a script-visible handle back into a pool slot.
    #[inline]
    #[must_use]
    pub const fn slot_of(script_handle: u32) -> u32 {
        script_handle.wrapping_sub(SCRIPT_HANDLE_BASE)
    }
}
