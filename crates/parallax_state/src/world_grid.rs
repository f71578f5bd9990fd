//! # World Grid
//!
//! A 2D sector-ownership map. Each connected client claims the sectors
//! around its player's focus; whoever owns a sector is the natural heir
//! for entities orphaned there. Claims and releases are broadcast as
//! byte-range deltas over the flattened entry table, so clients mirror
//! the whole structure with tiny messages.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::MAX_CLIENTS;

/// Side length of the accelerator, in sectors.
pub const GRID_DIM: usize = 256;

/// Claimed-sector entries per client slot.
pub const ENTRIES_PER_SLOT: usize = 32;

/// Sector edge length in world units.
pub const SECTOR_SIZE: f32 = 75.0;

/// World-to-grid offset applied to both axes.
pub const GRID_OFFSET: f32 = 8192.0;

/// Claim radius around the focus, in world units.
pub const CLAIM_RANGE: f32 = 149.0;

/// Marker for an unowned sector or free entry.
pub const NO_SLOT: u8 = 0xFF;

/// One claimed sector, as serialized to clients.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WorldGridEntry {
    /// Sector X coordinate.
    pub sector_x: u8,
    /// Sector Y coordinate.
    pub sector_y: u8,
    /// Owning slot, [`NO_SLOT`] when free.
    pub slot_id: u8,
}

/// All entries of one client slot.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct WorldGridState {
    /// The slot's currently claimed sectors.
    pub entries: [WorldGridEntry; ENTRIES_PER_SLOT],
}

/// The sector-ownership map plus its accelerator.
pub struct WorldGrid {
    accel: Box<[[u8; GRID_DIM]; GRID_DIM]>,
    slots: Box<[WorldGridState; MAX_CLIENTS]>,
}

impl Default for WorldGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldGrid {
    /// Creates a grid with every sector unowned.
    #[must_use]
    pub fn new() -> Self {
        let empty = WorldGridEntry {
            sector_x: 0,
            sector_y: 0,
            slot_id: NO_SLOT,
        };

        Self {
            accel: Box::new([[NO_SLOT; GRID_DIM]; GRID_DIM]),
            slots: Box::new(
                [WorldGridState {
                    entries: [empty; ENTRIES_PER_SLOT],
                }; MAX_CLIENTS],
            ),
        }
    }

    /// Owner of a sector, [`NO_SLOT`] when free.
    #[inline]
    #[must_use]
    pub fn owner_at(&self, sector_x: usize, sector_y: usize) -> u8 {
        self.accel[sector_x][sector_y]
    }

    /// One slot's entry table.
    #[must_use]
    pub fn entries_of(&self, slot_id: u8) -> &[WorldGridEntry; ENTRIES_PER_SLOT] {
        &self.slots[slot_id as usize].entries
    }

    /// The whole entry table as wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.slots[..])
    }

    /// Flat entry index of `(slot, entry)`, the unit of delta
    /// broadcasts.
    #[inline]
    #[must_use]
    pub const fn flat_index(slot_id: u8, entry: usize) -> usize {
        slot_id as usize * ENTRIES_PER_SLOT + entry
    }

    fn sector_range(center: f32) -> (i32, i32) {
        let min = ((center - CLAIM_RANGE + GRID_OFFSET).max(0.0) / SECTOR_SIZE) as i32;
        let max = ((center + CLAIM_RANGE + GRID_OFFSET).max(0.0) / SECTOR_SIZE) as i32;
        (min.min(GRID_DIM as i32 - 1), max.min(GRID_DIM as i32 - 1))
    }

    /// Refreshes one slot's claims around its focus.
    ///
    /// Releases entries that drifted out of the expanded range, then
    /// claims every unowned sector in range into free entries.
    /// Returns the flat indexes of every entry that changed.
    pub fn update_for_slot(&mut self, slot_id: u8, focus: Vec3) -> Vec<usize> {
        let mut changed = Vec::new();

        let (min_x, max_x) = Self::sector_range(focus.x);
        let (min_y, max_y) = Self::sector_range(focus.y);

        // disown entries that are no longer near the focus
        let state = &mut self.slots[slot_id as usize];
        for (index, entry) in state.entries.iter_mut().enumerate() {
            if entry.slot_id == NO_SLOT {
                continue;
            }

            let ex = i32::from(entry.sector_x);
            let ey = i32::from(entry.sector_y);

            if ex < min_x - 1 || ex >= max_x + 1 || ey < min_y - 1 || ey >= max_y + 1 {
                if self.accel[ex as usize][ey as usize] == slot_id {
                    self.accel[ex as usize][ey as usize] = NO_SLOT;
                }

                *entry = WorldGridEntry {
                    sector_x: 0,
                    sector_y: 0,
                    slot_id: NO_SLOT,
                };
                changed.push(Self::flat_index(slot_id, index));
            }
        }

        // claim every free sector in range
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                if self.accel[x as usize][y as usize] != NO_SLOT {
                    continue;
                }

                let state = &mut self.slots[slot_id as usize];
                if let Some((index, entry)) = state
                    .entries
                    .iter_mut()
                    .enumerate()
                    .find(|(_, e)| e.slot_id == NO_SLOT)
                {
                    *entry = WorldGridEntry {
                        sector_x: x as u8,
                        sector_y: y as u8,
                        slot_id,
                    };
                    self.accel[x as usize][y as usize] = slot_id;
                    changed.push(Self::flat_index(slot_id, index));
                }
            }
        }

        changed
    }

    /// Releases every entry of a departing slot. Returns the flat
    /// indexes of the cleared entries.
    pub fn release_slot(&mut self, slot_id: u8) -> Vec<usize> {
        let mut changed = Vec::new();

        let state = &mut self.slots[slot_id as usize];
        for (index, entry) in state.entries.iter_mut().enumerate() {
            let ex = entry.sector_x as usize;
            let ey = entry.sector_y as usize;

            if self.accel[ex][ey] == slot_id {
                self.accel[ex][ey] = NO_SLOT;
            }

            if entry.slot_id != NO_SLOT {
                changed.push(Self::flat_index(slot_id, index));
            }

            *entry = WorldGridEntry {
                sector_x: 0,
                sector_y: 0,
                slot_id: NO_SLOT,
            };
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_mutual_exclusion(grid: &WorldGrid) {
        for slot in 0..MAX_CLIENTS as u8 {
            for entry in grid.entries_of(slot) {
                if entry.slot_id != NO_SLOT {
                    assert_eq!(entry.slot_id, slot);
                    assert_eq!(
                        grid.owner_at(entry.sector_x as usize, entry.sector_y as usize),
                        slot,
                        "accelerator disagrees at ({}, {})",
                        entry.sector_x,
                        entry.sector_y
                    );
                }
            }
        }
    }

    #[test]
    fn test_claim_covers_focus_range() {
        let mut grid = WorldGrid::new();
        let changed = grid.update_for_slot(0, Vec3::new(0.0, 0.0, 0.0));

        // 149 units either side of origin-at-8192 spans sectors 107..111
        assert_eq!(changed.len(), 25);
        for x in 107..=111 {
            for y in 107..=111 {
                assert_eq!(grid.owner_at(x, y), 0);
            }
        }
        assert_mutual_exclusion(&grid);
    }

    #[test]
    fn test_second_slot_cannot_claim_owned_sectors() {
        let mut grid = WorldGrid::new();
        grid.update_for_slot(0, Vec3::ZERO);
        let changed = grid.update_for_slot(1, Vec3::ZERO);

        assert!(changed.is_empty());
        assert_mutual_exclusion(&grid);
    }

    #[test]
    fn test_movement_releases_and_reclaims() {
        let mut grid = WorldGrid::new();
        grid.update_for_slot(0, Vec3::ZERO);

        // move far enough that the old claims leave the expanded range
        let changed = grid.update_for_slot(0, Vec3::new(1000.0, 0.0, 0.0));
        assert!(!changed.is_empty());

        // old sectors are free again
        assert_eq!(grid.owner_at(107, 109), NO_SLOT);

        // new sectors are owned
        let (new_min, _) = (
            ((1000.0 - CLAIM_RANGE + GRID_OFFSET) / SECTOR_SIZE) as usize,
            0,
        );
        assert_eq!(grid.owner_at(new_min, 109), 0);
        assert_mutual_exclusion(&grid);
    }

    #[test]
    fn test_release_slot_clears_everything() {
        let mut grid = WorldGrid::new();
        grid.update_for_slot(2, Vec3::ZERO);

        let changed = grid.release_slot(2);
        assert_eq!(changed.len(), 25);

        for x in 0..GRID_DIM {
            for y in 0..GRID_DIM {
                assert_eq!(grid.owner_at(x, y), NO_SLOT);
            }
        }
    }

    #[test]
    fn test_wire_bytes_shape() {
        let grid = WorldGrid::new();
        let bytes = grid.as_bytes();
        assert_eq!(bytes.len(), MAX_CLIENTS * ENTRIES_PER_SLOT * 3);

        // every entry serializes its slot byte at offset 2
        assert_eq!(bytes[2], NO_SLOT);
        assert_eq!(bytes[5], NO_SLOT);
    }
}
