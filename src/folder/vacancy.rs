//! Slot allocation policy.
//!
//! Incoming sectors go to the emptiest eligible folder, with round-robin
//! rotation among equally-empty folders to spread load. Inside a folder
//! the slot is chosen by probing forward from a uniformly random start, so
//! deletion churn does not concentrate writes at the front of the file.
//!
//! A reservation is tentative until the sector's data and metadata writes
//! both land and sync. The [`SlotReservation`] guard rolls the usage bit
//! and the `available_sectors` entry back on drop unless the caller
//! commits it.

use super::StorageFolder;
use crate::crypto::SectorId;
use bitvec::prelude::*;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Picks the folder that should receive the next sector.
///
/// Quarantined folders, `exclude`d folders (being shrunk, removed, or
/// already tried and failed), and full folders are ineligible. Among the
/// rest the emptiest by fill ratio wins; ties rotate via `round_robin`.
pub fn pick_vacant_folder(
    folders: &[Arc<StorageFolder>],
    exclude: &[u16],
    round_robin: &AtomicU64,
) -> Option<Arc<StorageFolder>> {
    let mut eligible: Vec<(&Arc<StorageFolder>, f64)> = folders
        .iter()
        .filter(|f| !f.is_unavailable())
        .filter(|f| !exclude.contains(&f.index()))
        .filter_map(|f| {
            let slots = f.slot_count();
            let used = f.used_slots();
            if used >= slots {
                return None;
            }
            Some((f, used as f64 / slots as f64))
        })
        .collect();
    if eligible.is_empty() {
        return None;
    }

    let min_ratio = eligible
        .iter()
        .map(|(_, r)| *r)
        .fold(f64::INFINITY, f64::min);
    eligible.retain(|(_, r)| *r <= min_ratio);

    let turn = round_robin.fetch_add(1, Ordering::Relaxed) as usize;
    Some(Arc::clone(eligible[turn % eligible.len()].0))
}

/// Returns a free slot index, probing forward from a random start.
pub fn random_free_slot<R: Rng>(usage: &BitVec<u64, Lsb0>, rng: &mut R) -> Option<u32> {
    let slots = usage.len();
    if slots == 0 || usage.count_zeros() == 0 {
        return None;
    }
    let start = rng.gen_range(0..slots);
    for offset in 0..slots {
        let slot = (start + offset) % slots;
        if !usage[slot] {
            return Some(slot as u32);
        }
    }
    None
}

/// Reserves a free slot in `folder` for `id`.
///
/// The usage bit is set and the sector is recorded in `available_sectors`
/// before the folder lock is released, so a concurrent allocator cannot
/// pick the same slot.
pub fn reserve_slot(folder: &Arc<StorageFolder>, id: SectorId) -> Option<SlotReservation> {
    let mut state = folder.state();
    let slot = random_free_slot(&state.usage, &mut rand::thread_rng())?;
    state.usage.set(slot as usize, true);
    state.available_sectors.insert(id, slot);
    drop(state);

    Some(SlotReservation {
        folder: Arc::clone(folder),
        id,
        slot,
        committed: false,
    })
}

/// A tentative slot allocation.
///
/// Dropping the reservation without committing clears the usage bit and
/// evicts the `available_sectors` entry, returning the slot to the free
/// pool.
pub struct SlotReservation {
    folder: Arc<StorageFolder>,
    id: SectorId,
    slot: u32,
    committed: bool,
}

impl SlotReservation {
    pub fn folder(&self) -> &Arc<StorageFolder> {
        &self.folder
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Keeps the usage bit set. The caller takes over the
    /// `available_sectors` entry (promotion to the location index removes
    /// it there).
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.folder.state();
        state.usage.set(self.slot as usize, false);
        state.available_sectors.remove(&self.id);
    }
}
