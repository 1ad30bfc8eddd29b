//! # Per-Sector Locking
//!
//! Every public sector operation holds an exclusive lock on the sector's
//! ID for its full duration. A single global lock would serialize all
//! traffic, so the table is striped: each stripe owns a map of on-demand
//! lock entries, and a sector's stripe is chosen from its ID bytes.
//! Operations on distinct sectors proceed in parallel; operations on the
//! same sector are serialized in arrival order.
//!
//! Entries are created when first locked and removed when the last guard
//! drops, so the table stays proportional to the number of in-flight
//! operations rather than the number of stored sectors.

use crate::crypto::SectorId;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of stripes in the lock table.
pub const SECTOR_LOCK_STRIPES: usize = 256;

struct LockEntry {
    lock: Mutex<()>,
    ref_count: AtomicU64,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            ref_count: AtomicU64::new(1),
        }
    }

    fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

struct Stripe {
    entries: Mutex<HashMap<SectorId, Arc<LockEntry>>>,
}

impl Stripe {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, id: SectorId) -> Arc<LockEntry> {
        let mut map = self.entries.lock();
        if let Some(entry) = map.get(&id) {
            entry.acquire();
            return Arc::clone(entry);
        }
        let entry = Arc::new(LockEntry::new());
        map.insert(id, Arc::clone(&entry));
        entry
    }

    fn try_cleanup(&self, id: SectorId, entry: &LockEntry) {
        if entry.release() {
            let mut map = self.entries.lock();
            // Double-check ref_count is still 0 under the stripe lock
            if entry.ref_count.load(Ordering::Acquire) == 0 {
                map.remove(&id);
            }
        }
    }
}

/// Striped table of per-sector exclusive locks.
pub struct SectorLockTable {
    stripes: Vec<Stripe>,
}

impl Default for SectorLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorLockTable {
    pub fn new() -> Self {
        Self {
            stripes: (0..SECTOR_LOCK_STRIPES).map(|_| Stripe::new()).collect(),
        }
    }

    fn stripe_index(id: &SectorId) -> usize {
        // The ID is already uniformly distributed keyed-hash output; the
        // first byte alone indexes 256 stripes.
        id.0[0] as usize % SECTOR_LOCK_STRIPES
    }

    /// Acquires the exclusive lock for a sector ID (blocking).
    pub fn acquire(&self, id: SectorId) -> SectorLockGuard<'_> {
        let stripe = &self.stripes[Self::stripe_index(&id)];
        let entry = stripe.get_or_create(id);

        let guard = entry.lock.lock();
        // Forget the guard to prevent automatic unlock; the lock is
        // released manually in SectorLockGuard::drop.
        std::mem::forget(guard);

        SectorLockGuard { stripe, id, entry }
    }
}

/// RAII guard for a sector lock.
pub struct SectorLockGuard<'a> {
    stripe: &'a Stripe,
    id: SectorId,
    entry: Arc<LockEntry>,
}

impl SectorLockGuard<'_> {
    /// The locked sector's ID.
    pub fn id(&self) -> SectorId {
        self.id
    }
}

impl Drop for SectorLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: acquire() locked entry.lock on this thread and forgot the
        // guard, so this thread still holds the lock and must release it.
        unsafe { self.entry.lock.force_unlock() };
        self.stripe.try_cleanup(self.id, &self.entry);
    }
}
