//! Sector add / remove / delete / read operations.
//!
//! The virtual/physical split: a sector whose ID is already indexed gets
//! its reference count bumped (`SectorMetadata` update only); a new sector
//! reserves a slot and writes payload plus metadata. Removal decrements
//! the count and frees the slot at zero; deletion forces the count to zero
//! in one step regardless of pinning.
//!
//! Batches are non-atomic by contract: each root is processed under its
//! own sector lock by a bounded worker set, individual failures are
//! logged, and the batch call itself always succeeds.

use super::{SectorLocation, SharedStore};
use crate::alerts::AlertId;
use crate::crypto::{merkle_root, Hash, SectorId};
use crate::error::{Result, StoreError};
use crate::folder::vacancy::{pick_vacant_folder, reserve_slot};
use crate::wal::WalUpdate;
use crate::{HostStore, MAX_BATCH_PARALLELISM, SECTOR_SIZE};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

impl HostStore {
    /// Adds a sector. A payload already stored gains a virtual reference;
    /// a new payload is written to a free slot chosen by the allocation
    /// policy.
    pub fn add_sector(&self, root: Hash, data: &[u8]) -> Result<()> {
        let _gate = self.shared.tg.enter()?;
        let result = self.shared.managed_add_sector(root, data);
        if let Err(err) = &result {
            warn!(%root, %err, "failed to add sector");
        }
        result
    }

    /// Non-atomic bulk add for legacy renters. Processes each root as a
    /// virtual add in a detached bounded worker set; failures are logged,
    /// never surfaced. Roots without an existing physical sector are
    /// skipped.
    pub fn add_sector_batch(&self, roots: Vec<Hash>) -> Result<()> {
        self.shared.tg.add()?;
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            run_bounded(&roots, |root| {
                let id = shared.salt.sector_id(root);
                let _lock = shared.sector_locks.acquire(id);
                let existing = shared.sector_locations.read().get(&id).copied();
                match existing {
                    Some(location) => {
                        if let Err(err) = shared.managed_add_virtual_sector(id, location) {
                            warn!(%root, %err, "batch virtual add failed");
                        }
                    }
                    None => debug!(%root, "batch add skipped unknown sector"),
                }
            });
            shared.tg.done();
        });
        Ok(())
    }

    /// Removes one reference to a sector. The slot is freed once the count
    /// reaches zero.
    pub fn remove_sector(&self, root: Hash) -> Result<()> {
        let _gate = self.shared.tg.enter()?;
        let id = self.shared.salt.sector_id(&root);
        let _lock = self.shared.sector_locks.acquire(id);
        self.shared.managed_remove_sector(id, false)
    }

    /// Non-atomic bulk remove. Each root is removed independently under
    /// its own lock; failures are logged, never surfaced. Blocks until the
    /// worker set drains.
    pub fn remove_sector_batch(&self, roots: Vec<Hash>) -> Result<()> {
        let _gate = self.shared.tg.enter()?;
        let shared = &self.shared;
        run_bounded(&roots, |root| {
            let id = shared.salt.sector_id(root);
            let _lock = shared.sector_locks.acquire(id);
            if let Err(err) = shared.managed_remove_sector(id, false) {
                warn!(%root, %err, "batch remove failed");
            }
        });
        Ok(())
    }

    /// Deletes a sector outright, discarding every virtual reference.
    /// Intended for content policy enforcement; the renters pinning the
    /// sector will fail their storage proofs.
    pub fn delete_sector(&self, root: Hash) -> Result<()> {
        let _gate = self.shared.tg.enter()?;
        let id = self.shared.salt.sector_id(&root);
        let _lock = self.shared.sector_locks.acquire(id);
        self.shared.managed_remove_sector(id, true)
    }

    /// Reads a sector's payload and verifies it against the requested
    /// root.
    pub fn read_sector(&self, root: Hash) -> Result<Vec<u8>> {
        let _gate = self.shared.tg.enter()?;
        let id = self.shared.salt.sector_id(&root);
        let _lock = self.shared.sector_locks.acquire(id);
        self.shared.managed_read_sector(root, id)
    }
}

impl SharedStore {
    fn managed_add_sector(&self, root: Hash, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE {
            return Err(StoreError::MalformedSector {
                expected: SECTOR_SIZE,
                actual: data.len(),
            });
        }

        let id = self.salt.sector_id(&root);
        let _lock = self.sector_locks.acquire(id);

        let existing = self.sector_locations.read().get(&id).copied();
        match existing {
            Some(location) => self.managed_add_virtual_sector(id, location),
            None => self.managed_add_physical_sector(id, data, 1),
        }
    }

    /// Bumps the reference count of an already-stored sector.
    pub(crate) fn managed_add_virtual_sector(
        &self,
        id: SectorId,
        mut location: SectorLocation,
    ) -> Result<()> {
        if location.count == u16::MAX {
            return Err(StoreError::MaxVirtualSectors);
        }
        let folder = self.writable_folder(location.folder)?;
        location.count += 1;

        // The index is updated before the metadata lands; on failure the
        // count is rolled back. Writing after the index update means an
        // unclean shutdown can never leave a count on disk above the one
        // the WAL will restore.
        self.sector_locations.write().insert(id, location);

        let update = WalUpdate::SectorMetadata {
            path: folder.metadata_path(),
            slot: location.slot,
            id,
            count: location.count,
        };
        match self.create_and_apply_transaction(&[update]) {
            Ok(()) => Ok(()),
            Err(err) => {
                location.count -= 1;
                self.sector_locations.write().insert(id, location);
                Err(err)
            }
        }
    }

    /// Writes a brand-new sector, retrying across folders on disk trouble.
    pub(crate) fn managed_add_physical_sector(
        &self,
        id: SectorId,
        data: &[u8],
        count: u16,
    ) -> Result<()> {
        let mut failed_folders: Vec<u16> = Vec::new();
        loop {
            let folders = self.folder_snapshot();
            let Some(folder) = pick_vacant_folder(&folders, &failed_folders, &self.round_robin)
            else {
                self.alerter.register(
                    AlertId::HostOutOfStorage,
                    "no storage folder has a free slot",
                );
                return Err(StoreError::OutOfStorage);
            };
            let Some(reservation) = reserve_slot(&folder, id) else {
                // Lost the last slot to a concurrent allocator; try the
                // next folder.
                failed_folders.push(folder.index());
                continue;
            };
            let slot = reservation.slot();

            let updates = [
                WalUpdate::SectorData {
                    path: folder.sectors_path(),
                    slot,
                    data: data.to_vec(),
                },
                WalUpdate::SectorMetadata {
                    path: folder.metadata_path(),
                    slot,
                    id,
                    count,
                },
            ];
            match self.create_and_apply_transaction(&updates) {
                Ok(()) => {
                    let mut locations = self.sector_locations.write();
                    let mut state = folder.state();
                    state.available_sectors.remove(&id);
                    locations.insert(
                        id,
                        SectorLocation {
                            folder: folder.index(),
                            slot,
                            count,
                        },
                    );
                    drop(state);
                    drop(locations);
                    reservation.commit();
                    return Ok(());
                }
                Err(err) => {
                    // Zero the metadata record best-effort so a torn write
                    // cannot resurrect a phantom sector at the next scan.
                    let _ = folder.write_metadata(slot, SectorId::default(), 0);
                    let _ = folder.sync_metadata();
                    drop(reservation);

                    if err.is_disk_trouble() {
                        failed_folders.push(folder.index());
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Removes a reference (`delete` drops them all). Caller holds the
    /// sector lock.
    pub(crate) fn managed_remove_sector(&self, id: SectorId, delete: bool) -> Result<()> {
        let location = self
            .sector_locations
            .read()
            .get(&id)
            .copied()
            .ok_or(StoreError::SectorNotFound)?;
        let folder = self.writable_folder(location.folder)?;

        let new_count = if delete { 0 } else { location.count - 1 };
        let update = WalUpdate::SectorMetadata {
            path: folder.metadata_path(),
            slot: location.slot,
            id,
            count: new_count,
        };
        self.create_and_apply_transaction(&[update])?;

        if new_count == 0 {
            {
                let mut locations = self.sector_locations.write();
                let mut state = folder.state();
                locations.remove(&id);
                state.available_sectors.insert(id, location.slot);
            }
            // The transaction is fully retired; reclaim the slot. The
            // usage bit stays set until this point so the payload cannot
            // be overwritten while the release is still crash-visible.
            let mut state = folder.state();
            state.available_sectors.remove(&id);
            state.usage.set(location.slot as usize, false);
        } else {
            self.sector_locations.write().insert(
                id,
                SectorLocation {
                    count: new_count,
                    ..location
                },
            );
        }
        Ok(())
    }

    pub(crate) fn managed_read_sector(&self, root: Hash, id: SectorId) -> Result<Vec<u8>> {
        let location = self
            .sector_locations
            .read()
            .get(&id)
            .copied()
            .ok_or(StoreError::SectorNotFound)?;
        let folder = self.folder(location.folder)?;

        let data = folder.read_sector(location.slot).map_err(|err| {
            self.alerter.register(
                AlertId::HostDiskTrouble,
                format!(
                    "reading sector from folder {} failed: {err}",
                    folder.index()
                ),
            );
            StoreError::disk(format!("reading sector from folder {}", folder.index()), err)
        })?;

        if merkle_root(&data) != root {
            self.alerter.register(
                AlertId::HostSectorCorruption,
                format!(
                    "sector {id} failed verification in folder {} slot {}",
                    location.folder, location.slot
                ),
            );
            return Err(StoreError::Corruption {
                folder: location.folder,
                slot: location.slot,
            });
        }
        Ok(data)
    }
}

/// Runs `work` over `items` with at most [`MAX_BATCH_PARALLELISM`] worker
/// threads, returning once every item is processed.
fn run_bounded<T: Sync>(items: &[T], work: impl Fn(&T) + Sync) {
    if items.is_empty() {
        return;
    }
    let queue: Mutex<VecDeque<&T>> = Mutex::new(items.iter().collect());
    let workers = items.len().min(MAX_BATCH_PARALLELISM);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let Some(item) = queue.lock().pop_front() else {
                    return;
                };
                work(item);
            });
        }
    });
}
