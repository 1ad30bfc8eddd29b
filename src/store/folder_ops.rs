//! Storage folder management: add, grow, shrink, remove.
//!
//! Growing is a single atomic update: extend both files, then the usage
//! bitmap. Shrinking and removal run in two phases: first every live
//! sector above the new size is migrated to another folder (each move is
//! its own WAL transaction under the sector's lock), then the
//! shrink/remove transaction truncates or drops the folder. If migration
//! cannot complete and `force` is false the operation aborts with
//! `InsufficientCapacity`; under `force` the displaced sectors are
//! declared lost.
//!
//! While a shrink or removal is migrating, the free slots of the affected
//! range are pre-reserved in the usage bitmap so concurrent adds cannot
//! allocate into space that is about to disappear.

use super::{SectorLocation, SharedStore};
use crate::crypto::SectorId;
use crate::error::{Result, StoreError};
use crate::folder::vacancy::{pick_vacant_folder, reserve_slot};
use crate::folder::{StorageFolder, MAX_SLOTS_PER_FOLDER, MIN_SLOTS_PER_FOLDER};
use crate::wal::WalUpdate;
use crate::{HostStore, META_ENTRY_SIZE, SECTOR_SIZE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

impl HostStore {
    /// Registers a new storage folder rooted at `path` with room for
    /// `slot_count` sectors. The folder's files are created at full size.
    pub fn add_storage_folder(&self, path: &Path, slot_count: u32) -> Result<()> {
        let _gate = self.shared.tg.enter()?;
        self.shared.managed_add_storage_folder(path, slot_count)
    }

    /// Grows or shrinks the folder at `index` to `new_slot_count` slots.
    pub fn resize_storage_folder(&self, index: u16, new_slot_count: u32, force: bool) -> Result<()> {
        let _gate = self.shared.tg.enter()?;
        self.shared
            .managed_resize_storage_folder(index, new_slot_count, force)
    }

    /// Removes the folder at `index`, migrating its sectors elsewhere
    /// first. The index becomes reusable by a later add.
    pub fn remove_storage_folder(&self, index: u16, force: bool) -> Result<()> {
        let _gate = self.shared.tg.enter()?;
        self.shared.managed_remove_storage_folder(index, force)
    }
}

impl SharedStore {
    fn managed_add_storage_folder(&self, path: &Path, slot_count: u32) -> Result<()> {
        if !(MIN_SLOTS_PER_FOLDER..=MAX_SLOTS_PER_FOLDER).contains(&slot_count) {
            return Err(StoreError::InvalidSlotCount {
                requested: slot_count,
            });
        }
        if self
            .folders
            .read()
            .values()
            .any(|f| f.path() == path)
        {
            return Err(StoreError::AlreadyExists {
                path: path.display().to_string(),
            });
        }

        let update = WalUpdate::AddStorageFolder {
            path: path.to_path_buf(),
            slot_count,
        };
        self.create_and_apply_transaction(&[update])
    }

    fn managed_resize_storage_folder(
        &self,
        index: u16,
        new_slot_count: u32,
        force: bool,
    ) -> Result<()> {
        if !(MIN_SLOTS_PER_FOLDER..=MAX_SLOTS_PER_FOLDER).contains(&new_slot_count) {
            return Err(StoreError::InvalidSlotCount {
                requested: new_slot_count,
            });
        }
        let folder = self.folder(index)?;
        let current = folder.slot_count();
        if new_slot_count == current {
            return Ok(());
        }

        if new_slot_count > current {
            let update = WalUpdate::GrowStorageFolder {
                index,
                new_slot_count,
            };
            return self.create_and_apply_transaction(&[update]);
        }

        // Shrink: fence off the doomed range, migrate, then truncate.
        let fenced = self.evacuate_range(&folder, new_slot_count, force)?;

        let updates = [
            WalUpdate::ShrinkStorageFolder {
                index,
                new_slot_count,
                force,
            },
            WalUpdate::Truncate {
                path: folder.sectors_path(),
                new_size: new_slot_count as u64 * SECTOR_SIZE as u64,
            },
            WalUpdate::Truncate {
                path: folder.metadata_path(),
                new_size: new_slot_count as u64 * META_ENTRY_SIZE as u64,
            },
        ];
        let result = self.create_and_apply_transaction(&updates);
        if result.is_err() {
            release_fenced_slots(&folder, &fenced);
        }
        result
    }

    fn managed_remove_storage_folder(&self, index: u16, force: bool) -> Result<()> {
        let folder = self.folder(index)?;

        let fenced = self.evacuate_range(&folder, 0, force)?;

        let update = WalUpdate::RemoveStorageFolder {
            index,
            path: folder.path().to_path_buf(),
        };
        let result = self.create_and_apply_transaction(&[update]);
        if result.is_err() {
            release_fenced_slots(&folder, &fenced);
        }
        result
    }

    /// Empties the slot range `>= floor` of `folder`: fences its free
    /// slots against concurrent allocation, migrates the live sectors,
    /// and repeats until a pass finds nothing left to move (slots freed
    /// by concurrent removals get fenced by the next pass). On abort the
    /// fence is released; on success the fenced slots are returned so the
    /// caller can release them if the follow-up transaction fails.
    fn evacuate_range(
        &self,
        folder: &Arc<StorageFolder>,
        floor: u32,
        force: bool,
    ) -> Result<Vec<u32>> {
        let mut fenced: Vec<u32> = Vec::new();
        loop {
            fenced.extend(fence_free_slots(folder, floor));
            match self.migrate_sectors_above(folder, floor, force) {
                Ok(0) => return Ok(fenced),
                Ok(_) => continue,
                Err(err) => {
                    release_fenced_slots(folder, &fenced);
                    return Err(err);
                }
            }
        }
    }

    /// Moves every indexed sector of `folder` in a slot `>= floor` into
    /// another folder, returning how many sectors it processed. With
    /// `force`, sectors that cannot be placed are dropped from the index
    /// instead of aborting.
    fn migrate_sectors_above(
        &self,
        folder: &Arc<StorageFolder>,
        floor: u32,
        force: bool,
    ) -> Result<usize> {
        let victims: Vec<(SectorId, SectorLocation)> = self
            .sector_locations
            .read()
            .iter()
            .filter(|(_, loc)| loc.folder == folder.index() && loc.slot >= floor)
            .map(|(id, loc)| (*id, *loc))
            .collect();
        let mut processed = 0usize;

        for (id, _) in victims {
            let _lock = self.sector_locks.acquire(id);
            // Re-read under the lock; the sector may have been removed or
            // already moved since the snapshot.
            let Some(location) = self.sector_locations.read().get(&id).copied() else {
                continue;
            };
            if location.folder != folder.index() || location.slot < floor {
                continue;
            }

            processed += 1;
            match self.relocate_sector(folder, id, location) {
                Ok(()) => {}
                // Under force, a sector that cannot be placed (or even
                // read off the dying disk) is dropped rather than pinning
                // the folder in place.
                Err(err)
                    if force
                        && (matches!(err, StoreError::OutOfStorage) || err.is_disk_trouble()) =>
                {
                    warn!(
                        %id,
                        folder = folder.index(),
                        slot = location.slot,
                        %err,
                        "discarding sector displaced by forced shrink"
                    );
                    let mut locations = self.sector_locations.write();
                    let mut state = folder.state();
                    locations.remove(&id);
                    state.usage.set(location.slot as usize, false);
                    state.available_sectors.remove(&id);
                }
                Err(StoreError::OutOfStorage) => {
                    return Err(StoreError::InsufficientCapacity {
                        folder: folder.index(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(processed)
    }

    /// Moves one sector out of `source` in a single transaction: new data
    /// write, new metadata record, zeroed old record.
    fn relocate_sector(
        &self,
        source: &Arc<StorageFolder>,
        id: SectorId,
        location: SectorLocation,
    ) -> Result<()> {
        let data = source
            .read_sector(location.slot)
            .map_err(|e| StoreError::disk("reading sector for migration", e))?;

        let mut failed: Vec<u16> = vec![source.index()];
        loop {
            let folders = self.folder_snapshot();
            let Some(target) = pick_vacant_folder(&folders, &failed, &self.round_robin) else {
                return Err(StoreError::OutOfStorage);
            };
            let Some(reservation) = reserve_slot(&target, id) else {
                failed.push(target.index());
                continue;
            };
            let new_slot = reservation.slot();

            let updates = [
                WalUpdate::SectorData {
                    path: target.sectors_path(),
                    slot: new_slot,
                    data: data.clone(),
                },
                WalUpdate::SectorMetadata {
                    path: target.metadata_path(),
                    slot: new_slot,
                    id,
                    count: location.count,
                },
                WalUpdate::SectorMetadata {
                    path: source.metadata_path(),
                    slot: location.slot,
                    id: SectorId::default(),
                    count: 0,
                },
            ];
            match self.create_and_apply_transaction(&updates) {
                Ok(()) => {
                    {
                        let mut locations = self.sector_locations.write();
                        let mut target_state = target.state();
                        target_state.available_sectors.remove(&id);
                        locations.insert(
                            id,
                            SectorLocation {
                                folder: target.index(),
                                slot: new_slot,
                                count: location.count,
                            },
                        );
                    }
                    reservation.commit();
                    let mut source_state = source.state();
                    source_state.usage.set(location.slot as usize, false);
                    source_state.available_sectors.remove(&id);
                    info!(
                        %id,
                        from = source.index(),
                        to = target.index(),
                        "migrated sector"
                    );
                    return Ok(());
                }
                Err(err) if err.is_disk_trouble() => {
                    drop(reservation);
                    failed.push(target.index());
                    continue;
                }
                Err(err) => {
                    drop(reservation);
                    return Err(err);
                }
            }
        }
    }

    // -- apply routines (normal operation and WAL replay) ------------------

    pub(crate) fn apply_add_storage_folder(&self, path: &Path, slot_count: u32) -> Result<()> {
        // Idempotent: a replayed add finds the folder already registered.
        if self.folders.read().values().any(|f| f.path() == path) {
            return Ok(());
        }
        let index = self.next_folder_index()?;
        let folder = StorageFolder::create(index, path, slot_count)
            .map_err(|e| StoreError::disk("creating storage folder files", e))?;
        info!(index, path = %path.display(), slot_count, "storage folder added");
        self.folders.write().insert(index, Arc::new(folder));
        self.save_settings()
    }

    pub(crate) fn apply_grow_storage_folder(
        &self,
        index: u16,
        new_slot_count: u32,
        replaying: bool,
    ) -> Result<()> {
        let folder = match self.folder(index) {
            Ok(f) => f,
            // A replayed grow may target a folder removed later in the
            // log.
            Err(_) if replaying => return Ok(()),
            Err(e) => return Err(e),
        };
        if folder.slot_count() >= new_slot_count {
            return Ok(());
        }
        folder
            .grow(new_slot_count)
            .map_err(|e| StoreError::disk("growing storage folder files", e))?;
        info!(index, new_slot_count, "storage folder grown");
        self.save_settings()
    }

    pub(crate) fn apply_shrink_storage_folder(
        &self,
        index: u16,
        new_slot_count: u32,
        replaying: bool,
    ) -> Result<()> {
        let folder = match self.folder(index) {
            Ok(f) => f,
            Err(_) if replaying => return Ok(()),
            Err(e) => return Err(e),
        };
        folder.shrink_usage(new_slot_count);
        info!(index, new_slot_count, "storage folder shrunk");
        self.save_settings()
    }

    pub(crate) fn apply_remove_storage_folder(
        &self,
        index: u16,
        path: &Path,
        replaying: bool,
    ) -> Result<()> {
        let removed = self.folders.write().remove(&index);
        match removed {
            Some(folder) => {
                folder.remove_files();
                info!(index, path = %folder.path().display(), "storage folder removed");
                self.save_settings()
            }
            None if replaying => {
                // The folder may never have been reopened; clear any
                // leftover files by path.
                remove_leftover_files(path);
                Ok(())
            }
            None => Err(StoreError::FolderNotFound { index }),
        }
    }
}

/// Reserves every free slot at or above `floor` so concurrent adds stay
/// out of a range that is being shrunk away. Returns the fenced slots.
fn fence_free_slots(folder: &Arc<StorageFolder>, floor: u32) -> Vec<u32> {
    let mut state = folder.state();
    let mut fenced = Vec::new();
    for slot in (floor as usize)..state.usage.len() {
        if !state.usage[slot] {
            state.usage.set(slot, true);
            fenced.push(slot as u32);
        }
    }
    fenced
}

/// Undoes [`fence_free_slots`] after an aborted shrink.
fn release_fenced_slots(folder: &Arc<StorageFolder>, fenced: &[u32]) {
    let mut state = folder.state();
    for &slot in fenced {
        state.usage.set(slot as usize, false);
    }
}

fn remove_leftover_files(path: &Path) {
    for name in [
        crate::folder::SECTORS_FILE_NAME,
        crate::folder::METADATA_FILE_NAME,
    ] {
        let file: PathBuf = path.join(name);
        if file.exists() {
            let _ = std::fs::remove_file(&file);
        }
    }
    let _ = std::fs::remove_dir(path);
}
