//! Transaction creation and update application.
//!
//! `create_and_apply_transaction` is the single path every mutation takes:
//! write the updates to the WAL, signal setup complete (durability point),
//! apply them to the folder files, signal updates applied. The apply
//! routines are a total match over the update catalog; each one is
//! idempotent so recovery can replay it.
//!
//! When an apply fails at runtime the caller rolls its in-memory state
//! back, and the transaction is still retired so a later crash cannot
//! replay a known-failed operation over a slot that may since have been
//! reallocated.

use super::SharedStore;
use crate::alerts::AlertId;
use crate::error::{IoResultExt, Result, StoreError};
use crate::folder::StorageFolder;
use crate::wal::WalUpdate;
use crate::{META_ENTRY_SIZE, SECTOR_SIZE};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

impl SharedStore {
    /// Runs `updates` through the WAL: append, setup-complete, apply,
    /// updates-applied.
    pub(crate) fn create_and_apply_transaction(&self, updates: &[WalUpdate]) -> Result<()> {
        let mut txn = self.wal.new_transaction(updates)?;
        txn.signal_setup_complete()?;

        let applied = self.apply_updates(updates, false);

        // Retire the transaction even on apply failure; the caller rolls
        // back in-memory state and replaying the failure later would race
        // a reallocated slot. See DESIGN.md.
        if let Err(retire_err) = txn.signal_updates_applied() {
            if applied.is_ok() {
                return Err(retire_err);
            }
        }
        applied
    }

    /// Applies updates one by one, stopping at the first failure.
    /// `replaying` is true during startup recovery, where folder-level
    /// updates must tolerate already-applied state.
    pub(crate) fn apply_updates(&self, updates: &[WalUpdate], replaying: bool) -> Result<()> {
        for update in updates {
            let result = match update {
                WalUpdate::AddStorageFolder { path, slot_count } => {
                    self.apply_add_storage_folder(path, *slot_count)
                }
                WalUpdate::GrowStorageFolder {
                    index,
                    new_slot_count,
                } => self.apply_grow_storage_folder(*index, *new_slot_count, replaying),
                WalUpdate::ShrinkStorageFolder {
                    index,
                    new_slot_count,
                    ..
                } => self.apply_shrink_storage_folder(*index, *new_slot_count, replaying),
                WalUpdate::RemoveStorageFolder { index, path } => {
                    self.apply_remove_storage_folder(*index, path, replaying)
                }
                WalUpdate::SectorData { path, slot, data } => {
                    self.apply_sector_data(path, *slot, data)
                }
                WalUpdate::SectorMetadata {
                    path,
                    slot,
                    id,
                    count,
                } => self.apply_sector_metadata(path, *slot, *id, *count),
                WalUpdate::Truncate { path, new_size } => self.apply_truncate(path, *new_size),
            };
            if let Err(err) = result {
                error!(update = update.name(), %err, "failed to apply WAL update");
                return Err(err);
            }
        }
        Ok(())
    }

    // -- sector-level applies ----------------------------------------------

    fn apply_sector_data(&self, path: &Path, slot: u32, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE {
            return Err(StoreError::Fatal(format!(
                "sector data update carries {} bytes instead of {}",
                data.len(),
                SECTOR_SIZE
            )));
        }
        if let Some(folder) = self.folder_by_data_path(path) {
            let outcome = folder
                .write_sector(slot, data)
                .and_then(|_| folder.sync_sectors());
            return self.finish_folder_write(&folder, outcome, "writing sector data");
        }
        // The folder is not registered (created and removed within the
        // replayed log); write through the path directly.
        debug!(path = %path.display(), "sector data update targets unregistered folder");
        write_at_path(path, slot as u64 * SECTOR_SIZE as u64, data)
            .disk_context("writing sector data by path")
    }

    fn apply_sector_metadata(
        &self,
        path: &Path,
        slot: u32,
        id: crate::crypto::SectorId,
        count: u16,
    ) -> Result<()> {
        if let Some(folder) = self.folder_by_metadata_path(path) {
            let outcome = folder
                .write_metadata(slot, id, count)
                .and_then(|_| folder.sync_metadata());
            return self.finish_folder_write(&folder, outcome, "writing sector metadata");
        }
        debug!(path = %path.display(), "sector metadata update targets unregistered folder");
        let mut record = [0u8; META_ENTRY_SIZE];
        record[..12].copy_from_slice(&id.0);
        record[12..14].copy_from_slice(&count.to_le_bytes());
        write_at_path(path, slot as u64 * META_ENTRY_SIZE as u64, &record)
            .disk_context("writing sector metadata by path")
    }

    fn apply_truncate(&self, path: &Path, new_size: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .disk_context("opening file for truncation")?;
        file.set_len(new_size).disk_context("truncating file")?;
        file.sync_all().disk_context("syncing truncated file")
    }

    /// Folds a folder write outcome into the health counters and the
    /// disk-trouble alert.
    pub(crate) fn finish_folder_write(
        &self,
        folder: &Arc<StorageFolder>,
        outcome: std::io::Result<()>,
        context: &str,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                folder.record_write_success();
                self.alerter.clear(AlertId::HostDiskTrouble);
                Ok(())
            }
            Err(err) => {
                folder.record_write_failure();
                self.alerter.register(
                    AlertId::HostDiskTrouble,
                    format!("{context} failed on folder {}: {err}", folder.index()),
                );
                Err(StoreError::disk(
                    format!("{context} on folder {}", folder.index()),
                    err,
                ))
            }
        }
    }

    pub(crate) fn folder_by_data_path(&self, path: &Path) -> Option<Arc<StorageFolder>> {
        self.folders
            .read()
            .values()
            .find(|f| f.sectors_path() == path)
            .cloned()
    }

    pub(crate) fn folder_by_metadata_path(&self, path: &Path) -> Option<Arc<StorageFolder>> {
        self.folders
            .read()
            .values()
            .find(|f| f.metadata_path() == path)
            .cloned()
    }
}

fn write_at_path(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.write_all_at(data, offset)?;
    file.sync_all()
}
