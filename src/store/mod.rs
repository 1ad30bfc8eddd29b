//! # Sector Store
//!
//! `HostStore` is the host-side façade consumed by the RPC layer. It owns
//! the WAL, the folder registry, the sector location index, the per-sector
//! lock table, the alert registry, and the lifecycle gate. Every public
//! operation follows the same shape:
//!
//! 1. register with the thread group (refused once shutdown begins),
//! 2. derive the salted sector ID and take its lock,
//! 3. build a WAL transaction, signal setup complete, apply the updates to
//!    the folder files, signal updates applied,
//! 4. fold the outcome into the in-memory index.
//!
//! The in-memory maps are only ever touched from these methods; callers
//! prove exclusion for a sector by holding its lock from the table.
//!
//! ## Persist Directory
//!
//! ```text
//! persist_dir/
//! ├── settings.json    # salt + folder paths and slot counts
//! └── wal.dat          # write-ahead log
//! ```
//!
//! Folder directories live wherever the operator mounts them; the
//! settings file only enumerates them for startup.

mod commit;
mod folder_ops;
mod recovery;
mod sectors;
mod syncer;

use crate::alerts::Alerter;
use crate::crypto::{SectorId, SectorSalt};
use crate::error::{Result, StoreError};
use crate::folder::{FolderReport, StorageFolder};
use crate::sector_locks::SectorLockTable;
use crate::threadgroup::ThreadGroup;
use crate::wal::Wal;
use eyre::WrapErr;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

/// Name of the settings file inside the persist directory.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

const SETTINGS_VERSION: u32 = 1;

/// Where a sector currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorLocation {
    /// Index of the folder holding the sector.
    pub folder: u16,
    /// Slot inside that folder.
    pub slot: u32,
    /// Virtual reference count; zero never appears in the index.
    pub count: u16,
}

/// Aggregate capacity numbers for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCapacity {
    /// Total slots across all folders.
    pub total_slots: u64,
    /// Slots occupied or reserved.
    pub used_slots: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsFile {
    version: u32,
    salt: SectorSalt,
    folders: Vec<FolderSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FolderSettings {
    index: u16,
    path: PathBuf,
    slot_count: u32,
}

/// Shared state behind every store handle and background thread.
///
/// Lock order: `sector_locations` before any folder's state mutex. The
/// `folders` registry lock is released before a folder state mutex is
/// taken.
pub(crate) struct SharedStore {
    pub(crate) persist_dir: PathBuf,
    pub(crate) salt: SectorSalt,
    pub(crate) wal: Wal,
    pub(crate) sector_locations: RwLock<HashMap<SectorId, SectorLocation>>,
    pub(crate) folders: RwLock<HashMap<u16, Arc<StorageFolder>>>,
    pub(crate) sector_locks: SectorLockTable,
    pub(crate) alerter: Alerter,
    pub(crate) tg: ThreadGroup,
    pub(crate) round_robin: AtomicU64,
    pub(crate) syncer_stop: Mutex<bool>,
    pub(crate) syncer_wake: Condvar,
}

impl SharedStore {
    pub(crate) fn folder(&self, index: u16) -> Result<Arc<StorageFolder>> {
        self.folders
            .read()
            .get(&index)
            .cloned()
            .ok_or(StoreError::FolderNotFound { index })
    }

    /// Looks up a folder and refuses quarantined ones, for paths that are
    /// about to write to it.
    pub(crate) fn writable_folder(&self, index: u16) -> Result<Arc<StorageFolder>> {
        let folder = self.folder(index)?;
        if folder.is_unavailable() {
            return Err(StoreError::disk_state(format!(
                "storage folder {index} is quarantined"
            )));
        }
        Ok(folder)
    }

    pub(crate) fn folder_snapshot(&self) -> Vec<Arc<StorageFolder>> {
        self.folders.read().values().cloned().collect()
    }

    /// Writes the settings file atomically: tmp file, fsync, rename.
    pub(crate) fn save_settings(&self) -> Result<()> {
        let folders = self.folders.read();
        let mut entries: Vec<FolderSettings> = folders
            .values()
            .map(|f| FolderSettings {
                index: f.index(),
                path: f.path().to_path_buf(),
                slot_count: f.slot_count(),
            })
            .collect();
        drop(folders);
        entries.sort_by_key(|e| e.index);

        let settings = SettingsFile {
            version: SETTINGS_VERSION,
            salt: self.salt,
            folders: entries,
        };
        let json = serde_json::to_vec_pretty(&settings)
            .map_err(|e| StoreError::Fatal(format!("failed to serialize settings: {e}")))?;

        let path = self.persist_dir.join(SETTINGS_FILE_NAME);
        let tmp = self.persist_dir.join(format!("{SETTINGS_FILE_NAME}.tmp"));
        (|| -> std::io::Result<()> {
            fs::write(&tmp, &json)?;
            let file = fs::File::open(&tmp)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })()
        .map_err(|e| StoreError::disk("persisting settings", e))
    }
}

/// The host-side sector store.
///
/// See the module docs for the operation shape. All methods are safe to
/// call from any thread; `HostStore` is `Send + Sync`.
pub struct HostStore {
    pub(crate) shared: Arc<SharedStore>,
    syncer: Mutex<Option<JoinHandle<()>>>,
}

impl HostStore {
    /// Opens the store rooted at `persist_dir`, initializing it on first
    /// use. Replays any pending WAL transactions and rebuilds the sector
    /// index from the folder metadata files. A folder listed in the
    /// settings whose directory is missing blocks startup.
    pub fn open(persist_dir: &Path) -> eyre::Result<Self> {
        fs::create_dir_all(persist_dir).wrap_err_with(|| {
            format!(
                "failed to create persist directory '{}'",
                persist_dir.display()
            )
        })?;

        let shared = recovery::open_shared(persist_dir)?;
        let store = HostStore {
            syncer: Mutex::new(Some(syncer::spawn(Arc::clone(&shared)))),
            shared,
        };
        Ok(store)
    }

    /// Derives the on-disk ID the store uses for a sector root.
    pub fn sector_id(&self, root: &crate::crypto::Hash) -> SectorId {
        self.shared.salt.sector_id(root)
    }

    /// Aggregate slot counts across all folders.
    pub fn capacity(&self) -> StorageCapacity {
        let folders = self.shared.folder_snapshot();
        let mut cap = StorageCapacity {
            total_slots: 0,
            used_slots: 0,
        };
        for folder in folders {
            cap.total_slots += folder.slot_count() as u64;
            cap.used_slots += folder.used_slots() as u64;
        }
        cap
    }

    /// Number of distinct physical sectors currently indexed.
    pub fn stored_sector_count(&self) -> usize {
        self.shared.sector_locations.read().len()
    }

    /// Snapshot reports for every registered folder, sorted by index.
    pub fn folder_reports(&self) -> Vec<FolderReport> {
        let mut reports: Vec<FolderReport> = self
            .shared
            .folder_snapshot()
            .iter()
            .map(|f| f.report())
            .collect();
        reports.sort_by_key(|r| r.index);
        reports
    }

    /// The alert registry, for the host's health endpoint.
    pub fn alerts(&self) -> &Alerter {
        &self.shared.alerter
    }

    /// Stops admitting operations, drains in-flight ones, stops the
    /// background syncer, and syncs every folder. Idempotent.
    pub fn close(&self) {
        self.shared.tg.stop();

        {
            let mut stop = self.shared.syncer_stop.lock();
            *stop = true;
            self.shared.syncer_wake.notify_all();
        }
        if let Some(handle) = self.syncer.lock().take() {
            if handle.join().is_err() {
                warn!("background syncer panicked during shutdown");
            }
        }

        for folder in self.shared.folder_snapshot() {
            if let Err(err) = folder.sync_sectors().and_then(|_| folder.sync_metadata()) {
                warn!(folder = folder.index(), %err, "failed to sync folder during shutdown");
            }
        }
        if let Err(err) = self.shared.wal.truncate_if_idle() {
            warn!(%err, "failed to truncate WAL during shutdown");
        }
    }
}

impl Drop for HostStore {
    fn drop(&mut self) {
        if !self.shared.tg.is_stopped() {
            self.close();
        }
    }
}

fn load_or_init_settings(persist_dir: &Path) -> eyre::Result<SettingsFile> {
    let path = persist_dir.join(SETTINGS_FILE_NAME);
    if path.exists() {
        let bytes = fs::read(&path)
            .wrap_err_with(|| format!("failed to read settings at '{}'", path.display()))?;
        let settings: SettingsFile = serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("failed to parse settings at '{}'", path.display()))?;
        eyre::ensure!(
            settings.version == SETTINGS_VERSION,
            "unsupported settings version {}",
            settings.version
        );
        Ok(settings)
    } else {
        let settings = SettingsFile {
            version: SETTINGS_VERSION,
            salt: SectorSalt::generate(),
            folders: Vec::new(),
        };
        let json = serde_json::to_vec_pretty(&settings).wrap_err("failed to serialize settings")?;
        fs::write(&path, json)
            .wrap_err_with(|| format!("failed to write settings at '{}'", path.display()))?;
        Ok(settings)
    }
}

impl SharedStore {
    /// Allocates the smallest folder index not currently in use.
    pub(crate) fn next_folder_index(&self) -> Result<u16> {
        let folders = self.folders.read();
        for candidate in 0..=u16::MAX {
            if !folders.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(StoreError::Fatal(
            "all storage folder indices are in use".to_string(),
        ))
    }
}
