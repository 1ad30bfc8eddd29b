//! # Storage Folders
//!
//! A storage folder is a mounted directory holding two files indexed in
//! parallel:
//!
//! ```text
//! <folder>/sectors.dat    # slot_count * SECTOR_SIZE bytes
//! <folder>/metadata.dat   # slot_count * META_ENTRY_SIZE bytes
//! ```
//!
//! Slot `i` of the data file holds one sector payload; slot `i` of the
//! metadata file holds the 12-byte sector ID plus a little-endian `u16`
//! reference count. A zeroed metadata entry marks a vacant slot.
//!
//! File handles are long-lived and shared; all I/O is positional so no
//! cursor state exists to race on. The usage bitmap and the
//! `available_sectors` map live behind one mutex. A set usage bit means
//! the slot is occupied or tentatively reserved; `available_sectors`
//! tracks slots whose payload is no longer referenced but whose usage bit
//! has not been cleared yet, so the data stays untouchable until the
//! releasing transaction is fully retired.
//!
//! Folders track write outcomes. A run of consecutive failures quarantines
//! the folder: it stops receiving allocations (reads continue) until the
//! host restarts.

pub mod vacancy;

use crate::crypto::SectorId;
use crate::{META_ENTRY_SIZE, SECTOR_SIZE};
use bitvec::prelude::*;
use hashbrown::HashMap;
use memmap2::Mmap;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{error, warn};

/// Data file name inside a folder directory.
pub const SECTORS_FILE_NAME: &str = "sectors.dat";

/// Metadata file name inside a folder directory.
pub const METADATA_FILE_NAME: &str = "metadata.dat";

/// Consecutive failed writes before a folder is quarantined.
pub const MAX_FOLDER_FAILURES: u32 = 5;

/// Smallest permitted folder, in slots.
pub const MIN_SLOTS_PER_FOLDER: u32 = 1;

/// Largest permitted folder, in slots.
pub const MAX_SLOTS_PER_FOLDER: u32 = 1 << 20;

/// Mutable folder state guarded by one mutex.
#[derive(Debug)]
pub struct FolderState {
    /// One bit per slot; 1 = occupied or tentatively reserved.
    pub usage: BitVec<u64, Lsb0>,
    /// Slots released by the WAL but not yet reclaimed, kept unallocatable
    /// until the releasing transaction retires.
    pub available_sectors: HashMap<SectorId, u32>,
}

/// One mounted storage folder.
#[derive(Debug)]
pub struct StorageFolder {
    index: u16,
    path: PathBuf,
    sector_file: File,
    metadata_file: File,
    state: Mutex<FolderState>,
    unavailable: AtomicBool,
    successful_writes: AtomicU64,
    failed_writes: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl StorageFolder {
    /// Creates the folder directory and both files at full size, zeroed.
    pub fn create(index: u16, path: &Path, slot_count: u32) -> io::Result<Self> {
        fs::create_dir_all(path)?;
        let folder = Self::open_files(index, path, slot_count)?;
        folder.reconcile_sizes(slot_count)?;
        folder.sector_file.sync_all()?;
        folder.metadata_file.sync_all()?;
        Ok(folder)
    }

    /// Opens an existing folder and reconciles on-disk sizes with the
    /// declared slot count, truncating or zero-extending as needed.
    pub fn open(index: u16, path: &Path, slot_count: u32) -> io::Result<Self> {
        if !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("storage folder directory missing: {}", path.display()),
            ));
        }
        let folder = Self::open_files(index, path, slot_count)?;
        folder.reconcile_sizes(slot_count)?;
        Ok(folder)
    }

    fn open_files(index: u16, path: &Path, slot_count: u32) -> io::Result<Self> {
        let sector_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.join(SECTORS_FILE_NAME))?;
        let metadata_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.join(METADATA_FILE_NAME))?;

        Ok(Self {
            index,
            path: path.to_path_buf(),
            sector_file,
            metadata_file,
            state: Mutex::new(FolderState {
                usage: bitvec![u64, Lsb0; 0; slot_count as usize],
                available_sectors: HashMap::new(),
            }),
            unavailable: AtomicBool::new(false),
            successful_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    fn reconcile_sizes(&self, slot_count: u32) -> io::Result<()> {
        let want_data = slot_count as u64 * SECTOR_SIZE as u64;
        let want_meta = slot_count as u64 * META_ENTRY_SIZE as u64;
        if self.sector_file.metadata()?.len() != want_data {
            self.sector_file.set_len(want_data)?;
        }
        if self.metadata_file.metadata()?.len() != want_meta {
            self.metadata_file.set_len(want_meta)?;
        }
        Ok(())
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sectors_path(&self) -> PathBuf {
        self.path.join(SECTORS_FILE_NAME)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE_NAME)
    }

    /// Locks and returns the mutable folder state.
    pub fn state(&self) -> MutexGuard<'_, FolderState> {
        self.state.lock()
    }

    pub fn slot_count(&self) -> u32 {
        self.state.lock().usage.len() as u32
    }

    /// Number of slots currently reserved or occupied.
    pub fn used_slots(&self) -> u32 {
        self.state.lock().usage.count_ones() as u32
    }

    // -- positional I/O ----------------------------------------------------

    /// Reads one sector payload.
    pub fn read_sector(&self, slot: u32) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.sector_file
            .read_exact_at(&mut buf, slot as u64 * SECTOR_SIZE as u64)?;
        Ok(buf)
    }

    /// Positionally writes one sector payload. The caller syncs.
    pub fn write_sector(&self, slot: u32, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len(), SECTOR_SIZE);
        self.sector_file
            .write_all_at(data, slot as u64 * SECTOR_SIZE as u64)
    }

    /// Reads one metadata record.
    pub fn read_metadata(&self, slot: u32) -> io::Result<(SectorId, u16)> {
        let mut buf = [0u8; META_ENTRY_SIZE];
        self.metadata_file
            .read_exact_at(&mut buf, slot as u64 * META_ENTRY_SIZE as u64)?;
        let mut id = SectorId::default();
        id.0.copy_from_slice(&buf[..12]);
        let count = u16::from_le_bytes([buf[12], buf[13]]);
        Ok((id, count))
    }

    /// Writes one metadata record. The caller syncs.
    pub fn write_metadata(&self, slot: u32, id: SectorId, count: u16) -> io::Result<()> {
        let mut buf = [0u8; META_ENTRY_SIZE];
        buf[..12].copy_from_slice(&id.0);
        buf[12..14].copy_from_slice(&count.to_le_bytes());
        self.metadata_file
            .write_all_at(&buf, slot as u64 * META_ENTRY_SIZE as u64)
    }

    pub fn sync_sectors(&self) -> io::Result<()> {
        self.sector_file.sync_all()
    }

    pub fn sync_metadata(&self) -> io::Result<()> {
        self.metadata_file.sync_all()
    }

    /// Scans the metadata file and yields every record with `count > 0`.
    pub fn scan_metadata(&self) -> io::Result<Vec<(u32, SectorId, u16)>> {
        // SAFETY: the mapping is dropped before this function returns and
        // the metadata file is not resized concurrently during recovery.
        let mmap = unsafe { Mmap::map(&self.metadata_file)? };
        let slot_count = (mmap.len() / META_ENTRY_SIZE) as u32;
        let mut records = Vec::new();
        for slot in 0..slot_count {
            let start = slot as usize * META_ENTRY_SIZE;
            let entry = &mmap[start..start + META_ENTRY_SIZE];
            let count = u16::from_le_bytes([entry[12], entry[13]]);
            if count == 0 {
                continue;
            }
            let mut id = SectorId::default();
            id.0.copy_from_slice(&entry[..12]);
            records.push((slot, id, count));
        }
        Ok(records)
    }

    // -- resizing ----------------------------------------------------------

    /// Extends both files and the usage bitmap to `new_slot_count` slots.
    /// New slots arrive zeroed (vacant).
    pub fn grow(&self, new_slot_count: u32) -> io::Result<()> {
        self.sector_file
            .set_len(new_slot_count as u64 * SECTOR_SIZE as u64)?;
        self.metadata_file
            .set_len(new_slot_count as u64 * META_ENTRY_SIZE as u64)?;
        self.sector_file.sync_all()?;
        self.metadata_file.sync_all()?;

        let mut state = self.state.lock();
        let len = state.usage.len();
        if (new_slot_count as usize) > len {
            state.usage.resize(new_slot_count as usize, false);
        }
        Ok(())
    }

    /// Shrinks the usage bitmap to `new_slot_count` slots. File truncation
    /// is driven separately by `Truncate` updates.
    pub fn shrink_usage(&self, new_slot_count: u32) {
        let mut state = self.state.lock();
        if (new_slot_count as usize) < state.usage.len() {
            state.usage.truncate(new_slot_count as usize);
            let retained: Vec<(SectorId, u32)> = state
                .available_sectors
                .iter()
                .filter(|(_, &slot)| slot < new_slot_count)
                .map(|(id, &slot)| (*id, slot))
                .collect();
            state.available_sectors = retained.into_iter().collect();
        }
    }

    /// Deletes the folder's files and directory, best effort.
    pub fn remove_files(&self) {
        for path in [self.sectors_path(), self.metadata_path()] {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "failed to delete storage folder file");
            }
        }
        if let Err(err) = fs::remove_dir(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to delete storage folder directory");
        }
    }

    // -- health ------------------------------------------------------------

    /// True when the folder is quarantined and must not receive
    /// allocations.
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    /// Records a successful write and lifts the failure streak.
    pub fn record_write_success(&self) {
        self.successful_writes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Records a failed write. Returns true if this failure crossed the
    /// quarantine threshold.
    pub fn record_write_failure(&self) -> bool {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
        let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= MAX_FOLDER_FAILURES && !self.unavailable.swap(true, Ordering::AcqRel) {
            error!(
                folder = self.index,
                path = %self.path.display(),
                "storage folder quarantined after repeated write failures"
            );
            return true;
        }
        false
    }

    /// Snapshot of the folder's write counters and health.
    pub fn report(&self) -> FolderReport {
        FolderReport {
            index: self.index,
            path: self.path.clone(),
            slot_count: self.slot_count(),
            used_slots: self.used_slots(),
            successful_writes: self.successful_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            unavailable: self.is_unavailable(),
        }
    }
}

/// Point-in-time report of one folder's state, for the host's status
/// surface.
#[derive(Debug, Clone)]
pub struct FolderReport {
    pub index: u16,
    pub path: PathBuf,
    pub slot_count: u32,
    pub used_slots: u32,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub unavailable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sizes_both_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("folder-a");
        let folder = StorageFolder::create(0, &path, 8).unwrap();

        assert_eq!(
            fs::metadata(folder.sectors_path()).unwrap().len(),
            8 * SECTOR_SIZE as u64
        );
        assert_eq!(
            fs::metadata(folder.metadata_path()).unwrap().len(),
            8 * META_ENTRY_SIZE as u64
        );
        assert_eq!(folder.slot_count(), 8);
        assert_eq!(folder.used_slots(), 0);
    }

    #[test]
    fn metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let folder = StorageFolder::create(0, &dir.path().join("f"), 8).unwrap();
        let id = SectorId([7u8; 12]);

        folder.write_metadata(3, id, 2).unwrap();
        folder.sync_metadata().unwrap();

        let (read_id, count) = folder.read_metadata(3).unwrap();
        assert_eq!(read_id, id);
        assert_eq!(count, 2);

        let records = folder.scan_metadata().unwrap();
        assert_eq!(records, vec![(3, id, 2)]);
    }

    #[test]
    fn scan_skips_zero_count_entries() {
        let dir = tempdir().unwrap();
        let folder = StorageFolder::create(0, &dir.path().join("f"), 8).unwrap();
        folder.write_metadata(1, SectorId([1u8; 12]), 0).unwrap();
        folder.write_metadata(2, SectorId([2u8; 12]), 5).unwrap();

        let records = folder.scan_metadata().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 2);
    }

    #[test]
    fn open_reconciles_truncated_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        {
            let _folder = StorageFolder::create(0, &path, 8).unwrap();
        }
        // Simulate a crash mid-grow leaving the data file short.
        let sectors = path.join(SECTORS_FILE_NAME);
        OpenOptions::new()
            .write(true)
            .open(&sectors)
            .unwrap()
            .set_len(3 * SECTOR_SIZE as u64)
            .unwrap();

        let folder = StorageFolder::open(0, &path, 8).unwrap();
        assert_eq!(
            fs::metadata(folder.sectors_path()).unwrap().len(),
            8 * SECTOR_SIZE as u64
        );
    }

    #[test]
    fn grow_extends_usage_bitmap() {
        let dir = tempdir().unwrap();
        let folder = StorageFolder::create(0, &dir.path().join("f"), 8).unwrap();
        folder.grow(16).unwrap();
        assert_eq!(folder.slot_count(), 16);
        assert_eq!(folder.used_slots(), 0);
    }

    #[test]
    fn quarantine_after_failure_streak() {
        let dir = tempdir().unwrap();
        let folder = StorageFolder::create(0, &dir.path().join("f"), 8).unwrap();

        for _ in 0..MAX_FOLDER_FAILURES - 1 {
            assert!(!folder.record_write_failure());
        }
        assert!(!folder.is_unavailable());
        assert!(folder.record_write_failure());
        assert!(folder.is_unavailable());
        // Crossing the threshold again does not re-report.
        assert!(!folder.record_write_failure());
    }

    #[test]
    fn success_resets_failure_streak() {
        let dir = tempdir().unwrap();
        let folder = StorageFolder::create(0, &dir.path().join("f"), 8).unwrap();
        for _ in 0..MAX_FOLDER_FAILURES - 1 {
            folder.record_write_failure();
        }
        folder.record_write_success();
        for _ in 0..MAX_FOLDER_FAILURES - 1 {
            folder.record_write_failure();
        }
        assert!(!folder.is_unavailable());
    }
}
