//! Startup: settings load, folder reconciliation, WAL replay, index
//! rebuild.
//!
//! Order matters. Folders are opened first and their file sizes
//! reconciled with the declared slot counts. Pending WAL transactions are
//! then replayed: folder-level updates mutate the registry, sector-level
//! updates mutate disk. Only after replay is the sector index rebuilt by
//! scanning the metadata files, so every index entry is validated against
//! the slot's final metadata record. Replayed transactions are signalled
//! applied last, which lets the log truncate.

use super::{load_or_init_settings, SectorLocation, SharedStore};
use crate::alerts::Alerter;
use crate::folder::StorageFolder;
use crate::sector_locks::SectorLockTable;
use crate::threadgroup::ThreadGroup;
use crate::wal::Wal;
use eyre::WrapErr;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::{info, warn};

pub(super) fn open_shared(persist_dir: &Path) -> eyre::Result<Arc<SharedStore>> {
    let settings = load_or_init_settings(persist_dir)?;

    let mut folders = HashMap::new();
    for entry in &settings.folders {
        let folder = StorageFolder::open(entry.index, &entry.path, entry.slot_count)
            .wrap_err_with(|| {
                format!(
                    "failed to open storage folder {} at '{}'",
                    entry.index,
                    entry.path.display()
                )
            })?;
        folders.insert(entry.index, Arc::new(folder));
    }

    let wal = Wal::open(persist_dir).wrap_err("failed to open the write-ahead log")?;

    let shared = Arc::new(SharedStore {
        persist_dir: persist_dir.to_path_buf(),
        salt: settings.salt,
        wal,
        sector_locations: RwLock::new(HashMap::new()),
        folders: RwLock::new(folders),
        sector_locks: SectorLockTable::new(),
        alerter: Alerter::new(),
        tg: ThreadGroup::new(),
        round_robin: AtomicU64::new(0),
        syncer_stop: Mutex::new(false),
        syncer_wake: Condvar::new(),
    });

    replay_wal(&shared)?;
    rebuild_index(&shared);

    // Folder-level replays may have changed the folder set.
    shared
        .save_settings()
        .map_err(|e| eyre::eyre!("failed to persist settings after recovery: {e}"))?;

    Ok(shared)
}

fn replay_wal(shared: &Arc<SharedStore>) -> eyre::Result<()> {
    let recovered = shared
        .wal
        .recover()
        .map_err(|e| eyre::eyre!("failed to recover the write-ahead log: {e}"))?;
    if recovered.is_empty() {
        return Ok(());
    }

    info!(
        transactions = recovered.len(),
        "replaying WAL after unclean shutdown"
    );
    for txn in &recovered {
        shared
            .apply_updates(&txn.updates, true)
            .map_err(|e| eyre::eyre!("failed to replay WAL transaction {}: {e}", txn.seq))?;
        shared
            .wal
            .signal_recovered_applied(txn)
            .map_err(|e| eyre::eyre!("failed to retire replayed transaction {}: {e}", txn.seq))?;
    }
    Ok(())
}

/// Rebuilds `sector_locations` and the usage bitmaps from the metadata
/// files. Entries with `count > 0` define the index; everything else is
/// vacant.
fn rebuild_index(shared: &Arc<SharedStore>) {
    let folders = shared.folder_snapshot();
    let mut locations = shared.sector_locations.write();

    for folder in folders {
        let records = match folder.scan_metadata() {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    folder = folder.index(),
                    %err,
                    "failed to scan folder metadata; folder starts empty"
                );
                continue;
            }
        };

        let mut state = folder.state();
        for (slot, id, count) in records {
            if locations.contains_key(&id) {
                warn!(
                    %id,
                    folder = folder.index(),
                    slot,
                    "duplicate sector record ignored during recovery"
                );
                continue;
            }
            state.usage.set(slot as usize, true);
            locations.insert(
                id,
                SectorLocation {
                    folder: folder.index(),
                    slot,
                    count,
                },
            );
        }
    }

    info!(sectors = locations.len(), "sector index rebuilt");
}
