//! Background maintenance thread.
//!
//! On a fixed cadence: truncate the WAL if no transactions are live and
//! sync every folder's files so the window of unsynced data stays small.
//! The thread parks on a condvar and is woken early by shutdown.

use super::SharedStore;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Cadence of the maintenance loop.
pub const SYNC_LOOP_INTERVAL: Duration = Duration::from_millis(500);

pub(super) fn spawn(shared: Arc<SharedStore>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("hoststore-syncer".to_string())
        .spawn(move || run(&shared))
        .expect("failed to spawn syncer thread")
}

fn run(shared: &SharedStore) {
    loop {
        {
            let mut stop = shared.syncer_stop.lock();
            if *stop {
                return;
            }
            shared
                .syncer_wake
                .wait_for(&mut stop, SYNC_LOOP_INTERVAL);
            if *stop {
                return;
            }
        }

        if let Err(err) = shared.wal.truncate_if_idle() {
            warn!(%err, "syncer failed to truncate WAL");
        }

        for folder in shared.folder_snapshot() {
            if let Err(err) = folder.sync_sectors().and_then(|_| folder.sync_metadata()) {
                warn!(folder = folder.index(), %err, "syncer failed to sync folder");
            }
        }
    }
}
