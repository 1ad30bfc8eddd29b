//! # Write-Ahead Log
//!
//! All mutations to the sector store go through the WAL, which provides an
//! ordered, durable log of idempotent updates replayed at startup after an
//! unclean shutdown.
//!
//! ## File Format
//!
//! A single `wal.dat` file in the persist directory:
//!
//! ```text
//! +---------------------+----------------------+----------------------+
//! | File header (32 B)  | Transaction record   | Transaction record…  |
//! +---------------------+----------------------+----------------------+
//! ```
//!
//! Each transaction record is a 32-byte header followed by the encoded
//! updates:
//!
//! ```text
//! payload_len: u32 | update_count: u32 | seq: u64 | checksum: u64 |
//! status: u8 | reserved [7]
//! ```
//!
//! The checksum is CRC-64/ECMA over the header prefix (length, count,
//! sequence) and the payload. The status byte is excluded so it can be
//! flipped in place without rewriting the record.
//!
//! ## Transaction Lifecycle
//!
//! 1. `new_transaction` appends the full record with status `PENDING`.
//! 2. `signal_setup_complete` flips the status to `COMMITTED` and fsyncs.
//!    Once it returns, the updates are durable and will be replayed after
//!    a crash.
//! 3. The caller applies the updates to the folder files.
//! 4. `signal_updates_applied` flips the status to `APPLIED` and fsyncs;
//!    the record is then skipped by recovery.
//!
//! Appends are serialized under one lock, so a record is always fully
//! written before the next record begins. An fsync therefore makes every
//! earlier record durable as well, and the only records recovery can find
//! torn are in the never-synced tail, which it discards.
//!
//! ## Truncation
//!
//! When the last live transaction retires, the log is truncated back to
//! its header. The background syncer also truncates opportunistically.

mod update;

pub use update::WalUpdate;

use crate::error::{IoResultExt, Result, StoreError};
use crc::{Crc, CRC_64_ECMA_182};
use hashbrown::HashSet;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Name of the log file inside the persist directory.
pub const WAL_FILE_NAME: &str = "wal.dat";

/// Size of the file header in bytes.
pub const WAL_HEADER_SIZE: u64 = 32;

/// Size of a transaction record header in bytes.
pub const TXN_HEADER_SIZE: usize = 32;

const WAL_MAGIC: &[u8; 16] = b"hoststore wal\x00\x00\x00";
const WAL_VERSION: u16 = 1;

const STATUS_PENDING: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_APPLIED: u8 = 2;

/// Byte offset of the status field inside a transaction header.
const STATUS_OFFSET: u64 = 24;

/// Records larger than this are treated as corruption, not allocation
/// requests. Bounds a transaction to one sector payload plus slack.
const MAX_TXN_PAYLOAD: u32 = (crate::SECTOR_SIZE as u32) + (1 << 16);

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

use zerocopy::{FromBytes, Immutable, IntoBytes};

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable)]
struct WalFileHeader {
    magic: [u8; 16],
    version: u16,
    _reserved: [u8; 14],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable)]
struct TxnHeader {
    payload_len: u32,
    update_count: u32,
    seq: u64,
    checksum: u64,
    status: u8,
    _reserved: [u8; 7],
}

fn compute_checksum(payload_len: u32, update_count: u32, seq: u64, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&payload_len.to_le_bytes());
    digest.update(&update_count.to_le_bytes());
    digest.update(&seq.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

struct WalInner {
    file: File,
    end_offset: u64,
}

/// The write-ahead log.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
    /// Sequence numbers of transactions that have been written but not yet
    /// retired (applied or dropped). Truncation waits for this to drain.
    live: Mutex<HashSet<u64>>,
    next_seq: AtomicU64,
}

impl Wal {
    /// Opens the log at `dir/wal.dat`, creating it if missing.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(WAL_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .disk_context("opening WAL file")?;

        let len = file.metadata().disk_context("reading WAL metadata")?.len();
        if len < WAL_HEADER_SIZE {
            let header = WalFileHeader {
                magic: *WAL_MAGIC,
                version: WAL_VERSION,
                _reserved: [0u8; 14],
            };
            file.write_all_at(header.as_bytes(), 0)
                .disk_context("writing WAL header")?;
            file.set_len(WAL_HEADER_SIZE)
                .disk_context("sizing new WAL file")?;
            file.sync_all().disk_context("syncing new WAL file")?;
        } else {
            let mut buf = [0u8; WAL_HEADER_SIZE as usize];
            file.read_exact_at(&mut buf, 0)
                .disk_context("reading WAL header")?;
            let header = WalFileHeader::read_from_bytes(&buf)
                .map_err(|_| StoreError::Fatal("invalid WAL header layout".to_string()))?;
            if header.magic != *WAL_MAGIC {
                return Err(StoreError::Fatal("WAL magic mismatch".to_string()));
            }
            if header.version != WAL_VERSION {
                return Err(StoreError::Fatal(format!(
                    "unsupported WAL version {}",
                    header.version
                )));
            }
        }

        Ok(Self {
            path,
            inner: Mutex::new(WalInner {
                file,
                end_offset: len.max(WAL_HEADER_SIZE),
            }),
            live: Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates a transaction from the given updates. The record is written
    /// to the log immediately but is not durable (and will not be replayed)
    /// until [`WalTransaction::signal_setup_complete`] returns.
    pub fn new_transaction(&self, updates: &[WalUpdate]) -> Result<WalTransaction<'_>> {
        let mut payload = Vec::new();
        for update in updates {
            update.encode(&mut payload);
        }
        let payload_len = payload.len() as u32;
        let update_count = updates.len() as u32;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let checksum = compute_checksum(payload_len, update_count, seq, &payload);

        let header = TxnHeader {
            payload_len,
            update_count,
            seq,
            checksum,
            status: STATUS_PENDING,
            _reserved: [0u8; 7],
        };

        let mut record: SmallVec<[u8; 256]> = SmallVec::with_capacity(TXN_HEADER_SIZE + payload.len());
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(&payload);

        let offset;
        {
            let mut inner = self.inner.lock();
            offset = inner.end_offset;
            inner
                .file
                .write_all_at(&record, offset)
                .disk_context("appending WAL transaction")?;
            inner.end_offset += record.len() as u64;
        }
        self.live.lock().insert(seq);

        Ok(WalTransaction {
            wal: self,
            seq,
            offset,
            committed: false,
            retired: false,
            poisoned: false,
        })
    }

    fn write_status(&self, offset: u64, status: u8) -> Result<()> {
        let inner = self.inner.lock();
        inner
            .file
            .write_all_at(&[status], offset + STATUS_OFFSET)
            .disk_context("updating WAL transaction status")?;
        inner
            .file
            .sync_all()
            .disk_context("syncing WAL transaction status")?;
        Ok(())
    }

    fn retire(&self, seq: u64) {
        let idle = {
            let mut live = self.live.lock();
            live.remove(&seq);
            live.is_empty()
        };
        if idle {
            if let Err(err) = self.truncate_if_idle() {
                warn!(%err, "opportunistic WAL truncation failed");
            }
        }
    }

    /// Number of transactions written but not yet retired.
    pub fn outstanding(&self) -> usize {
        self.live.lock().len()
    }

    /// Truncates the log back to its header if no transactions are live.
    pub fn truncate_if_idle(&self) -> Result<()> {
        // Lock order: live before inner, matching retire().
        let live = self.live.lock();
        if !live.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.end_offset == WAL_HEADER_SIZE {
            return Ok(());
        }
        inner
            .file
            .set_len(WAL_HEADER_SIZE)
            .disk_context("truncating WAL")?;
        inner.file.sync_all().disk_context("syncing truncated WAL")?;
        inner.end_offset = WAL_HEADER_SIZE;
        debug!("WAL truncated");
        Ok(())
    }

    /// Scans the log and returns the transactions that reached setup
    /// complete but were never marked applied, in log order. A corrupt
    /// record ends the scan and the tail is discarded.
    ///
    /// Recovered sequence numbers are registered as live so the log is not
    /// truncated underneath them before they are signalled applied.
    pub fn recover(&self) -> Result<Vec<RecoveredTransaction>> {
        let mut recovered = Vec::new();
        let mut offset = WAL_HEADER_SIZE;
        let mut max_seq = 0u64;
        let mut inner = self.inner.lock();
        let end = inner.end_offset;

        while offset + TXN_HEADER_SIZE as u64 <= end {
            let mut header_buf = [0u8; TXN_HEADER_SIZE];
            if inner.file.read_exact_at(&mut header_buf, offset).is_err() {
                break;
            }
            let header = match TxnHeader::read_from_bytes(&header_buf) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.payload_len > MAX_TXN_PAYLOAD {
                break;
            }
            let payload_end = offset + TXN_HEADER_SIZE as u64 + header.payload_len as u64;
            if payload_end > end {
                break;
            }
            let mut payload = vec![0u8; header.payload_len as usize];
            if inner
                .file
                .read_exact_at(&mut payload, offset + TXN_HEADER_SIZE as u64)
                .is_err()
            {
                break;
            }
            let checksum =
                compute_checksum(header.payload_len, header.update_count, header.seq, &payload);
            if checksum != header.checksum {
                break;
            }

            if header.status == STATUS_COMMITTED {
                let updates = WalUpdate::decode_all(&payload, header.update_count)?;
                recovered.push(RecoveredTransaction {
                    seq: header.seq,
                    offset,
                    updates,
                });
            }
            max_seq = max_seq.max(header.seq);
            offset = payload_end;
        }

        if offset < end {
            warn!(
                discarded = end - offset,
                "discarding corrupt WAL tail"
            );
            inner
                .file
                .set_len(offset)
                .disk_context("discarding corrupt WAL tail")?;
            inner
                .file
                .sync_all()
                .disk_context("syncing WAL after tail discard")?;
        }
        inner.end_offset = offset;
        drop(inner);

        self.next_seq.store(max_seq + 1, Ordering::Relaxed);
        let mut live = self.live.lock();
        for txn in &recovered {
            live.insert(txn.seq);
        }
        Ok(recovered)
    }

    /// Marks a recovered transaction applied and retires it.
    pub fn signal_recovered_applied(&self, txn: &RecoveredTransaction) -> Result<()> {
        self.write_status(txn.offset, STATUS_APPLIED)?;
        self.retire(txn.seq);
        Ok(())
    }
}

/// A transaction replayed from the log at startup.
#[derive(Debug)]
pub struct RecoveredTransaction {
    /// Sequence number assigned when the transaction was created.
    pub seq: u64,
    offset: u64,
    /// The updates to re-apply, in their original order.
    pub updates: Vec<WalUpdate>,
}

/// Handle for an open WAL transaction.
///
/// Any I/O error poisons the handle; both signals fail afterwards. A
/// handle dropped without being applied retires its record (the record
/// stays in the log until truncation; `PENDING` records are skipped by
/// recovery, and a committed-but-unapplied record is replayed).
pub struct WalTransaction<'a> {
    wal: &'a Wal,
    seq: u64,
    offset: u64,
    committed: bool,
    retired: bool,
    poisoned: bool,
}

impl WalTransaction<'_> {
    /// Sequence number of this transaction.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Marks the transaction ready to apply and makes it durable. After
    /// this returns, a crash replays the transaction's updates.
    pub fn signal_setup_complete(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(StoreError::disk_state("WAL transaction is poisoned"));
        }
        if self.committed {
            return Ok(());
        }
        match self.wal.write_status(self.offset, STATUS_COMMITTED) {
            Ok(()) => {
                self.committed = true;
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// Marks the updates as committed to the final store. The WAL may then
    /// reclaim the record's space.
    pub fn signal_updates_applied(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(StoreError::disk_state("WAL transaction is poisoned"));
        }
        if !self.committed {
            return Err(StoreError::Fatal(
                "signal_updates_applied before signal_setup_complete".to_string(),
            ));
        }
        match self.wal.write_status(self.offset, STATUS_APPLIED) {
            Ok(()) => {
                self.retired = true;
                self.wal.retire(self.seq);
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }
}

impl Drop for WalTransaction<'_> {
    fn drop(&mut self) {
        if !self.retired {
            self.wal.retire(self.seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn sample_updates() -> Vec<WalUpdate> {
        vec![
            WalUpdate::SectorData {
                path: PathBuf::from("/f/sectors.dat"),
                slot: 2,
                data: vec![9u8; 128],
            },
            WalUpdate::SectorMetadata {
                path: PathBuf::from("/f/metadata.dat"),
                slot: 2,
                id: crate::crypto::SectorId([3u8; 12]),
                count: 1,
            },
        ]
    }

    #[test]
    fn committed_transaction_is_recovered() {
        let dir = tempdir().unwrap();
        let updates = sample_updates();
        {
            let wal = Wal::open(dir.path()).unwrap();
            let mut txn = wal.new_transaction(&updates).unwrap();
            txn.signal_setup_complete().unwrap();
            // Crash before signal_updates_applied.
            std::mem::forget(txn);
        }

        let wal = Wal::open(dir.path()).unwrap();
        let recovered = wal.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].updates, updates);
    }

    #[test]
    fn pending_transaction_is_not_recovered() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path()).unwrap();
            let txn = wal.new_transaction(&sample_updates()).unwrap();
            // Crash before signal_setup_complete.
            std::mem::forget(txn);
        }

        let wal = Wal::open(dir.path()).unwrap();
        assert!(wal.recover().unwrap().is_empty());
    }

    #[test]
    fn applied_transaction_is_not_recovered() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path()).unwrap();
            let mut txn = wal.new_transaction(&sample_updates()).unwrap();
            txn.signal_setup_complete().unwrap();
            txn.signal_updates_applied().unwrap();
        }

        let wal = Wal::open(dir.path()).unwrap();
        assert!(wal.recover().unwrap().is_empty());
    }

    #[test]
    fn retiring_last_transaction_truncates_log() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        let mut txn = wal.new_transaction(&sample_updates()).unwrap();
        txn.signal_setup_complete().unwrap();
        txn.signal_updates_applied().unwrap();
        drop(txn);

        assert_eq!(wal.outstanding(), 0);
        let len = std::fs::metadata(wal.path()).unwrap().len();
        assert_eq!(len, WAL_HEADER_SIZE);
    }

    #[test]
    fn corrupt_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let updates = sample_updates();
        let wal_path;
        {
            let wal = Wal::open(dir.path()).unwrap();
            wal_path = wal.path().to_path_buf();
            let mut first = wal.new_transaction(&updates).unwrap();
            first.signal_setup_complete().unwrap();
            let mut second = wal.new_transaction(&updates).unwrap();
            second.signal_setup_complete().unwrap();
            std::mem::forget(first);
            std::mem::forget(second);
        }

        // Flip a payload byte inside the second record.
        let data = std::fs::read(&wal_path).unwrap();
        let mut mangled = data.clone();
        let idx = data.len() - 10;
        mangled[idx] ^= 0xff;
        std::fs::write(&wal_path, mangled).unwrap();

        let wal = Wal::open(dir.path()).unwrap();
        let recovered = wal.recover().unwrap();
        assert_eq!(recovered.len(), 1, "only the intact prefix replays");
        assert_eq!(recovered[0].updates, updates);
    }

    #[test]
    fn updates_applied_requires_setup_complete() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        let mut txn = wal.new_transaction(&sample_updates()).unwrap();
        assert!(matches!(
            txn.signal_updates_applied(),
            Err(StoreError::Fatal(_))
        ));
    }

    #[test]
    fn transactions_recover_in_commit_order() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path()).unwrap();
            for slot in 0..4u32 {
                let mut txn = wal
                    .new_transaction(&[WalUpdate::Truncate {
                        path: PathBuf::from("/x"),
                        new_size: slot as u64,
                    }])
                    .unwrap();
                txn.signal_setup_complete().unwrap();
                std::mem::forget(txn);
            }
        }

        let wal = Wal::open(dir.path()).unwrap();
        let recovered = wal.recover().unwrap();
        let sizes: Vec<u64> = recovered
            .iter()
            .map(|t| match &t.updates[0] {
                WalUpdate::Truncate { new_size, .. } => *new_size,
                other => panic!("unexpected update {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![0, 1, 2, 3]);

        for txn in &recovered {
            wal.signal_recovered_applied(txn).unwrap();
        }
        assert_eq!(wal.outstanding(), 0);
    }
}
