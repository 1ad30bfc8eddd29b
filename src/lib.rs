//! # hoststore - Host Sector Storage Engine
//!
//! hoststore is the storage core of a decentralized file-storage host: it
//! commits, serves, duplicates, and removes fixed-size encrypted sectors
//! on behalf of remote renters while keeping a crash-consistent layout
//! across any number of storage folders.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Host façade (HostStore)           │  consumed by the RPC layer
//! ├─────────────────────────────────────────┤
//! │  Sector store (index, locks, refcounts)  │
//! ├──────────────────────┬──────────────────┤
//! │ Storage folder mgmt  │  Write-ahead log  │
//! ├──────────────────────┴──────────────────┤
//! │   Positional file I/O (data + metadata)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every mutation flows through the WAL: a transaction is appended and
//! made durable before the folder files change, and replayed at the next
//! startup if the host dies in between. Sectors are content-addressed by
//! the Merkle root of their payload; renters pinning the same payload
//! share one physical slot through a virtual reference count.
//!
//! ## On-Disk Layout
//!
//! ```text
//! persist_dir/
//! ├── settings.json        # salt + folder paths and slot counts
//! └── wal.dat              # write-ahead log
//!
//! <each storage folder>/
//! ├── sectors.dat          # slot_count * SECTOR_SIZE bytes
//! └── metadata.dat         # slot_count * META_ENTRY_SIZE bytes
//! ```
//!
//! Slot `i` of the two folder files is indexed in parallel: the data file
//! holds the payload, the metadata file holds the 12-byte salted sector
//! ID and a little-endian `u16` reference count.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hoststore::{merkle_root, HostStore, SECTOR_SIZE};
//!
//! let store = HostStore::open(persist_dir)?;
//! store.add_storage_folder(folder_dir, 64)?;
//!
//! let data = vec![0u8; SECTOR_SIZE];
//! let root = merkle_root(&data);
//! store.add_sector(root, &data)?;
//! assert_eq!(store.read_sector(root)?, data);
//! ```
//!
//! ## Module Overview
//!
//! - [`store`]: the `HostStore` façade and its operations
//! - [`folder`]: storage folder files, usage bitmaps, allocation
//! - [`wal`]: write-ahead log and the update catalog
//! - [`crypto`]: Merkle roots and salted sector IDs
//! - [`alerts`]: host health alerts
//! - [`error`]: the `StoreError` taxonomy

pub mod alerts;
pub mod crypto;
pub mod error;
pub mod folder;
pub mod sector_locks;
pub mod store;
pub mod threadgroup;
pub mod wal;

pub use crypto::{merkle_root, Hash, SectorId, SectorSalt};
pub use error::{Result, StoreError};
pub use store::{HostStore, SectorLocation, StorageCapacity};

/// Size of one sector payload in bytes (4 MiB).
pub const SECTOR_SIZE: usize = 1 << 22;

/// Size of one metadata record: 12-byte sector ID plus `u16` count.
pub const META_ENTRY_SIZE: usize = crypto::SECTOR_ID_LEN + 2;

/// Upper bound on concurrent workers for batch sector operations.
pub const MAX_BATCH_PARALLELISM: usize = 16;
