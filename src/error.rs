//! Error and Result types for host storage operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for sector store and storage folder operations.
///
/// Variants fall into four groups. Validation errors (`MalformedSector`,
/// `InsufficientCapacity`, `AlreadyExists`) are reported to the caller with
/// no state change. State errors (`SectorNotFound`, `MaxVirtualSectors`,
/// `ShuttingDown`) are reported without internal retries. Persistence
/// errors (`DiskTrouble`, `Corruption`) raise an alert and may quarantine
/// the offending folder. `Fatal` marks a programming error; the host halts
/// rather than continuing on inconsistent state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Sector payload is not exactly `SECTOR_SIZE` bytes.
    #[error("malformed sector: expected {expected} bytes, got {actual}")]
    MalformedSector {
        /// Required payload length.
        expected: usize,
        /// Length the caller provided.
        actual: usize,
    },

    /// No sector with the given root is stored.
    #[error("sector not found")]
    SectorNotFound,

    /// The sector's reference count is already at `u16::MAX`.
    #[error("sector has reached the maximum number of virtual references")]
    MaxVirtualSectors,

    /// Every eligible storage folder is full or unavailable.
    #[error("no storage folder has room for the sector")]
    OutOfStorage,

    /// A shrink or removal could not relocate the displaced sectors.
    #[error("insufficient capacity to relocate sectors from folder {folder}")]
    InsufficientCapacity {
        /// Index of the folder being shrunk or removed.
        folder: u16,
    },

    /// A storage folder is already registered at the given path.
    #[error("storage folder already exists at {path}")]
    AlreadyExists {
        /// The duplicate path.
        path: String,
    },

    /// A folder add or resize asked for a slot count outside the
    /// permitted range.
    #[error("invalid storage folder size: {requested} slots")]
    InvalidSlotCount {
        /// The rejected slot count.
        requested: u32,
    },

    /// No storage folder is registered at the given index.
    #[error("no storage folder at index {index}")]
    FolderNotFound {
        /// The missing folder index.
        index: u16,
    },

    /// A read returned bytes whose Merkle root does not match the index.
    #[error("sector data corrupt in folder {folder} slot {slot}")]
    Corruption {
        /// Folder holding the corrupt slot.
        folder: u16,
        /// Slot whose payload failed verification.
        slot: u32,
    },

    /// An I/O operation against a folder or the WAL failed.
    #[error("disk trouble: {context}")]
    DiskTrouble {
        /// Brief description of the failed operation.
        context: String,
        /// Underlying I/O error, when one was observed.
        #[source]
        source: Option<io::Error>,
    },

    /// The host is shutting down; no new operations are admitted.
    #[error("host is shutting down")]
    ShuttingDown,

    /// A programming error was detected. The host must halt.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Wraps an I/O error with a brief context string.
    pub fn disk<C: Into<String>>(context: C, source: io::Error) -> Self {
        StoreError::DiskTrouble {
            context: context.into(),
            source: Some(source),
        }
    }

    /// A disk-trouble error with no underlying `io::Error`, for conditions
    /// like a quarantined folder standing in the way of an operation.
    pub fn disk_state<C: Into<String>>(context: C) -> Self {
        StoreError::DiskTrouble {
            context: context.into(),
            source: None,
        }
    }

    /// True for the persistence-class errors that raise host alerts.
    pub fn is_disk_trouble(&self) -> bool {
        matches!(self, StoreError::DiskTrouble { .. })
    }
}

/// Extension trait attaching disk-trouble context to raw I/O results.
pub trait IoResultExt<T> {
    /// Maps `io::Error` into [`StoreError::DiskTrouble`] with `context`.
    fn disk_context(self, context: &str) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, io::Error> {
    fn disk_context(self, context: &str) -> Result<T> {
        self.map_err(|e| StoreError::disk(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_trouble_classification() {
        let err = StoreError::disk("writing sector", io::Error::other("boom"));
        assert!(err.is_disk_trouble());
        assert!(!StoreError::SectorNotFound.is_disk_trouble());
    }

    #[test]
    fn io_result_ext_attaches_context() {
        let res: std::result::Result<(), io::Error> = Err(io::Error::other("nope"));
        let err = res.disk_context("syncing metadata").unwrap_err();
        assert!(err.to_string().contains("syncing metadata"));
    }
}
