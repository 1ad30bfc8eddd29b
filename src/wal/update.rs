//! The catalog of idempotent WAL updates.
//!
//! Each update is a self-contained instruction: it names the target file
//! by path (so replay works without any in-memory handle cache), the slot,
//! and the payload. Updates are encoded with a one-byte tag followed by
//! little-endian fields; paths and sector payloads are length-prefixed.
//! The tags are part of the on-disk format and must never be renumbered.

use crate::crypto::{SectorId, SECTOR_ID_LEN};
use crate::error::{Result, StoreError};
use std::path::PathBuf;

const TAG_ADD_STORAGE_FOLDER: u8 = 1;
const TAG_GROW_STORAGE_FOLDER: u8 = 2;
const TAG_SHRINK_STORAGE_FOLDER: u8 = 3;
const TAG_REMOVE_STORAGE_FOLDER: u8 = 4;
const TAG_SECTOR_DATA: u8 = 5;
const TAG_SECTOR_METADATA: u8 = 6;
const TAG_TRUNCATE: u8 = 7;

/// An idempotent on-disk mutation recorded in the WAL.
///
/// Replaying any suffix of committed updates produces the same on-disk
/// state as applying each update exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalUpdate {
    /// Create a folder's files and register it at the next free index.
    AddStorageFolder {
        path: PathBuf,
        slot_count: u32,
    },
    /// Extend a folder's files and usage bitmap to a larger slot count.
    GrowStorageFolder {
        index: u16,
        new_slot_count: u32,
    },
    /// Truncate a folder to a smaller slot count. Sectors above the new
    /// size must already be migrated unless `force` is set.
    ShrinkStorageFolder {
        index: u16,
        new_slot_count: u32,
        force: bool,
    },
    /// Drop an emptied folder and delete its files.
    RemoveStorageFolder {
        index: u16,
        path: PathBuf,
    },
    /// Positional write of one sector payload.
    SectorData {
        path: PathBuf,
        slot: u32,
        data: Vec<u8>,
    },
    /// Write one fixed-size metadata record.
    SectorMetadata {
        path: PathBuf,
        slot: u32,
        id: SectorId,
        count: u16,
    },
    /// Truncate a file to a new size.
    Truncate {
        path: PathBuf,
        new_size: u64,
    },
}

impl WalUpdate {
    /// Appends the encoded update to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            WalUpdate::AddStorageFolder { path, slot_count } => {
                buf.push(TAG_ADD_STORAGE_FOLDER);
                encode_path(buf, path);
                buf.extend_from_slice(&slot_count.to_le_bytes());
            }
            WalUpdate::GrowStorageFolder {
                index,
                new_slot_count,
            } => {
                buf.push(TAG_GROW_STORAGE_FOLDER);
                buf.extend_from_slice(&index.to_le_bytes());
                buf.extend_from_slice(&new_slot_count.to_le_bytes());
            }
            WalUpdate::ShrinkStorageFolder {
                index,
                new_slot_count,
                force,
            } => {
                buf.push(TAG_SHRINK_STORAGE_FOLDER);
                buf.extend_from_slice(&index.to_le_bytes());
                buf.extend_from_slice(&new_slot_count.to_le_bytes());
                buf.push(u8::from(*force));
            }
            WalUpdate::RemoveStorageFolder { index, path } => {
                buf.push(TAG_REMOVE_STORAGE_FOLDER);
                buf.extend_from_slice(&index.to_le_bytes());
                encode_path(buf, path);
            }
            WalUpdate::SectorData { path, slot, data } => {
                buf.push(TAG_SECTOR_DATA);
                encode_path(buf, path);
                buf.extend_from_slice(&slot.to_le_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
            }
            WalUpdate::SectorMetadata {
                path,
                slot,
                id,
                count,
            } => {
                buf.push(TAG_SECTOR_METADATA);
                encode_path(buf, path);
                buf.extend_from_slice(&slot.to_le_bytes());
                buf.extend_from_slice(&id.0);
                buf.extend_from_slice(&count.to_le_bytes());
            }
            WalUpdate::Truncate { path, new_size } => {
                buf.push(TAG_TRUNCATE);
                encode_path(buf, path);
                buf.extend_from_slice(&new_size.to_le_bytes());
            }
        }
    }

    /// Decodes one update from the front of `input`, advancing it.
    ///
    /// An unknown tag is a programming error (the log was written by an
    /// incompatible version) and is fatal rather than recoverable.
    pub fn decode(input: &mut &[u8]) -> Result<WalUpdate> {
        let tag = take_u8(input)?;
        match tag {
            TAG_ADD_STORAGE_FOLDER => Ok(WalUpdate::AddStorageFolder {
                path: decode_path(input)?,
                slot_count: take_u32(input)?,
            }),
            TAG_GROW_STORAGE_FOLDER => Ok(WalUpdate::GrowStorageFolder {
                index: take_u16(input)?,
                new_slot_count: take_u32(input)?,
            }),
            TAG_SHRINK_STORAGE_FOLDER => Ok(WalUpdate::ShrinkStorageFolder {
                index: take_u16(input)?,
                new_slot_count: take_u32(input)?,
                force: take_u8(input)? != 0,
            }),
            TAG_REMOVE_STORAGE_FOLDER => Ok(WalUpdate::RemoveStorageFolder {
                index: take_u16(input)?,
                path: decode_path(input)?,
            }),
            TAG_SECTOR_DATA => {
                let path = decode_path(input)?;
                let slot = take_u32(input)?;
                let len = take_u32(input)? as usize;
                let data = take_bytes(input, len)?.to_vec();
                Ok(WalUpdate::SectorData { path, slot, data })
            }
            TAG_SECTOR_METADATA => {
                let path = decode_path(input)?;
                let slot = take_u32(input)?;
                let id_bytes = take_bytes(input, SECTOR_ID_LEN)?;
                let mut id = SectorId::default();
                id.0.copy_from_slice(id_bytes);
                let count = take_u16(input)?;
                Ok(WalUpdate::SectorMetadata {
                    path,
                    slot,
                    id,
                    count,
                })
            }
            TAG_TRUNCATE => Ok(WalUpdate::Truncate {
                path: decode_path(input)?,
                new_size: take_u64(input)?,
            }),
            other => Err(StoreError::Fatal(format!(
                "unknown WAL update tag {other}"
            ))),
        }
    }

    /// Decodes exactly `count` updates from `payload`.
    pub fn decode_all(mut payload: &[u8], count: u32) -> Result<Vec<WalUpdate>> {
        let mut updates = Vec::with_capacity(count as usize);
        for _ in 0..count {
            updates.push(WalUpdate::decode(&mut payload)?);
        }
        if !payload.is_empty() {
            return Err(StoreError::Fatal(format!(
                "{} trailing bytes after decoding WAL transaction",
                payload.len()
            )));
        }
        Ok(updates)
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            WalUpdate::AddStorageFolder { .. } => "AddStorageFolder",
            WalUpdate::GrowStorageFolder { .. } => "GrowStorageFolder",
            WalUpdate::ShrinkStorageFolder { .. } => "ShrinkStorageFolder",
            WalUpdate::RemoveStorageFolder { .. } => "RemoveStorageFolder",
            WalUpdate::SectorData { .. } => "SectorData",
            WalUpdate::SectorMetadata { .. } => "SectorMetadata",
            WalUpdate::Truncate { .. } => "Truncate",
        }
    }
}

fn encode_path(buf: &mut Vec<u8>, path: &PathBuf) {
    let bytes = path.to_string_lossy();
    let bytes = bytes.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn decode_path(input: &mut &[u8]) -> Result<PathBuf> {
    let len = take_u32(input)? as usize;
    let bytes = take_bytes(input, len)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| StoreError::Fatal("non-UTF-8 path in WAL update".to_string()))?;
    Ok(PathBuf::from(s))
}

fn take_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if input.len() < len {
        return Err(StoreError::Fatal(format!(
            "truncated WAL update: wanted {len} bytes, had {}",
            input.len()
        )));
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}

fn take_u8(input: &mut &[u8]) -> Result<u8> {
    Ok(take_bytes(input, 1)?[0])
}

fn take_u16(input: &mut &[u8]) -> Result<u16> {
    Ok(u16::from_le_bytes(take_bytes(input, 2)?.try_into().unwrap()))
}

fn take_u32(input: &mut &[u8]) -> Result<u32> {
    Ok(u32::from_le_bytes(take_bytes(input, 4)?.try_into().unwrap()))
}

fn take_u64(input: &mut &[u8]) -> Result<u64> {
    Ok(u64::from_le_bytes(take_bytes(input, 8)?.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(update: WalUpdate) {
        let mut buf = Vec::new();
        update.encode(&mut buf);
        let mut slice = buf.as_slice();
        let decoded = WalUpdate::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded, update);
    }

    #[test]
    fn encodes_every_variant() {
        roundtrip(WalUpdate::AddStorageFolder {
            path: PathBuf::from("/srv/folder-a"),
            slot_count: 64,
        });
        roundtrip(WalUpdate::GrowStorageFolder {
            index: 3,
            new_slot_count: 128,
        });
        roundtrip(WalUpdate::ShrinkStorageFolder {
            index: 3,
            new_slot_count: 32,
            force: true,
        });
        roundtrip(WalUpdate::RemoveStorageFolder {
            index: 9,
            path: PathBuf::from("/srv/folder-b"),
        });
        roundtrip(WalUpdate::SectorData {
            path: PathBuf::from("/srv/folder-a/sectors.dat"),
            slot: 17,
            data: vec![0xee; 512],
        });
        roundtrip(WalUpdate::SectorMetadata {
            path: PathBuf::from("/srv/folder-a/metadata.dat"),
            slot: 17,
            id: SectorId([5u8; SECTOR_ID_LEN]),
            count: 2,
        });
        roundtrip(WalUpdate::Truncate {
            path: PathBuf::from("/srv/folder-a/sectors.dat"),
            new_size: 1 << 30,
        });
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let buf = [0xffu8, 0, 0];
        let mut slice = &buf[..];
        match WalUpdate::decode(&mut slice) {
            Err(StoreError::Fatal(msg)) => assert!(msg.contains("unknown WAL update tag")),
            other => panic!("expected Fatal, got {:?}", other),
        }
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let update = WalUpdate::GrowStorageFolder {
            index: 1,
            new_slot_count: 99,
        };
        let mut buf = Vec::new();
        update.encode(&mut buf);
        buf.truncate(buf.len() - 1);
        let mut slice = buf.as_slice();
        assert!(matches!(
            WalUpdate::decode(&mut slice),
            Err(StoreError::Fatal(_))
        ));
    }

    #[test]
    fn decode_all_rejects_trailing_bytes() {
        let update = WalUpdate::Truncate {
            path: PathBuf::from("/x"),
            new_size: 10,
        };
        let mut buf = Vec::new();
        update.encode(&mut buf);
        buf.push(0);
        assert!(matches!(
            WalUpdate::decode_all(&buf, 1),
            Err(StoreError::Fatal(_))
        ));
    }
}
