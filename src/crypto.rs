//! # Content Addressing
//!
//! Sectors are addressed by the Merkle root of their payload. The tree is
//! built over 64-byte leaves with domain-separated blake3 hashing: leaf
//! hashes are prefixed with `0x00`, interior node hashes with `0x01`. Two
//! hosts storing the same payload compute the same root, which is what the
//! renter protocol relies on for storage proofs.
//!
//! On-disk sector identifiers are NOT raw roots. Each host mixes a private
//! 32-byte salt into the ID with a keyed hash:
//!
//! ```text
//! SectorId = blake3::keyed(salt, root)[..12]
//! ```
//!
//! Without the salt, an observer who can read a host's metadata files could
//! confirm which well-known payloads the host is storing by deriving IDs
//! from candidate roots. The salt is generated once when the host is
//! initialized and persisted with the settings.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a Merkle tree leaf in bytes.
pub const SEGMENT_SIZE: usize = 64;

/// Length of a sector identifier in bytes.
pub const SECTOR_ID_LEN: usize = 12;

/// Length of the host-private sector ID salt in bytes.
pub const SECTOR_SALT_LEN: usize = 32;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// A 32-byte Merkle root identifying a sector payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Compact on-disk sector identifier derived from a root and the host salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectorId(pub [u8; SECTOR_ID_LEN]);

impl SectorId {
    /// The all-zero ID marking a vacant metadata slot.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; SECTOR_ID_LEN]
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Host-private salt mixed into every sector ID.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorSalt(pub [u8; SECTOR_SALT_LEN]);

impl SectorSalt {
    /// Generates a fresh salt from OS randomness.
    pub fn generate() -> Self {
        let mut salt = [0u8; SECTOR_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        SectorSalt(salt)
    }

    /// Derives the on-disk identifier for a sector root.
    pub fn sector_id(&self, root: &Hash) -> SectorId {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(&root.0);
        let digest = hasher.finalize();
        let mut id = [0u8; SECTOR_ID_LEN];
        id.copy_from_slice(&digest.as_bytes()[..SECTOR_ID_LEN]);
        SectorId(id)
    }
}

impl fmt::Debug for SectorSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The salt never appears in logs.
        write!(f, "SectorSalt(..)")
    }
}

/// Computes the Merkle root of a sector payload.
///
/// The payload is split into 64-byte segments, each hashed with a leaf
/// prefix, and the resulting layer is folded pairwise with a node prefix
/// until one hash remains. An odd node at the end of a layer is promoted
/// unchanged, matching the original segment-tree construction.
pub fn merkle_root(data: &[u8]) -> Hash {
    if data.is_empty() {
        return Hash(*blake3::hash(&[LEAF_PREFIX]).as_bytes());
    }

    let mut layer: Vec<[u8; 32]> = data
        .chunks(SEGMENT_SIZE)
        .map(|segment| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&[LEAF_PREFIX]);
            hasher.update(segment);
            *hasher.finalize().as_bytes()
        })
        .collect();

    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            if pair.len() == 2 {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&[NODE_PREFIX]);
                hasher.update(&pair[0]);
                hasher.update(&pair[1]);
                next.push(*hasher.finalize().as_bytes());
            } else {
                next.push(pair[0]);
            }
        }
        layer = next;
    }

    Hash(layer[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_root_is_deterministic() {
        let data = vec![0xabu8; 4096];
        assert_eq!(merkle_root(&data), merkle_root(&data));
    }

    #[test]
    fn merkle_root_distinguishes_payloads() {
        let a = vec![0u8; 4096];
        let mut b = a.clone();
        b[1000] ^= 1;
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn merkle_root_depends_on_segment_position() {
        // Swapping two segments must change the root even though the
        // multiset of segment contents is identical.
        let mut a = vec![0u8; SEGMENT_SIZE * 2];
        a[..SEGMENT_SIZE].fill(1);
        let mut b = vec![0u8; SEGMENT_SIZE * 2];
        b[SEGMENT_SIZE..].fill(1);
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn sector_ids_are_salt_dependent() {
        let root = merkle_root(&[7u8; 128]);
        let a = SectorSalt([1u8; SECTOR_SALT_LEN]);
        let b = SectorSalt([2u8; SECTOR_SALT_LEN]);
        assert_ne!(a.sector_id(&root), b.sector_id(&root));
        assert_eq!(a.sector_id(&root), a.sector_id(&root));
    }

    #[test]
    fn zero_id_detection() {
        assert!(SectorId::default().is_zero());
        let root = merkle_root(&[1u8; 64]);
        let salt = SectorSalt::generate();
        assert!(!salt.sector_id(&root).is_zero());
    }
}
