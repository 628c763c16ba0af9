//! Cluster descriptors and the running content hash of raw clusters.

use super::structures::{HashMode, RawClusterEntry};
use crate::error::{ContentHashFailedSnafu, ContentHashMismatchSnafu, Error};
use digest::Digest;
use log::{debug, warn};
use sha1::Sha1;
use sha2::Sha256;

/// Reference data for a cluster, taken from the title metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedContent {
    pub hash: [u8; 32],
    pub sha1: bool,
    /// Logical content size in bytes, before padding.
    pub size: u64,
}

impl TrustedContent {
    pub fn digest_len(&self) -> usize {
        if self.sha1 {
            20
        } else {
            32
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterDescriptor {
    /// In sectors, relative to the partition.
    pub offset: u32,
    pub size: u32,
    pub owner_title_id: u64,
    pub group_id: u32,
    pub hash_mode: HashMode,
    pub trusted: Option<TrustedContent>,
}

impl ClusterDescriptor {
    pub fn from_raw(raw: &RawClusterEntry, trusted: Option<TrustedContent>) -> ClusterDescriptor {
        ClusterDescriptor {
            offset: raw.offset,
            size: raw.size,
            owner_title_id: raw.owner_title_id,
            group_id: raw.group_id,
            hash_mode: raw.hash_mode,
            trusted,
        }
    }

    pub fn byte_offset(&self, sector_size: u32) -> u64 {
        u64::from(self.offset) * u64::from(sector_size)
    }

    /// Bytes of cluster data. The trusted content size wins when known.
    pub fn byte_len(&self, sector_size: u32) -> u64 {
        match &self.trusted {
            Some(trusted) => trusted.size,
            None => u64::from(self.size) * u64::from(sector_size),
        }
    }
}

#[derive(Clone)]
pub enum ContentHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl ContentHasher {
    pub fn new(sha1: bool) -> ContentHasher {
        if sha1 {
            ContentHasher::Sha1(Sha1::new())
        } else {
            ContentHasher::Sha256(Sha256::new())
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha1(h) => h.update(data),
            ContentHasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            ContentHasher::Sha1(h) => h.finalize().to_vec(),
            ContentHasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentHasher::Sha1(_) => f.write_str("Sha1"),
            ContentHasher::Sha256(_) => f.write_str("Sha256"),
        }
    }
}

/// How far the whole-content hash of a raw cluster has progressed. Sectors
/// are folded in strictly in order, the first time each one is decrypted.
#[derive(Debug)]
pub enum ContentHashState {
    /// No reference hash for this cluster.
    Untracked,
    NotStarted,
    Accumulating {
        hasher: ContentHasher,
        sectors_hashed: u64,
    },
    Verified,
    Failed,
}

impl ContentHashState {
    pub fn for_cluster(cluster: &ClusterDescriptor) -> ContentHashState {
        match (cluster.hash_mode, &cluster.trusted) {
            (HashMode::HashInterleaved, _) | (_, None) => ContentHashState::Untracked,
            (_, Some(_)) => ContentHashState::NotStarted,
        }
    }

    /// Offers decrypted sector `sector` to the running hash. Sectors that are
    /// not next in sequence are ignored. Fails once the final sector shows a
    /// mismatch, and for every later call on a failed cluster.
    pub fn feed(
        &mut self,
        cluster: u16,
        sector: u64,
        data: &[u8],
        trusted: &TrustedContent,
        sector_size: u32,
    ) -> Result<(), Error> {
        if let ContentHashState::NotStarted = self {
            *self = ContentHashState::Accumulating {
                hasher: ContentHasher::new(trusted.sha1),
                sectors_hashed: 0,
            };
        }

        let (hasher, sectors_hashed) = match self {
            ContentHashState::Untracked | ContentHashState::Verified => return Ok(()),
            ContentHashState::Failed => return ContentHashFailedSnafu { cluster }.fail(),
            ContentHashState::NotStarted => unreachable!(),
            ContentHashState::Accumulating {
                hasher,
                sectors_hashed,
            } => (hasher, sectors_hashed),
        };
        if *sectors_hashed != sector {
            return Ok(());
        }

        let sector_size = u64::from(sector_size);
        let start = sector * sector_size;
        let last_sector = (trusted.size.max(1) - 1) / sector_size;
        if sector > last_sector {
            return Ok(());
        }
        let is_last = sector == last_sector;
        let len = if is_last {
            trusted.size - start
        } else {
            sector_size
        };
        let len = (len as usize).min(data.len());
        hasher.update(&data[..len]);
        *sectors_hashed += 1;

        if !is_last {
            return Ok(());
        }
        let hasher = match std::mem::replace(self, ContentHashState::Failed) {
            ContentHashState::Accumulating { hasher, .. } => hasher,
            _ => unreachable!(),
        };
        let digest = hasher.finalize();
        if digest[..] == trusted.hash[..trusted.digest_len()] {
            debug!("Cluster {} content hash verified", cluster);
            *self = ContentHashState::Verified;
            Ok(())
        } else {
            warn!("Cluster {} content hash mismatch", cluster);
            ContentHashMismatchSnafu { cluster }.fail()
        }
    }
}
