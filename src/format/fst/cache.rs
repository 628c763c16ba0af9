//! Decrypted block cache.
//!
//! Raw sectors and hash-interleaved blocks share one LRU, ordered by a
//! monotonically increasing access stamp, under a single byte budget. An
//! entry only ever enters the cache after it decrypted and verified, so
//! anything resident is correct.
//!
//! The materialization half lives here as well: reading a sector or block
//! from the data source, working out its IV, decrypting and checking it.

use super::cluster::ContentHashState;
use super::FstVolume;
use crate::error::{Error, HashMismatchSnafu, SourceReadSnafu};
use crate::format::source::ClusterDataSource;
use crate::utils::{align_down, align_up};
use digest::Digest;
use log::{trace, warn};
use sha1::Sha1;
use snafu::ensure;
use std::collections::{BTreeMap, HashMap};

pub const CACHE_BUDGET: usize = 2 * 1024 * 1024;

pub const HASHED_BLOCK_SIZE: usize = 0x10000;
pub const HASHED_BLOCK_HASH_SIZE: usize = 0x400;
pub const HASHED_BLOCK_DATA_SIZE: usize = HASHED_BLOCK_SIZE - HASHED_BLOCK_HASH_SIZE;
pub const H0_OFFSET: usize = 0;
pub const H1_OFFSET: usize = 20 * 16;
pub const H2_OFFSET: usize = 20 * 16 * 2;
pub const HASH_ARRAY_SIZE: usize = 20 * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Sector { cluster: u16, index: u64 },
    Hashed { cluster: u16, index: u64 },
}

#[derive(Debug)]
struct CacheEntry {
    data: Vec<u8>,
    /// Last ciphertext block of a raw sector, the IV of the next one.
    next_iv: Option<[u8; 0x10]>,
    last_access: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub resident_bytes: usize,
    pub raw_sectors: usize,
    pub hashed_blocks: usize,
    pub budget: usize,
}

#[derive(Debug)]
pub struct BlockCache {
    entries: HashMap<CacheKey, CacheEntry>,
    lru: BTreeMap<u64, CacheKey>,
    access_counter: u64,
    resident: usize,
    budget: usize,
}

impl BlockCache {
    pub fn new(budget: usize) -> BlockCache {
        BlockCache {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            access_counter: 0,
            resident: 0,
            budget,
        }
    }

    /// Bumps the entry's access stamp. Returns whether it is resident.
    pub fn touch(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.access_counter += 1;
                self.lru.remove(&entry.last_access);
                entry.last_access = self.access_counter;
                self.lru.insert(entry.last_access, *key);
                true
            }
            None => false,
        }
    }

    pub fn data(&self, key: &CacheKey) -> Option<&[u8]> {
        self.entries.get(key).map(|entry| &entry.data[..])
    }

    pub fn next_iv(&self, key: &CacheKey) -> Option<[u8; 0x10]> {
        self.entries.get(key).and_then(|entry| entry.next_iv)
    }

    /// Evicts least recently used entries until the cache is under budget,
    /// handing back the last evicted buffer for reuse.
    pub fn make_room(&mut self) -> Option<Vec<u8>> {
        let mut recycled = None;
        while self.resident >= self.budget {
            let key = match self.lru.values().next() {
                Some(key) => *key,
                None => break,
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.lru.remove(&entry.last_access);
                self.resident -= entry.data.len();
                trace!("Evicting {:?}", key);
                recycled = Some(entry.data);
            }
        }
        recycled
    }

    pub fn insert(&mut self, key: CacheKey, data: Vec<u8>, next_iv: Option<[u8; 0x10]>) {
        self.access_counter += 1;
        self.resident += data.len();
        self.lru.insert(self.access_counter, key);
        if let Some(old) = self.entries.insert(
            key,
            CacheEntry {
                data,
                next_iv,
                last_access: self.access_counter,
            },
        ) {
            self.lru.remove(&old.last_access);
            self.resident -= old.data.len();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let raw_sectors = self
            .entries
            .keys()
            .filter(|key| matches!(key, CacheKey::Sector { .. }))
            .count();
        CacheStats {
            resident_bytes: self.resident,
            raw_sectors,
            hashed_blocks: self.entries.len() - raw_sectors,
            budget: self.budget,
        }
    }
}

pub fn initial_iv(cluster: u16) -> [u8; 0x10] {
    let mut iv = [0; 0x10];
    iv[0] = (cluster >> 8) as u8;
    iv[1] = cluster as u8;
    iv
}

fn take_buffer(recycled: Option<Vec<u8>>, len: usize) -> Vec<u8> {
    let mut buf = recycled.unwrap_or_default();
    buf.clear();
    buf.resize(len, 0);
    buf
}

impl<S: ClusterDataSource> FstVolume<S> {
    /// Decrypted bytes of raw sector `index` of `cluster`. `None` if the
    /// sector could not be read or failed verification; the volume is then
    /// marked corrupted.
    pub(super) fn raw_sector(&mut self, cluster: u16, index: u64) -> Option<&[u8]> {
        let key = CacheKey::Sector { cluster, index };
        if self.cache.touch(&key) {
            return self.cache.data(&key);
        }
        let recycled = self.cache.make_room();
        match self.materialize_sector(cluster, index, recycled) {
            Ok((data, next_iv)) => {
                self.cache.insert(key, data, Some(next_iv));
                self.cache.data(&key)
            }
            Err(err) => {
                warn!("Failed to read sector {} of cluster {}: {}", index, cluster, err);
                self.corrupted = true;
                None
            }
        }
    }

    fn materialize_sector(
        &mut self,
        cluster_index: u16,
        index: u64,
        recycled: Option<Vec<u8>>,
    ) -> Result<(Vec<u8>, [u8; 0x10]), Error> {
        let sector_size = self.sector_size as usize;
        let cluster = &self.clusters[cluster_index as usize];
        let cluster_offset = cluster.byte_offset(self.sector_size);
        let start = index * sector_size as u64;

        // Content files are only padded to the AES block size, so the final
        // sector may be short.
        let required = match &cluster.trusted {
            Some(trusted) => {
                ensure!(
                    start < trusted.size.max(1),
                    SourceReadSnafu { expected: sector_size, read: 0usize }
                );
                align_up(trusted.size.max(1) - start, 16).min(sector_size as u64) as usize
            }
            None => sector_size,
        };

        let mut data = take_buffer(recycled, sector_size);
        let read = self
            .source
            .read_data(cluster_index, cluster_offset, start, &mut data)?;
        let len = align_down(read, 16);
        ensure!(len >= required, SourceReadSnafu { expected: required, read });
        data.truncate(len);

        let iv = if index == 0 {
            initial_iv(cluster_index)
        } else {
            let prev = CacheKey::Sector {
                cluster: cluster_index,
                index: index - 1,
            };
            match self.cache.next_iv(&prev) {
                Some(iv) => iv,
                None => {
                    let mut iv = [0; 0x10];
                    let read =
                        self.source
                            .read_data(cluster_index, cluster_offset, start - 16, &mut iv)?;
                    ensure!(read == iv.len(), SourceReadSnafu { expected: iv.len(), read });
                    iv
                }
            }
        };

        let mut next_iv = [0; 0x10];
        next_iv.copy_from_slice(&data[len - 16..]);
        self.title_key.decrypt_cbc(&mut data, &iv)?;

        if let Some(trusted) = &cluster.trusted {
            let state: &mut ContentHashState = &mut self.hash_states[cluster_index as usize];
            state.feed(cluster_index, index, &data, trusted, self.sector_size)?;
        }
        Ok((data, next_iv))
    }

    /// File data (0xFC00 bytes) of hashed block `index` of `cluster`, after
    /// its H0 hash checked out.
    pub(super) fn hashed_block(&mut self, cluster: u16, index: u64) -> Option<&[u8]> {
        let key = CacheKey::Hashed { cluster, index };
        if self.cache.touch(&key) {
            return self.cache.data(&key).map(|d| &d[HASHED_BLOCK_HASH_SIZE..]);
        }
        let recycled = self.cache.make_room();
        match self.materialize_hashed_block(cluster, index, recycled) {
            Ok(data) => {
                self.cache.insert(key, data, None);
                self.cache.data(&key).map(|d| &d[HASHED_BLOCK_HASH_SIZE..])
            }
            Err(err) => {
                warn!("Failed to read block {} of cluster {}: {}", index, cluster, err);
                self.corrupted = true;
                None
            }
        }
    }

    fn materialize_hashed_block(
        &mut self,
        cluster_index: u16,
        index: u64,
        recycled: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, Error> {
        let cluster_offset = self.clusters[cluster_index as usize].byte_offset(self.sector_size);
        let mut block = take_buffer(recycled, HASHED_BLOCK_SIZE);
        let read = self.source.read_data(
            cluster_index,
            cluster_offset,
            index * HASHED_BLOCK_SIZE as u64,
            &mut block,
        )?;
        ensure!(
            read == HASHED_BLOCK_SIZE,
            SourceReadSnafu { expected: HASHED_BLOCK_SIZE, read }
        );
        decrypt_hashed_block(&self.title_key, &mut block, index)?;
        ensure!(
            check_h0(&block, index),
            HashMismatchSnafu {
                cluster: cluster_index,
                block: index,
            }
        );
        Ok(block)
    }
}

/// Decrypts a 0x10000 hashed block in place: the hash region with a zero IV,
/// then the data region with the block's own H0 slot as IV.
pub fn decrypt_hashed_block(
    key: &crate::pki::Aes128Key,
    block: &mut [u8],
    index: u64,
) -> Result<(), Error> {
    let (hashes, data) = block.split_at_mut(HASHED_BLOCK_HASH_SIZE);
    key.decrypt_cbc(hashes, &[0; 0x10])?;
    let slot = H0_OFFSET + (index % 16) as usize * 20;
    let mut iv = [0; 0x10];
    iv.copy_from_slice(&hashes[slot..slot + 0x10]);
    key.decrypt_cbc(data, &iv)
}

/// Whether SHA-1 of the decrypted data region matches its H0 slot.
pub fn check_h0(block: &[u8], index: u64) -> bool {
    let slot = H0_OFFSET + (index % 16) as usize * 20;
    let digest = Sha1::digest(&block[HASHED_BLOCK_HASH_SIZE..]);
    digest[..] == block[slot..slot + 20]
}
