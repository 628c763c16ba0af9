//! Deep verification.
//!
//! Reads only ever check what is cheap to check: the H0 hash of each hashed
//! block, and the running content hash of raw clusters read front to back.
//! The functions here walk a whole cluster and check everything it carries:
//! the full H0/H1/H2 tree, the H3 and H4 levels above it, or the content hash
//! of a raw cluster regardless of the order it was read in.

use super::cache::{
    check_h0, decrypt_hashed_block, initial_iv, H0_OFFSET, H1_OFFSET, H2_OFFSET,
    HASHED_BLOCK_SIZE, HASH_ARRAY_SIZE,
};
use super::cluster::{ContentHashState, ContentHasher};
use super::FstVolume;
use crate::error::{Error, InvalidFstSnafu};
use crate::format::source::ClusterDataSource;
use crate::utils::align_up;
use digest::Digest;
use log::{debug, info, warn};
use sha1::Sha1;

const RAW_CHUNK_SIZE: usize = 0x10000;
const BLOCKS_PER_H3: u64 = 16 * 16 * 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerifyOutcome {
    Verified,
    /// Nothing to check the cluster against.
    Unverifiable,
    Mismatch,
}

fn slot(array: &[u8], index: u64) -> &[u8] {
    let start = (index % 16) as usize * 20;
    &array[start..start + 20]
}

impl<S: ClusterDataSource> FstVolume<S> {
    /// Checks one cluster end to end. I/O failures are errors; data that
    /// does not match is `Ok(VerifyOutcome::Mismatch)` and marks the volume
    /// as corrupted.
    pub fn verify_cluster(&mut self, index: u16) -> Result<VerifyOutcome, Error> {
        let cluster = match self.clusters.get(index as usize) {
            Some(cluster) => cluster,
            None => return InvalidFstSnafu { error: "cluster index out of range" }.fail(),
        };
        let outcome = if cluster.hash_mode.is_hashed() {
            self.verify_hashed_cluster(index)?
        } else {
            self.verify_raw_cluster(index)?
        };
        debug!("Cluster {}: {:?}", index, outcome);
        Ok(outcome)
    }

    pub fn verify_all(&mut self) -> Result<Vec<VerifyOutcome>, Error> {
        let mut outcomes = Vec::with_capacity(self.clusters.len());
        for index in 0..self.clusters.len() {
            outcomes.push(self.verify_cluster(index as u16)?);
        }
        let failed = outcomes
            .iter()
            .filter(|o| **o == VerifyOutcome::Mismatch)
            .count();
        info!("Verified {} clusters, {} mismatched", outcomes.len(), failed);
        Ok(outcomes)
    }

    fn mismatch(&mut self, index: u16, what: &str) -> VerifyOutcome {
        warn!("Cluster {} failed verification: {}", index, what);
        self.corrupted = true;
        VerifyOutcome::Mismatch
    }

    fn verify_raw_cluster(&mut self, index: u16) -> Result<VerifyOutcome, Error> {
        let cluster = &self.clusters[index as usize];
        let trusted = match cluster.trusted {
            Some(trusted) => trusted,
            None => return Ok(VerifyOutcome::Unverifiable),
        };
        let cluster_offset = cluster.byte_offset(self.sector_size);
        let total = align_up(trusted.size, 16);

        let mut hasher = ContentHasher::new(trusted.sha1);
        let mut iv = initial_iv(index);
        let mut buf = vec![0; RAW_CHUNK_SIZE];
        let mut pos = 0;
        while pos < total {
            let len = (total - pos).min(RAW_CHUNK_SIZE as u64) as usize;
            let chunk = &mut buf[..len];
            let read = self.source.read_data(index, cluster_offset, pos, chunk)?;
            if read < len {
                return Ok(self.mismatch(index, "content is truncated"));
            }
            let mut next_iv = [0; 0x10];
            next_iv.copy_from_slice(&chunk[len - 0x10..]);
            self.title_key.decrypt_cbc(chunk, &iv)?;
            iv = next_iv;

            let valid = (trusted.size - pos).min(len as u64) as usize;
            hasher.update(&chunk[..valid]);
            pos += len as u64;
        }

        if hasher.finalize()[..] == trusted.hash[..trusted.digest_len()] {
            if let ContentHashState::NotStarted | ContentHashState::Accumulating { .. } =
                self.hash_states[index as usize]
            {
                self.hash_states[index as usize] = ContentHashState::Verified;
            }
            Ok(VerifyOutcome::Verified)
        } else {
            self.hash_states[index as usize] = ContentHashState::Failed;
            Ok(self.mismatch(index, "content hash"))
        }
    }

    fn verify_hashed_cluster(&mut self, index: u16) -> Result<VerifyOutcome, Error> {
        let cluster = &self.clusters[index as usize];
        let trusted = cluster.trusted;
        let cluster_offset = cluster.byte_offset(self.sector_size);
        let len = cluster.byte_len(self.sector_size);
        if len == 0 {
            return Ok(VerifyOutcome::Unverifiable);
        }
        if trusted.is_some() && len % HASHED_BLOCK_SIZE as u64 != 0 {
            return Ok(self.mismatch(index, "content size is not a whole number of blocks"));
        }
        let num_blocks = len / HASHED_BLOCK_SIZE as u64;

        let mut block = vec![0; HASHED_BLOCK_SIZE];
        let mut h0_array = [0; HASH_ARRAY_SIZE];
        let mut h1_array = [0; HASH_ARRAY_SIZE];
        let mut h2_array = [0; HASH_ARRAY_SIZE];
        let mut h3 = Vec::new();

        for b in 0..num_blocks {
            let read = self.source.read_data(
                index,
                cluster_offset,
                b * HASHED_BLOCK_SIZE as u64,
                &mut block,
            )?;
            if read < HASHED_BLOCK_SIZE {
                return Ok(self.mismatch(index, "content is truncated"));
            }
            decrypt_hashed_block(&self.title_key, &mut block, b)?;
            if !check_h0(&block, b) {
                return Ok(self.mismatch(index, "H0"));
            }

            let h0 = &block[H0_OFFSET..H0_OFFSET + HASH_ARRAY_SIZE];
            let h1 = &block[H1_OFFSET..H1_OFFSET + HASH_ARRAY_SIZE];
            let h2 = &block[H2_OFFSET..H2_OFFSET + HASH_ARRAY_SIZE];

            // Every block of a group embeds the same copy of the group's
            // hash array. Check the first copy against the level above and
            // the others against the first.
            if b % BLOCKS_PER_H3 == 0 {
                h3.push(Sha1::digest(h2));
                h2_array.copy_from_slice(h2);
            } else if h2 != &h2_array[..] {
                return Ok(self.mismatch(index, "H2 copies differ"));
            }

            if b % 256 == 0 {
                if Sha1::digest(h1)[..] != *slot(h2, b / 256) {
                    return Ok(self.mismatch(index, "H1"));
                }
                h1_array.copy_from_slice(h1);
            } else if h1 != &h1_array[..] {
                return Ok(self.mismatch(index, "H1 copies differ"));
            }

            if b % 16 == 0 {
                if Sha1::digest(h0)[..] != *slot(h1, b / 16) {
                    return Ok(self.mismatch(index, "H0 array"));
                }
                h0_array.copy_from_slice(h0);
            } else if h0 != &h0_array[..] {
                return Ok(self.mismatch(index, "H0 copies differ"));
            }
        }

        let trusted = match trusted {
            Some(trusted) => trusted,
            None => return Ok(VerifyOutcome::Verified),
        };
        let mut h4 = Sha1::new();
        for digest in &h3 {
            h4.update(digest);
        }
        if h4.finalize()[..] == trusted.hash[..20] {
            Ok(VerifyOutcome::Verified)
        } else {
            Ok(self.mismatch(index, "H4"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::fst::cache::{HASHED_BLOCK_DATA_SIZE, HASHED_BLOCK_HASH_SIZE};
    use crate::format::fst::structures::HashMode;
    use crate::format::source::ContentFileSource;
    use crate::testutil::{
        build_hashed_cluster, encrypt_raw_cluster, hashed_content, raw_content, FstBuilder,
        MemorySource, Node, TITLE_KEY,
    };
    use std::io::Cursor;

    const HASHED_FILE_SIZE: u32 = (HASHED_BLOCK_DATA_SIZE + 0x100) as u32;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    /// Cluster 0: FST, cluster 1: raw, cluster 2: hashed (two blocks).
    fn volume_with(
        trusted: bool,
        tamper: impl FnOnce(&mut Vec<u8>, &mut Vec<u8>),
    ) -> FstVolume<MemorySource> {
        let builder = FstBuilder::new(vec![
            Node::file("raw.bin", 1, 0, 0x9000),
            Node::file("hashed.bin", 2, 0, HASHED_FILE_SIZE),
        ])
        .raw_clusters(2)
        .cluster(0, 4, HashMode::HashInterleaved);
        let (fst, fst_size) = builder.encrypted(&TITLE_KEY);

        let raw_plain = payload(0x9000);
        let mut raw = encrypt_raw_cluster(&TITLE_KEY, 1, &raw_plain);
        let hashed = build_hashed_cluster(&TITLE_KEY, &payload(HASHED_FILE_SIZE as usize));
        let contents = vec![
            raw_content(0, &builder.plaintext()),
            raw_content(1, &raw_plain),
            hashed_content(2, &hashed),
        ];
        let mut hashed_data = hashed.data;
        tamper(&mut raw, &mut hashed_data);

        let source = ContentFileSource::from_readers(vec![
            Some(Cursor::new(fst)),
            Some(Cursor::new(raw)),
            Some(Cursor::new(hashed_data)),
        ]);
        FstVolume::open(
            source,
            0,
            fst_size,
            TITLE_KEY,
            HashMode::RawUnverified,
            if trusted { Some(&contents[..]) } else { None },
        )
        .unwrap()
    }

    #[test]
    fn reads_hashed_blocks() {
        let mut volume = volume_with(true, |_, _| ());
        let data = volume.extract_file("hashed.bin").unwrap();
        assert_eq!(data, payload(HASHED_FILE_SIZE as usize));
        assert_eq!(volume.cache_stats().hashed_blocks, 2);
        assert!(!volume.corruption_detected());
    }

    #[test]
    fn corrupt_hashed_block_gives_short_read() {
        let mut volume = volume_with(true, |_, hashed| {
            hashed[HASHED_BLOCK_SIZE + HASHED_BLOCK_HASH_SIZE + 5] ^= 0x01;
        });
        let handle = volume.open_file("hashed.bin", true).unwrap();
        let mut buf = vec![0; HASHED_FILE_SIZE as usize];
        let read = volume.read_file(handle, 0, &mut buf);
        assert_eq!(read, HASHED_BLOCK_DATA_SIZE);
        assert!(volume.corruption_detected());

        // the intact first block still reads fine
        let mut head = [0; 0x10];
        assert_eq!(volume.read_file(handle, 0, &mut head), 0x10);
    }

    #[test]
    fn clean_title_verifies() {
        let mut volume = volume_with(true, |_, _| ());
        let outcomes = volume.verify_all().unwrap();
        assert_eq!(outcomes[1], VerifyOutcome::Verified);
        assert_eq!(outcomes[2], VerifyOutcome::Verified);
        assert!(!volume.corruption_detected());
    }

    #[test]
    fn untrusted_raw_clusters_are_unverifiable() {
        let mut volume = volume_with(false, |_, _| ());
        assert_eq!(volume.verify_cluster(1).unwrap(), VerifyOutcome::Unverifiable);
        // the embedded tree is still self-consistent
        assert_eq!(volume.verify_cluster(2).unwrap(), VerifyOutcome::Verified);
        assert!(volume.verify_cluster(3).is_err());
    }

    #[test]
    fn tampered_h1_reads_but_fails_deep_verify() {
        let mut volume = volume_with(true, |_, hashed| {
            // second ciphertext block of the H1 array: H0 slots stay intact
            hashed[H1_OFFSET + 0x20] ^= 0x80;
        });
        let handle = volume.open_file("hashed.bin", true).unwrap();
        let mut head = [0; 0x100];
        assert_eq!(volume.read_file(handle, 0, &mut head), 0x100);
        assert!(!volume.corruption_detected());

        assert_eq!(volume.verify_cluster(2).unwrap(), VerifyOutcome::Mismatch);
        assert!(volume.corruption_detected());
    }

    #[test]
    fn raw_content_hash_mismatch() {
        let mut volume = volume_with(true, |raw, _| raw[0x8800] ^= 0x01);
        assert_eq!(volume.verify_cluster(1).unwrap(), VerifyOutcome::Mismatch);
        assert!(volume.corruption_detected());
        // reads of a cluster that failed verification fail too
        let handle = volume.open_file("raw.bin", true).unwrap();
        let mut buf = vec![0; 0x9000];
        assert!(volume.read_file(handle, 0, &mut buf) < 0x9000);
    }

    #[test]
    fn raw_hash_checked_while_reading_in_order() {
        let mut volume = volume_with(true, |raw, _| raw[0x8800] ^= 0x01);
        let handle = volume.open_file("raw.bin", true).unwrap();
        let mut buf = vec![0; 0x9000];
        // the final sector completes the hash and is rejected
        assert_eq!(volume.read_file(handle, 0, &mut buf), 0x8000);
        assert!(volume.corruption_detected());
    }

    #[test]
    fn wrong_h4_is_a_mismatch() {
        let builder = FstBuilder::new(vec![Node::file("hashed.bin", 1, 0, 0x10)])
            .raw_clusters(1)
            .cluster(0, 2, HashMode::HashInterleaved);
        let (fst, fst_size) = builder.encrypted(&TITLE_KEY);
        let hashed = build_hashed_cluster(&TITLE_KEY, &payload(0x10));
        let mut content = hashed_content(1, &hashed);
        content.hash[3] ^= 0xFF;
        let contents = vec![raw_content(0, &builder.plaintext()), content];
        let source = ContentFileSource::from_readers(vec![
            Some(Cursor::new(fst)),
            Some(Cursor::new(hashed.data)),
        ]);
        let mut volume = FstVolume::open(
            source,
            0,
            fst_size,
            TITLE_KEY,
            HashMode::RawUnverified,
            Some(&contents[..]),
        )
        .unwrap();
        assert_eq!(volume.extract_file("hashed.bin").unwrap(), payload(0x10));
        assert_eq!(volume.verify_cluster(1).unwrap(), VerifyOutcome::Mismatch);
    }
}
