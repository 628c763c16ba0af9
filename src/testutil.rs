//! Synthetic titles and disc images for tests.

use crate::format::fst::cache::{
    initial_iv, HASHED_BLOCK_DATA_SIZE, HASHED_BLOCK_HASH_SIZE, HASH_ARRAY_SIZE,
};
use crate::format::fst::structures::{
    HashMode, RawFileEntry, CLUSTER_ENTRY_SIZE, FILE_ENTRY_SIZE, FST_HEADER_SIZE, FST_MAGIC,
    TYPE_DIRECTORY, TYPE_LINK_FLAG,
};
use crate::format::source::ContentFileSource;
use crate::format::tmd::{ContentEntry, ContentFlags};
use crate::format::SECTOR_SIZE;
use crate::pki::Aes128Key;
use crate::utils::align_up;
use byteorder::{BigEndian, ByteOrder};
use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use std::io::Cursor;

pub const COMMON_KEY: Aes128Key = Aes128Key([
    0xC0, 0x33, 0x0B, 0x1E, 0x5A, 0x41, 0x97, 0x20, 0x8D, 0x6E, 0x12, 0xF4, 0x3B, 0x88, 0x0C, 0x51,
]);
pub const DISC_KEY: Aes128Key = Aes128Key([
    0xD1, 0x5C, 0x4B, 0xE7, 0x02, 0x33, 0x9A, 0x6F, 0x10, 0xEE, 0x47, 0x81, 0x2C, 0x5D, 0x90, 0x0A,
]);
pub const TITLE_KEY: Aes128Key = Aes128Key([
    0x7E, 0x11, 0x2A, 0x93, 0x4C, 0xD8, 0x05, 0x66, 0xBF, 0x30, 0x71, 0x1A, 0xE2, 0x49, 0x0D, 0xC4,
]);

pub type MemorySource = ContentFileSource<Cursor<Vec<u8>>>;

#[derive(Debug, Clone)]
pub enum Node {
    Dir {
        name: String,
        children: Vec<Node>,
    },
    File {
        name: String,
        cluster: u16,
        offset: u32,
        size: u32,
        link: bool,
    },
}

impl Node {
    pub fn dir(name: &str, children: Vec<Node>) -> Node {
        Node::Dir {
            name: name.to_string(),
            children,
        }
    }

    /// `offset` is in units of the FST's offset factor.
    pub fn file(name: &str, cluster: u16, offset: u32, size: u32) -> Node {
        Node::File {
            name: name.to_string(),
            cluster,
            offset,
            size,
            link: false,
        }
    }

    pub fn link_file(name: &str, cluster: u16, offset: u32, size: u32) -> Node {
        Node::File {
            name: name.to_string(),
            cluster,
            offset,
            size,
            link: true,
        }
    }
}

/// Masters FST blobs from a node tree.
#[derive(Debug, Clone)]
pub struct FstBuilder {
    nodes: Vec<Node>,
    clusters: Vec<(u32, u32, HashMode)>,
    offset_factor: u32,
}

impl FstBuilder {
    pub fn new(nodes: Vec<Node>) -> FstBuilder {
        FstBuilder {
            nodes,
            clusters: Vec::new(),
            offset_factor: 1,
        }
    }

    /// Appends `count` checksummed raw clusters with dummy placement.
    pub fn raw_clusters(mut self, count: usize) -> FstBuilder {
        for _ in 0..count {
            self.clusters.push((0, 1, HashMode::RawChecksummed));
        }
        self
    }

    /// Appends one cluster. `offset` and `size` are in sectors.
    pub fn cluster(mut self, offset: u32, size: u32, mode: HashMode) -> FstBuilder {
        self.clusters.push((offset, size, mode));
        self
    }

    pub fn offset_factor(mut self, offset_factor: u32) -> FstBuilder {
        self.offset_factor = offset_factor;
        self
    }

    fn flatten(&self) -> (Vec<RawFileEntry>, Vec<u8>, Vec<u32>) {
        let mut entries = vec![RawFileEntry {
            type_and_name_offset: u32::from(TYPE_DIRECTORY) << 24,
            offset: 0,
            size: 0,
            flags_or_permissions: 0,
            cluster_index: 0,
        }];
        let mut names = vec![0];
        let mut parents = vec![0];
        flatten_into(&self.nodes, 0, &mut entries, &mut names, &mut parents);
        entries[0].size = entries.len() as u32;
        (entries, names, parents)
    }

    pub fn tables(&self) -> (Vec<RawFileEntry>, Vec<u8>) {
        let (entries, names, _) = self.flatten();
        (entries, names)
    }

    pub fn expected_parents(&self) -> Vec<u32> {
        self.flatten().2
    }

    pub fn plaintext(&self) -> Vec<u8> {
        let (entries, names, _) = self.flatten();
        let mut data = vec![0; FST_HEADER_SIZE];
        BigEndian::write_u32(&mut data[0x0..], FST_MAGIC);
        BigEndian::write_u32(&mut data[0x4..], self.offset_factor);
        BigEndian::write_u32(&mut data[0x8..], self.clusters.len() as u32);

        for (i, (offset, size, mode)) in self.clusters.iter().enumerate() {
            let mut entry = [0; CLUSTER_ENTRY_SIZE];
            BigEndian::write_u32(&mut entry[0x0..], *offset);
            BigEndian::write_u32(&mut entry[0x4..], *size);
            BigEndian::write_u64(&mut entry[0x8..], 0x0005_0000_1010_1010);
            BigEndian::write_u32(&mut entry[0x10..], i as u32);
            entry[0x14] = match mode {
                HashMode::RawUnverified => 0,
                HashMode::RawChecksummed => 1,
                HashMode::HashInterleaved => 2,
            };
            data.extend_from_slice(&entry);
        }

        for raw in &entries {
            let mut entry = [0; FILE_ENTRY_SIZE];
            BigEndian::write_u32(&mut entry[0x0..], raw.type_and_name_offset);
            BigEndian::write_u32(&mut entry[0x4..], raw.offset);
            BigEndian::write_u32(&mut entry[0x8..], raw.size);
            BigEndian::write_u16(&mut entry[0xC..], raw.flags_or_permissions);
            BigEndian::write_u16(&mut entry[0xE..], raw.cluster_index);
            data.extend_from_slice(&entry);
        }
        data.extend_from_slice(&names);
        data
    }

    /// The FST encrypted as one zero-IV CBC chain, and its logical size.
    pub fn encrypted(&self, key: &Aes128Key) -> (Vec<u8>, u32) {
        let mut data = self.plaintext();
        let size = data.len() as u32;
        data.resize(align_up(data.len(), 16), 0);
        key.encrypt_cbc(&mut data, &[0; 0x10]).unwrap();
        (data, size)
    }
}

fn flatten_into(
    nodes: &[Node],
    parent: u32,
    entries: &mut Vec<RawFileEntry>,
    names: &mut Vec<u8>,
    parents: &mut Vec<u32>,
) {
    for node in nodes {
        let index = entries.len();
        let name_offset = names.len() as u32;
        parents.push(parent);
        match node {
            Node::Dir { name, children } => {
                names.extend_from_slice(name.as_bytes());
                names.push(0);
                entries.push(RawFileEntry {
                    type_and_name_offset: u32::from(TYPE_DIRECTORY) << 24 | name_offset,
                    offset: parent,
                    size: 0,
                    flags_or_permissions: 0,
                    cluster_index: 0,
                });
                flatten_into(children, index as u32, entries, names, parents);
                entries[index].size = entries.len() as u32;
            }
            Node::File {
                name,
                cluster,
                offset,
                size,
                link,
            } => {
                names.extend_from_slice(name.as_bytes());
                names.push(0);
                let type_flags = if *link { TYPE_LINK_FLAG } else { 0 };
                entries.push(RawFileEntry {
                    type_and_name_offset: u32::from(type_flags) << 24 | name_offset,
                    offset: *offset,
                    size: *size,
                    flags_or_permissions: 0,
                    cluster_index: *cluster,
                });
            }
        }
    }
}

/// Small deterministic generator for randomized tests.
#[derive(Debug)]
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Lcg {
        Lcg(seed)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }
}

pub fn random_tree(rng: &mut Lcg, depth: u32, max_children: u32) -> Vec<Node> {
    let count = rng.next() % (max_children + 1);
    (0..count)
        .map(|i| {
            if depth > 0 && rng.next() % 2 == 0 {
                let children = random_tree(rng, depth - 1, max_children);
                Node::dir(&format!("d{}", i), children)
            } else {
                Node::file(&format!("f{}", i), 0, 0, rng.next() % 100)
            }
        })
        .collect()
}

/// Encrypts a raw cluster as one CBC chain starting from the cluster's
/// index IV, which is what chaining sector by sector amounts to.
pub fn encrypt_raw_cluster(key: &Aes128Key, cluster_index: u16, plaintext: &[u8]) -> Vec<u8> {
    let mut data = plaintext.to_vec();
    data.resize(align_up(data.len(), 16), 0);
    key.encrypt_cbc(&mut data, &initial_iv(cluster_index)).unwrap();
    data
}

/// TMD entry for a raw content, hashed with SHA-256.
pub fn raw_content(index: u16, plaintext: &[u8]) -> ContentEntry {
    let mut hash = [0; 32];
    hash.copy_from_slice(&Sha256::digest(plaintext));
    ContentEntry {
        content_id: u32::from(index),
        index,
        flags: ContentFlags(ContentFlags::ENCRYPTED),
        size: plaintext.len() as u64,
        hash,
    }
}

#[derive(Debug, Clone)]
pub struct HashedCluster {
    pub data: Vec<u8>,
    pub h4: [u8; 20],
}

pub fn hashed_content(index: u16, cluster: &HashedCluster) -> ContentEntry {
    let mut hash = [0; 32];
    hash[..20].copy_from_slice(&cluster.h4);
    ContentEntry {
        content_id: u32::from(index),
        index,
        flags: ContentFlags(ContentFlags::ENCRYPTED | ContentFlags::HASHED | ContentFlags::SHA1),
        size: cluster.data.len() as u64,
        hash,
    }
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut out = [0; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

/// Groups hashes by sixteen into zero-padded hash arrays.
fn hash_arrays(hashes: &[[u8; 20]]) -> Vec<[u8; HASH_ARRAY_SIZE]> {
    hashes
        .chunks(16)
        .map(|group| {
            let mut array = [0; HASH_ARRAY_SIZE];
            for (i, hash) in group.iter().enumerate() {
                array[i * 20..i * 20 + 20].copy_from_slice(hash);
            }
            array
        })
        .collect()
}

/// Masters a hash-interleaved cluster holding `payload`, with its complete
/// H0..H4 hash tree.
pub fn build_hashed_cluster(key: &Aes128Key, payload: &[u8]) -> HashedCluster {
    let num_blocks = ((payload.len() + HASHED_BLOCK_DATA_SIZE - 1) / HASHED_BLOCK_DATA_SIZE).max(1);
    let blocks: Vec<Vec<u8>> = (0..num_blocks)
        .map(|b| {
            let start = (b * HASHED_BLOCK_DATA_SIZE).min(payload.len());
            let end = ((b + 1) * HASHED_BLOCK_DATA_SIZE).min(payload.len());
            let mut block = payload[start..end].to_vec();
            block.resize(HASHED_BLOCK_DATA_SIZE, 0);
            block
        })
        .collect();

    let h0: Vec<[u8; 20]> = blocks.iter().map(|block| sha1(block)).collect();
    let h0_arrays = hash_arrays(&h0);
    let h1: Vec<[u8; 20]> = h0_arrays.iter().map(|array| sha1(array)).collect();
    let h1_arrays = hash_arrays(&h1);
    let h2: Vec<[u8; 20]> = h1_arrays.iter().map(|array| sha1(array)).collect();
    let h2_arrays = hash_arrays(&h2);
    let h3: Vec<[u8; 20]> = h2_arrays.iter().map(|array| sha1(array)).collect();
    let h4 = sha1(&h3.concat());

    let mut data = Vec::with_capacity(num_blocks * (HASHED_BLOCK_DATA_SIZE + HASHED_BLOCK_HASH_SIZE));
    for (b, block) in blocks.into_iter().enumerate() {
        let mut hashes = vec![0; HASHED_BLOCK_HASH_SIZE];
        hashes[..HASH_ARRAY_SIZE].copy_from_slice(&h0_arrays[b / 16]);
        hashes[HASH_ARRAY_SIZE..2 * HASH_ARRAY_SIZE].copy_from_slice(&h1_arrays[b / 256]);
        hashes[2 * HASH_ARRAY_SIZE..3 * HASH_ARRAY_SIZE].copy_from_slice(&h2_arrays[b / 4096]);
        let mut iv = [0; 0x10];
        iv.copy_from_slice(&h0[b][..0x10]);

        let mut block = block;
        key.encrypt_cbc(&mut hashes, &[0; 0x10]).unwrap();
        key.encrypt_cbc(&mut block, &iv).unwrap();
        data.extend_from_slice(&hashes);
        data.extend_from_slice(&block);
    }
    HashedCluster { data, h4 }
}

/// A ticket for `title_id` whose title key unwraps to `title_key` under
/// [`COMMON_KEY`].
pub fn build_ticket(title_id: u64, title_key: &Aes128Key) -> Vec<u8> {
    let mut data = vec![0; 0x2A4];
    BigEndian::write_u32(&mut data[0x0..], 0x0001_0004);
    let mut iv = [0; 0x10];
    BigEndian::write_u64(&mut iv[..8], title_id);
    let mut key = title_key.0;
    COMMON_KEY.encrypt_cbc(&mut key, &iv).unwrap();
    data[0x1BF..0x1CF].copy_from_slice(&key);
    BigEndian::write_u64(&mut data[0x1D0..], 0x0123_4567_89AB_CDEF);
    BigEndian::write_u64(&mut data[0x1DC..], title_id);
    BigEndian::write_u16(&mut data[0x1E6..], 32);
    data
}

/// A format v1 ticket with one content rights section granting `rights`.
pub fn build_ticket_v1(title_id: u64, rights: &[usize]) -> Vec<u8> {
    const EXT: usize = 0x2A4;
    let mut data = build_ticket(title_id, &Aes128Key([0; 0x10]));
    data[0x1BC] = 1;
    data.resize(EXT + 0x24 + 0x84, 0);
    BigEndian::write_u32(&mut data[EXT + 0x8..], 0x10);
    BigEndian::write_u16(&mut data[EXT + 0xC..], 1);
    BigEndian::write_u16(&mut data[EXT + 0xE..], 0x14);

    let section = EXT + 0x10;
    BigEndian::write_u32(&mut data[section..], 0x24);
    BigEndian::write_u32(&mut data[section + 0x4..], 1);
    BigEndian::write_u32(&mut data[section + 0x8..], 0x84);
    BigEndian::write_u16(&mut data[section + 0x10..], 3);

    let mask = EXT + 0x24 + 4;
    for &right in rights {
        data[mask + right / 8] |= 1 << (right & 7);
    }
    data
}

#[derive(Debug, Clone, Copy)]
pub struct TmdContent {
    pub content_id: u32,
    pub index: u16,
    pub flags: u16,
    pub size: u64,
    pub hash: [u8; 32],
}

impl From<&ContentEntry> for TmdContent {
    fn from(entry: &ContentEntry) -> TmdContent {
        TmdContent {
            content_id: entry.content_id,
            index: entry.index,
            flags: entry.flags.0,
            size: entry.size,
            hash: entry.hash,
        }
    }
}

pub fn build_tmd(title_id: u64, contents: &[TmdContent]) -> Vec<u8> {
    let header = 0x204 + 64 * 36;
    let mut data = vec![0; header + contents.len() * 0x30];
    BigEndian::write_u32(&mut data[0x0..], 0x0001_0004);
    BigEndian::write_u64(&mut data[0x18C..], title_id);
    BigEndian::write_u16(&mut data[0x1DC..], 32);
    BigEndian::write_u16(&mut data[0x1DE..], contents.len() as u16);
    for (i, content) in contents.iter().enumerate() {
        let entry = &mut data[header + i * 0x30..header + (i + 1) * 0x30];
        BigEndian::write_u32(&mut entry[0x0..], content.content_id);
        BigEndian::write_u16(&mut entry[0x4..], content.index);
        BigEndian::write_u16(&mut entry[0x6..], content.flags);
        BigEndian::write_u64(&mut entry[0x8..], content.size);
        entry[0x10..0x30].copy_from_slice(&content.hash);
    }
    data
}

/// One partition of a synthetic disc. Its clusters are raw and laid out
/// after a header sector and two FST sectors.
#[derive(Debug, Clone)]
pub struct DiscPartition {
    pub name: String,
    pub key: Aes128Key,
    pub nodes: Vec<Node>,
    pub clusters: Vec<Vec<u8>>,
}

impl DiscPartition {
    pub fn new(name: &str, key: Aes128Key, nodes: Vec<Node>, clusters: Vec<Vec<u8>>) -> DiscPartition {
        DiscPartition {
            name: name.to_string(),
            key,
            nodes,
            clusters,
        }
    }
}

pub const PARTITION_TABLE_OFFSET: usize = 0x18000;
const FIRST_PARTITION_SECTOR: u32 = 4;
const PARTITION_FST_SECTOR: u32 = 1;
const PARTITION_DATA_SECTOR: u32 = 3;

pub fn build_disc(disc_key: &Aes128Key, partitions: &[DiscPartition]) -> Vec<u8> {
    build_disc_patched(disc_key, partitions, |_| ())
}

/// Like [`build_disc`], with a chance to edit the plaintext partition table
/// before it is encrypted.
pub fn build_disc_patched(
    disc_key: &Aes128Key,
    partitions: &[DiscPartition],
    patch: impl FnOnce(&mut [u8]),
) -> Vec<u8> {
    let ss = SECTOR_SIZE as usize;
    let mut image = vec![0; FIRST_PARTITION_SECTOR as usize * ss];
    image[..10].copy_from_slice(b"WUP-P-TEST");
    BigEndian::write_u32(&mut image[0x10000..], 0xCC54_9EB9);

    let mut table = vec![0; ss];
    BigEndian::write_u32(&mut table[0x0..], 0xCCA6_E67B);
    BigEndian::write_u32(&mut table[0x4..], SECTOR_SIZE);
    BigEndian::write_u32(&mut table[0x1C..], partitions.len() as u32);

    let mut next_sector = FIRST_PARTITION_SECTOR;
    for (i, partition) in partitions.iter().enumerate() {
        let entry = &mut table[0x800 + i * 0x80..0x800 + (i + 1) * 0x80];
        entry[..partition.name.len()].copy_from_slice(partition.name.as_bytes());
        entry[0x1F] = 1;
        BigEndian::write_u32(&mut entry[0x20..], next_sector);

        let mut builder = FstBuilder::new(partition.nodes.clone());
        let mut cluster_sector = PARTITION_DATA_SECTOR;
        let mut cluster_data = Vec::new();
        for (c, plain) in partition.clusters.iter().enumerate() {
            let sectors = (align_up(plain.len().max(1), ss) / ss) as u32;
            builder = builder.cluster(cluster_sector, sectors, HashMode::RawChecksummed);
            let mut encrypted = encrypt_raw_cluster(&partition.key, c as u16, plain);
            encrypted.resize(sectors as usize * ss, 0);
            cluster_data.extend_from_slice(&encrypted);
            cluster_sector += sectors;
        }
        let (fst, fst_size) = builder.encrypted(&partition.key);
        assert!(fst.len() <= 2 * ss);

        let mut header = vec![0; ss];
        BigEndian::write_u32(&mut header[0x0..], 0xCC93_A4F5);
        BigEndian::write_u32(&mut header[0x4..], SECTOR_SIZE);
        BigEndian::write_u32(&mut header[0x14..], fst_size);
        BigEndian::write_u32(&mut header[0x18..], PARTITION_FST_SECTOR);
        header[0x24] = 0;
        header[0x25] = 1;

        image.extend_from_slice(&header);
        let mut fst_area = fst;
        fst_area.resize(2 * ss, 0);
        image.extend_from_slice(&fst_area);
        image.extend_from_slice(&cluster_data);
        next_sector = cluster_sector + next_sector;
    }

    patch(&mut table);
    disc_key.encrypt_cbc(&mut table, &[0; 0x10]).unwrap();
    image[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + ss].copy_from_slice(&table);
    image
}
