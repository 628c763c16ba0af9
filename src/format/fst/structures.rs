//! Raw FST structures
//!
//! The decrypted FST blob is laid out as:
//!
//! ```text
//! +0x00  header (0x20 bytes)
//! +0x20  cluster table, num_cluster * 0x20 bytes
//!        file table, root.end_index * 0x10 bytes
//!        name table, NUL-terminated names up to the end of the blob
//! ```
//!
//! All integers are big-endian.

use crate::error::{Error, InvalidFstSnafu};
use bit_field::BitField;
use byteorder::{BigEndian, ByteOrder};
use log::warn;
use snafu::ensure;

pub const FST_MAGIC: u32 = 0x4653_5400;
pub const FST_HEADER_SIZE: usize = 0x20;
pub const CLUSTER_ENTRY_SIZE: usize = 0x20;
pub const FILE_ENTRY_SIZE: usize = 0x10;
pub const MAX_CLUSTERS: u32 = 0x1000;

/// How a cluster's bytes are encrypted and verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HashMode {
    /// Chained AES-CBC sectors, no hash.
    RawUnverified,
    /// Chained AES-CBC sectors, checked against the TMD content hash when
    /// one is available.
    RawChecksummed,
    /// 64KiB blocks carrying their own H0/H1/H2 hash tree.
    HashInterleaved,
}

impl HashMode {
    pub fn from_raw(value: u8) -> Option<HashMode> {
        match value {
            0 => Some(HashMode::RawUnverified),
            1 => Some(HashMode::RawChecksummed),
            2 => Some(HashMode::HashInterleaved),
            _ => None,
        }
    }

    pub fn is_hashed(self) -> bool {
        self == HashMode::HashInterleaved
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawClusterEntry {
    /// In sectors, relative to the partition.
    pub offset: u32,
    pub size: u32,
    pub owner_title_id: u64,
    pub group_id: u32,
    pub hash_mode: HashMode,
}

impl RawClusterEntry {
    fn parse(buf: &[u8]) -> Result<RawClusterEntry, Error> {
        let raw_mode = buf[0x14];
        let hash_mode = match HashMode::from_raw(raw_mode) {
            Some(mode) => mode,
            None => {
                warn!("FST cluster uses unknown hash mode {}", raw_mode);
                return InvalidFstSnafu { error: "unknown cluster hash mode" }.fail();
            }
        };
        Ok(RawClusterEntry {
            offset: BigEndian::read_u32(&buf[0x0..]),
            size: BigEndian::read_u32(&buf[0x4..]),
            owner_title_id: BigEndian::read_u64(&buf[0x8..]),
            group_id: BigEndian::read_u32(&buf[0x10..]),
            hash_mode,
        })
    }
}

pub const TYPE_DIRECTORY: u8 = 0x01;
pub const TYPE_RESERVED_FLAG: u8 = 0x02;
pub const TYPE_LINK_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFileEntry {
    pub type_and_name_offset: u32,
    /// File: offset in units of the header's offset factor. Directory:
    /// parent index.
    pub offset: u32,
    /// File: byte size. Directory: end index (exclusive).
    pub size: u32,
    pub flags_or_permissions: u16,
    pub cluster_index: u16,
}

impl RawFileEntry {
    pub fn parse(buf: &[u8]) -> RawFileEntry {
        RawFileEntry {
            type_and_name_offset: BigEndian::read_u32(&buf[0x0..]),
            offset: BigEndian::read_u32(&buf[0x4..]),
            size: BigEndian::read_u32(&buf[0x8..]),
            flags_or_permissions: BigEndian::read_u16(&buf[0xC..]),
            cluster_index: BigEndian::read_u16(&buf[0xE..]),
        }
    }

    pub fn type_flags(&self) -> u8 {
        self.type_and_name_offset.get_bits(24..32) as u8
    }

    pub fn name_offset(&self) -> u32 {
        self.type_and_name_offset.get_bits(0..24)
    }

    pub fn is_directory(&self) -> bool {
        self.type_flags() & TYPE_DIRECTORY != 0
    }

    pub fn parent_index(&self) -> u32 {
        self.offset
    }

    pub fn end_index(&self) -> u32 {
        self.size
    }
}

/// The FST blob split into its tables, before the entry tree is validated.
#[derive(Debug)]
pub struct RawFst {
    pub offset_factor: u32,
    pub clusters: Vec<RawClusterEntry>,
    pub entries: Vec<RawFileEntry>,
    pub names: Vec<u8>,
}

impl RawFst {
    /// Splits a decrypted FST blob. `data` must already be cut to the
    /// logical FST size; anything past it would be read as names.
    pub fn parse(data: &[u8]) -> Result<RawFst, Error> {
        ensure!(data.len() >= FST_HEADER_SIZE, InvalidFstSnafu { error: "blob too small" });
        let magic = BigEndian::read_u32(&data[0x0..]);
        let offset_factor = BigEndian::read_u32(&data[0x4..]);
        let num_cluster = BigEndian::read_u32(&data[0x8..]);
        if magic != FST_MAGIC || num_cluster >= MAX_CLUSTERS {
            warn!("FST has invalid header");
            return InvalidFstSnafu { error: "invalid header" }.fail();
        }

        let file_table = FST_HEADER_SIZE + num_cluster as usize * CLUSTER_ENTRY_SIZE;
        ensure!(
            file_table <= data.len(),
            InvalidFstSnafu { error: "cluster table out of bounds" }
        );
        let clusters = data[FST_HEADER_SIZE..file_table]
            .chunks_exact(CLUSTER_ENTRY_SIZE)
            .map(RawClusterEntry::parse)
            .collect::<Result<Vec<_>, _>>()?;

        ensure!(
            file_table + FILE_ENTRY_SIZE <= data.len(),
            InvalidFstSnafu { error: "file table out of bounds" }
        );
        let root = RawFileEntry::parse(&data[file_table..]);
        ensure!(root.is_directory(), InvalidFstSnafu { error: "root is not a directory" });
        let num_entries = root.end_index() as usize;
        let name_table = num_entries
            .checked_mul(FILE_ENTRY_SIZE)
            .and_then(|len| len.checked_add(file_table))
            .filter(|end| num_entries != 0 && *end <= data.len())
            .ok_or_else(|| InvalidFstSnafu { error: "file table out of bounds" }.build())?;
        ensure!(name_table < data.len(), InvalidFstSnafu { error: "name table is empty" });

        let entries = data[file_table..name_table]
            .chunks_exact(FILE_ENTRY_SIZE)
            .map(RawFileEntry::parse)
            .collect();

        Ok(RawFst {
            offset_factor,
            clusters,
            entries,
            names: data[name_table..].to_vec(),
        })
    }
}
