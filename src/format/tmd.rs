//! Title metadata (`title.tmd`).
//!
//! The TMD lists every content of a title with its size and hash, which is
//! what the FST parser trusts when a title is opened from a content folder.

use crate::error::{BadTitleMetadataSnafu, Error};
use byteorder::{BigEndian, ByteOrder};
use snafu::ensure;

const HEADER_SIZE: usize = 0x204 + 64 * 36;
const CONTENT_ENTRY_SIZE: usize = 0x30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentFlags(pub u16);

impl ContentFlags {
    pub const ENCRYPTED: u16 = 0x0001;
    pub const HASHED: u16 = 0x0002;
    pub const SHA1: u16 = 0x2000;

    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Content is stored as hash-interleaved 64KiB blocks.
    pub fn is_hashed(self) -> bool {
        self.0 & Self::HASHED != 0
    }

    /// The content hash is SHA-1 (20 bytes) rather than SHA-256.
    pub fn is_sha1(self) -> bool {
        self.0 & Self::SHA1 != 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentEntry {
    pub content_id: u32,
    pub index: u16,
    pub flags: ContentFlags,
    pub size: u64,
    #[serde(skip)]
    pub hash: [u8; 32],
}

#[derive(Debug, Clone, Serialize)]
pub struct Tmd {
    title_id: u64,
    title_version: u16,
    contents: Vec<ContentEntry>,
}

impl Tmd {
    pub fn parse(data: &[u8]) -> Result<Tmd, Error> {
        ensure!(data.len() >= HEADER_SIZE, BadTitleMetadataSnafu { error: "header too small" });
        let num_content = BigEndian::read_u16(&data[0x1DE..]) as usize;
        ensure!(
            data.len() >= HEADER_SIZE + num_content * CONTENT_ENTRY_SIZE,
            BadTitleMetadataSnafu { error: "content list truncated" }
        );

        let contents = data[HEADER_SIZE..]
            .chunks_exact(CONTENT_ENTRY_SIZE)
            .take(num_content)
            .map(|entry| {
                let mut hash = [0; 32];
                hash.copy_from_slice(&entry[0x10..0x30]);
                ContentEntry {
                    content_id: BigEndian::read_u32(&entry[0x0..]),
                    index: BigEndian::read_u16(&entry[0x4..]),
                    flags: ContentFlags(BigEndian::read_u16(&entry[0x6..])),
                    size: BigEndian::read_u64(&entry[0x8..]),
                    hash,
                }
            })
            .collect();

        Ok(Tmd {
            title_id: BigEndian::read_u64(&data[0x18C..]),
            title_version: BigEndian::read_u16(&data[0x1DC..]),
            contents,
        })
    }

    pub fn title_id(&self) -> u64 {
        self.title_id
    }

    pub fn title_version(&self) -> u16 {
        self.title_version
    }

    /// Contents in the order they appear in the TMD.
    pub fn contents(&self) -> &[ContentEntry] {
        &self.contents
    }

    pub fn content_by_index(&self, index: u16) -> Option<&ContentEntry> {
        self.contents.iter().find(|c| c.index == index)
    }
}
