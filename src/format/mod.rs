//! Parsers for the containers found on Wii U discs and in installable title
//! folders.

pub mod content;
pub mod fst;
pub mod source;
pub mod ticket;
pub mod tmd;
pub mod wud;

/// Size of a disc sector, and of a raw (unhashed) cluster sector.
pub const SECTOR_SIZE: u32 = 0x8000;
