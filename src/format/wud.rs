//! Wii U disc images (WUD).
//!
//! A disc is split into partitions, listed in a partition table encrypted
//! with the disc key. The SI partition holds one ticket per partition; the
//! GM partition holds the game itself, encrypted with the title key from its
//! ticket. Opening a disc image means:
//!
//! 1. checking the disc headers and finding the disc key,
//! 2. decrypting the partition table and picking the SI and GM partitions,
//! 3. opening the SI partition's FST with the disc key and pulling
//!    `<gm index>/title.tik` out of it,
//! 4. opening the GM partition's FST with the ticket's title key.

use crate::error::{
    BadTitleTicketSnafu, DiscDecryptionFailedSnafu, DiscKeyMissingSnafu, Error,
    InvalidDiscSnafu, InvalidPartitionHeaderSnafu, MultipleSystemPartitionsSnafu,
    NoSystemOrGamePartitionSnafu, ResultExt, SourceReadSnafu, TitleTicketMissingSnafu,
    UnsupportedPartitionSnafu,
};
use crate::format::fst::structures::HashMode;
use crate::format::fst::FstVolume;
use crate::format::source::DiscImageSource;
use crate::format::ticket::Ticket;
use crate::format::SECTOR_SIZE;
use crate::pki::{Aes128Key, Keys};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use snafu::ensure;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

const PRODUCT_CODE_PREFIX: &[u8] = b"WUP-";
const HEADER_B_OFFSET: u64 = 0x10000;
const HEADER_B_MAGIC: u32 = 0xCC54_9EB9;
const PARTITION_TABLE_OFFSET: u64 = 0x18000;
const PARTITION_TABLE_MAGIC: u32 = 0xCCA6_E67B;
const PARTITION_ENTRIES_OFFSET: usize = 0x800;
const PARTITION_ENTRY_SIZE: usize = 0x80;
const PARTITION_NAME_SIZE: usize = 31;
const MAX_PARTITIONS: u32 = 30;
const PARTITION_HEADER_MAGIC: u32 = 0xCC93_A4F5;
const PARTITION_HEADER_SIZE: usize = 0x28;

/// 48 bytes inside the partition table that decrypt to zeros.
const KEY_PROBE_OFFSET: u64 = PARTITION_TABLE_OFFSET + 0x100;
const KEY_PROBE_SIZE: usize = 0x30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    /// Position in the partition table.
    pub index: usize,
    pub name: String,
    /// In sectors from the start of the disc.
    pub address: u32,
}

impl PartitionEntry {
    pub fn byte_offset(&self) -> u64 {
        u64::from(self.address) * u64::from(SECTOR_SIZE)
    }

    pub fn is_system(&self) -> bool {
        self.name.starts_with("SI")
    }

    pub fn is_game(&self) -> bool {
        self.name.starts_with("GM")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionHeader {
    pub fst_size: u32,
    /// Relative to the partition start.
    pub fst_sector: u32,
    pub fst_hash_mode: HashMode,
    pub fst_encryption_type: u8,
}

impl PartitionHeader {
    pub fn fst_offset(&self) -> u64 {
        u64::from(self.fst_sector) * u64::from(SECTOR_SIZE)
    }
}

fn read_exact_at<R: Read + Seek>(
    source: &mut DiscImageSource<R>,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), Error> {
    let read = source.read_at(offset, buf)?;
    ensure!(
        read == buf.len(),
        SourceReadSnafu { expected: buf.len(), read }
    );
    Ok(())
}

/// Checks the product code header and the magic at 0x10000.
pub fn check_disc_headers<R: Read + Seek>(source: &mut DiscImageSource<R>) -> Result<(), Error> {
    let mut product_code = [0; 22];
    read_exact_at(source, 0, &mut product_code)
        .map_err(|_| InvalidDiscSnafu { error: "image too small" }.build())?;
    if !product_code.starts_with(PRODUCT_CODE_PREFIX) {
        warn!("Disc image rejected: no WUP- product code");
        return InvalidDiscSnafu { error: "missing product code" }.fail();
    }

    let mut magic = [0; 4];
    read_exact_at(source, HEADER_B_OFFSET, &mut magic)
        .map_err(|_| InvalidDiscSnafu { error: "image too small" }.build())?;
    if BigEndian::read_u32(&magic) != HEADER_B_MAGIC {
        warn!("Disc image rejected: bad header magic");
        return InvalidDiscSnafu { error: "bad header magic" }.fail();
    }
    Ok(())
}

/// Finds which of the known disc keys encrypts this disc.
pub fn resolve_disc_key<R: Read + Seek>(
    source: &mut DiscImageSource<R>,
    keys: &Keys,
) -> Result<Aes128Key, Error> {
    let mut probe = [0; KEY_PROBE_SIZE];
    read_exact_at(source, KEY_PROBE_OFFSET, &mut probe)?;

    for (name, key) in keys.disc_keys() {
        let mut buf = probe;
        key.decrypt_cbc(&mut buf, &[0; 0x10])?;
        // The first block decrypts against the wrong IV; the rest chain
        // from ciphertext and come out clean.
        if buf[0x10..].iter().all(|&b| b == 0) {
            debug!("Found disc key {}", name);
            return Ok(*key);
        }
    }
    warn!("None of the {} known disc keys matches", keys.disc_keys().count());
    DiscKeyMissingSnafu.fail()
}

/// Decrypts and parses the partition table.
pub fn read_partition_table<R: Read + Seek>(
    source: &mut DiscImageSource<R>,
    disc_key: &Aes128Key,
) -> Result<Vec<PartitionEntry>, Error> {
    let mut table = vec![0; SECTOR_SIZE as usize];
    read_exact_at(source, PARTITION_TABLE_OFFSET, &mut table)?;
    disc_key.decrypt_cbc(&mut table, &[0; 0x10])?;

    if BigEndian::read_u32(&table[0x0..]) != PARTITION_TABLE_MAGIC {
        warn!("Disc image rejected: partition table did not decrypt");
        return DiscDecryptionFailedSnafu.fail();
    }
    if BigEndian::read_u32(&table[0x4..]) != SECTOR_SIZE {
        warn!("Disc image rejected: invalid partition sector size");
        return InvalidDiscSnafu { error: "invalid partition sector size" }.fail();
    }
    let num_partitions = BigEndian::read_u32(&table[0x1C..]);
    if num_partitions > MAX_PARTITIONS {
        warn!("Disc image rejected: {} partitions", num_partitions);
        return InvalidDiscSnafu { error: "too many partitions" }.fail();
    }

    let mut partitions = Vec::with_capacity(num_partitions as usize);
    for index in 0..num_partitions as usize {
        let off = PARTITION_ENTRIES_OFFSET + index * PARTITION_ENTRY_SIZE;
        let entry = &table[off..off + PARTITION_ENTRY_SIZE];
        let addresses = entry[0x1F];
        if addresses != 1 {
            warn!("Disc image has a partition with {} addresses", addresses);
            return UnsupportedPartitionSnafu { addresses }.fail();
        }
        let name = &entry[..PARTITION_NAME_SIZE];
        let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
        partitions.push(PartitionEntry {
            index,
            name: String::from_utf8_lossy(&name[..len]).into_owned(),
            address: BigEndian::read_u32(&entry[0x20..]),
        });
    }
    Ok(partitions)
}

/// Picks the single SI partition and the first GM partition.
pub fn select_partitions(
    partitions: &[PartitionEntry],
) -> Result<(&PartitionEntry, &PartitionEntry), Error> {
    let mut system = None;
    let mut game = None;
    for partition in partitions {
        if partition.is_system() {
            if system.is_some() {
                warn!("Disc image has multiple SI partitions");
                return MultipleSystemPartitionsSnafu.fail();
            }
            system = Some(partition);
        }
        if partition.is_game() && game.is_none() {
            game = Some(partition);
        }
    }
    match (system, game) {
        (Some(system), Some(game)) => Ok((system, game)),
        _ => {
            warn!("Disc image has no SI or no GM partition");
            NoSystemOrGamePartitionSnafu.fail()
        }
    }
}

pub fn read_partition_header<R: Read + Seek>(
    source: &mut DiscImageSource<R>,
    partition: &PartitionEntry,
) -> Result<PartitionHeader, Error> {
    let invalid = || {
        warn!("Disc image {} partition header is invalid", partition.name);
        InvalidPartitionHeaderSnafu {
            partition: partition.name.clone(),
        }
        .build()
    };
    let mut header = [0; PARTITION_HEADER_SIZE];
    read_exact_at(source, partition.byte_offset(), &mut header).map_err(|_| invalid())?;
    if BigEndian::read_u32(&header[0x0..]) != PARTITION_HEADER_MAGIC
        || BigEndian::read_u32(&header[0x4..]) != SECTOR_SIZE
    {
        return Err(invalid());
    }
    let fst_hash_mode = HashMode::from_raw(header[0x24]).ok_or_else(invalid)?;
    Ok(PartitionHeader {
        fst_size: BigEndian::read_u32(&header[0x14..]),
        fst_sector: BigEndian::read_u32(&header[0x18..]),
        fst_hash_mode,
        fst_encryption_type: header[0x25],
    })
}

/// Opens the game partition of a disc image, finding the disc key among
/// `keys`.
pub fn open_from_disc_image<P: AsRef<Path>>(
    path: P,
    keys: &Keys,
) -> Result<FstVolume<DiscImageSource<File>>, Error> {
    let source = DiscImageSource::open(path.as_ref())?;
    open_disc(source, keys, None).with_path(path)
}

/// Opens the game partition of a disc image with a known disc key.
pub fn open_from_disc_image_with_key<P: AsRef<Path>>(
    path: P,
    keys: &Keys,
    disc_key: Aes128Key,
) -> Result<FstVolume<DiscImageSource<File>>, Error> {
    let source = DiscImageSource::open(path.as_ref())?;
    open_disc(source, keys, Some(disc_key)).with_path(path)
}

/// Opens the game partition of a disc image read from any seekable stream.
/// Without `disc_key`, the key is looked up among `keys`.
pub fn open_disc<R: Read + Seek>(
    mut source: DiscImageSource<R>,
    keys: &Keys,
    disc_key: Option<Aes128Key>,
) -> Result<FstVolume<DiscImageSource<R>>, Error> {
    source.set_base_offset(0);
    check_disc_headers(&mut source)?;
    let disc_key = match disc_key {
        Some(key) => key,
        None => resolve_disc_key(&mut source, keys)?,
    };

    let partitions = read_partition_table(&mut source, &disc_key)?;
    let (system, game) = select_partitions(&partitions)?;
    debug!(
        "SI partition {} at sector {:#x}, GM partition {} ({}) at sector {:#x}",
        system.index, system.address, game.index, game.name, game.address
    );
    let system_header = read_partition_header(&mut source, system)?;
    let game_header = read_partition_header(&mut source, game)?;

    source.set_base_offset(system.byte_offset());
    let ticket_data = {
        let mut system_volume = FstVolume::open(
            &mut source,
            system_header.fst_offset(),
            system_header.fst_size,
            disc_key,
            system_header.fst_hash_mode,
            None,
        )?;
        let ticket_path = format!("{:02x}/title.tik", game.index);
        match system_volume.extract_file(&ticket_path) {
            Ok(data) => data,
            Err(Error::FileNotFound { .. }) => {
                warn!("Disc image has no {}", ticket_path);
                return TitleTicketMissingSnafu.fail();
            }
            Err(err) => {
                warn!("Failed to read {}: {}", ticket_path, err);
                return BadTitleTicketSnafu { error: "ticket unreadable" }.fail();
            }
        }
    };
    let ticket = Ticket::parse(&ticket_data)?;
    let title_key = ticket.title_key(keys.common_key()?)?;
    info!("Opening GM partition of title {:016x}", ticket.title_id());

    source.set_base_offset(game.byte_offset());
    FstVolume::open(
        source,
        game_header.fst_offset(),
        game_header.fst_size,
        title_key,
        game_header.fst_hash_mode,
        None,
    )
}
