//! eTicket parsing.
//!
//! A ticket grants the right to use a title and carries its title key,
//! wrapped with the platform common key. Only the fields needed to unwrap
//! that key (and the v1 content rights) are parsed; signatures are not
//! checked.

use crate::error::{BadTitleTicketSnafu, Error};
use crate::pki::Aes128Key;
use bit_field::BitField;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use snafu::ensure;

const HEADER_SIZE: usize = 0x220;
const EXT_HEADER_OFFSET: usize = 0x2A4;
const EXT_HEADER_SIZE: usize = 0x10;
const SECTION_HEADER_SIZE: usize = 0x14;
const SECTION_TYPE_CONTENT_RIGHTS: u16 = 3;
const CONTENT_RIGHTS_SIZE: usize = 0x84;
const MAX_RIGHTS_BASE_INDEX: u32 = 0x1000;

#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    title_id: u64,
    ticket_id: u64,
    format_version: u8,
    title_version: u16,
    device_id: u32,
    #[serde(skip)]
    encrypted_title_key: [u8; 0x10],
    #[serde(skip)]
    content_rights: Vec<bool>,
}

fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], Error> {
    data.get(offset..offset.saturating_add(len))
        .ok_or_else(|| BadTitleTicketSnafu { error: "structure out of bounds" }.build())
}

impl Ticket {
    pub fn parse(data: &[u8]) -> Result<Ticket, Error> {
        ensure!(data.len() >= HEADER_SIZE, BadTitleTicketSnafu { error: "ticket too small" });

        let title_id = BigEndian::read_u64(&data[0x1DC..]);
        let title_id_high = (title_id >> 32) as u32;
        ensure!(
            title_id_high >> 16 == 0x5,
            BadTitleTicketSnafu { error: "not a Wii U title id" }
        );

        let mut encrypted_title_key = [0; 0x10];
        encrypted_title_key.copy_from_slice(&data[0x1BF..0x1CF]);

        let mut ticket = Ticket {
            title_id,
            ticket_id: BigEndian::read_u64(&data[0x1D0..]),
            format_version: data[0x1BC],
            title_version: BigEndian::read_u16(&data[0x1E6..]),
            device_id: BigEndian::read_u32(&data[0x1D8..]),
            encrypted_title_key,
            content_rights: Vec::new(),
        };

        if ticket.is_personalized() {
            warn!(
                "Ticket for {:016x} is personalized to device {:08x}; its title key will not decrypt correctly",
                ticket.title_id, ticket.device_id
            );
        }

        if ticket.format_version >= 1 && title_id_high == 0x0005_000C {
            ticket.parse_v1_extension(data)?;
        }

        Ok(ticket)
    }

    fn parse_v1_extension(&mut self, data: &[u8]) -> Result<(), Error> {
        let ext = slice(data, EXT_HEADER_OFFSET, EXT_HEADER_SIZE)?;
        let section_table_offset = BigEndian::read_u32(&ext[0x8..]) as usize;
        let num_sections = BigEndian::read_u16(&ext[0xC..]) as usize;
        let mut section_entry_size = BigEndian::read_u16(&ext[0xE..]) as usize;
        if section_entry_size == 0 {
            section_entry_size = SECTION_HEADER_SIZE;
        }

        for i in 0..num_sections {
            let off = EXT_HEADER_OFFSET + section_table_offset + i * section_entry_size;
            let section = slice(data, off, SECTION_HEADER_SIZE)?;
            let section_offset = BigEndian::read_u32(&section[0x0..]) as usize;
            let entry_count = BigEndian::read_u32(&section[0x4..]) as usize;
            let entry_size = BigEndian::read_u32(&section[0x8..]) as usize;
            let section_type = BigEndian::read_u16(&section[0x10..]);

            if section_type != SECTION_TYPE_CONTENT_RIGHTS {
                debug!("Skipping ticket section of type {}", section_type);
                continue;
            }
            ensure!(
                entry_size == CONTENT_RIGHTS_SIZE,
                BadTitleTicketSnafu { error: "invalid content rights size" }
            );

            for r in 0..entry_count {
                let rights = slice(
                    data,
                    EXT_HEADER_OFFSET + section_offset + r * entry_size,
                    CONTENT_RIGHTS_SIZE,
                )?;
                let base_index = BigEndian::read_u32(rights);
                if base_index > MAX_RIGHTS_BASE_INDEX {
                    warn!("Invalid content rights index ({})", base_index);
                    continue;
                }
                let mask = &rights[4..];
                let base_index = base_index as usize;
                let count = mask.len() * 8;
                if self.content_rights.len() < base_index + count {
                    self.content_rights.resize(base_index + count, false);
                }
                for x in 0..count {
                    self.content_rights[base_index + x] = mask[x / 8].get_bit(x & 7);
                }
            }
        }
        Ok(())
    }

    pub fn title_id(&self) -> u64 {
        self.title_id
    }

    pub fn ticket_id(&self) -> u64 {
        self.ticket_id
    }

    pub fn format_version(&self) -> u8 {
        self.format_version
    }

    pub fn title_version(&self) -> u16 {
        self.title_version
    }

    pub fn is_personalized(&self) -> bool {
        self.device_id != 0
    }

    /// Whether a v1 ticket grants the content with the given index. Tickets
    /// without a rights section grant nothing through this check.
    pub fn has_content_right(&self, index: usize) -> bool {
        self.content_rights.get(index).copied().unwrap_or(false)
    }

    /// Unwraps the title key. The IV is the big-endian title id followed by
    /// eight zero bytes.
    pub fn title_key(&self, common_key: &Aes128Key) -> Result<Aes128Key, Error> {
        let mut iv = [0; 0x10];
        BigEndian::write_u64(&mut iv[..8], self.title_id);
        let mut key = self.encrypted_title_key;
        common_key.decrypt_cbc(&mut key, &iv)?;
        Ok(Aes128Key(key))
    }
}
