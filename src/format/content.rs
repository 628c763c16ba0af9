//! Installable title folders: `title.tmd`, `title.tik` and one
//! `<content id>.app` per content.
//!
//! Content 0 holds the FST. The TMD's content list doubles as the trusted
//! reference the volume checks cluster contents against.

use crate::error::{
    BadTitleMetadataSnafu, BadTitleTicketSnafu, Error, ResultExt, TitleTicketMissingSnafu,
};
use crate::format::fst::structures::HashMode;
use crate::format::fst::FstVolume;
use crate::format::source::{ClusterDataSource, ContentFileSource};
use crate::format::ticket::Ticket;
use crate::format::tmd::{ContentEntry, Tmd};
use crate::pki::Keys;
use log::{info, warn};
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Opens a title folder, unwrapping its title key with the common key from
/// `keys`.
pub fn open_from_content_folder<P: AsRef<Path>>(
    path: P,
    keys: &Keys,
) -> Result<FstVolume<ContentFileSource<File>>, Error> {
    let folder = path.as_ref();

    let tmd_data = match fs::read(folder.join("title.tmd")) {
        Ok(data) => data,
        Err(err) => {
            warn!("Failed to read title.tmd: {}", err);
            return BadTitleMetadataSnafu { error: "title.tmd is missing" }.fail();
        }
    };
    let tmd = Tmd::parse(&tmd_data)?;

    let ticket_data = match fs::read(folder.join("title.tik")) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return TitleTicketMissingSnafu.fail();
        }
        Err(err) => {
            warn!("Failed to read title.tik: {}", err);
            return BadTitleTicketSnafu { error: "title.tik is unreadable" }.fail();
        }
    };
    let ticket = Ticket::parse(&ticket_data)?;

    let source = ContentFileSource::open(folder, &tmd)?;
    open_title(source, &tmd, &ticket, keys).with_path(folder)
}

/// Opens a title whose contents are already available as `source`, indexed
/// by content index.
pub fn open_title<S: ClusterDataSource>(
    source: S,
    tmd: &Tmd,
    ticket: &Ticket,
    keys: &Keys,
) -> Result<FstVolume<S>, Error> {
    let title_key = ticket.title_key(keys.common_key()?)?;

    let fst_content = match tmd.content_by_index(0) {
        Some(content) => content,
        None => return BadTitleMetadataSnafu { error: "no FST content" }.fail(),
    };
    if fst_content.size > u64::from(u32::MAX) {
        return BadTitleMetadataSnafu { error: "FST content too large" }.fail();
    }
    let fst_hash_mode = if fst_content.flags.is_hashed() {
        HashMode::HashInterleaved
    } else {
        HashMode::RawUnverified
    };

    let mut trusted: Vec<ContentEntry> = tmd.contents().to_vec();
    trusted.sort_by_key(|content| content.index);
    if trusted.iter().enumerate().any(|(i, c)| usize::from(c.index) != i) {
        warn!("Title metadata content indices are not contiguous");
        return BadTitleMetadataSnafu { error: "content indices have gaps" }.fail();
    }

    info!(
        "Opening title {:016x} v{} with {} contents",
        tmd.title_id(),
        tmd.title_version(),
        trusted.len()
    );
    FstVolume::open(
        source,
        0,
        fst_content.size as u32,
        title_key,
        fst_hash_mode,
        Some(&trusted[..]),
    )
}
