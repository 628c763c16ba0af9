//! Validation and linkage of the flattened entry tree.
//!
//! Entries are stored in preorder. A directory at index `i` owns every index
//! in `[i + 1, end_index)`, and those ranges nest like brackets. The walk
//! below checks the nesting, resolves names and assigns each entry the index
//! of its enclosing directory.

use super::path::name_hash;
use super::structures::{RawFileEntry, TYPE_LINK_FLAG, TYPE_RESERVED_FLAG};
use crate::error::{Error, InvalidFstSnafu};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory {
        end_index: u32,
    },
    File {
        cluster_index: u16,
        /// In units of the volume's offset factor.
        offset: u32,
        size: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatEntry {
    pub name_offset: u32,
    pub name_hash: u16,
    /// Index of the enclosing directory. The root and its direct children
    /// all point at 0.
    pub parent: u32,
    pub link: bool,
    pub reserved_flag: bool,
    pub kind: EntryKind,
}

impl FlatEntry {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenRange {
    origin: u32,
    end: u32,
}

fn fail<T>(error: &'static str) -> Result<T, Error> {
    warn!("FST: {}", error);
    InvalidFstSnafu { error }.fail()
}

/// Walks `raw` once, left to right. Fails on the first structural violation;
/// nothing is returned for a malformed tree.
pub fn build_entries(
    raw: &[RawFileEntry],
    num_cluster: u32,
    names: &[u8],
) -> Result<Vec<FlatEntry>, Error> {
    let num_entries = raw.len() as u32;
    let root = match raw.first() {
        Some(root) => root,
        None => return fail("empty file table"),
    };
    if !root.is_directory() || root.end_index() != num_entries || root.parent_index() != 0 {
        return fail("root node is invalid");
    }

    let mut stack = Vec::with_capacity(32);
    stack.push(OpenRange {
        origin: 0,
        end: num_entries,
    });
    let mut entries = Vec::with_capacity(raw.len());

    for (index, entry) in raw.iter().enumerate() {
        let index = index as u32;
        while stack.last().map_or(false, |top| index >= top.end) {
            stack.pop();
        }
        let top = match stack.last() {
            Some(top) => *top,
            None => return fail("entry outside of the root directory"),
        };

        let name_offset = entry.name_offset();
        let name = match names.get(name_offset as usize..) {
            Some(tail) => match tail.iter().position(|&c| c == 0) {
                Some(len) => &tail[..len],
                None => return fail("name exceeds string table"),
            },
            None => return fail("name exceeds string table"),
        };

        let kind = if entry.is_directory() {
            let end_index = entry.end_index();
            if end_index < index || end_index > top.end {
                return fail("directory range out of bounds");
            }
            if entry.parent_index() != top.origin {
                return fail("parent index does not match");
            }
            stack.push(OpenRange {
                origin: index,
                end: end_index,
            });
            EntryKind::Directory { end_index }
        } else {
            if u32::from(entry.cluster_index) >= num_cluster {
                return fail("file references cluster out of range");
            }
            EntryKind::File {
                cluster_index: entry.cluster_index,
                offset: entry.offset,
                size: entry.size,
            }
        };

        let type_flags = entry.type_flags();
        entries.push(FlatEntry {
            name_offset,
            name_hash: name_hash(name),
            parent: top.origin,
            link: type_flags & TYPE_LINK_FLAG != 0,
            reserved_flag: type_flags & TYPE_RESERVED_FLAG != 0,
            kind,
        });
    }

    while stack.last().map_or(false, |top| num_entries >= top.end) {
        stack.pop();
    }
    if !stack.is_empty() {
        return fail("unterminated directory");
    }
    Ok(entries)
}
