//! FST volumes.
//!
//! An [`FstVolume`] is one opened partition: its parsed file system table,
//! the title key protecting it, and a cache of decrypted sectors and hashed
//! blocks. Path lookups and directory walks only touch the in-memory tables;
//! file reads go through the cache, which decrypts and checks data the first
//! time it is needed.
//!
//! A volume is not synchronized. Callers sharing one between threads must
//! serialize access to it.

pub mod cache;
pub mod cluster;
pub mod path;
pub mod structures;
pub mod tree;
pub mod verify;

use self::cache::{BlockCache, CacheStats, CACHE_BUDGET, HASHED_BLOCK_DATA_SIZE};
use self::cluster::{ClusterDescriptor, ContentHashState, TrustedContent};
use self::path::{name_hash, name_matches, split_path};
use self::structures::{HashMode, RawFst, FST_HEADER_SIZE};
use self::tree::{EntryKind, FlatEntry};
use crate::error::{
    Error, FileNotFoundSnafu, InvalidFstSnafu, MissingContentHashSnafu, ShortReadSnafu,
    SourceReadSnafu,
};
use crate::format::source::ClusterDataSource;
use crate::format::tmd::ContentEntry;
use crate::format::SECTOR_SIZE;
use crate::pki::Aes128Key;
use crate::utils::align_up;
use log::{debug, warn};
use snafu::ensure;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

/// Index of an entry in the volume's file table. The root directory is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u32);

/// Position inside one directory's child list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryIterator {
    current: u32,
    end: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub index: u16,
    pub offset: u32,
    pub size: u32,
    pub owner_title_id: u64,
    pub group_id: u32,
    pub hash_mode: HashMode,
    /// Content size from the title metadata, when the volume has one.
    pub content_size: Option<u64>,
}

#[derive(Debug)]
pub struct FstVolume<S> {
    source: S,
    title_key: Aes128Key,
    sector_size: u32,
    offset_factor: u32,
    clusters: Vec<ClusterDescriptor>,
    hash_states: Vec<ContentHashState>,
    entries: Vec<FlatEntry>,
    names: Vec<u8>,
    cache: BlockCache,
    corrupted: bool,
}

impl<S: ClusterDataSource> FstVolume<S> {
    /// Reads, decrypts and parses the FST blob of `fst_size` bytes found at
    /// `fst_offset` of `source`.
    ///
    /// `trusted`, when given, must list one content per cluster in cluster
    /// order. Its sizes and hashes are then used to check raw clusters as
    /// they are read, and by the deep verification.
    pub fn open(
        mut source: S,
        fst_offset: u64,
        fst_size: u32,
        title_key: Aes128Key,
        fst_hash_mode: HashMode,
        trusted: Option<&[ContentEntry]>,
    ) -> Result<FstVolume<S>, Error> {
        ensure!(
            fst_size as usize >= FST_HEADER_SIZE,
            InvalidFstSnafu { error: "blob too small" }
        );
        debug!(
            "Opening FST at {:#x}, {:#x} bytes, declared as {:?}",
            fst_offset, fst_size, fst_hash_mode
        );

        // The FST blob is always one CBC chain with a zero IV.
        let mut blob = vec![0; align_up(fst_size as usize, 16)];
        let read = source.read_data(0, 0, fst_offset, &mut blob)?;
        ensure!(
            read == blob.len(),
            SourceReadSnafu { expected: blob.len(), read }
        );
        title_key.decrypt_cbc(&mut blob, &[0; 0x10])?;
        blob.truncate(fst_size as usize);

        let raw = RawFst::parse(&blob)?;
        if let Some(contents) = trusted {
            if contents.len() != raw.clusters.len() {
                warn!(
                    "Title metadata lists {} contents, FST has {} clusters",
                    contents.len(),
                    raw.clusters.len()
                );
                return MissingContentHashSnafu {
                    contents: contents.len(),
                    clusters: raw.clusters.len(),
                }
                .fail();
            }
        }

        let clusters: Vec<ClusterDescriptor> = raw
            .clusters
            .iter()
            .enumerate()
            .map(|(i, cluster)| {
                let trusted = trusted.map(|contents| TrustedContent {
                    hash: contents[i].hash,
                    sha1: contents[i].flags.is_sha1(),
                    size: contents[i].size,
                });
                ClusterDescriptor::from_raw(cluster, trusted)
            })
            .collect();
        let hash_states = clusters.iter().map(ContentHashState::for_cluster).collect();
        let entries = tree::build_entries(&raw.entries, clusters.len() as u32, &raw.names)?;
        debug!(
            "FST has {} clusters and {} entries",
            clusters.len(),
            entries.len()
        );

        Ok(FstVolume {
            source,
            title_key,
            sector_size: SECTOR_SIZE,
            offset_factor: raw.offset_factor,
            clusters,
            hash_states,
            entries,
            names: raw.names,
            cache: BlockCache::new(CACHE_BUDGET),
            corrupted: false,
        })
    }

    /// Copies up to `buf.len()` bytes of the file starting at `offset`.
    ///
    /// Returns the number of bytes copied. A count short of what the file
    /// holds means a sector or block failed to read or verify, in which case
    /// [`FstVolume::corruption_detected`] turns true.
    pub fn read_file(&mut self, handle: FileHandle, offset: u32, buf: &mut [u8]) -> usize {
        let (cluster_index, file_offset, size) = match self.entries.get(handle.0 as usize) {
            Some(FlatEntry {
                kind:
                    EntryKind::File {
                        cluster_index,
                        offset: file_offset,
                        size,
                    },
                ..
            }) => (*cluster_index, *file_offset, *size),
            _ => return 0,
        };
        if offset >= size {
            return 0;
        }
        let len = buf.len().min((size - offset) as usize);
        let hashed = self.clusters[cluster_index as usize].hash_mode.is_hashed();
        let block_size = if hashed {
            HASHED_BLOCK_DATA_SIZE as u64
        } else {
            u64::from(self.sector_size)
        };

        let mut pos = u64::from(file_offset) * u64::from(self.offset_factor) + u64::from(offset);
        let mut done = 0;
        while done < len {
            let index = pos / block_size;
            let within = (pos % block_size) as usize;
            let data = if hashed {
                self.hashed_block(cluster_index, index)
            } else {
                self.raw_sector(cluster_index, index)
            };
            let data = match data {
                Some(data) if within < data.len() => data,
                _ => break,
            };
            let n = (len - done).min(data.len() - within);
            buf[done..done + n].copy_from_slice(&data[within..within + n]);
            done += n;
            pos += n as u64;
        }
        done
    }

    /// Reads a whole file into memory.
    pub fn extract_file(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let handle = self
            .open_file(path, true)
            .ok_or_else(|| FileNotFoundSnafu { path }.build())?;
        let size = self.file_size(handle);
        let mut data = vec![0; size as usize];
        let read = self.read_file(handle, 0, &mut data);
        ensure!(
            read == data.len(),
            ShortReadSnafu {
                path,
                expected: size,
                read: read as u32,
            }
        );
        Ok(data)
    }

    /// Erases the source type, so volumes opened from different layouts can
    /// be handled alike.
    pub fn boxed<'a>(self) -> FstVolume<Box<dyn ClusterDataSource + 'a>>
    where
        S: 'a,
    {
        FstVolume {
            source: Box::new(self.source),
            title_key: self.title_key,
            sector_size: self.sector_size,
            offset_factor: self.offset_factor,
            clusters: self.clusters,
            hash_states: self.hash_states,
            entries: self.entries,
            names: self.names,
            cache: self.cache,
            corrupted: self.corrupted,
        }
    }
}

impl<S> FstVolume<S> {
    /// Resolves `path` against the root. An empty path (or one made only of
    /// separators) is the root directory itself.
    ///
    /// With `require_file`, directories do not match.
    pub fn open_file(&self, path: &str, require_file: bool) -> Option<FileHandle> {
        let components = split_path(path);
        if components.is_empty() {
            return if require_file {
                None
            } else {
                Some(FileHandle(0))
            };
        }

        let mut start = 1;
        let mut end = self.root_end();
        for (i, component) in components.iter().enumerate() {
            let found = self.find_child(start, end, component.as_bytes())?;
            let entry = &self.entries[found as usize];
            if i + 1 == components.len() {
                if require_file && entry.is_directory() {
                    return None;
                }
                return Some(FileHandle(found));
            }
            match entry.kind {
                EntryKind::Directory { end_index } => {
                    start = found + 1;
                    end = end_index;
                }
                EntryKind::File { .. } => return None,
            }
        }
        None
    }

    fn root_end(&self) -> u32 {
        match self.entries.first().map(|root| root.kind) {
            Some(EntryKind::Directory { end_index }) => end_index,
            _ => 0,
        }
    }

    /// Linear scan over one directory level, skipping the subtrees of
    /// non-matching directories.
    fn find_child(&self, start: u32, end: u32, wanted: &[u8]) -> Option<u32> {
        let hash = name_hash(wanted);
        let mut index = start;
        while index < end {
            let entry = &self.entries[index as usize];
            if entry.name_hash == hash
                && name_matches(&self.names[entry.name_offset as usize..], wanted)
            {
                return Some(index);
            }
            index = next_sibling(index, entry);
        }
        None
    }

    pub fn open_directory_iterator(&self, path: &str) -> Option<DirectoryIterator> {
        let handle = self.open_file(path, false)?;
        match self.entries[handle.0 as usize].kind {
            EntryKind::Directory { end_index } => Some(DirectoryIterator {
                current: handle.0 + 1,
                end: end_index,
            }),
            EntryKind::File { .. } => None,
        }
    }

    /// Yields the next direct child of the iterated directory.
    pub fn next_entry(&self, iter: &mut DirectoryIterator) -> Option<FileHandle> {
        if iter.current >= iter.end {
            return None;
        }
        let index = iter.current;
        let entry = self.entries.get(index as usize)?;
        iter.current = next_sibling(index, entry);
        Some(FileHandle(index))
    }

    pub fn read_dir(&self, path: &str) -> Result<ReadDir<'_, S>, Error> {
        let iter = self
            .open_directory_iterator(path)
            .ok_or_else(|| FileNotFoundSnafu { path }.build())?;
        Ok(ReadDir { volume: self, iter })
    }

    pub fn is_directory(&self, handle: FileHandle) -> bool {
        self.entries
            .get(handle.0 as usize)
            .map_or(false, FlatEntry::is_directory)
    }

    pub fn is_file(&self, handle: FileHandle) -> bool {
        self.entries
            .get(handle.0 as usize)
            .map_or(false, |entry| !entry.is_directory())
    }

    pub fn has_link_flag(&self, handle: FileHandle) -> bool {
        self.entries
            .get(handle.0 as usize)
            .map_or(false, |entry| entry.link)
    }

    /// Size in bytes. Directories are 0.
    pub fn file_size(&self, handle: FileHandle) -> u32 {
        match self.entries.get(handle.0 as usize).map(|entry| entry.kind) {
            Some(EntryKind::File { size, .. }) => size,
            _ => 0,
        }
    }

    /// The entry's own name. The root's name is empty.
    pub fn name(&self, handle: FileHandle) -> Cow<'_, str> {
        let tail = match self.entries.get(handle.0 as usize) {
            Some(entry) => &self.names[entry.name_offset as usize..],
            None => return Cow::Borrowed(""),
        };
        let len = tail.iter().position(|&c| c == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..len])
    }

    /// Full path from the root, components separated by `/`, without a
    /// leading separator.
    pub fn path(&self, handle: FileHandle) -> String {
        let mut components = Vec::new();
        let mut index = handle.0;
        while index != 0 {
            let entry = match self.entries.get(index as usize) {
                Some(entry) => entry,
                None => break,
            };
            components.push(self.name(FileHandle(index)));
            index = entry.parent;
        }
        components.reverse();
        components.join("/")
    }

    /// The entry's path relative to an extraction root on the host, or
    /// `None` when a component could leave that root: empty names, `.`, `..`,
    /// names holding a separator or anything the host reads as a prefix.
    pub fn host_path(&self, handle: FileHandle) -> Option<PathBuf> {
        let mut components = Vec::new();
        let mut index = handle.0;
        while index != 0 {
            let entry = self.entries.get(index as usize)?;
            let name = self.name(FileHandle(index));
            if !is_plain_component(&name) {
                return None;
            }
            components.push(name);
            index = entry.parent;
        }
        Some(components.iter().rev().map(|c| &**c).collect())
    }

    /// Number of file (non-directory) entries.
    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_directory()).count()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn cluster_info(&self) -> Vec<ClusterInfo> {
        self.clusters
            .iter()
            .enumerate()
            .map(|(index, cluster)| ClusterInfo {
                index: index as u16,
                offset: cluster.offset,
                size: cluster.size,
                owner_title_id: cluster.owner_title_id,
                group_id: cluster.group_id,
                hash_mode: cluster.hash_mode,
                content_size: cluster.trusted.map(|trusted| trusted.size),
            })
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Whether any read so far hit a sector or block that failed to read or
    /// verify.
    pub fn corruption_detected(&self) -> bool {
        self.corrupted
    }

    pub fn title_key(&self) -> &Aes128Key {
        &self.title_key
    }

    pub fn offset_factor(&self) -> u32 {
        self.offset_factor
    }

    #[cfg(test)]
    pub(crate) fn set_cache_budget(&mut self, budget: usize) {
        self.cache = BlockCache::new(budget);
    }
}

fn is_plain_component(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn next_sibling(index: u32, entry: &FlatEntry) -> u32 {
    match entry.kind {
        EntryKind::Directory { end_index } => end_index.max(index + 1),
        EntryKind::File { .. } => index + 1,
    }
}

/// Direct children of one directory, as handles.
#[derive(Debug)]
pub struct ReadDir<'a, S> {
    volume: &'a FstVolume<S>,
    iter: DirectoryIterator,
}

impl<'a, S> Iterator for ReadDir<'a, S> {
    type Item = FileHandle;

    fn next(&mut self) -> Option<FileHandle> {
        self.volume.next_entry(&mut self.iter)
    }
}
