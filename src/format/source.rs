//! Where cluster bytes come from.
//!
//! A Wii U partition stores its clusters either back to back inside one disc
//! image, or as one `.app` file per cluster inside a title folder. The FST
//! code only ever asks for "these bytes of that cluster", so both layouts sit
//! behind [`ClusterDataSource`].

use crate::error::{Error, ResultExt};
use crate::format::tmd::Tmd;
use log::debug;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

pub trait ClusterDataSource {
    /// Reads up to `buf.len()` bytes of cluster `cluster_index`, starting
    /// `offset` bytes into the cluster. `cluster_offset` is the byte position
    /// of the cluster inside its partition, for layouts that need it.
    ///
    /// Returns the number of bytes read, which is only short at end of data.
    fn read_data(
        &mut self,
        cluster_index: u16,
        cluster_offset: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize>;
}

impl<S: ClusterDataSource + ?Sized> ClusterDataSource for &mut S {
    fn read_data(
        &mut self,
        cluster_index: u16,
        cluster_offset: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        (**self).read_data(cluster_index, cluster_offset, offset, buf)
    }
}

impl<S: ClusterDataSource + ?Sized> ClusterDataSource for Box<S> {
    fn read_data(
        &mut self,
        cluster_index: u16,
        cluster_offset: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        (**self).read_data(cluster_index, cluster_offset, offset, buf)
    }
}

fn read_full<R: Read>(reader: &mut R, mut buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while !buf.is_empty() {
        match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                buf = &mut buf[n..];
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => (),
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

/// A whole disc image. Cluster offsets are relative to the partition
/// currently selected with [`DiscImageSource::set_base_offset`].
#[derive(Debug)]
pub struct DiscImageSource<R> {
    stream: R,
    base_offset: u64,
}

impl DiscImageSource<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DiscImageSource<File>, Error> {
        let file = File::open(path.as_ref()).map_err(|err| (err, path.as_ref()))?;
        Ok(DiscImageSource::new(file))
    }
}

impl<R: Read + Seek> DiscImageSource<R> {
    pub fn new(stream: R) -> DiscImageSource<R> {
        DiscImageSource {
            stream,
            base_offset: 0,
        }
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn set_base_offset(&mut self, base_offset: u64) {
        self.base_offset = base_offset;
    }

    /// Reads at an absolute disc offset, ignoring the partition base.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.seek(SeekFrom::Start(offset))?;
        read_full(&mut self.stream, buf)
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

impl<R: Read + Seek> ClusterDataSource for DiscImageSource<R> {
    fn read_data(
        &mut self,
        _cluster_index: u16,
        cluster_offset: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let pos = self.base_offset + cluster_offset + offset;
        self.read_at(pos, buf)
    }
}

/// One stream per cluster, indexed by cluster index. Missing slots fail
/// reads with `NotFound`.
#[derive(Debug)]
pub struct ContentFileSource<R> {
    files: Vec<Option<R>>,
}

impl ContentFileSource<File> {
    /// Opens `<content id>.app` for every content listed in the title
    /// metadata.
    pub fn open<P: AsRef<Path>>(folder: P, tmd: &Tmd) -> Result<ContentFileSource<File>, Error> {
        let mut files = Vec::new();
        for content in tmd.contents() {
            let path = folder.as_ref().join(format!("{:08x}.app", content.content_id));
            let file = File::open(&path).map_err(Error::from).with_path(&path)?;
            let index = content.index as usize;
            if files.len() <= index {
                files.resize_with(index + 1, || None);
            }
            files[index] = Some(file);
        }
        debug!("Opened {} content files", files.iter().flatten().count());
        Ok(ContentFileSource { files })
    }
}

impl<R: Read + Seek> ContentFileSource<R> {
    pub fn from_readers(files: Vec<Option<R>>) -> ContentFileSource<R> {
        ContentFileSource { files }
    }
}

impl<R: Read + Seek> ClusterDataSource for ContentFileSource<R> {
    fn read_data(
        &mut self,
        cluster_index: u16,
        _cluster_offset: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let file = self
            .files
            .get_mut(cluster_index as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::NotFound,
                    format!("no content file for cluster {}", cluster_index),
                )
            })?;
        file.seek(SeekFrom::Start(offset))?;
        read_full(file, buf)
    }
}
