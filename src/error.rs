use crate::pki::KeyName;
use derive_more::Display;
use snafu::Snafu;
use snafu::{Backtrace, GenerateImplicitData};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display( "{}: {}", path.display(), error))]
    Io {
        error: io::Error,
        path: PathBuf,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "Internal IO Error (please submit a bug report with the backtrace): {}",
        error
    ))]
    IoInternal {
        error: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Error parsing the INI file: {}", error))]
    Ini {
        error: ini::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Error writing JSON: {}", error))]
    Json {
        error: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Crypto error: {}", error))]
    Crypto { error: String, backtrace: Backtrace },
    #[snafu(display("Missing key {}. Make sure your keyfile is complete", key_name))]
    MissingKey {
        key_name: KeyName,
        backtrace: Backtrace,
    },
    #[snafu(display("None of the known disc keys decrypts this disc."))]
    DiscKeyMissing { backtrace: Backtrace },
    #[snafu(display("Not a Wii U disc image: {}.", error))]
    InvalidDisc {
        error: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decrypt the partition table. Is the disc key correct?"))]
    DiscDecryptionFailed { backtrace: Backtrace },
    #[snafu(display("Disc has no SI or no GM partition."))]
    NoSystemOrGamePartition { backtrace: Backtrace },
    #[snafu(display("Disc has more than one SI partition."))]
    MultipleSystemPartitions { backtrace: Backtrace },
    #[snafu(display("Partition with {} addresses is not supported.", addresses))]
    UnsupportedPartition { addresses: u8, backtrace: Backtrace },
    #[snafu(display("Invalid header for partition {}.", partition))]
    InvalidPartitionHeader {
        partition: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid FST: {}.", error))]
    InvalidFst {
        error: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Title ticket is missing."))]
    TitleTicketMissing { backtrace: Backtrace },
    #[snafu(display("Invalid title ticket: {}.", error))]
    BadTitleTicket {
        error: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid title metadata: {}.", error))]
    BadTitleMetadata {
        error: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("File not found: {}", path))]
    FileNotFound { path: String, backtrace: Backtrace },
    #[snafu(display(
        "Short read on {}: expected {} bytes, got {}",
        path,
        expected,
        read
    ))]
    ShortRead {
        path: String,
        expected: u32,
        read: u32,
        backtrace: Backtrace,
    },
    #[snafu(display("Data source returned {} of {} bytes.", read, expected))]
    SourceRead {
        expected: usize,
        read: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Hash mismatch in cluster {} block {}.", cluster, block))]
    HashMismatch {
        cluster: u16,
        block: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Content hash of cluster {} does not match the title metadata.", cluster))]
    ContentHashMismatch { cluster: u16, backtrace: Backtrace },
    #[snafu(display("Cluster {} previously failed its content hash check.", cluster))]
    ContentHashFailed { cluster: u16, backtrace: Backtrace },
    #[snafu(display("Content list has {} entries but the FST has {} clusters.", contents, clusters))]
    MissingContentHash {
        contents: usize,
        clusters: usize,
        backtrace: Backtrace,
    },
}

/// The named reasons an open can fail with, coarse enough for a UI to tell
/// a missing key apart from a missing ticket or an unrecognized image.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    #[display(fmt = "unknown error")]
    UnknownError,
    #[display(fmt = "disc key missing")]
    DiscKeyMissing,
    #[display(fmt = "title ticket missing")]
    TitleTicketMissing,
    #[display(fmt = "bad title metadata")]
    BadTitleMetadata,
    #[display(fmt = "bad title ticket")]
    BadTitleTicket,
}

impl Error {
    fn with_path<T: AsRef<Path>>(self, path: T) -> Error {
        if let Error::IoInternal { error, backtrace } = self {
            Error::Io {
                error,
                path: path.as_ref().to_owned(),
                backtrace,
            }
        } else {
            self
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::DiscKeyMissing { .. } => ErrorCode::DiscKeyMissing,
            Error::TitleTicketMissing { .. } => ErrorCode::TitleTicketMissing,
            Error::BadTitleMetadata { .. } | Error::MissingContentHash { .. } => {
                ErrorCode::BadTitleMetadata
            }
            Error::BadTitleTicket { .. } => ErrorCode::BadTitleTicket,
            _ => ErrorCode::UnknownError,
        }
    }
}

pub trait ResultExt {
    fn with_path<T: AsRef<Path>>(self, path: T) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn with_path<U: AsRef<Path>>(self, path: U) -> Result<T, Error> {
        self.map_err(|err| err.with_path(path))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoInternal {
            error: err,
            backtrace: Backtrace::generate(),
        }
    }
}

impl<T: AsRef<Path>> From<(io::Error, T)> for Error {
    fn from((error, path): (io::Error, T)) -> Error {
        Error::Io {
            error,
            path: path.as_ref().to_owned(),
            backtrace: Backtrace::generate(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::Json {
            error,
            backtrace: Backtrace::generate(),
        }
    }
}

impl From<ini::Error> for Error {
    fn from(error: ini::Error) -> Error {
        Error::Ini {
            error,
            backtrace: Backtrace::generate(),
        }
    }
}
