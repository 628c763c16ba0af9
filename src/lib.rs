//! Read-only access to encrypted Wii U disc images (WUD) and installable
//! title folders (`title.tmd` + `title.tik` + `*.app`).
//!
//! The entry points live in [`format::fst::FstVolume`]: open a volume, then
//! look up paths, iterate directories and read files. Decryption and
//! integrity checks happen lazily, one sector or hashed block at a time.

#[macro_use]
extern crate serde_derive;

#[macro_use]
pub mod utils;
pub mod error;
pub mod format;
pub mod pki;

#[cfg(test)]
pub(crate) mod testutil;
