use crate::error::Error;
use aes::Aes128;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use derive_more::Display;
use ini::Properties;
use log::{debug, warn};
use snafu::{Backtrace, GenerateImplicitData};
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::Path;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Aes128Key(pub [u8; 0x10]);

impl_debug_deserialize_serialize_hexstring!(Aes128Key);

impl Aes128Key {
    fn check_len(buf: &[u8]) -> Result<(), Error> {
        if buf.len() % 16 != 0 {
            return Err(Error::Crypto {
                error: String::from(
                    "buf length should be a multiple of 16, the size of an AES block.",
                ),
                backtrace: Backtrace::generate(),
            });
        }
        Ok(())
    }

    /// Decrypt blocks in CBC mode, in place.
    pub fn decrypt_cbc(&self, buf: &mut [u8], iv: &[u8; 0x10]) -> Result<(), Error> {
        Self::check_len(buf)?;
        Aes128CbcDec::new((&self.0).into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|err| Error::Crypto {
                error: format!("{:?}", err),
                backtrace: Backtrace::generate(),
            })?;
        Ok(())
    }

    pub fn encrypt_cbc(&self, buf: &mut [u8], iv: &[u8; 0x10]) -> Result<(), Error> {
        Self::check_len(buf)?;
        let len = buf.len();
        Aes128CbcEnc::new((&self.0).into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(buf, len)
            .map_err(|err| Error::Crypto {
                error: format!("{:?}", err),
                backtrace: Backtrace::generate(),
            })?;
        Ok(())
    }
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum KeyName {
    #[display(fmt = "common_key")]
    CommonKey,
}

fn key_to_aes(keys: &Properties, name: &str, key: &mut [u8]) -> Result<Option<()>, Error> {
    let value = keys.get(name);
    if let Some(value) = value {
        if value.len() != key.len() * 2 {
            return Err(Error::Crypto {
                error: format!(
                    "Key {} is not of the right size. It should be a {} byte hexstring",
                    name,
                    key.len() * 2
                ),
                backtrace: Backtrace::generate(),
            });
        }
        crate::utils::parse_hexstring(value, key).map_err(|err| Error::Crypto {
            error: format!("Key {}: {}. Each character should be a hexadecimal digit.", name, err),
            backtrace: Backtrace::generate(),
        })?;
        Ok(Some(()))
    } else {
        Ok(None)
    }
}

/// Key material loaded from a `keys.txt` INI file.
///
/// `common_key` unwraps ticket title keys. Every `disc_key_*` entry is a
/// candidate for decrypting the partition table of a disc image; they are
/// tried in file order.
#[derive(Default, Debug, Clone)]
pub struct Keys {
    common_key: Option<Aes128Key>,
    disc_keys: Vec<(String, Aes128Key)>,
}

impl Keys {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(key_path: Option<&Path>) -> Result<Keys, Error> {
        let mut keys = Keys::default();

        let paths = if let Some(key_path) = key_path {
            vec![Some(key_path.into())]
        } else {
            vec![
                dirs_next::config_dir().map(|mut v| {
                    v.push("wiiu");
                    v.push("keys.txt");
                    v
                }),
                dirs_next::home_dir().map(|mut v| {
                    v.push(".wiiu");
                    v.push("keys.txt");
                    v
                }),
            ]
        };

        let mut succeed = false;
        for path in paths.into_iter().flatten() {
            match File::open(&path) {
                Ok(mut file) => {
                    debug!("Loading keys from {}", path.display());
                    keys.read_from_ini(&mut file)?;
                    succeed = true;
                    break;
                }
                Err(ref err) if err.kind() == ErrorKind::NotFound => (),
                Err(err) => warn!("Failed to open {}: {}", path.display(), err),
            }
        }

        if !succeed {
            return Err(io::Error::new(ErrorKind::NotFound, "Keyfile not found.").into());
        }

        Ok(keys)
    }

    /// Parses `name = hexstring` pairs from the general section. Keys already
    /// present are kept; disc keys accumulate.
    pub fn read_from_ini<R: Read>(&mut self, file: &mut R) -> Result<(), Error> {
        let config = ini::Ini::read_from(file)?;
        let section = config.general_section();

        if self.common_key.is_none() {
            let mut key = [0; 0x10];
            if key_to_aes(section, "common_key", &mut key)?.is_some() {
                self.common_key = Some(Aes128Key(key));
            }
        }

        for (name, _) in section.iter() {
            if let Some(suffix) = name.strip_prefix("disc_key_") {
                let mut key = [0; 0x10];
                if key_to_aes(section, name, &mut key)?.is_some() {
                    self.disc_keys.push((suffix.to_string(), Aes128Key(key)));
                }
            }
        }
        Ok(())
    }

    pub fn with_common_key(mut self, key: Aes128Key) -> Keys {
        self.common_key = Some(key);
        self
    }

    pub fn with_disc_key(mut self, name: &str, key: Aes128Key) -> Keys {
        self.disc_keys.push((name.to_string(), key));
        self
    }

    pub fn common_key(&self) -> Result<&Aes128Key, Error> {
        self.common_key.as_ref().ok_or_else(|| Error::MissingKey {
            key_name: KeyName::CommonKey,
            backtrace: Backtrace::generate(),
        })
    }

    /// Candidate disc keys with their `disc_key_` suffix, in the order
    /// they were loaded.
    pub fn disc_keys(&self) -> impl Iterator<Item = (&str, &Aes128Key)> {
        self.disc_keys.iter().map(|(name, key)| (name.as_str(), key))
    }
}
