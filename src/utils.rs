use core::ops::{BitAnd, Not};
use num_traits::Num;

pub struct Hexstring<'a>(pub &'a [u8]);

impl<'a> core::fmt::Debug for Hexstring<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Decodes a hexstring into `out`. The string must be exactly twice as long
/// as the output buffer.
pub fn parse_hexstring(s: &str, out: &mut [u8]) -> Result<(), String> {
    if s.len() != out.len() * 2 {
        return Err(format!(
            "expected a {} character hexstring, got {} characters",
            out.len() * 2,
            s.len()
        ));
    }
    out.iter_mut().for_each(|b| *b = 0);
    for (idx, c) in s.bytes().enumerate() {
        let c = match c {
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            b'0'..=b'9' => c - b'0',
            c => return Err(format!("invalid hex digit {:?}", c as char)),
        };
        out[idx / 2] |= c << if idx % 2 == 0 { 4 } else { 0 };
    }
    Ok(())
}

#[macro_export]
macro_rules! impl_debug_deserialize_serialize_hexstring {
    ($for:ident) => {
        impl std::fmt::Debug for $for {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($for))
                    .field(&$crate::utils::Hexstring(&self.0[..]))
                    .finish()
            }
        }

        impl std::fmt::Display for $for {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> std::fmt::Result {
                std::fmt::Debug::fmt(&$crate::utils::Hexstring(&self.0[..]), f)
            }
        }

        impl std::str::FromStr for $for {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut value = [0; std::mem::size_of::<$for>()];
                $crate::utils::parse_hexstring(s, &mut value)?;
                Ok($for(value))
            }
        }

        impl<'de> serde::Deserialize<'de> for $for {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct StrVisitor;
                impl<'de> serde::de::Visitor<'de> for StrVisitor {
                    type Value = $for;

                    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                        formatter.write_str("a character hexstring")
                    }

                    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        s.parse::<$for>().map_err(|_| {
                            E::invalid_value(serde::de::Unexpected::Str(s), &self)
                        })
                    }
                }

                deserializer.deserialize_str(StrVisitor)
            }
        }

        impl serde::Serialize for $for {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }
    };
}

pub fn align_down<T: Num + Not<Output = T> + BitAnd<Output = T> + Copy>(addr: T, align: T) -> T {
    addr & !(align - T::one())
}

pub fn align_up<T: Num + Not<Output = T> + BitAnd<Output = T> + Copy>(addr: T, align: T) -> T {
    align_down(addr + (align - T::one()), align)
}
