//! Core value types: fixed-width byte newtypes and the checked amount.
//!
//! `PublicKey` and `Hash` render as lowercase hex everywhere (display,
//! debug, serde), accept an optional `0x` prefix on parse, and reject any
//! input of the wrong width.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

fn decode_fixed_hex<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let mut out = [0u8; N];
    hex::decode_to_slice(raw, &mut out)
        .map_err(|_| anyhow!("{} must be exactly {} hex-encoded bytes", what, N))?;
    Ok(out)
}

/// Hex-rendered fixed-width byte newtype: accessors, parsing, display, and
/// serde-as-hex-string in one place.
macro_rules! hex_bytes_newtype {
    ($name:ident, $len:expr, $what:expr) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                decode_fixed_hex::<$len>(s, $what).map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in self.0.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let text = Cow::<str>::deserialize(deserializer)?;
                Self::from_hex(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Public key is 32 raw ed25519 bytes. Accounts and delegates are keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

hex_bytes_newtype!(PublicKey, 32, "public key");

/// Hash type: sha3-512 digest wrapper (64 bytes). Block ids and transaction
/// ids are values of this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 64]);

hex_bytes_newtype!(Hash, 64, "sha3-512 digest");

/// Amount newtype (smallest units). 8 decimals scale factor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u128);

impl Amount {
    pub fn new_raw(v: u128) -> Self {
        Amount(v)
    }

    pub fn zero() -> Self {
        Amount(0)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// exposed constants for tokenomics
pub const DECIMALS: u32 = 8;
pub const SCALE: u128 = 10u128.pow(DECIMALS);
pub const MAX_SUPPLY: u128 = 120_000_000u128 * SCALE;
