use lazy_static::lazy_static;
use regex::Regex;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::registry::Error;

lazy_static! {
    static ref DIGEST_REGEX: Regex =
        Regex::new(r"^(?P<algorithm>[a-z0-9]+):(?P<hash>[a-f0-9]+)$").unwrap();
}

/// A content address: `<algorithm>:<lower-hex>`.
///
/// Only `sha256` and `sha512` are accepted; anything else, including
/// upper-case hex or a wrong hash length, fails with `DigestInvalid`.
#[derive(Debug, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Digest {
    Sha256(String),
    Sha512(String),
}

impl Digest {
    pub fn algorithm(&self) -> &str {
        match self {
            Digest::Sha256(_) => "sha256",
            Digest::Sha512(_) => "sha512",
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            Digest::Sha256(s) | Digest::Sha512(s) => s,
        }
    }

    /// First two hex characters, used to shard blob directories.
    pub fn hash_prefix(&self) -> &str {
        &self.hash()[0..2]
    }
}

impl TryFrom<&str> for Digest {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Error> {
        let captures = DIGEST_REGEX.captures(s).ok_or(Error::DigestInvalid)?;
        let algorithm = &captures["algorithm"];
        let hash = &captures["hash"];

        match (algorithm, hash.len()) {
            ("sha256", 64) => Ok(Digest::Sha256(hash.to_string())),
            ("sha512", 128) => Ok(Digest::Sha512(hash.to_string())),
            _ => Err(Error::DigestInvalid),
        }
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Digest::try_from(s)
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.hash())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Digest, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestVisitor;

        impl Visitor<'_> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
                formatter.write_str("a valid digest string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Digest, E>
            where
                E: DeError,
            {
                Digest::try_from(value).map_err(DeError::custom)
            }
        }

        deserializer.deserialize_str(DigestVisitor)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
