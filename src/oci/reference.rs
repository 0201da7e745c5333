use lazy_static::lazy_static;
use regex::Regex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::oci::Digest;
use crate::registry::Error;

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap();
}

/// What a manifest is addressed by: a mutable tag or an immutable digest.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl TryFrom<&str> for Reference {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Error> {
        if s.contains(':') {
            Ok(Reference::Digest(Digest::try_from(s)?))
        } else if TAG_REGEX.is_match(s) {
            Ok(Reference::Tag(s.to_string()))
        } else {
            Err(Error::ManifestUnknown)
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Reference::try_from(s)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(s) => write!(f, "{s}"),
            Reference::Digest(d) => write!(f, "{d}"),
        }
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Reference, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ReferenceVisitor;

        impl Visitor<'_> for ReferenceVisitor {
            type Value = Reference;

            fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
                formatter.write_str("a valid reference string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Reference, E>
            where
                E: de::Error,
            {
                Reference::try_from(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(ReferenceVisitor)
    }
}
