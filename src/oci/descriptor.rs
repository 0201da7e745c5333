use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::oci::Digest;

/// A content descriptor as it appears inside a manifest. The digest is
/// kept as a string here; it is parsed when the descriptor is resolved.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// The resolved form of an addressable artifact, keyed by its digest.
/// Immutable once written; this is what the descriptor cache stores.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
}

impl BlobDescriptor {
    pub fn new(digest: Digest, size: u64, media_type: impl Into<String>) -> Self {
        BlobDescriptor {
            digest,
            size,
            media_type: media_type.into(),
        }
    }
}
