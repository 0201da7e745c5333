use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::oci::{media_types, Descriptor, Digest};
use crate::registry::Error;

/// A parsed manifest document. One model covers the accepted schema
/// variants; `kind()` tells them apart after parsing:
/// schema 2 manifests and OCI image manifests carry `config`/`layers`,
/// manifest lists and OCI image indexes carry `manifests`, and legacy
/// schema 1 documents carry `fsLayers`.
#[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

/// A schema 1 layer reference. Only enough is modelled to recognise the
/// legacy format; schema 1 content is served verbatim, never re-built.
#[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManifestKind {
    Image,
    Index,
    Schema1,
}

impl Manifest {
    pub fn from_slice(s: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(s)
            .map_err(|e| Error::ManifestInvalid(Some(format!("malformed manifest JSON: {e}"))))
    }

    pub fn kind(&self) -> ManifestKind {
        if self.schema_version == 1 || !self.fs_layers.is_empty() {
            return ManifestKind::Schema1;
        }

        match self.media_type.as_deref() {
            Some(media_types::DOCKER_MANIFEST_LIST) | Some(media_types::OCI_INDEX) => {
                ManifestKind::Index
            }
            Some(media_types::DOCKER_MANIFEST) | Some(media_types::OCI_MANIFEST) => {
                ManifestKind::Image
            }
            // OCI allows the index/manifest media type to be implied by
            // shape when the field is omitted.
            _ if !self.manifests.is_empty() => ManifestKind::Index,
            _ => ManifestKind::Image,
        }
    }

    /// Digests of every blob this manifest requires to be present in the
    /// repository: config plus layers for image manifests, child
    /// manifests for indexes.
    pub fn referenced_blobs(&self) -> Result<Vec<Digest>, Error> {
        let mut digests = Vec::new();

        if let Some(config) = &self.config {
            digests.push(parse_descriptor_digest(config)?);
        }
        for layer in &self.layers {
            digests.push(parse_descriptor_digest(layer)?);
        }

        Ok(digests)
    }

    pub fn referenced_manifests(&self) -> Result<Vec<(Digest, &Descriptor)>, Error> {
        self.manifests
            .iter()
            .map(|descriptor| Ok((parse_descriptor_digest(descriptor)?, descriptor)))
            .collect()
    }

    /// Layer descriptors carrying external URLs, subject to the
    /// allow/deny policy. Foreign/external references only ever appear
    /// on layers.
    pub fn descriptors_with_urls(&self) -> impl Iterator<Item = &Descriptor> {
        self.layers.iter().filter(|layer| !layer.urls.is_empty())
    }

    /// Required-field validation for pushed content. Parsing is lenient
    /// so stored legacy documents stay readable; pushes are strict.
    pub fn validate_structure(&self) -> Result<(), Error> {
        match self.kind() {
            ManifestKind::Schema1 => Err(Error::ManifestInvalid(Some(
                "schema 1 manifests are read-only; push a schema 2 or OCI manifest".to_string(),
            ))),
            ManifestKind::Image => {
                if self.schema_version != 2 {
                    return Err(Error::ManifestInvalid(Some(format!(
                        "unsupported schema version {}",
                        self.schema_version
                    ))));
                }
                if self.config.is_none() {
                    return Err(Error::ManifestInvalid(Some(
                        "image manifest is missing a config descriptor".to_string(),
                    )));
                }
                Ok(())
            }
            ManifestKind::Index => {
                if self.schema_version != 2 {
                    return Err(Error::ManifestInvalid(Some(format!(
                        "unsupported schema version {}",
                        self.schema_version
                    ))));
                }
                if self.config.is_some() || !self.layers.is_empty() {
                    return Err(Error::ManifestInvalid(Some(
                        "image index must not carry config or layers".to_string(),
                    )));
                }
                Ok(())
            }
        }
    }
}

fn parse_descriptor_digest(descriptor: &Descriptor) -> Result<Digest, Error> {
    Digest::try_from(descriptor.digest.as_str())
        .map_err(|_| Error::ManifestInvalid(Some(format!("invalid digest {}", descriptor.digest))))
}
