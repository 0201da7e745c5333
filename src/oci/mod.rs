mod descriptor;
mod digest;
pub mod manifest;
mod reference;

pub use descriptor::{BlobDescriptor, Descriptor, Platform};
pub use digest::Digest;
pub use manifest::{Manifest, ManifestKind};
pub use reference::Reference;

pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST_SCHEMA1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCTET_STREAM: &str = "application/octet-stream";
}
