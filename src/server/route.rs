use uuid::Uuid;

use crate::oci::{Digest, Reference};

/// The OCI v2 API surface, parsed from method and path.
#[derive(Debug)]
pub enum Route<'a> {
    ApiVersion,
    Healthz,
    ListCatalog {
        n: Option<usize>,
        last: Option<String>,
    },
    ListTags {
        namespace: &'a str,
        n: Option<usize>,
        last: Option<String>,
    },
    GetManifest {
        namespace: &'a str,
        reference: Reference,
    },
    HeadManifest {
        namespace: &'a str,
        reference: Reference,
    },
    PutManifest {
        namespace: &'a str,
        reference: Reference,
    },
    DeleteManifest {
        namespace: &'a str,
        reference: Reference,
    },
    GetBlob {
        namespace: &'a str,
        digest: Digest,
    },
    HeadBlob {
        namespace: &'a str,
        digest: Digest,
    },
    DeleteBlob {
        namespace: &'a str,
        digest: Digest,
    },
    StartUpload {
        namespace: &'a str,
        digest: Option<Digest>,
        mount: Option<Digest>,
        from: Option<String>,
    },
    GetUpload {
        namespace: &'a str,
        uuid: Uuid,
    },
    PatchUpload {
        namespace: &'a str,
        uuid: Uuid,
    },
    PutUpload {
        namespace: &'a str,
        uuid: Uuid,
        digest: Digest,
    },
    DeleteUpload {
        namespace: &'a str,
        uuid: Uuid,
    },
    Unknown,
}
