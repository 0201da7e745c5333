use std::fmt::Display;
use std::string::FromUtf8Error;
use tracing::{debug, warn};

use crate::oci::Digest;

/// Registry error taxonomy. Every variant maps to an OCI error code and
/// an HTTP status in `server::response`; anything that reaches the
/// catch-all maps to `UNKNOWN` + 500.
#[derive(Debug, PartialEq)]
pub enum Error {
    BlobUnknown,
    BlobUploadInvalid(Option<String>),
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown(Vec<Digest>),
    ManifestInvalid(Option<String>),
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    Unauthorized(Option<String>),
    Denied,
    Unsupported,
    // Upload offset or byte-range mismatch; answers 416 with the
    // BLOB_UPLOAD_INVALID code.
    RangeNotSatisfiable,
    // Access controller misconfiguration; answers 400 with an empty body
    // so configuration details never leak to clients.
    AuthControllerFailure,
    Upstream(Option<String>),
    NotFound,
    Internal(Option<String>),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BlobUnknown => write!(f, "blob unknown to registry"),
            Error::BlobUploadInvalid(Some(s)) => write!(f, "blob upload invalid: {s}"),
            Error::BlobUploadInvalid(None) => write!(f, "blob upload invalid"),
            Error::BlobUploadUnknown => write!(f, "blob upload unknown to registry"),
            Error::DigestInvalid => write!(f, "provided digest did not match uploaded content"),
            Error::ManifestBlobUnknown(_) => {
                write!(
                    f,
                    "manifest references a manifest or blob unknown to registry"
                )
            }
            Error::ManifestInvalid(Some(s)) => write!(f, "manifest invalid: {s}"),
            Error::ManifestInvalid(None) => write!(f, "manifest invalid"),
            Error::ManifestUnknown => write!(f, "manifest unknown to registry"),
            Error::NameInvalid => write!(f, "invalid repository name"),
            Error::NameUnknown => write!(f, "repository name not known to registry"),
            Error::SizeInvalid => write!(f, "provided length did not match content length"),
            Error::Unauthorized(Some(s)) => write!(f, "unauthorized: {s}"),
            Error::Unauthorized(None) => write!(f, "unauthorized"),
            Error::Denied => write!(f, "requested access to the resource is denied"),
            Error::Unsupported => write!(f, "the operation is unsupported"),
            Error::RangeNotSatisfiable => write!(f, "range not satisfiable"),
            Error::AuthControllerFailure => write!(f, "authorization failed"),
            Error::Upstream(Some(s)) => write!(f, "upstream registry error: {s}"),
            Error::Upstream(None) => write!(f, "upstream registry error"),
            Error::NotFound => write!(f, "resource not found"),
            Error::Internal(Some(s)) => write!(f, "internal server error: {s}"),
            Error::Internal(None) => write!(f, "internal server error"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            debug!("Storage error: {error:?}");
            Error::NotFound
        } else {
            warn!("Storage error: {error:?}");
            Error::Internal(Some("storage error during operation".to_string()))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        debug!("Serde JSON error: {error:?}");
        Error::Internal(Some("serialization error during operation".to_string()))
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Self {
        debug!("Hyper error: {error:?}");
        Error::Internal(Some("HTTP error during operation".to_string()))
    }
}

impl From<hyper::http::Error> for Error {
    fn from(error: hyper::http::Error) -> Self {
        debug!("Hyper HTTP error: {error:?}");
        Error::Internal(Some("HTTP error during operation".to_string()))
    }
}

impl From<FromUtf8Error> for Error {
    fn from(error: FromUtf8Error) -> Self {
        debug!("UTF-8 error: {error:?}");
        Error::Internal(Some("UTF-8 error during operation".to_string()))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        warn!("Upstream query error: {error:?}");
        Error::Upstream(Some("failed to query upstream registry".to_string()))
    }
}
