use futures_util::{Stream, StreamExt};
use http_body_util::{Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::{Response, StatusCode};
use serde_json::json;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::registry::Error;

pub const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
pub const API_VERSION: &str = "registry/2.0";
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
pub const DOCKER_UPLOAD_UUID: &str = "Docker-Upload-UUID";

type BytesFrameStream = Pin<Box<dyn Stream<Item = Result<Frame<Bytes>, io::Error>> + Send>>;

pub enum Body {
    Empty,
    Fixed(Full<Bytes>),
    Streaming(StreamBody<BytesFrameStream>),
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn fixed(data: Vec<u8>) -> Self {
        Body::Fixed(Full::new(Bytes::from(data)))
    }

    pub fn streaming<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let stream = ReaderStream::new(reader).map(|result| result.map(Frame::data));
        Body::Streaming(StreamBody::new(Box::pin(stream)))
    }
}

impl hyper::body::Body for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            Body::Empty => Poll::Ready(None),
            Body::Fixed(body) => Pin::new(body).poll_frame(cx).map_err(io::Error::other),
            Body::Streaming(body) => Pin::new(body).poll_frame(cx),
        }
    }
}

/// Map a registry error onto the OCI error envelope and HTTP status.
pub fn error_response(error: &Error) -> Response<Body> {
    let (status, code) = match error {
        Error::BlobUnknown => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
        Error::BlobUploadInvalid(_) => (StatusCode::BAD_REQUEST, "BLOB_UPLOAD_INVALID"),
        Error::BlobUploadUnknown => (StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN"),
        Error::DigestInvalid => (StatusCode::BAD_REQUEST, "DIGEST_INVALID"),
        Error::ManifestBlobUnknown(_) => (StatusCode::BAD_REQUEST, "MANIFEST_BLOB_UNKNOWN"),
        Error::ManifestInvalid(_) => (StatusCode::BAD_REQUEST, "MANIFEST_INVALID"),
        Error::ManifestUnknown => (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN"),
        Error::NameInvalid => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
        Error::NameUnknown => (StatusCode::NOT_FOUND, "NAME_UNKNOWN"),
        Error::SizeInvalid => (StatusCode::BAD_REQUEST, "SIZE_INVALID"),
        Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        Error::Denied => (StatusCode::FORBIDDEN, "DENIED"),
        Error::Unsupported => (StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED"),
        Error::RangeNotSatisfiable => {
            (StatusCode::RANGE_NOT_SATISFIABLE, "BLOB_UPLOAD_INVALID")
        }
        Error::AuthControllerFailure => {
            // nothing about the auth configuration leaks to the client
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .header(API_VERSION_HEADER, API_VERSION)
                .body(Body::empty())
                .unwrap();
        }
        Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "UNKNOWN"),
        Error::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
    };

    let errors = match error {
        Error::ManifestBlobUnknown(missing) => missing
            .iter()
            .map(|digest| {
                json!({
                    "code": code,
                    "message": error.to_string(),
                    "detail": {"digest": digest.to_string()}
                })
            })
            .collect::<Vec<_>>(),
        _ => vec![json!({
            "code": code,
            "message": error.to_string(),
            "detail": null
        })],
    };

    let body = json!({ "errors": errors }).to_string();

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header(API_VERSION_HEADER, API_VERSION);

    if matches!(error, Error::Unauthorized(_)) {
        builder = builder.header(
            "WWW-Authenticate",
            "Basic realm=\"Registry Realm\", charset=\"UTF-8\"",
        );
    }

    builder.body(Body::fixed(body.into_bytes())).unwrap()
}

/// The 401 produced when the access controller issues a challenge.
pub fn challenge_response(www_authenticate: &str) -> Response<Body> {
    let body = json!({
        "errors": [{
            "code": "UNAUTHORIZED",
            "message": "authentication required",
            "detail": null
        }]
    })
    .to_string();

    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("Content-Type", "application/json")
        .header("WWW-Authenticate", www_authenticate)
        .header(API_VERSION_HEADER, API_VERSION)
        .body(Body::fixed(body.into_bytes()))
        .unwrap()
}

/// A JSON page with an RFC 5988 `Link` header when more results remain.
pub fn paginated(
    body: Vec<u8>,
    path: &str,
    n: Option<usize>,
    next: Option<&str>,
) -> Result<Response<Body>, Error> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json");

    if let Some(last) = next {
        let n = n.map(|n| format!("n={n}&")).unwrap_or_default();
        let link = format!("<{path}?{n}last={last}>; rel=\"next\"");
        builder = builder.header("Link", link);
    }

    Ok(builder.body(Body::fixed(body))?)
}
