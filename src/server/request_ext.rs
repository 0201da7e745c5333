use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use hyper::header::{AsHeaderName, HeaderName, ACCEPT, AUTHORIZATION};
use hyper::Request;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::warn;

use crate::registry::Error;

lazy_static! {
    static ref RANGE_RE: Regex = Regex::new(r"^(?:bytes=)?(?P<start>\d+)-(?P<end>\d+)$").unwrap();
}

pub trait RequestExt {
    fn get_header<K: AsHeaderName>(&self, header: K) -> Option<String>;

    fn query_parameters<D: DeserializeOwned + Default>(&self) -> D;

    fn basic_credentials(&self) -> Option<(String, String)>;

    fn accepted_media_types(&self) -> Vec<String>;

    /// `Range`/`Content-Range` style `[bytes=]start-end`; both bounds
    /// required, start ≤ end.
    fn byte_range(&self, header: HeaderName) -> Result<Option<(u64, u64)>, Error>;
}

impl<T> RequestExt for Request<T> {
    fn get_header<K: AsHeaderName>(&self, header: K) -> Option<String> {
        self.headers()
            .get(header)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    }

    fn query_parameters<D: DeserializeOwned + Default>(&self) -> D {
        let Some(query) = self.uri().query() else {
            return D::default();
        };
        serde_urlencoded::from_str(query).unwrap_or_default()
    }

    fn basic_credentials(&self) -> Option<(String, String)> {
        let authorization = self.get_header(AUTHORIZATION)?;
        let value = authorization.strip_prefix("Basic ")?;
        let value = BASE64_STANDARD.decode(value).ok()?;
        let value = String::from_utf8(value).ok()?;

        let (username, password) = value.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }

    fn accepted_media_types(&self) -> Vec<String> {
        self.headers()
            .get_all(ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    }

    fn byte_range(&self, header: HeaderName) -> Result<Option<(u64, u64)>, Error> {
        let Some(range) = self.get_header(header) else {
            return Ok(None);
        };

        let captures = RANGE_RE.captures(&range).ok_or_else(|| {
            warn!("Malformed range header: {range}");
            Error::RangeNotSatisfiable
        })?;

        let start: u64 = captures["start"]
            .parse()
            .map_err(|_| Error::RangeNotSatisfiable)?;
        let end: u64 = captures["end"]
            .parse()
            .map_err(|_| Error::RangeNotSatisfiable)?;

        if start > end {
            warn!("Range start {start} exceeds end {end}");
            return Err(Error::RangeNotSatisfiable);
        }

        Ok(Some((start, end)))
    }
}

pub trait IntoAsyncRead {
    fn into_async_read(self) -> impl AsyncRead + Unpin + Send;
}

impl<S> IntoAsyncRead for Request<S>
where
    S: hyper::body::Body + Send + Unpin + 'static,
    S::Data: Send,
    S::Error: Sync + Send + std::error::Error + 'static,
{
    fn into_async_read(self) -> impl AsyncRead + Unpin + Send {
        let stream = self.into_data_stream().map_err(io::Error::other);
        StreamReader::new(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, CONTENT_RANGE, RANGE};
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_query_parameters() {
        let request = Request::builder()
            .uri("/v2/_catalog?n=42&last=repo")
            .body(())
            .unwrap();

        let params: HashMap<String, String> = request.query_parameters();
        assert_eq!(params["n"], "42");
        assert_eq!(params["last"], "repo");
    }

    #[test]
    fn test_basic_credentials() {
        let request = Request::builder()
            .header(
                AUTHORIZATION,
                HeaderValue::from_static("Basic dXNlcjpwYXNzd29yZA=="),
            )
            .body(())
            .unwrap();
        assert_eq!(
            request.basic_credentials(),
            Some(("user".to_string(), "password".to_string()))
        );

        let request = Request::builder()
            .header(
                AUTHORIZATION,
                HeaderValue::from_static("Bearer dXNlcjpwYXNzd29yZA=="),
            )
            .body(())
            .unwrap();
        assert_eq!(request.basic_credentials(), None);

        let request = Request::builder()
            .header(AUTHORIZATION, HeaderValue::from_static("Basic %%%"))
            .body(())
            .unwrap();
        assert_eq!(request.basic_credentials(), None);
    }

    #[test]
    fn test_accepted_media_types() {
        let request = Request::builder()
            .header(ACCEPT, "application/vnd.oci.image.manifest.v1+json")
            .header(
                ACCEPT,
                "application/vnd.docker.distribution.manifest.v2+json, application/json",
            )
            .body(())
            .unwrap();

        assert_eq!(
            request.accepted_media_types(),
            vec![
                "application/vnd.oci.image.manifest.v1+json",
                "application/vnd.docker.distribution.manifest.v2+json",
                "application/json",
            ]
        );
    }

    #[test]
    fn test_byte_range() {
        let request = Request::builder()
            .header(RANGE, "bytes=0-499")
            .body(())
            .unwrap();
        assert_eq!(request.byte_range(RANGE).unwrap(), Some((0, 499)));

        let request = Request::builder()
            .header(CONTENT_RANGE, "100-199")
            .body(())
            .unwrap();
        assert_eq!(
            request.byte_range(CONTENT_RANGE).unwrap(),
            Some((100, 199))
        );

        let request = Request::builder().body(()).unwrap();
        assert_eq!(request.byte_range(RANGE).unwrap(), None);
    }

    #[test]
    fn test_byte_range_invalid() {
        for value in ["bytes=500-499", "bytes=0-", "bytes=-499", "plouf"] {
            let request = Request::builder().header(RANGE, value).body(()).unwrap();
            assert_eq!(
                request.byte_range(RANGE).unwrap_err(),
                Error::RangeNotSatisfiable,
                "value {value} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_into_async_read() {
        let request = Request::builder()
            .body(http_body_util::Full::new(bytes::Bytes::from_static(
                b"Hello World!",
            )))
            .unwrap();

        let mut reader = request.into_async_read();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"Hello World!");
    }
}
