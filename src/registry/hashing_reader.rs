use sha2::digest::common::hazmat::SerializableState;
use sha2::{Digest as Sha2Digest, Sha256, Sha512};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::oci::Digest;
use crate::registry::Error;

/// Serialisable SHA-256 state, used to resume upload hashing across
/// chunks and across processes.
pub trait Sha256Ext {
    fn serialized_state(&self) -> Vec<u8>;
    fn from_state(state: &[u8]) -> Result<Sha256, Error>;
    fn digest(self) -> Digest;
}

impl Sha256Ext for Sha256 {
    fn serialized_state(&self) -> Vec<u8> {
        self.serialize().as_slice().to_vec()
    }

    fn from_state(state: &[u8]) -> Result<Sha256, Error> {
        let state = state
            .try_into()
            .map_err(|_| Error::Internal(Some("unable to resume hash state".to_string())))?;
        Sha256::deserialize(state)
            .map_err(|_| Error::Internal(Some("unable to resume hash state".to_string())))
    }

    fn digest(self) -> Digest {
        Digest::Sha256(hex::encode(self.finalize()))
    }
}

/// Hash bytes with the algorithm a digest claims, for verification.
pub fn digest_content(algorithm_of: &Digest, content: &[u8]) -> Digest {
    match algorithm_of {
        Digest::Sha256(_) => Digest::Sha256(hex::encode(<Sha256 as Sha2Digest>::digest(content))),
        Digest::Sha512(_) => Digest::Sha512(hex::encode(Sha512::digest(content))),
    }
}

pub fn sha256_digest(content: &[u8]) -> Digest {
    Digest::Sha256(hex::encode(<Sha256 as Sha2Digest>::digest(content)))
}

/// Incremental digester following the algorithm of an expected digest,
/// for verifying streamed transfers.
pub enum AnyDigester {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl AnyDigester {
    pub fn matching(expected: &Digest) -> Self {
        match expected {
            Digest::Sha256(_) => AnyDigester::Sha256(Sha256::new()),
            Digest::Sha512(_) => AnyDigester::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            AnyDigester::Sha256(hasher) => hasher.update(data),
            AnyDigester::Sha512(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            AnyDigester::Sha256(hasher) => Digest::Sha256(hex::encode(hasher.finalize())),
            AnyDigester::Sha512(hasher) => Digest::Sha512(hex::encode(hasher.finalize())),
        }
    }
}

/// An `AsyncRead` wrapper that feeds everything it reads into a SHA-256
/// hasher, so uploads are digested as they are spooled.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        HashingReader {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn with_hasher(inner: R, hasher: Sha256) -> Self {
        HashingReader { inner, hasher }
    }

    pub fn serialized_state(&self) -> Vec<u8> {
        self.hasher.serialized_state()
    }

    pub fn digest(self) -> Digest {
        self.hasher.digest()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let pre_len = buf.filled().len();

        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let post_len = buf.filled().len();
                if post_len > pre_len {
                    let new_data = &buf.filled()[pre_len..post_len];
                    self.hasher.update(new_data);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
