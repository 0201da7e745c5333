pub mod fs;
pub mod memory;

use async_trait::async_trait;
use hyper::Method;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

pub use fs::FsDriver;
pub use memory::MemoryDriver;

use crate::configuration::StorageBackendConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    pub size: u64,
    pub is_dir: bool,
}

pub trait Reader: AsyncRead + Unpin + Send {}
impl<T> Reader for T where T: AsyncRead + Unpin + Send {}

/// A resumable writer handed out by [`StorageDriver::writer`].
///
/// Bytes written through an append writer become durable only after
/// `commit` returns; `cancel` discards them, restoring the length the
/// writer was opened at. `size` reports the total committed-plus-pending
/// length, which for an append writer includes the pre-existing bytes.
#[async_trait]
pub trait DriverWriter: AsyncWrite + Unpin + Send {
    fn size(&self) -> u64;
    async fn commit(&mut self) -> io::Result<()>;
    async fn cancel(&mut self) -> io::Result<()>;
}

/// The storage driver contract: a narrow capability set over an abstract
/// object namespace.
///
/// Paths are slash-delimited, case-sensitive and treated as opaque keys;
/// the registry core always passes rooted paths (`/docker/registry/v2/…`).
/// Implementations must provide byte-accurate, case-preserving path
/// semantics, strong consistency on a single key once
/// `put_content`/`rename` has returned, and read-your-writes.
/// `put_content` replaces atomically: an interrupted call leaves the
/// prior content (or absence) intact.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn get_content(&self, path: &str) -> io::Result<Vec<u8>>;

    async fn put_content(&self, path: &str, content: &[u8]) -> io::Result<()>;

    /// A byte source positioned at `offset`.
    async fn reader(&self, path: &str, offset: u64) -> io::Result<Box<dyn Reader>>;

    /// A resumable writer; with `append` the writer continues at the end
    /// of the existing content, otherwise it starts from scratch.
    async fn writer(&self, path: &str, append: bool) -> io::Result<Box<dyn DriverWriter>>;

    async fn stat(&self, path: &str) -> io::Result<FileInfo>;

    /// Immediate children of a directory, as bare names, sorted
    /// lexicographically. A missing directory lists as empty.
    async fn list(&self, path: &str) -> io::Result<Vec<String>>;

    /// Move a file or an entire subtree.
    async fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Remove a file or an entire subtree; removing a missing path is
    /// not an error.
    async fn delete(&self, path: &str) -> io::Result<()>;

    /// A signed URL clients can be redirected to for direct downloads,
    /// when the backend supports offloading. Drivers without the
    /// capability return `None`.
    fn redirect_url(&self, _method: &Method, _path: &str) -> Option<String> {
        None
    }
}

pub fn build_driver(config: &StorageBackendConfig) -> std::sync::Arc<dyn StorageDriver> {
    match config {
        StorageBackendConfig::Fs(fs_config) => {
            tracing::info!("Using filesystem storage driver");
            std::sync::Arc::new(FsDriver::new(fs_config.clone()))
        }
        StorageBackendConfig::Memory => {
            tracing::info!("Using in-memory storage driver");
            std::sync::Arc::new(MemoryDriver::new())
        }
    }
}
