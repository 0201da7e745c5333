use hyper::Method;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::cache::DescriptorCache;
use crate::driver::{Reader, StorageDriver};
use crate::oci::{media_types, BlobDescriptor, Digest};
use crate::registry::hashing_reader::{digest_content, sha256_digest};
use crate::registry::{paths, Error};

/// Content-addressed blob storage over the driver. Blobs are immutable
/// and deduplicated by digest; repository visibility is handled one
/// layer up through links.
#[derive(Clone)]
pub struct BlobStore {
    driver: Arc<dyn StorageDriver>,
    cache: Arc<dyn DescriptorCache>,
}

impl BlobStore {
    pub fn new(driver: Arc<dyn StorageDriver>, cache: Arc<dyn DescriptorCache>) -> Self {
        BlobStore { driver, cache }
    }

    #[instrument(skip(self))]
    pub async fn stat(&self, digest: &Digest) -> Result<BlobDescriptor, Error> {
        if let Some(descriptor) = self.cache.get(digest).await {
            return Ok(descriptor);
        }

        let info = match self.driver.stat(&paths::blob_data_path(digest)).await {
            Ok(info) => info,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::BlobUnknown),
            Err(e) => return Err(e.into()),
        };

        let descriptor = BlobDescriptor::new(digest.clone(), info.size, media_types::OCTET_STREAM);
        self.cache.put(&descriptor).await;
        Ok(descriptor)
    }

    /// A seekable byte source plus the total blob length. A cached
    /// descriptor whose size disagrees with the driver is evicted here;
    /// the driver stat is authoritative.
    #[instrument(skip(self))]
    pub async fn open(
        &self,
        digest: &Digest,
        offset: u64,
    ) -> Result<(Box<dyn Reader>, u64), Error> {
        let path = paths::blob_data_path(digest);
        let info = match self.driver.stat(&path).await {
            Ok(info) => info,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::BlobUnknown),
            Err(e) => return Err(e.into()),
        };

        if let Some(cached) = self.cache.get(digest).await {
            if cached.size != info.size {
                warn!(
                    "Cached descriptor size {} disagrees with stored size {}, evicting",
                    cached.size, info.size
                );
                self.cache.evict(digest).await;
            }
        }

        let reader = self.driver.reader(&path, offset).await?;
        Ok((reader, info.size))
    }

    /// A signed download URL when the driver supports offloading.
    pub fn redirect_url(&self, method: &Method, digest: &Digest) -> Option<String> {
        self.driver
            .redirect_url(method, &paths::blob_data_path(digest))
    }

    /// Store a blob whose content is already in memory (manifests, small
    /// uploads). Writing an identical existing blob is a no-op.
    #[instrument(skip(self, content))]
    pub async fn put(&self, content: &[u8], media_type: &str) -> Result<BlobDescriptor, Error> {
        let digest = sha256_digest(content);
        let path = paths::blob_data_path(&digest);

        if self.driver.stat(&path).await.is_err() {
            self.driver.put_content(&path, content).await?;
        }

        let descriptor = BlobDescriptor::new(digest, content.len() as u64, media_type);
        self.cache.put(&descriptor).await;
        Ok(descriptor)
    }

    /// Read a blob fully and verify its bytes still hash to the digest.
    /// Corruption surfaces as `DigestInvalid`, never as silent bytes.
    #[instrument(skip(self))]
    pub async fn read_verified(&self, digest: &Digest) -> Result<Vec<u8>, Error> {
        let content = match self.driver.get_content(&paths::blob_data_path(digest)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::BlobUnknown),
            Err(e) => return Err(e.into()),
        };

        if digest_content(digest, &content) != *digest {
            warn!("Blob content does not hash to {digest}");
            return Err(Error::DigestInvalid);
        }

        Ok(content)
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::driver::MemoryDriver;
    use tokio::io::AsyncReadExt;

    fn store() -> (BlobStore, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        let cache = Arc::new(MemoryCache::new(100));
        (BlobStore::new(driver.clone(), cache), driver)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (store, _) = store();

        let descriptor = store
            .put(b"blob bytes", media_types::OCTET_STREAM)
            .await
            .unwrap();
        assert_eq!(descriptor.size, 10);

        let content = store.read_verified(&descriptor.digest).await.unwrap();
        assert_eq!(content, b"blob bytes");
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (store, driver) = store();

        let first = store.put(b"same", media_types::OCTET_STREAM).await.unwrap();
        let second = store.put(b"same", media_types::OCTET_STREAM).await.unwrap();
        assert_eq!(first.digest, second.digest);

        // exactly one blob file
        let path = paths::blob_data_path(&first.digest);
        assert_eq!(driver.get_content(&path).await.unwrap(), b"same");
        let prefix_dir = paths::blobs_root_dir() + "/sha256";
        let shards = driver.list(&prefix_dir).await.unwrap();
        assert_eq!(shards.len(), 1);
    }

    #[tokio::test]
    async fn test_stat_unknown_blob() {
        let (store, _) = store();
        let digest = sha256_digest(b"never stored");
        assert_eq!(store.stat(&digest).await.unwrap_err(), Error::BlobUnknown);
    }

    #[tokio::test]
    async fn test_open_with_offset() {
        let (store, _) = store();
        let descriptor = store
            .put(b"0123456789", media_types::OCTET_STREAM)
            .await
            .unwrap();

        let (mut reader, total) = store.open(&descriptor.digest, 5).await.unwrap();
        assert_eq!(total, 10);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"56789");
    }

    #[tokio::test]
    async fn test_corrupted_blob_is_digest_invalid() {
        let (store, driver) = store();
        let descriptor = store
            .put(b"pristine", media_types::OCTET_STREAM)
            .await
            .unwrap();

        driver
            .put_content(&paths::blob_data_path(&descriptor.digest), b"tampered")
            .await
            .unwrap();

        assert_eq!(
            store.read_verified(&descriptor.digest).await.unwrap_err(),
            Error::DigestInvalid
        );
    }

    #[tokio::test]
    async fn test_size_mismatch_evicts_cache_entry() {
        let (store, driver) = store();
        let descriptor = store
            .put(b"original", media_types::OCTET_STREAM)
            .await
            .unwrap();

        // stat populates the cache, then the underlying file changes size
        store.stat(&descriptor.digest).await.unwrap();
        driver
            .put_content(&paths::blob_data_path(&descriptor.digest), b"longer content")
            .await
            .unwrap();

        let (_, total) = store.open(&descriptor.digest, 0).await.unwrap();
        assert_eq!(total, 14);

        // the stale entry is gone; a fresh stat sees the driver's truth
        let descriptor = store.stat(&descriptor.digest).await.unwrap();
        assert_eq!(descriptor.size, 14);
    }
}
