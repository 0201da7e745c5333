use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use super::DescriptorCache;
use crate::configuration;
use crate::oci::{BlobDescriptor, Digest};

/// Redis-backed descriptor cache, shared by a fleet of registries.
/// Entries live under `blobs::<algorithm>:<hex>` keys; the
/// repository-scoped layer under `repo::<name>::blobs::…`. Values are
/// JSON-serialized descriptors. Backend failures degrade to cache
/// misses.
pub struct RedisCache {
    client: redis::Client,
    key_prefix: String,
}

impl RedisCache {
    pub fn new(url: &str, key_prefix: String) -> Result<Self, configuration::Error> {
        let client = redis::Client::open(url)
            .map_err(|e| configuration::Error::Cache(format!("invalid redis url: {e}")))?;
        Ok(RedisCache { client, key_prefix })
    }

    fn global_key(&self, digest: &Digest) -> String {
        format!(
            "{}blobs::{}:{}",
            self.key_prefix,
            digest.algorithm(),
            digest.hash()
        )
    }

    fn scoped_key(&self, namespace: &str, digest: &Digest) -> String {
        format!(
            "{}repo::{namespace}::blobs::{}:{}",
            self.key_prefix,
            digest.algorithm(),
            digest.hash()
        )
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(connection) => Some(connection),
            Err(e) => {
                warn!("Descriptor cache unavailable: {e}");
                None
            }
        }
    }

    async fn fetch(&self, key: &str) -> Option<BlobDescriptor> {
        let mut connection = self.connection().await?;
        let value: Option<String> = connection.get(key).await.ok()?;
        serde_json::from_str(&value?).ok()
    }

    async fn store(&self, key: &str, descriptor: &BlobDescriptor) {
        let Some(mut connection) = self.connection().await else {
            return;
        };
        let Ok(value) = serde_json::to_string(descriptor) else {
            return;
        };
        if let Err(e) = connection.set::<_, _, ()>(key, value).await {
            warn!("Failed to store descriptor in cache: {e}");
        }
    }
}

#[async_trait]
impl DescriptorCache for RedisCache {
    async fn get(&self, digest: &Digest) -> Option<BlobDescriptor> {
        self.fetch(&self.global_key(digest)).await
    }

    async fn put(&self, descriptor: &BlobDescriptor) {
        self.store(&self.global_key(&descriptor.digest), descriptor)
            .await;
    }

    async fn get_scoped(&self, namespace: &str, digest: &Digest) -> Option<BlobDescriptor> {
        self.fetch(&self.scoped_key(namespace, digest)).await
    }

    async fn put_scoped(&self, namespace: &str, descriptor: &BlobDescriptor) {
        self.store(&self.scoped_key(namespace, &descriptor.digest), descriptor)
            .await;
        self.put(descriptor).await;
    }

    async fn evict(&self, digest: &Digest) {
        let Some(mut connection) = self.connection().await else {
            return;
        };
        if let Err(e) = connection.del::<_, ()>(self.global_key(digest)).await {
            warn!("Failed to evict descriptor from cache: {e}");
        }
    }
}
