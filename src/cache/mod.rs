pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::configuration::CacheConfig;
use crate::oci::{BlobDescriptor, Digest};

/// The blob descriptor cache: a global `digest → descriptor` layer plus
/// a repository-scoped layer that additionally records which
/// repositories link a given digest. A scoped hit implies a global hit.
///
/// The cache is an accelerator, never a source of truth: lookups that
/// fail (or backends that error) are treated as misses, and a size
/// disagreement with a later driver stat evicts the entry.
#[async_trait]
pub trait DescriptorCache: Send + Sync {
    async fn get(&self, digest: &Digest) -> Option<BlobDescriptor>;

    async fn put(&self, descriptor: &BlobDescriptor);

    async fn get_scoped(&self, namespace: &str, digest: &Digest) -> Option<BlobDescriptor>;

    /// Record that `namespace` links the digest, populating the global
    /// layer as well.
    async fn put_scoped(&self, namespace: &str, descriptor: &BlobDescriptor);

    async fn evict(&self, digest: &Digest);
}

pub fn build_cache(config: &CacheConfig) -> Result<Arc<dyn DescriptorCache>, crate::configuration::Error> {
    match config {
        CacheConfig::Memory { size } => {
            info!("Using in-memory blob descriptor cache ({size} entries)");
            Ok(Arc::new(memory::MemoryCache::new(*size)))
        }
        CacheConfig::Redis { url, key_prefix } => {
            info!("Using redis blob descriptor cache");
            Ok(Arc::new(redis::RedisCache::new(url, key_prefix.clone())?))
        }
    }
}
