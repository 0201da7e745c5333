use hyper::Method;
use tracing::instrument;

use crate::driver::Reader;
use crate::notify::Event;
use crate::oci::{BlobDescriptor, Digest};
use crate::proxy::ProxyBlob;
use crate::registry::{Error, LinkKind, Registry, Repository};

pub enum GetBlobResponse {
    Reader(Box<dyn Reader>, u64),
    RangedReader(Box<dyn Reader>, (u64, u64), u64),
    Redirect(String),
}

impl Registry {
    /// Stat a blob in the scope of a repository: the digest must be
    /// linked there (or reachable through the upstream in pull-through
    /// mode).
    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn head_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
    ) -> Result<BlobDescriptor, Error> {
        if let Some(descriptor) = self.cache.get_scoped(&repository.name, digest).await {
            return Ok(descriptor);
        }

        if self
            .links
            .exists(&repository.name, &LinkKind::Layer(digest.clone()))
            .await
        {
            let descriptor = self.blob_store.stat(digest).await?;
            self.cache.put_scoped(&repository.name, &descriptor).await;
            return Ok(descriptor);
        }

        if let Some(proxy) = &self.proxy {
            return proxy.head_blob(&repository.name, digest).await;
        }

        Err(Error::BlobUnknown)
    }

    /// Open a blob for download. Plain reads may be offloaded to a
    /// signed URL when the driver offers one and redirects are enabled;
    /// range reads are always served directly.
    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn get_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        range: Option<(u64, u64)>,
    ) -> Result<GetBlobResponse, Error> {
        let linked = self
            .links
            .exists(&repository.name, &LinkKind::Layer(digest.clone()))
            .await;

        if !linked {
            let Some(proxy) = &self.proxy else {
                return Err(Error::BlobUnknown);
            };

            match proxy.get_blob(&repository.name, digest).await? {
                ProxyBlob::Stream { reader, size } => {
                    // The first fetch streams through; range requests are
                    // honoured once the blob is local.
                    return Ok(GetBlobResponse::Reader(reader, size));
                }
                ProxyBlob::Local => {}
            }
        }

        if range.is_none() && !self.redirect_disabled {
            if let Some(url) = self.blob_store.redirect_url(&Method::GET, digest) {
                return Ok(GetBlobResponse::Redirect(url));
            }
        }

        match range {
            Some((start, end)) => {
                let (_, total) = self.blob_store.open(digest, 0).await?;
                if start > end || start >= total {
                    return Err(Error::RangeNotSatisfiable);
                }
                let end = end.min(total.saturating_sub(1));

                let (reader, total) = self.blob_store.open(digest, start).await?;
                Ok(GetBlobResponse::RangedReader(reader, (start, end), total))
            }
            None => {
                let (reader, total) = self.blob_store.open(digest, 0).await?;
                Ok(GetBlobResponse::Reader(reader, total))
            }
        }
    }

    /// Unlink a blob from the repository. The physical blob file is left
    /// for offline garbage collection, never removed here.
    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn delete_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        if !self.delete_enabled {
            return Err(Error::Unsupported);
        }

        let link = LinkKind::Layer(digest.clone());
        if !self.links.exists(&repository.name, &link).await {
            return Err(Error::BlobUnknown);
        }

        self.links.delete(&repository.name, &link).await?;
        self.cache.evict(digest).await;

        self.notifier
            .notify(Event::blob_deleted(&repository.name, digest));
        Ok(())
    }

    /// Cross-repository mount: link the digest into `to` without
    /// re-transferring bytes, provided `from` links it.
    #[instrument(skip(self, from, to), fields(from = %from.name, to = %to.name))]
    pub async fn mount_blob(
        &self,
        from: &Repository,
        digest: &Digest,
        to: &Repository,
    ) -> Result<BlobDescriptor, Error> {
        self.ensure_writable()?;

        if !self
            .links
            .exists(&from.name, &LinkKind::Layer(digest.clone()))
            .await
        {
            return Err(Error::BlobUnknown);
        }

        let descriptor = self.blob_store.stat(digest).await?;
        self.links
            .create(&to.name, &LinkKind::Layer(digest.clone()), digest)
            .await?;
        self.cache.put_scoped(&to.name, &descriptor).await;

        self.notifier
            .notify(Event::blob_mounted(&to.name, &from.name, digest));
        Ok(descriptor)
    }

    /// Link a freshly published blob into a repository.
    pub(crate) async fn link_blob(
        &self,
        namespace: &str,
        descriptor: &BlobDescriptor,
    ) -> Result<(), Error> {
        self.links
            .create(
                namespace,
                &LinkKind::Layer(descriptor.digest.clone()),
                &descriptor.digest,
            )
            .await?;
        self.cache.put_scoped(namespace, descriptor).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Configuration;
    use crate::oci::media_types;
    use crate::registry::tests::{test_registry, test_registry_with};
    use tokio::io::AsyncReadExt;

    async fn publish(registry: &Registry, namespace: &str, content: &[u8]) -> BlobDescriptor {
        let descriptor = registry
            .blob_store
            .put(content, media_types::OCTET_STREAM)
            .await
            .unwrap();
        registry.link_blob(namespace, &descriptor).await.unwrap();
        descriptor
    }

    #[tokio::test]
    async fn test_head_blob_requires_link() {
        let registry = test_registry();
        let alice = registry.repository("alice/app").unwrap();
        let bob = registry.repository("bob/app").unwrap();

        let descriptor = publish(&registry, "alice/app", b"layer bytes").await;

        let stat = registry
            .head_blob(&alice, &descriptor.digest)
            .await
            .unwrap();
        assert_eq!(stat.size, 11);

        // same digest, unlinked repository
        assert_eq!(
            registry.head_blob(&bob, &descriptor.digest).await,
            Err(Error::BlobUnknown)
        );
    }

    #[tokio::test]
    async fn test_get_blob_full_and_ranged() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let descriptor = publish(&registry, "alice/app", b"0123456789").await;

        match registry
            .get_blob(&repository, &descriptor.digest, None)
            .await
            .unwrap()
        {
            GetBlobResponse::Reader(mut reader, total) => {
                assert_eq!(total, 10);
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await.unwrap();
                assert_eq!(buf, b"0123456789");
            }
            _ => panic!("expected full reader"),
        }

        match registry
            .get_blob(&repository, &descriptor.digest, Some((2, 5)))
            .await
            .unwrap()
        {
            GetBlobResponse::RangedReader(mut reader, (start, end), total) => {
                assert_eq!((start, end, total), (2, 5, 10));
                let mut buf = vec![0u8; (end - start + 1) as usize];
                reader.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, b"2345");
            }
            _ => panic!("expected ranged reader"),
        }
    }

    #[tokio::test]
    async fn test_get_blob_range_clamped_and_rejected() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let descriptor = publish(&registry, "alice/app", b"0123456789").await;

        match registry
            .get_blob(&repository, &descriptor.digest, Some((5, 500)))
            .await
            .unwrap()
        {
            GetBlobResponse::RangedReader(_, (start, end), _) => {
                assert_eq!((start, end), (5, 9));
            }
            _ => panic!("expected ranged reader"),
        }

        assert_eq!(
            registry
                .get_blob(&repository, &descriptor.digest, Some((10, 20)))
                .await
                .map(|_| ()),
            Err(Error::RangeNotSatisfiable)
        );
    }

    #[tokio::test]
    async fn test_mount_blob() {
        let registry = test_registry();
        let alice = registry.repository("alice/app").unwrap();
        let bob = registry.repository("bob/app").unwrap();
        let descriptor = publish(&registry, "alice/app", b"mounted bytes").await;

        let mounted = registry
            .mount_blob(&alice, &descriptor.digest, &bob)
            .await
            .unwrap();
        assert_eq!(mounted.digest, descriptor.digest);

        // served from bob now, same bytes, no copy
        match registry
            .get_blob(&bob, &descriptor.digest, None)
            .await
            .unwrap()
        {
            GetBlobResponse::Reader(mut reader, _) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await.unwrap();
                assert_eq!(buf, b"mounted bytes");
            }
            _ => panic!("expected reader"),
        }
    }

    #[tokio::test]
    async fn test_mount_unknown_source_fails() {
        let registry = test_registry();
        let alice = registry.repository("alice/app").unwrap();
        let bob = registry.repository("bob/app").unwrap();
        let digest = crate::registry::hashing_reader::sha256_digest(b"never pushed");

        assert_eq!(
            registry.mount_blob(&alice, &digest, &bob).await,
            Err(Error::BlobUnknown)
        );
    }

    #[tokio::test]
    async fn test_delete_blob_gated_on_config() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let descriptor = publish(&registry, "alice/app", b"doomed").await;

        // deletes disabled by default
        assert_eq!(
            registry.delete_blob(&repository, &descriptor.digest).await,
            Err(Error::Unsupported)
        );

        let mut config = Configuration::default();
        config.storage.delete.enabled = true;
        let registry = test_registry_with(config);
        let repository = registry.repository("alice/app").unwrap();
        let descriptor = publish(&registry, "alice/app", b"doomed").await;

        registry
            .delete_blob(&repository, &descriptor.digest)
            .await
            .unwrap();
        assert_eq!(
            registry.head_blob(&repository, &descriptor.digest).await,
            Err(Error::BlobUnknown)
        );

        // the physical blob file survives for offline GC
        assert!(registry
            .blob_store
            .read_verified(&descriptor.digest)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let mut config = Configuration::default();
        config.storage.readonly.enabled = true;
        config.storage.delete.enabled = true;
        let registry = test_registry_with(config);
        let alice = registry.repository("alice/app").unwrap();
        let bob = registry.repository("bob/app").unwrap();
        let digest = crate::registry::hashing_reader::sha256_digest(b"x");

        assert_eq!(
            registry.delete_blob(&alice, &digest).await,
            Err(Error::Unsupported)
        );
        assert_eq!(
            registry.mount_blob(&alice, &digest, &bob).await,
            Err(Error::Unsupported)
        );
    }

    #[tokio::test]
    async fn test_mount_equivalence_no_second_blob_file() {
        let registry = test_registry();
        let alice = registry.repository("alice/app").unwrap();
        let bob = registry.repository("bob/app").unwrap();
        let descriptor = publish(&registry, "alice/app", b"shared").await;

        registry
            .mount_blob(&alice, &descriptor.digest, &bob)
            .await
            .unwrap();

        let shards = registry
            .blob_store
            .driver()
            .list(&format!("{}/sha256", crate::registry::paths::blobs_root_dir()))
            .await
            .unwrap();
        assert_eq!(shards.len(), 1);
    }
}
