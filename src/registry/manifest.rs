use futures_util::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use tracing::{instrument, warn};

use crate::configuration::{self, IndexPlatformPolicy, ValidationConfig};
use crate::notify::Event;
use crate::oci::{media_types, Digest, Manifest, ManifestKind, Platform, Reference};
use crate::registry::hashing_reader::sha256_digest;
use crate::registry::{paginate, paths, Error, LinkKind, Registry, Repository};

pub struct GetManifestResponse {
    pub media_type: Option<String>,
    pub digest: Digest,
    pub content: Vec<u8>,
}

pub struct HeadManifestResponse {
    pub media_type: Option<String>,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug)]
pub struct PutManifestResponse {
    pub digest: Digest,
}

/// Compiled manifest validation policy: URL allow/deny lists and the
/// image-index completeness rule.
pub struct ManifestValidation {
    enabled: bool,
    url_allow: Vec<Regex>,
    url_deny: Vec<Regex>,
    index_policy: IndexPlatformPolicy,
    platform_list: Vec<Platform>,
}

impl ManifestValidation {
    pub fn from_config(config: &ValidationConfig) -> Result<Self, configuration::Error> {
        Ok(ManifestValidation {
            enabled: config.enabled,
            url_allow: compile_regexes(&config.manifest_urls.allow)?,
            url_deny: compile_regexes(&config.manifest_urls.deny)?,
            index_policy: config.indexes.platforms,
            platform_list: config
                .indexes
                .platform_list
                .iter()
                .map(|p| Platform {
                    architecture: p.architecture.clone(),
                    os: p.os.clone(),
                    variant: None,
                })
                .collect(),
        })
    }

    /// Allow is consulted first: with a non-empty allow list a URL must
    /// match one of its patterns. Deny is consulted second and a match
    /// rejects. With both lists empty every URL is rejected.
    fn check_url(&self, url: &str) -> Result<(), Error> {
        if self.url_allow.is_empty() && self.url_deny.is_empty() {
            return Err(Error::ManifestInvalid(Some(format!(
                "external URLs are not permitted: {url}"
            ))));
        }

        if !self.url_allow.is_empty() && !self.url_allow.iter().any(|re| re.is_match(url)) {
            return Err(Error::ManifestInvalid(Some(format!(
                "URL is not covered by the allow policy: {url}"
            ))));
        }

        if self.url_deny.iter().any(|re| re.is_match(url)) {
            return Err(Error::ManifestInvalid(Some(format!(
                "URL is rejected by the deny policy: {url}"
            ))));
        }

        Ok(())
    }

    /// Whether an index entry with this platform must already be linked.
    fn index_entry_required(&self, platform: Option<&Platform>) -> bool {
        match self.index_policy {
            IndexPlatformPolicy::None => false,
            IndexPlatformPolicy::All => true,
            IndexPlatformPolicy::List => platform.is_some_and(|platform| {
                self.platform_list.iter().any(|allowed| {
                    allowed.architecture == platform.architecture && allowed.os == platform.os
                })
            }),
        }
    }
}

fn compile_regexes(patterns: &[String]) -> Result<Vec<Regex>, configuration::Error> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| configuration::Error::Validation(format!("invalid regex: {e}")))
        })
        .collect()
}

impl Registry {
    /// Ingest a manifest: parse, validate, persist the canonical bytes
    /// as a blob, link the revision, and move the tag if one was given.
    #[instrument(skip(self, repository, body), fields(repository = %repository.name))]
    pub async fn put_manifest(
        &self,
        repository: &Repository,
        reference: Reference,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<PutManifestResponse, Error> {
        self.ensure_writable()?;

        let manifest = Manifest::from_slice(body)?;
        manifest.validate_structure()?;

        if let (Some(content_type), Some(media_type)) = (content_type, &manifest.media_type) {
            if content_type != media_type {
                warn!("Manifest media type mismatch: {content_type} != {media_type}");
                return Err(Error::ManifestInvalid(Some(
                    "Content-Type does not match manifest media type".to_string(),
                )));
            }
        }

        let digest = sha256_digest(body);
        if let Reference::Digest(provided) = &reference {
            if provided != &digest {
                warn!("Provided digest does not match canonical bytes: {provided} != {digest}");
                return Err(Error::DigestInvalid);
            }
        }

        if self.validation.enabled {
            self.validate_manifest(&repository.name, &manifest).await?;
        }

        let media_type = manifest.media_type.clone().unwrap_or_else(|| {
            match manifest.kind() {
                ManifestKind::Index => media_types::OCI_INDEX,
                _ => media_types::OCI_MANIFEST,
            }
            .to_string()
        });

        self.blob_store.put(body, &media_type).await?;
        self.links
            .create(&repository.name, &LinkKind::Revision(digest.clone()), &digest)
            .await?;

        if let Reference::Tag(tag) = &reference {
            self.links
                .create(
                    &repository.name,
                    &LinkKind::TagIndex(tag.clone(), digest.clone()),
                    &digest,
                )
                .await?;
            // the tag flip is a single PutContent of the link text
            self.links
                .create(&repository.name, &LinkKind::Tag(tag.clone()), &digest)
                .await?;
        }

        self.notifier
            .notify(Event::manifest_pushed(&repository.name, &reference, &digest));
        Ok(PutManifestResponse { digest })
    }

    async fn validate_manifest(&self, namespace: &str, manifest: &Manifest) -> Result<(), Error> {
        match manifest.kind() {
            ManifestKind::Image => {
                let mut missing = Vec::new();
                for digest in manifest.referenced_blobs()? {
                    let linked = self
                        .links
                        .exists(namespace, &LinkKind::Layer(digest.clone()))
                        .await
                        || self
                            .links
                            .exists(namespace, &LinkKind::Revision(digest.clone()))
                            .await;
                    if !linked {
                        missing.push(digest);
                    }
                }
                if !missing.is_empty() {
                    return Err(Error::ManifestBlobUnknown(missing));
                }

                for descriptor in manifest.descriptors_with_urls() {
                    for url in &descriptor.urls {
                        self.validation.check_url(url)?;
                    }
                }
            }
            ManifestKind::Index => {
                let mut missing = Vec::new();
                for (digest, descriptor) in manifest.referenced_manifests()? {
                    if !self
                        .validation
                        .index_entry_required(descriptor.platform.as_ref())
                    {
                        continue;
                    }
                    if !self
                        .links
                        .exists(namespace, &LinkKind::Revision(digest.clone()))
                        .await
                    {
                        missing.push(digest);
                    }
                }
                if !missing.is_empty() {
                    return Err(Error::ManifestBlobUnknown(missing));
                }
            }
            ManifestKind::Schema1 => unreachable!("rejected by structure validation"),
        }

        Ok(())
    }

    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn get_manifest(
        &self,
        repository: &Repository,
        reference: &Reference,
        accepted_media_types: &[String],
    ) -> Result<GetManifestResponse, Error> {
        match self.get_local_manifest(&repository.name, reference).await {
            Ok(response) => {
                self.notifier.notify(Event::manifest_pulled(
                    &repository.name,
                    reference,
                    &response.digest,
                ));
                Ok(response)
            }
            Err(Error::ManifestUnknown) if self.proxy.is_some() => {
                let proxy = self.proxy.as_ref().unwrap();
                proxy
                    .materialize_manifest(&repository.name, reference, accepted_media_types)
                    .await?;
                self.get_local_manifest(&repository.name, reference).await
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn head_manifest(
        &self,
        repository: &Repository,
        reference: &Reference,
        accepted_media_types: &[String],
    ) -> Result<HeadManifestResponse, Error> {
        let manifest = self
            .get_manifest(repository, reference, accepted_media_types)
            .await?;
        Ok(HeadManifestResponse {
            media_type: manifest.media_type,
            digest: manifest.digest,
            size: manifest.content.len() as u64,
        })
    }

    async fn get_local_manifest(
        &self,
        namespace: &str,
        reference: &Reference,
    ) -> Result<GetManifestResponse, Error> {
        let digest = match reference {
            Reference::Tag(tag) => match self
                .links
                .read(namespace, &LinkKind::Tag(tag.clone()))
                .await
            {
                Ok(digest) => digest,
                Err(Error::NotFound) => return Err(Error::ManifestUnknown),
                Err(e) => return Err(e),
            },
            Reference::Digest(digest) => {
                if !self
                    .links
                    .exists(namespace, &LinkKind::Revision(digest.clone()))
                    .await
                {
                    return Err(Error::ManifestUnknown);
                }
                digest.clone()
            }
        };

        let content = match self.blob_store.read_verified(&digest).await {
            Ok(content) => content,
            Err(Error::BlobUnknown) => return Err(Error::ManifestUnknown),
            Err(e) => return Err(e),
        };

        let manifest = Manifest::from_slice(&content)?;
        Ok(GetManifestResponse {
            media_type: manifest.media_type,
            digest,
            content,
        })
    }

    /// Delete a tag (the tag alone) or a manifest revision (the revision
    /// link plus every tag currently pointing at it).
    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn delete_manifest(
        &self,
        repository: &Repository,
        reference: Reference,
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        if !self.delete_enabled {
            return Err(Error::Unsupported);
        }

        match &reference {
            Reference::Tag(tag) => {
                let link = LinkKind::Tag(tag.clone());
                if !self.links.exists(&repository.name, &link).await {
                    return Err(Error::ManifestUnknown);
                }
                self.links.delete(&repository.name, &link).await?;
            }
            Reference::Digest(digest) => {
                let link = LinkKind::Revision(digest.clone());
                if !self.links.exists(&repository.name, &link).await {
                    return Err(Error::ManifestUnknown);
                }

                for tag in self.tags_pointing_to(&repository.name, digest).await? {
                    self.links
                        .delete(&repository.name, &LinkKind::Tag(tag))
                        .await?;
                }
                self.links.delete(&repository.name, &link).await?;
            }
        }

        self.notifier
            .notify(Event::manifest_deleted(&repository.name, &reference));
        Ok(())
    }

    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn list_tags(
        &self,
        repository: &Repository,
        n: Option<usize>,
        last: Option<String>,
    ) -> Result<(Vec<String>, Option<String>), Error> {
        let tags = self.all_tags(&repository.name).await?;
        if tags.is_empty()
            && self
                .blob_store
                .driver()
                .stat(&paths::repository_dir(&repository.name))
                .await
                .is_err()
        {
            return Err(Error::NameUnknown);
        }

        Ok(paginate(&tags, n.unwrap_or(100), last.as_deref()))
    }

    async fn all_tags(&self, namespace: &str) -> Result<Vec<String>, Error> {
        let mut tags = self
            .blob_store
            .driver()
            .list(&paths::tags_dir(namespace))
            .await?;
        tags.sort();
        Ok(tags)
    }

    /// Tags whose current link resolves to `digest`. Lookups run
    /// concurrently, bounded by the configured tag concurrency limit.
    async fn tags_pointing_to(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> Result<Vec<String>, Error> {
        let all_tags = self.all_tags(namespace).await?;
        let mut matches = Vec::new();

        let mut pending = all_tags.into_iter().peekable();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.tag_concurrency_limit && pending.peek().is_some() {
                let tag = pending.next().unwrap();
                let links = &self.links;
                in_flight.push(async move {
                    let target = links.read(namespace, &LinkKind::Tag(tag.clone())).await;
                    (tag, target)
                });
            }

            match in_flight.next().await {
                Some((tag, Ok(target))) if target == *digest => matches.push(tag),
                Some((_, _)) => {}
                None => break,
            }
        }

        matches.sort();
        Ok(matches)
    }
}
