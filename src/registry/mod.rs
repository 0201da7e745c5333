mod blob;
mod blob_store;
mod error;
pub mod hashing_reader;
mod links;
mod manifest;
pub mod paths;
mod purge;
mod upload;

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::instrument;

pub use blob::GetBlobResponse;
pub use blob_store::BlobStore;
pub use error::Error;
pub use links::{LinkKind, LinkStore};
pub use manifest::{
    GetManifestResponse, HeadManifestResponse, ManifestValidation, PutManifestResponse,
};
pub use purge::spawn_upload_purger;
pub use upload::StartUploadOutcome;

use crate::cache::DescriptorCache;
use crate::configuration::{self, Configuration};
use crate::driver::StorageDriver;
use crate::notify::Broadcaster;
use crate::proxy::ProxyCache;
use upload::SessionGuard;

lazy_static! {
    static ref REPOSITORY_NAME_RE: Regex =
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap();
}

const DEFAULT_PAGE_SIZE: usize = 100;

/// The registry namespace: owns the shared services and hands out
/// per-repository handles.
pub struct Registry {
    pub(crate) blob_store: BlobStore,
    pub(crate) links: LinkStore,
    pub(crate) cache: Arc<dyn DescriptorCache>,
    pub(crate) validation: ManifestValidation,
    pub(crate) delete_enabled: bool,
    pub(crate) read_only: bool,
    pub(crate) redirect_disabled: bool,
    pub(crate) tag_concurrency_limit: usize,
    pub(crate) proxy: Option<Arc<ProxyCache>>,
    pub(crate) sessions: SessionGuard,
    pub(crate) notifier: Broadcaster,
}

/// A per-repository handle. Construction is pure: the name is validated
/// against the repository grammar, no I/O happens until an operation is
/// invoked on it.
#[derive(Clone, Debug)]
pub struct Repository {
    pub name: String,
}

impl Registry {
    pub fn new(
        config: &Configuration,
        driver: Arc<dyn StorageDriver>,
        cache: Arc<dyn DescriptorCache>,
        proxy: Option<Arc<ProxyCache>>,
        notifier: Broadcaster,
    ) -> Result<Self, configuration::Error> {
        let validation = ManifestValidation::from_config(&config.validation)?;

        Ok(Registry {
            blob_store: BlobStore::new(driver.clone(), cache.clone()),
            links: LinkStore::new(driver),
            cache,
            validation,
            delete_enabled: config.storage.delete.enabled,
            read_only: config.storage.readonly.enabled,
            redirect_disabled: config.storage.redirect.disable,
            tag_concurrency_limit: config.storage.tag.concurrency_limit.max(1),
            proxy,
            sessions: SessionGuard::default(),
            notifier,
        })
    }

    pub fn repository(&self, name: &str) -> Result<Repository, Error> {
        if name.len() > 255 || !REPOSITORY_NAME_RE.is_match(name) {
            return Err(Error::NameInvalid);
        }
        Ok(Repository {
            name: name.to_string(),
        })
    }

    pub fn is_pull_through(&self) -> bool {
        self.proxy.is_some()
    }

    /// Writes are rejected in read-only mode and in pull-through mode.
    pub(crate) fn ensure_writable(&self) -> Result<(), Error> {
        if self.read_only || self.proxy.is_some() {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    /// Repository names under `/repositories/`, lexicographic, paged by
    /// the last returned name.
    #[instrument(skip(self))]
    pub async fn list_catalog(
        &self,
        n: Option<usize>,
        last: Option<String>,
    ) -> Result<(Vec<String>, Option<String>), Error> {
        let repositories = self.walk_repositories().await?;
        Ok(paginate(
            &repositories,
            n.unwrap_or(DEFAULT_PAGE_SIZE),
            last.as_deref(),
        ))
    }

    pub(crate) async fn walk_repositories(&self) -> Result<Vec<String>, Error> {
        let driver = self.blob_store.driver();
        let root = paths::repositories_root_dir();

        let mut found = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(prefix) = pending.pop() {
            let dir = if prefix.is_empty() {
                root.clone()
            } else {
                format!("{root}/{prefix}")
            };

            let children = driver.list(&dir).await?;
            let is_repository = children
                .iter()
                .any(|c| c == "_manifests" || c == "_layers" || c == "_uploads");

            if is_repository && !prefix.is_empty() {
                found.push(prefix.clone());
            }

            for child in children {
                if child.starts_with('_') {
                    continue;
                }
                pending.push(if prefix.is_empty() {
                    child
                } else {
                    format!("{prefix}/{child}")
                });
            }
        }

        found.sort();
        Ok(found)
    }
}

/// Lexicographic pagination keyed by the last returned item.
pub(crate) fn paginate(
    items: &[String],
    n: usize,
    last: Option<&str>,
) -> (Vec<String>, Option<String>) {
    let start = match last {
        Some(last) => items.partition_point(|item| item.as_str() <= last),
        None => 0,
    };

    let end = (start + n).min(items.len());
    let page = items[start..end].to_vec();

    let next = if end < items.len() {
        page.last().cloned()
    } else {
        None
    };

    (page, next)
}
