use std::sync::Arc;
use tracing::instrument;

use crate::driver::StorageDriver;
use crate::oci::Digest;
use crate::registry::{paths, Error};

/// The kinds of link files a repository namespace can hold. A link is a
/// small file whose content is a digest string; its existence is what
/// makes a blob or manifest accessible in the repository.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum LinkKind {
    Layer(Digest),
    Revision(Digest),
    Tag(String),
    TagIndex(String, Digest),
}

#[derive(Clone)]
pub struct LinkStore {
    driver: Arc<dyn StorageDriver>,
}

impl LinkStore {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        LinkStore { driver }
    }

    /// Write the link file. A single `put_content` of the digest text:
    /// idempotent, last writer wins, readers see either the old or the
    /// new content.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        namespace: &str,
        link: &LinkKind,
        target: &Digest,
    ) -> Result<(), Error> {
        let path = paths::link_path(namespace, link);
        self.driver
            .put_content(&path, target.to_string().as_bytes())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn read(&self, namespace: &str, link: &LinkKind) -> Result<Digest, Error> {
        let path = paths::link_path(namespace, link);
        let content = match self.driver.get_content(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };

        let text = String::from_utf8(content)?;
        Digest::try_from(text.trim())
    }

    pub async fn exists(&self, namespace: &str, link: &LinkKind) -> bool {
        self.read(namespace, link).await.is_ok()
    }

    /// Remove the link and its container directory. Removing a missing
    /// link is not an error. Deleting a tag removes the whole tag
    /// directory, history included.
    #[instrument(skip(self))]
    pub async fn delete(&self, namespace: &str, link: &LinkKind) -> Result<(), Error> {
        let path = paths::link_path(namespace, link);
        let container = match link {
            LinkKind::Tag(tag) => paths::tag_dir(namespace, tag),
            _ => path
                .strip_suffix("/link")
                .unwrap_or(path.as_str())
                .to_string(),
        };
        self.driver.delete(&container).await?;
        Ok(())
    }
}
