use chrono::{DateTime, Utc};
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::io::AsyncRead;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::notify::Event;
use crate::oci::{media_types, BlobDescriptor, Digest};
use crate::registry::hashing_reader::{digest_content, HashingReader, Sha256Ext};
use crate::registry::{paths, Error, Registry, Repository};

pub enum StartUploadOutcome {
    /// The blob is already available (existing digest or cross-repo
    /// mount); no session was opened.
    Created(BlobDescriptor),
    Session { uuid: String, offset: u64 },
}

/// Serializes access per upload session: only one `append`/`commit` may
/// be in progress, and session re-entry is exclusive — the first
/// resumer wins, later ones get `BLOB_UPLOAD_INVALID`.
#[derive(Default)]
pub struct SessionGuard {
    active: Mutex<HashSet<String>>,
}

pub struct SessionLease<'a> {
    guard: &'a SessionGuard,
    uuid: String,
}

impl SessionGuard {
    fn acquire(&self, uuid: &str) -> Result<SessionLease<'_>, Error> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(uuid.to_string()) {
            return Err(Error::BlobUploadInvalid(Some(
                "another request is writing to this upload session".to_string(),
            )));
        }
        Ok(SessionLease {
            guard: self,
            uuid: uuid.to_string(),
        })
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.guard.active.lock().unwrap().remove(&self.uuid);
    }
}

impl Registry {
    /// Open an upload session. A `mount=digest&from=repo` hint
    /// short-circuits to a finished mount when the source repository
    /// links the digest; a failed mount hint falls back to a regular
    /// session. A plain `digest` hint short-circuits when the blob
    /// already exists.
    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn start_upload(
        &self,
        repository: &Repository,
        mount: Option<(Digest, String)>,
        digest: Option<Digest>,
    ) -> Result<StartUploadOutcome, Error> {
        self.ensure_writable()?;

        if let Some((mount_digest, from)) = mount {
            let from = self.repository(&from)?;
            match self.mount_blob(&from, &mount_digest, repository).await {
                Ok(descriptor) => return Ok(StartUploadOutcome::Created(descriptor)),
                Err(Error::BlobUnknown) => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(digest) = digest {
            if let Ok(descriptor) = self.blob_store.stat(&digest).await {
                self.link_blob(&repository.name, &descriptor).await?;
                return Ok(StartUploadOutcome::Created(descriptor));
            }
        }

        let uuid = Uuid::new_v4().to_string();
        self.create_session(&repository.name, &uuid).await?;
        Ok(StartUploadOutcome::Session { uuid, offset: 0 })
    }

    async fn create_session(&self, namespace: &str, uuid: &str) -> Result<(), Error> {
        let driver = self.blob_store.driver();

        driver
            .put_content(&paths::upload_data_path(namespace, uuid), &[])
            .await?;
        driver
            .put_content(
                &paths::upload_startedat_path(namespace, uuid),
                Utc::now().to_rfc3339().as_bytes(),
            )
            .await?;
        driver
            .put_content(&paths::upload_uuid_path(namespace, uuid), uuid.as_bytes())
            .await?;

        self.save_hash_state(namespace, uuid, 0, &Sha256::new().serialized_state())
            .await
    }

    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn upload_status(
        &self,
        repository: &Repository,
        session_id: Uuid,
    ) -> Result<u64, Error> {
        self.session_size(&repository.name, &session_id.to_string())
            .await
    }

    /// Append a chunk at exactly the current offset. An offset mismatch
    /// is rejected without touching the session; a failed partial write
    /// rolls the data back to the last durable offset.
    #[instrument(skip(self, repository, stream), fields(repository = %repository.name))]
    pub async fn patch_upload<S>(
        &self,
        repository: &Repository,
        session_id: Uuid,
        start_offset: Option<u64>,
        stream: S,
    ) -> Result<u64, Error>
    where
        S: AsyncRead + Unpin + Send,
    {
        self.ensure_writable()?;
        let uuid = session_id.to_string();
        let _lease = self.sessions.acquire(&uuid)?;

        let current = self.session_size(&repository.name, &uuid).await?;
        if let Some(start_offset) = start_offset {
            if start_offset != current {
                warn!("Upload offset mismatch: expected {current}, got {start_offset}");
                return Err(Error::RangeNotSatisfiable);
            }
        }

        self.append_chunk(&repository.name, &uuid, current, stream)
            .await
    }

    /// Finalize the session: append the trailing chunk (possibly
    /// empty), verify the digest, publish the blob and link it. On
    /// digest mismatch the session is left open for a retry.
    #[instrument(skip(self, repository, stream), fields(repository = %repository.name))]
    pub async fn complete_upload<S>(
        &self,
        repository: &Repository,
        session_id: Uuid,
        declared: &Digest,
        stream: S,
    ) -> Result<BlobDescriptor, Error>
    where
        S: AsyncRead + Unpin + Send,
    {
        self.ensure_writable()?;
        let uuid = session_id.to_string();
        let _lease = self.sessions.acquire(&uuid)?;

        let current = self.session_size(&repository.name, &uuid).await?;
        let total = self
            .append_chunk(&repository.name, &uuid, current, stream)
            .await?;

        let computed = self.session_digest(&repository.name, &uuid, total).await?;
        let verified = match declared {
            Digest::Sha256(_) => computed == *declared,
            Digest::Sha512(_) => {
                // The resumable hash state is SHA-256; other algorithms
                // are verified against the spooled bytes.
                let driver = self.blob_store.driver();
                let content = driver
                    .get_content(&paths::upload_data_path(&repository.name, &uuid))
                    .await?;
                digest_content(declared, &content) == *declared
            }
        };

        if !verified {
            warn!("Upload digest mismatch: expected {declared}, computed {computed}");
            return Err(Error::DigestInvalid);
        }

        let driver = self.blob_store.driver();
        let data_path = paths::upload_data_path(&repository.name, &uuid);
        let blob_path = paths::blob_data_path(declared);

        if driver.stat(&blob_path).await.is_ok() {
            // identical content already published, the move is a no-op
            driver.delete(&data_path).await?;
        } else {
            driver.rename(&data_path, &blob_path).await?;
        }
        driver
            .delete(&paths::upload_container_dir(&repository.name, &uuid))
            .await?;

        let descriptor =
            BlobDescriptor::new(declared.clone(), total, media_types::OCTET_STREAM);
        self.link_blob(&repository.name, &descriptor).await?;

        self.notifier
            .notify(Event::blob_pushed(&repository.name, declared, total));
        Ok(descriptor)
    }

    #[instrument(skip(self, repository), fields(repository = %repository.name))]
    pub async fn cancel_upload(
        &self,
        repository: &Repository,
        session_id: Uuid,
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        let uuid = session_id.to_string();
        let _lease = self.sessions.acquire(&uuid)?;

        self.blob_store
            .driver()
            .delete(&paths::upload_container_dir(&repository.name, &uuid))
            .await?;
        Ok(())
    }

    async fn append_chunk<S>(
        &self,
        namespace: &str,
        uuid: &str,
        offset: u64,
        stream: S,
    ) -> Result<u64, Error>
    where
        S: AsyncRead + Unpin + Send,
    {
        let driver = self.blob_store.driver();

        let hasher = self.load_hash_state(namespace, uuid, offset).await?;
        let mut reader = HashingReader::with_hasher(stream, hasher);

        let mut writer = driver
            .writer(&paths::upload_data_path(namespace, uuid), true)
            .await?;

        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(written) => {
                writer.commit().await?;
                let total = offset + written;
                self.save_hash_state(namespace, uuid, total, &reader.serialized_state())
                    .await?;
                Ok(total)
            }
            Err(e) => {
                // roll the data file back to the last durable offset
                writer.cancel().await?;
                Err(e.into())
            }
        }
    }

    async fn session_size(&self, namespace: &str, uuid: &str) -> Result<u64, Error> {
        match self
            .blob_store
            .driver()
            .stat(&paths::upload_data_path(namespace, uuid))
            .await
        {
            Ok(info) => Ok(info.size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobUploadUnknown),
            Err(e) => Err(e.into()),
        }
    }

    async fn session_digest(
        &self,
        namespace: &str,
        uuid: &str,
        offset: u64,
    ) -> Result<Digest, Error> {
        let hasher = self.load_hash_state(namespace, uuid, offset).await?;
        Ok(hasher.digest())
    }

    async fn load_hash_state(
        &self,
        namespace: &str,
        uuid: &str,
        offset: u64,
    ) -> Result<Sha256, Error> {
        let path = paths::upload_hashstate_path(namespace, uuid, "sha256", offset);
        let state = match self.blob_store.driver().get_content(&path).await {
            Ok(state) => state,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Internal(Some(format!(
                    "missing upload hash state at offset {offset}"
                ))))
            }
            Err(e) => return Err(e.into()),
        };
        Sha256::from_state(&state)
    }

    async fn save_hash_state(
        &self,
        namespace: &str,
        uuid: &str,
        offset: u64,
        state: &[u8],
    ) -> Result<(), Error> {
        let path = paths::upload_hashstate_path(namespace, uuid, "sha256", offset);
        self.blob_store.driver().put_content(&path, state).await?;
        Ok(())
    }

    pub(crate) async fn list_uploads(&self, namespace: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .blob_store
            .driver()
            .list(&paths::uploads_root_dir(namespace))
            .await?)
    }

    pub(crate) async fn upload_started_at(
        &self,
        namespace: &str,
        uuid: &str,
    ) -> Result<DateTime<Utc>, Error> {
        let content = self
            .blob_store
            .driver()
            .get_content(&paths::upload_startedat_path(namespace, uuid))
            .await?;
        let text = String::from_utf8(content)?;

        DateTime::parse_from_rfc3339(text.trim())
            .map(|date| date.with_timezone(&Utc))
            .map_err(|_| Error::Internal(Some("malformed upload start date".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::hashing_reader::sha256_digest;
    use crate::registry::tests::test_registry;
    use std::io::Cursor;

    async fn open_session(registry: &Registry, repository: &Repository) -> Uuid {
        match registry
            .start_upload(repository, None, None)
            .await
            .unwrap()
        {
            StartUploadOutcome::Session { uuid, offset } => {
                assert_eq!(offset, 0);
                uuid.parse().unwrap()
            }
            StartUploadOutcome::Created(_) => panic!("expected a fresh session"),
        }
    }

    #[tokio::test]
    async fn test_single_chunk_upload() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let uuid = open_session(&registry, &repository).await;

        let digest = sha256_digest(b"");
        let descriptor = registry
            .complete_upload(&repository, uuid, &digest, Cursor::new(Vec::new()))
            .await
            .unwrap();

        assert_eq!(descriptor.digest, digest);
        assert_eq!(descriptor.size, 0);

        let stat = registry.head_blob(&repository, &digest).await.unwrap();
        assert_eq!(stat.size, 0);
    }

    #[tokio::test]
    async fn test_chunked_upload() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let uuid = open_session(&registry, &repository).await;

        let offset = registry
            .patch_upload(&repository, uuid, None, Cursor::new(b"hello ".to_vec()))
            .await
            .unwrap();
        assert_eq!(offset, 6);

        let offset = registry
            .patch_upload(&repository, uuid, Some(6), Cursor::new(b"world".to_vec()))
            .await
            .unwrap();
        assert_eq!(offset, 11);

        let digest = sha256_digest(b"hello world");
        registry
            .complete_upload(&repository, uuid, &digest, Cursor::new(Vec::new()))
            .await
            .unwrap();

        assert_eq!(
            registry.blob_store.read_verified(&digest).await.unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_offset_mismatch_leaves_session_intact() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let uuid = open_session(&registry, &repository).await;

        registry
            .patch_upload(&repository, uuid, None, Cursor::new(vec![0u8; 100]))
            .await
            .unwrap();

        let err = registry
            .patch_upload(&repository, uuid, Some(50), Cursor::new(vec![0u8; 100]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::RangeNotSatisfiable);

        assert_eq!(registry.upload_status(&repository, uuid).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_digest_mismatch_keeps_session_open() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let uuid = open_session(&registry, &repository).await;

        let wrong = sha256_digest(b"something else");
        let err = registry
            .complete_upload(&repository, uuid, &wrong, Cursor::new(b"actual".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err, Error::DigestInvalid);

        // the session survives and can be completed with the right digest
        let right = sha256_digest(b"actual");
        registry
            .complete_upload(&repository, uuid, &right, Cursor::new(Vec::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_purges_session() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let uuid = open_session(&registry, &repository).await;

        registry
            .patch_upload(&repository, uuid, None, Cursor::new(b"data".to_vec()))
            .await
            .unwrap();
        registry.cancel_upload(&repository, uuid).await.unwrap();

        assert_eq!(
            registry.upload_status(&repository, uuid).await,
            Err(Error::BlobUploadUnknown)
        );
    }

    #[tokio::test]
    async fn test_mount_short_circuit() {
        let registry = test_registry();
        let alice = registry.repository("alice/app").unwrap();
        let bob = registry.repository("bob/app").unwrap();

        let uuid = open_session(&registry, &alice).await;
        let digest = sha256_digest(b"layer");
        registry
            .complete_upload(&alice, uuid, &digest, Cursor::new(b"layer".to_vec()))
            .await
            .unwrap();

        match registry
            .start_upload(&bob, Some((digest.clone(), "alice/app".to_string())), None)
            .await
            .unwrap()
        {
            StartUploadOutcome::Created(descriptor) => assert_eq!(descriptor.digest, digest),
            StartUploadOutcome::Session { .. } => panic!("expected mount short-circuit"),
        }

        assert!(registry.head_blob(&bob, &digest).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_mount_falls_back_to_session() {
        let registry = test_registry();
        let bob = registry.repository("bob/app").unwrap();
        let digest = sha256_digest(b"not in alice");

        match registry
            .start_upload(&bob, Some((digest, "alice/app".to_string())), None)
            .await
            .unwrap()
        {
            StartUploadOutcome::Session { offset, .. } => assert_eq!(offset, 0),
            StartUploadOutcome::Created(_) => panic!("expected fallback session"),
        }
    }

    #[tokio::test]
    async fn test_existing_digest_short_circuit() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();

        let uuid = open_session(&registry, &repository).await;
        let digest = sha256_digest(b"known");
        registry
            .complete_upload(&repository, uuid, &digest, Cursor::new(b"known".to_vec()))
            .await
            .unwrap();

        match registry
            .start_upload(&repository, None, Some(digest.clone()))
            .await
            .unwrap()
        {
            StartUploadOutcome::Created(descriptor) => assert_eq!(descriptor.digest, digest),
            StartUploadOutcome::Session { .. } => panic!("expected existing-blob short-circuit"),
        }
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let uuid = Uuid::new_v4();

        assert_eq!(
            registry.upload_status(&repository, uuid).await,
            Err(Error::BlobUploadUnknown)
        );
        assert_eq!(
            registry
                .patch_upload(&repository, uuid, None, Cursor::new(Vec::new()))
                .await,
            Err(Error::BlobUploadUnknown)
        );
    }

    #[tokio::test]
    async fn test_session_guard_exclusive() {
        let guard = SessionGuard::default();
        let lease = guard.acquire("abc").unwrap();
        assert!(guard.acquire("abc").is_err());
        drop(lease);
        assert!(guard.acquire("abc").is_ok());
    }

    #[tokio::test]
    async fn test_sha512_declared_digest() {
        let registry = test_registry();
        let repository = registry.repository("alice/app").unwrap();
        let uuid = open_session(&registry, &repository).await;

        let declared = digest_content(&Digest::Sha512(String::new()), b"payload");
        let descriptor = registry
            .complete_upload(&repository, uuid, &declared, Cursor::new(b"payload".to_vec()))
            .await
            .unwrap();
        assert_eq!(descriptor.digest.algorithm(), "sha512");
    }
}
