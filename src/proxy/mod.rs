mod client;

use bytes::Bytes;
use futures_util::Stream;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio_util::io::StreamReader;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub use client::UpstreamClient;

use crate::cache::DescriptorCache;
use crate::configuration::{self, ProxyConfig};
use crate::driver::{Reader, StorageDriver};
use crate::oci::{media_types, BlobDescriptor, Digest, Manifest, Reference};
use crate::registry::hashing_reader::{digest_content, sha256_digest, AnyDigester};
use crate::registry::{paths, BlobStore, Error, LinkKind, LinkStore};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FlightState {
    Pending,
    Success,
    Failed,
}

type FlightMap = Arc<Mutex<HashMap<String, watch::Receiver<FlightState>>>>;

pub enum ProxyBlob {
    /// The blob has been materialized locally; serve it from storage.
    Local,
    /// First fetch in flight: bytes stream through while a detached
    /// task commits them locally.
    Stream { reader: Box<dyn Reader>, size: u64 },
}

/// Pull-through cache controller. Missing blobs and manifests are
/// fetched from the configured upstream, streamed to the requester and
/// committed locally; later requests are served from the local copy.
///
/// At most one upstream fetch runs per (repository, reference): later
/// callers attach to the in-flight materialisation and are served
/// locally once it lands. The fetch itself runs detached, so a
/// requester disconnecting does not abort it.
pub struct ProxyCache {
    client: UpstreamClient,
    blob_store: BlobStore,
    links: LinkStore,
    cache: Arc<dyn DescriptorCache>,
    flights: FlightMap,
    tag_checked: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl ProxyCache {
    pub fn new(
        config: &ProxyConfig,
        driver: Arc<dyn StorageDriver>,
        cache: Arc<dyn DescriptorCache>,
    ) -> Result<Arc<Self>, configuration::Error> {
        let client = UpstreamClient::new(config)?;
        info!("Registry configured as a pull-through cache for {}", client.remote_url());

        Ok(Arc::new(ProxyCache {
            client,
            blob_store: BlobStore::new(driver.clone(), cache.clone()),
            links: LinkStore::new(driver),
            cache,
            flights: FlightMap::default(),
            tag_checked: Mutex::new(HashMap::new()),
            ttl: config.ttl,
        }))
    }

    #[instrument(skip(self))]
    pub async fn head_blob(
        &self,
        namespace: &str,
        digest: &Digest,
    ) -> Result<BlobDescriptor, Error> {
        // a blob fetched for another repository only needs a link
        if let Ok(descriptor) = self.blob_store.stat(digest).await {
            self.links
                .create(namespace, &LinkKind::Layer(digest.clone()), digest)
                .await?;
            self.cache.put_scoped(namespace, &descriptor).await;
            return Ok(descriptor);
        }

        match self.client.head_blob(namespace, digest).await {
            Ok(size) => Ok(BlobDescriptor::new(
                digest.clone(),
                size,
                media_types::OCTET_STREAM,
            )),
            Err(Error::NotFound) => Err(Error::BlobUnknown),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_blob(&self, namespace: &str, digest: &Digest) -> Result<ProxyBlob, Error> {
        for _ in 0..3 {
            if self.blob_store.stat(digest).await.is_ok() {
                self.links
                    .create(namespace, &LinkKind::Layer(digest.clone()), digest)
                    .await?;
                return Ok(ProxyBlob::Local);
            }

            let key = format!("blob:{digest}");
            match self.join_or_lead(&key) {
                Role::Follower(rx) => {
                    if !await_flight(rx).await {
                        return Err(Error::Upstream(Some(
                            "upstream blob fetch failed".to_string(),
                        )));
                    }
                }
                Role::Leader(guard) => {
                    let response = match self.client.get_blob(namespace, digest).await {
                        Ok(response) => response,
                        Err(Error::NotFound) => {
                            guard.finish(FlightState::Failed);
                            return Err(Error::BlobUnknown);
                        }
                        Err(e) => {
                            guard.finish(FlightState::Failed);
                            return Err(e);
                        }
                    };

                    let size = response.content_length().unwrap_or(0);
                    let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Bytes>>(16);

                    // the transfer is detached: the requester going away
                    // must not abort the materialisation
                    let blob_store = self.blob_store.clone();
                    let links = self.links.clone();
                    let cache = self.cache.clone();
                    let namespace = namespace.to_string();
                    let digest = digest.clone();
                    tokio::spawn(async move {
                        match transfer(
                            blob_store, links, cache, &namespace, &digest, response, chunk_tx,
                        )
                        .await
                        {
                            Ok(()) => guard.finish(FlightState::Success),
                            Err(e) => {
                                warn!("Pull-through transfer of {digest} failed: {e}");
                                guard.finish(FlightState::Failed);
                            }
                        }
                    });

                    return Ok(ProxyBlob::Stream {
                        reader: Box::new(StreamReader::new(receiver_stream(chunk_rx))),
                        size,
                    });
                }
            }
        }

        Err(Error::Upstream(Some(
            "could not materialize blob from upstream".to_string(),
        )))
    }

    /// Make the manifest available locally, fetching it from the
    /// upstream if needed. Tags re-resolve upstream once their
    /// freshness window lapses; an unreachable upstream falls back to
    /// the local copy.
    #[instrument(skip(self, accepted_media_types))]
    pub async fn materialize_manifest(
        &self,
        namespace: &str,
        reference: &Reference,
        accepted_media_types: &[String],
    ) -> Result<(), Error> {
        match reference {
            Reference::Digest(digest) => {
                // revisions are immutable, a local copy settles it
                if self
                    .links
                    .exists(namespace, &LinkKind::Revision(digest.clone()))
                    .await
                {
                    return Ok(());
                }
            }
            Reference::Tag(tag) => {
                if self.tag_is_fresh(namespace, tag)
                    && self
                        .links
                        .exists(namespace, &LinkKind::Tag(tag.clone()))
                        .await
                {
                    return Ok(());
                }
            }
        }

        let key = format!("manifest:{namespace}:{reference}");
        match self.join_or_lead(&key) {
            Role::Follower(rx) => {
                if await_flight(rx).await {
                    Ok(())
                } else {
                    Err(Error::ManifestUnknown)
                }
            }
            Role::Leader(guard) => {
                match self
                    .fetch_and_store_manifest(namespace, reference, accepted_media_types)
                    .await
                {
                    Ok(()) => {
                        guard.finish(FlightState::Success);
                        Ok(())
                    }
                    Err(Error::NotFound) => {
                        guard.finish(FlightState::Failed);
                        Err(Error::ManifestUnknown)
                    }
                    Err(e) => {
                        guard.finish(FlightState::Failed);

                        // a stale tag beats an unreachable upstream
                        if let Reference::Tag(tag) = reference {
                            if self
                                .links
                                .exists(namespace, &LinkKind::Tag(tag.clone()))
                                .await
                            {
                                warn!("Serving stale tag {namespace}:{tag}: {e}");
                                return Ok(());
                            }
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn fetch_and_store_manifest(
        &self,
        namespace: &str,
        reference: &Reference,
        accepted_media_types: &[String],
    ) -> Result<(), Error> {
        let (media_type, content) = self
            .client
            .get_manifest(namespace, reference, accepted_media_types)
            .await?;

        // reject garbage before persisting it
        Manifest::from_slice(&content)?;

        let digest = sha256_digest(&content);
        let media_type = media_type.unwrap_or_else(|| media_types::OCI_MANIFEST.to_string());
        self.blob_store.put(&content, &media_type).await?;
        self.links
            .create(namespace, &LinkKind::Revision(digest.clone()), &digest)
            .await?;

        if let Reference::Digest(requested) = reference {
            if digest_content(requested, &content) != *requested {
                warn!("Upstream manifest does not hash to {requested}");
                return Err(Error::DigestInvalid);
            }
            // requests under a non-canonical algorithm stay resolvable
            if *requested != digest {
                self.blob_store
                    .driver()
                    .put_content(&paths::blob_data_path(requested), &content)
                    .await?;
                self.links
                    .create(namespace, &LinkKind::Revision(requested.clone()), requested)
                    .await?;
            }
        }

        if let Reference::Tag(tag) = reference {
            self.links
                .create(
                    namespace,
                    &LinkKind::TagIndex(tag.clone(), digest.clone()),
                    &digest,
                )
                .await?;
            self.links
                .create(namespace, &LinkKind::Tag(tag.clone()), &digest)
                .await?;
            self.mark_tag_checked(namespace, tag);
        }

        Ok(())
    }

    fn join_or_lead(&self, key: &str) -> Role {
        let mut flights = self.flights.lock().unwrap();
        if let Some(rx) = flights.get(key) {
            return Role::Follower(rx.clone());
        }

        let (tx, rx) = watch::channel(FlightState::Pending);
        flights.insert(key.to_string(), rx);
        Role::Leader(FlightGuard {
            flights: self.flights.clone(),
            key: key.to_string(),
            tx,
            done: false,
        })
    }

    fn tag_is_fresh(&self, namespace: &str, tag: &str) -> bool {
        let checked = self.tag_checked.lock().unwrap();
        checked
            .get(&format!("{namespace}:{tag}"))
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    fn mark_tag_checked(&self, namespace: &str, tag: &str) {
        let mut checked = self.tag_checked.lock().unwrap();
        checked.insert(format!("{namespace}:{tag}"), Instant::now());
    }
}

/// Fetch the upstream blob into local storage while relaying chunks to
/// the originating requester. A partial transfer commits nothing.
async fn transfer(
    blob_store: BlobStore,
    links: LinkStore,
    cache: Arc<dyn DescriptorCache>,
    namespace: &str,
    digest: &Digest,
    mut response: reqwest::Response,
    chunk_tx: mpsc::Sender<io::Result<Bytes>>,
) -> Result<(), Error> {
    let uuid = Uuid::new_v4().to_string();
    let data_path = paths::upload_data_path(namespace, &uuid);
    let container = paths::upload_container_dir(namespace, &uuid);
    let driver = blob_store.driver();

    let mut writer = driver.writer(&data_path, false).await?;
    let mut hasher = AnyDigester::matching(digest);

    let streamed: Result<(), Error> = loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                hasher.update(&chunk);
                if let Err(e) = writer.write_all(&chunk).await {
                    break Err(e.into());
                }
                // the requester may be gone; keep materializing
                let _ = chunk_tx.send(Ok(chunk)).await;
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    let verified = match streamed {
        Ok(()) => {
            let computed = hasher.finalize();
            if computed == *digest {
                Ok(())
            } else {
                warn!("Upstream bytes hash to {computed}, expected {digest}");
                Err(Error::DigestInvalid)
            }
        }
        Err(e) => Err(e),
    };

    match verified {
        Ok(()) => {
            writer.commit().await?;

            let blob_path = paths::blob_data_path(digest);
            if driver.stat(&blob_path).await.is_err() {
                driver.rename(&data_path, &blob_path).await?;
            }
            driver.delete(&container).await?;

            let size = driver.stat(&blob_path).await?.size;
            let descriptor = BlobDescriptor::new(digest.clone(), size, media_types::OCTET_STREAM);
            links
                .create(namespace, &LinkKind::Layer(digest.clone()), digest)
                .await?;
            cache.put_scoped(namespace, &descriptor).await;
            Ok(())
        }
        Err(e) => {
            let _ = writer.cancel().await;
            let _ = driver.delete(&container).await;
            let _ = chunk_tx
                .send(Err(io::Error::other(format!(
                    "upstream transfer failed: {e}"
                ))))
                .await;
            Err(e)
        }
    }
}

enum Role {
    Leader(FlightGuard),
    Follower(watch::Receiver<FlightState>),
}

/// Removes the flight entry and publishes the outcome; a dropped guard
/// counts as a failure so waiters never hang.
struct FlightGuard {
    flights: FlightMap,
    key: String,
    tx: watch::Sender<FlightState>,
    done: bool,
}

impl FlightGuard {
    fn finish(mut self, state: FlightState) {
        self.done = true;
        self.flights.lock().unwrap().remove(&self.key);
        let _ = self.tx.send(state);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            self.flights.lock().unwrap().remove(&self.key);
            let _ = self.tx.send(FlightState::Failed);
        }
    }
}

async fn await_flight(mut rx: watch::Receiver<FlightState>) -> bool {
    loop {
        let state = *rx.borrow();
        match state {
            FlightState::Pending => {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            FlightState::Success => return true,
            FlightState::Failed => return false,
        }
    }
}

fn receiver_stream(
    receiver: mpsc::Receiver<io::Result<Bytes>>,
) -> Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> {
    Box::pin(futures_util::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    }))
}
