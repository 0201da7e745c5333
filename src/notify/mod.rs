use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::configuration::NotificationEndpointConfig;
use crate::oci::{Digest, Reference};

/// A registry event handed to the notification endpoints.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub action: String,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_repository: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn new(action: &str, repository: &str) -> Self {
        Event {
            action: action.to_string(),
            repository: repository.to_string(),
            tag: None,
            digest: None,
            size: None,
            from_repository: None,
            timestamp: Utc::now(),
        }
    }

    pub fn blob_pushed(repository: &str, digest: &Digest, size: u64) -> Self {
        let mut event = Event::new("push", repository);
        event.digest = Some(digest.to_string());
        event.size = Some(size);
        event
    }

    pub fn blob_mounted(repository: &str, from: &str, digest: &Digest) -> Self {
        let mut event = Event::new("mount", repository);
        event.digest = Some(digest.to_string());
        event.from_repository = Some(from.to_string());
        event
    }

    pub fn blob_deleted(repository: &str, digest: &Digest) -> Self {
        let mut event = Event::new("delete", repository);
        event.digest = Some(digest.to_string());
        event
    }

    pub fn manifest_pushed(repository: &str, reference: &Reference, digest: &Digest) -> Self {
        let mut event = Event::new("push", repository);
        if let Reference::Tag(tag) = reference {
            event.tag = Some(tag.clone());
        }
        event.digest = Some(digest.to_string());
        event
    }

    pub fn manifest_pulled(repository: &str, reference: &Reference, digest: &Digest) -> Self {
        let mut event = Event::new("pull", repository);
        if let Reference::Tag(tag) = reference {
            event.tag = Some(tag.clone());
        }
        event.digest = Some(digest.to_string());
        event
    }

    pub fn manifest_deleted(repository: &str, reference: &Reference) -> Self {
        let mut event = Event::new("delete", repository);
        match reference {
            Reference::Tag(tag) => event.tag = Some(tag.clone()),
            Reference::Digest(digest) => event.digest = Some(digest.to_string()),
        }
        event
    }
}

/// Fans events out to the configured endpoints. Requests never block on
/// delivery: each endpoint owns a bounded queue drained by its own
/// worker, and a full queue drops the event and bumps a counter.
#[derive(Clone)]
pub struct Broadcaster {
    endpoints: Arc<Vec<EndpointQueue>>,
}

struct EndpointQueue {
    name: String,
    sender: mpsc::Sender<Event>,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn disabled() -> Self {
        Broadcaster {
            endpoints: Arc::new(Vec::new()),
        }
    }

    pub fn new(configs: &[NotificationEndpointConfig]) -> Self {
        let mut endpoints = Vec::new();

        for config in configs {
            let (sender, receiver) = mpsc::channel(config.queue_size);
            info!("Notification endpoint {} -> {}", config.name, config.url);

            tokio::spawn(deliver(config.clone(), receiver));
            endpoints.push(EndpointQueue {
                name: config.name.clone(),
                sender,
                dropped: AtomicU64::new(0),
            });
        }

        Broadcaster {
            endpoints: Arc::new(endpoints),
        }
    }

    pub fn notify(&self, event: Event) {
        for endpoint in self.endpoints.iter() {
            if endpoint.sender.try_send(event.clone()).is_err() {
                let dropped = endpoint.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Notification queue for {} is full, dropped event ({dropped} total)",
                    endpoint.name
                );
            }
        }
    }
}

async fn deliver(config: NotificationEndpointConfig, mut receiver: mpsc::Receiver<Event>) {
    let client = match reqwest::Client::builder().timeout(config.timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Notification endpoint {} disabled: {e}", config.name);
            return;
        }
    };

    while let Some(event) = receiver.recv().await {
        let mut backoff = config.backoff;

        for attempt in 0..=config.threshold {
            match client.post(&config.url).json(&event).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Delivered {} event to {}", event.action, config.name);
                    break;
                }
                Ok(response) => {
                    warn!(
                        "Endpoint {} answered {} (attempt {attempt})",
                        config.name,
                        response.status()
                    );
                }
                Err(e) => {
                    warn!("Endpoint {} delivery failed (attempt {attempt}): {e}", config.name);
                }
            }

            if attempt == config.threshold {
                warn!(
                    "Dropping {} event for {} after {attempt} retries",
                    event.action, config.name
                );
                break;
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(300));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_broadcaster_is_a_no_op() {
        let broadcaster = Broadcaster::disabled();
        let digest = Digest::Sha256("ab".repeat(32));
        broadcaster.notify(Event::blob_pushed("alice/app", &digest, 10));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let config = NotificationEndpointConfig {
            name: "test".to_string(),
            url: "http://127.0.0.1:1/unreachable".to_string(),
            timeout: Duration::from_millis(10),
            threshold: 0,
            backoff: Duration::from_millis(1),
            queue_size: 1,
        };
        let broadcaster = Broadcaster::new(std::slice::from_ref(&config));
        let digest = Digest::Sha256("cd".repeat(32));

        // flood well past the queue bound; notify must never block
        for _ in 0..50 {
            broadcaster.notify(Event::blob_pushed("alice/app", &digest, 1));
        }
    }

    #[test]
    fn test_event_serialization() {
        let digest = Digest::Sha256("ef".repeat(32));
        let event = Event::manifest_pushed(
            "alice/app",
            &Reference::Tag("latest".to_string()),
            &digest,
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "push");
        assert_eq!(value["repository"], "alice/app");
        assert_eq!(value["tag"], "latest");
        assert!(value["size"].is_null());
    }
}
