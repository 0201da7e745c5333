use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::configuration::UploadPurgeConfig;
use crate::registry::{paths, Error, Registry};

/// Long-lived sweeper that deletes upload sessions older than the
/// configured age. The first run is jittered within [0, 60) minutes so
/// a fleet restarted together does not sweep in lockstep.
pub fn spawn_upload_purger(
    registry: Arc<Registry>,
    config: UploadPurgeConfig,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        return None;
    }

    let age = config.age;
    let interval = config.interval;
    let dry_run = config.dry_run;

    Some(tokio::spawn(async move {
        let jitter = rand::thread_rng().gen_range(0..3600);
        info!(
            "Upload purger scheduled: first sweep in {jitter}s, age {age:?}, interval {interval:?}"
        );
        tokio::time::sleep(Duration::from_secs(jitter)).await;

        loop {
            match purge_once(&registry, age, dry_run).await {
                Ok(purged) => info!("Upload purge complete, removed {purged} stale sessions"),
                Err(e) => warn!("Upload purge failed: {e}"),
            }
            tokio::time::sleep(interval).await;
        }
    }))
}

#[instrument(skip(registry))]
pub(crate) async fn purge_once(
    registry: &Registry,
    age: Duration,
    dry_run: bool,
) -> Result<usize, Error> {
    let age = chrono::Duration::from_std(age)
        .map_err(|_| Error::Internal(Some("upload purge age out of range".to_string())))?;
    let cutoff = Utc::now() - age;
    let mut purged = 0;

    for namespace in registry.walk_repositories().await? {
        for uuid in registry.list_uploads(&namespace).await? {
            let started = match registry.upload_started_at(&namespace, &uuid).await {
                Ok(started) => started,
                Err(e) => {
                    warn!("Skipping upload {namespace}/{uuid} with unreadable start date: {e}");
                    continue;
                }
            };

            if started >= cutoff {
                continue;
            }

            if dry_run {
                info!("Would purge upload {namespace}/{uuid} started at {started}");
            } else {
                registry
                    .blob_store
                    .driver()
                    .delete(&paths::upload_container_dir(&namespace, &uuid))
                    .await?;
            }
            purged += 1;
        }
    }

    Ok(purged)
}
