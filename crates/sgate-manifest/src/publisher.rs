//! Versioned manifest publication.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use sgate_models::{JobEvent, Manifest, ManifestType, TranscodeJob};
use sgate_queue::{publish_or_log, EventBus};
use sgate_store::{ManifestStore, StoreError};

use crate::error::{ManifestError, ManifestResult};
use crate::generator::ManifestGenerator;

/// Manifest types published for every completed job.
pub const PUBLISHED_TYPES: [ManifestType; 2] = [ManifestType::Hls, ManifestType::Dash];

/// Generates, versions and persists manifests, then announces them.
pub struct ManifestPublisher {
    generator: ManifestGenerator,
    store: Arc<dyn ManifestStore>,
    bus: Arc<dyn EventBus>,
}

impl ManifestPublisher {
    pub fn new(generator: ManifestGenerator, store: Arc<dyn ManifestStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            generator,
            store,
            bus,
        }
    }

    pub fn generator(&self) -> &ManifestGenerator {
        &self.generator
    }

    /// Persist the next version of one manifest type for `job`.
    ///
    /// Concurrent publishers for the same content race on the version
    /// number; the loser re-reads the latest version and tries again.
    pub async fn publish(&self, job: &TranscodeJob, manifest_type: ManifestType) -> ManifestResult<Manifest> {
        let mut manifest = self.generator.generate(job, manifest_type)?;
        let attempts = self.generator.config().version_retries.max(1);

        for _ in 0..attempts {
            let latest = self
                .store
                .latest_version(&manifest.content_id, manifest_type)
                .await?;
            manifest.version = latest.map_or(1, |v| v + 1);
            manifest.generated_at = Utc::now();

            match self.store.save_manifest(&manifest).await {
                Ok(()) => {
                    info!(
                        job_id = %job.id,
                        content_id = %manifest.content_id,
                        manifest_type = %manifest_type,
                        version = manifest.version,
                        variants = manifest.variants.len(),
                        partial = manifest.partial,
                        "Manifest published"
                    );
                    let event = JobEvent::manifest_generated(
                        job.id.clone(),
                        manifest.content_id.clone(),
                        manifest_type,
                        manifest.version,
                        manifest.variants.len() as u32,
                        manifest.partial,
                    );
                    publish_or_log(self.bus.as_ref(), event).await;
                    return Ok(manifest);
                }
                Err(StoreError::VersionConflict { version, .. }) => {
                    debug!(content_id = %manifest.content_id, version, "Manifest version taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ManifestError::VersionContention {
            content_id: manifest.content_id,
            manifest_type,
        })
    }

    /// Fails when any published type cannot be assembled from `job`.
    pub fn check_assembly(&self, job: &TranscodeJob) -> ManifestResult<()> {
        for manifest_type in PUBLISHED_TYPES {
            self.generator.assemble(job, manifest_type)?;
        }
        Ok(())
    }

    /// Publish every manifest type for a completed job.
    ///
    /// Assembly is checked up front so a broken job publishes nothing.
    pub async fn publish_all(&self, job: &TranscodeJob) -> ManifestResult<Vec<Manifest>> {
        self.check_assembly(job)?;
        let mut published = Vec::with_capacity(PUBLISHED_TYPES.len());
        for manifest_type in PUBLISHED_TYPES {
            published.push(self.publish(job, manifest_type).await?);
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManifestConfig;
    use sgate_models::{EventPayload, RenditionProfile, Segment, WorkerId};
    use sgate_queue::BroadcastEventBus;
    use sgate_store::MemoryStore;

    fn completed_job() -> TranscodeJob {
        let mut job = TranscodeJob::new(
            "movie-7",
            "in.mkv",
            vec![
                RenditionProfile::preset("720p").unwrap(),
                RenditionProfile::preset("480p").unwrap(),
            ],
            3,
        );
        job.assign(WorkerId::new()).unwrap();
        job.start().unwrap();
        for name in ["720p", "480p"] {
            job.rendition_mut(name)
                .unwrap()
                .finish(vec![Segment::new(format!("{}/seg-0.ts", name), 6.0)]);
        }
        job.complete().unwrap();
        job
    }

    fn publisher(store: Arc<MemoryStore>, bus: &BroadcastEventBus) -> ManifestPublisher {
        ManifestPublisher::new(
            ManifestGenerator::new(ManifestConfig::default()),
            store,
            Arc::new(bus.clone()),
        )
    }

    #[tokio::test]
    async fn test_versions_increment_and_body_is_stable() {
        let store = Arc::new(MemoryStore::with_retained_versions(2));
        let bus = BroadcastEventBus::default();
        let mut events = bus.subscribe();
        let publisher = publisher(store.clone(), &bus);
        let job = completed_job();

        let v1 = publisher.publish(&job, ManifestType::Hls).await.unwrap();
        let v2 = publisher.publish(&job, ManifestType::Hls).await.unwrap();
        let v3 = publisher.publish(&job, ManifestType::Hls).await.unwrap();
        assert_eq!((v1.version, v2.version, v3.version), (1, 2, 3));
        assert_eq!(v1.body, v3.body);

        // Only the last two versions are retained.
        let versions = store.list_versions("movie-7", ManifestType::Hls).await.unwrap();
        assert_eq!(versions, vec![2, 3]);

        let ev = events.recv().await.unwrap();
        assert!(matches!(
            ev.payload,
            EventPayload::ManifestGenerated { version: 1, variants: 2, partial: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_all_writes_both_types() {
        let store = Arc::new(MemoryStore::new());
        let bus = BroadcastEventBus::default();
        let publisher = publisher(store.clone(), &bus);

        let manifests = publisher.publish_all(&completed_job()).await.unwrap();
        assert_eq!(manifests.len(), 2);
        assert!(store
            .load_manifest("movie-7", ManifestType::Dash, None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_broken_job_publishes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let bus = BroadcastEventBus::default();
        let publisher = publisher(store.clone(), &bus);
        let mut job = completed_job();
        job.renditions[1].segments.clear();

        let err = publisher.publish_all(&job).await.unwrap_err();
        assert!(err.is_assembly());
        assert_eq!(store.latest_version("movie-7", ManifestType::Hls).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_get_distinct_versions() {
        let store = Arc::new(MemoryStore::with_retained_versions(10));
        let bus = BroadcastEventBus::default();
        let publisher = Arc::new(publisher(store.clone(), &bus));
        let job = Arc::new(completed_job());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let publisher = publisher.clone();
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                publisher.publish(&job, ManifestType::Dash).await
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap().version);
        }
        versions.sort();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }
}
