//! Redis-backed store.
//!
//! Key layout (prefix defaults to `sgate`):
//! - `{p}:job:{id}`: job JSON
//! - `{p}:jobs:all` / `{p}:jobs:pending`: ID sets
//! - `{p}:heartbeat:{id}`: `worker|rfc3339`, written without touching the job document
//! - `{p}:archive:{id}`: archived job JSON with a TTL
//! - `{p}:manifest:{content}:{type}:{version}` plus a `{p}:manifests:{content}:{type}` version index

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use sgate_models::{JobId, Manifest, ManifestType, TranscodeJob, WorkerId};

use crate::error::{StoreError, StoreResult};
use crate::metrics::record_operation;
use crate::traits::{page_jobs, JobFilter, JobStore, ManifestStore, DEFAULT_RETAINED_VERSIONS};

const BACKEND: &str = "redis";

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix
    pub key_prefix: String,
    /// How long archived jobs stay readable
    pub archive_ttl: Duration,
    /// Manifest versions kept per content and type
    pub retained_versions: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "sgate".to_string(),
            archive_ttl: Duration::from_secs(7 * 24 * 3600),
            retained_versions: DEFAULT_RETAINED_VERSIONS,
        }
    }
}

impl RedisStoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("STORE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            archive_ttl: std::env::var("STORE_ARCHIVE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.archive_ttl),
            retained_versions: std::env::var("MANIFEST_RETAIN_VERSIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retained_versions),
        }
    }
}

/// Redis implementation of [`JobStore`] and [`ManifestStore`].
pub struct RedisStore {
    client: redis::Client,
    config: RedisStoreConfig,
}

impl RedisStore {
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        info!("Redis store using prefix '{}'", config.key_prefix);
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::new(RedisStoreConfig::from_env())
    }

    async fn conn(&self) -> StoreResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, id)
    }

    fn heartbeat_key(&self, id: &JobId) -> String {
        format!("{}:heartbeat:{}", self.config.key_prefix, id)
    }

    fn archive_key(&self, id: &JobId) -> String {
        format!("{}:archive:{}", self.config.key_prefix, id)
    }

    fn all_key(&self) -> String {
        format!("{}:jobs:all", self.config.key_prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:jobs:pending", self.config.key_prefix)
    }

    fn manifest_key(&self, content_id: &str, manifest_type: ManifestType, version: u32) -> String {
        format!(
            "{}:manifest:{}:{}:{}",
            self.config.key_prefix,
            content_id,
            manifest_type.as_str(),
            version
        )
    }

    fn manifest_index_key(&self, content_id: &str, manifest_type: ManifestType) -> String {
        format!(
            "{}:manifests:{}:{}",
            self.config.key_prefix,
            content_id,
            manifest_type.as_str()
        )
    }

    /// Apply a newer out-of-band heartbeat if it belongs to the current owner.
    fn merge_heartbeat(job: &mut TranscodeJob, raw: Option<String>) {
        let Some(raw) = raw else { return };
        let Some((worker, ts)) = raw.split_once('|') else {
            return;
        };
        let Ok(at) = DateTime::parse_from_rfc3339(ts) else {
            return;
        };
        let at = at.with_timezone(&Utc);
        if job.assigned_worker.as_ref().map(|w| w.as_str()) == Some(worker)
            && job.heartbeat_at.map_or(true, |prev| at > prev)
        {
            job.heartbeat_at = Some(at);
        }
    }

    async fn load_many(
        &self,
        conn: &mut MultiplexedConnection,
        ids: &[String],
    ) -> StoreResult<Vec<TranscodeJob>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let id = JobId::from_string(id.clone());
            if let Some(job) = self.load_with(conn, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn load_with(
        &self,
        conn: &mut MultiplexedConnection,
        id: &JobId,
    ) -> StoreResult<Option<TranscodeJob>> {
        let raw: Option<String> = conn.get(self.job_key(id)).await?;
        let Some(raw) = raw else { return Ok(None) };
        let mut job: TranscodeJob = serde_json::from_str(&raw)?;
        let heartbeat: Option<String> = conn.get(self.heartbeat_key(id)).await?;
        Self::merge_heartbeat(&mut job, heartbeat);
        Ok(Some(job))
    }

    fn parse_versions(members: Vec<String>) -> Vec<u32> {
        members.iter().filter_map(|m| m.parse().ok()).collect()
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn save_job(&self, job: &TranscodeJob) -> StoreResult<()> {
        let start = Instant::now();
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job)?;
        let id = job.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.job_key(&job.id), payload)
            .ignore()
            .sadd(self.all_key(), &id)
            .ignore();
        if job.is_terminal() {
            pipe.srem(self.pending_key(), &id)
                .ignore()
                .del(self.heartbeat_key(&job.id))
                .ignore();
        } else {
            pipe.sadd(self.pending_key(), &id).ignore();
        }

        let result = pipe.query_async::<()>(&mut conn).await;
        record_operation(BACKEND, "save_job", result.is_ok(), start.elapsed().as_secs_f64() * 1000.0);
        result?;
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let member = id.to_string();
        let (removed,): (u32,) = redis::pipe()
            .atomic()
            .del(self.job_key(id))
            .del(self.heartbeat_key(id))
            .ignore()
            .srem(self.all_key(), &member)
            .ignore()
            .srem(self.pending_key(), &member)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn load_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>> {
        let start = Instant::now();
        let mut conn = self.conn().await?;
        let result = self.load_with(&mut conn, id).await;
        record_operation(BACKEND, "load_job", result.is_ok(), start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn load_archived_job(&self, id: &JobId) -> StoreResult<Option<TranscodeJob>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.archive_key(id)).await?;
        raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }

    async fn list_pending_jobs(&self) -> StoreResult<Vec<TranscodeJob>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.pending_key()).await?;
        let jobs: Vec<_> = self
            .load_many(&mut conn, &ids)
            .await?
            .into_iter()
            .filter(|j| !j.is_terminal())
            .collect();
        let filter = JobFilter {
            limit: usize::MAX,
            ..Default::default()
        };
        Ok(page_jobs(jobs, &filter))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<TranscodeJob>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.all_key()).await?;
        let jobs: Vec<_> = self
            .load_many(&mut conn, &ids)
            .await?
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();
        Ok(page_jobs(jobs, filter))
    }

    async fn record_heartbeat(
        &self,
        id: &JobId,
        worker: &WorkerId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let Some(job) = self.load_with(&mut conn, id).await? else {
            return Ok(false);
        };
        if job.assigned_worker.as_ref() != Some(worker) {
            debug!("Rejected heartbeat for {} from non-owner {}", id, worker);
            return Ok(false);
        }
        let value = format!("{}|{}", worker, at.to_rfc3339());
        conn.set::<_, _, ()>(self.heartbeat_key(id), value).await?;
        Ok(true)
    }

    async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(self.all_key()).await?;
        let jobs = self.load_many(&mut conn, &ids).await?;
        let ttl = self.config.archive_ttl.as_secs().max(1);

        let mut archived = 0;
        for job in jobs
            .iter()
            .filter(|j| j.is_terminal() && j.completed_at.is_some_and(|t| t < cutoff))
        {
            let payload = serde_json::to_string(job)?;
            let id = job.id.to_string();
            redis::pipe()
                .atomic()
                .set_ex(self.archive_key(&job.id), payload, ttl)
                .ignore()
                .del(self.job_key(&job.id))
                .ignore()
                .del(self.heartbeat_key(&job.id))
                .ignore()
                .srem(self.all_key(), &id)
                .ignore()
                .srem(self.pending_key(), &id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
            archived += 1;
        }

        if archived > 0 {
            info!("Archived {} terminal jobs", archived);
        }
        Ok(archived)
    }
}

#[async_trait]
impl ManifestStore for RedisStore {
    async fn save_manifest(&self, manifest: &Manifest) -> StoreResult<()> {
        let start = Instant::now();
        let mut conn = self.conn().await?;
        let key = self.manifest_key(&manifest.content_id, manifest.manifest_type, manifest.version);
        let index = self.manifest_index_key(&manifest.content_id, manifest.manifest_type);
        let payload = serde_json::to_string(manifest)?;

        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            record_operation(BACKEND, "save_manifest", false, start.elapsed().as_secs_f64() * 1000.0);
            return Err(StoreError::VersionConflict {
                content_id: manifest.content_id.clone(),
                version: manifest.version,
            });
        }

        conn.zadd::<_, _, _, ()>(&index, manifest.version.to_string(), manifest.version)
            .await?;

        let count: usize = conn.zcard(&index).await?;
        let retained = self.config.retained_versions.max(1);
        if count > retained {
            let stale: Vec<String> = conn
                .zrange(&index, 0, (count - retained - 1) as isize)
                .await?;
            for version in Self::parse_versions(stale) {
                let stale_key =
                    self.manifest_key(&manifest.content_id, manifest.manifest_type, version);
                redis::pipe()
                    .atomic()
                    .del(stale_key)
                    .ignore()
                    .zrem(&index, version.to_string())
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                debug!(
                    "Pruned {} manifest v{} for {}",
                    manifest.manifest_type, version, manifest.content_id
                );
            }
        }

        record_operation(BACKEND, "save_manifest", true, start.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    async fn load_manifest(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
        version: Option<u32>,
    ) -> StoreResult<Option<Manifest>> {
        let version = match version {
            Some(v) => v,
            None => match self.latest_version(content_id, manifest_type).await? {
                Some(v) => v,
                None => return Ok(None),
            },
        };
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(self.manifest_key(content_id, manifest_type, version))
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => {
                warn!(
                    "Manifest index for {} lists missing {} v{}",
                    content_id, manifest_type, version
                );
                Ok(None)
            }
        }
    }

    async fn latest_version(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Option<u32>> {
        let mut conn = self.conn().await?;
        let top: Vec<String> = conn
            .zrevrange(self.manifest_index_key(content_id, manifest_type), 0, 0)
            .await?;
        Ok(Self::parse_versions(top).into_iter().next())
    }

    async fn list_versions(
        &self,
        content_id: &str,
        manifest_type: ManifestType,
    ) -> StoreResult<Vec<u32>> {
        let mut conn = self.conn().await?;
        let members: Vec<String> = conn
            .zrange(self.manifest_index_key(content_id, manifest_type), 0, -1)
            .await?;
        Ok(Self::parse_versions(members))
    }
}
