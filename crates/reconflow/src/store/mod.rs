//! Inventory store gateway.
//!
//! The orchestrator only talks to persistence through [`InventoryStore`]
//! (asset records) and [`StatusStore`] (targets, scans and jobs).

mod sqlite;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::StoreError,
    jobs::JobSnapshot,
    models::{
        AssetRecord, JobId, RecordFilter, RecordKind, ScanId, ScanStatus, StageStatus,
        StoredRecord, Target, TargetId, UpsertOutcome,
    },
};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Inserts or refreshes a record keyed by its natural key within the
    /// target. Safe to call concurrently for the same key.
    async fn upsert(
        &self,
        target: TargetId,
        source_tool: &str,
        record: &AssetRecord,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn exists(&self, target: TargetId, kind: RecordKind, key: &str) -> Result<bool, StoreError>;

    async fn list(
        &self,
        target: TargetId,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    async fn count(&self, target: TargetId, kind: RecordKind) -> Result<u64, StoreError>;

    /// Removes every record of the target. Returns how many were deleted.
    async fn purge_target(&self, target: TargetId) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub status: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub id: ScanId,
    pub target_id: TargetId,
    pub pipeline: String,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// In pipeline order.
    pub stages: Vec<StageSummary>,
}

/// Durable copy of scan state, written as transitions happen and read back
/// once a scan has left memory.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn save_target(&self, target: &Target) -> Result<(), StoreError>;
    async fn load_targets(&self) -> Result<Vec<Target>, StoreError>;
    async fn save_scan(&self, scan: &ScanSnapshot) -> Result<(), StoreError>;
    async fn save_job(&self, job: &JobSnapshot) -> Result<(), StoreError>;
    async fn load_scan(&self, id: ScanId) -> Result<Option<ScanSnapshot>, StoreError>;
    /// Most recent scan of every target.
    async fn load_latest_scans(&self) -> Result<Vec<ScanSnapshot>, StoreError>;
    async fn load_job(&self, id: JobId) -> Result<Option<JobSnapshot>, StoreError>;
    /// Jobs of a scan in creation order.
    async fn load_jobs(&self, scan: ScanId) -> Result<Vec<JobSnapshot>, StoreError>;
    /// Marks jobs left queued or running by a previous process as failed.
    async fn fail_interrupted_jobs(&self) -> Result<u64, StoreError>;
}

pub trait Store: InventoryStore + StatusStore {}

impl<T: InventoryStore + StatusStore> Store for T {}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Runs `op` until it succeeds, fails permanently, or the attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(operation, attempt, ?delay, error = %e, "store operation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wraps a store so inventory writes and reads retry transient failures.
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: Arc<S>,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: Arc<S>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<S: InventoryStore> InventoryStore for RetryingStore<S> {
    async fn upsert(
        &self,
        target: TargetId,
        source_tool: &str,
        record: &AssetRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        retry_with_backoff(&self.policy, "upsert", || {
            self.inner.upsert(target, source_tool, record)
        })
        .await
    }

    async fn exists(&self, target: TargetId, kind: RecordKind, key: &str) -> Result<bool, StoreError> {
        retry_with_backoff(&self.policy, "exists", || self.inner.exists(target, kind, key)).await
    }

    async fn list(
        &self,
        target: TargetId,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        retry_with_backoff(&self.policy, "list", || self.inner.list(target, kind, filter)).await
    }

    async fn count(&self, target: TargetId, kind: RecordKind) -> Result<u64, StoreError> {
        retry_with_backoff(&self.policy, "count", || self.inner.count(target, kind)).await
    }

    async fn purge_target(&self, target: TargetId) -> Result<u64, StoreError> {
        retry_with_backoff(&self.policy, "purge", || self.inner.purge_target(target)).await
    }
}

#[async_trait]
impl<S: StatusStore> StatusStore for RetryingStore<S> {
    async fn save_target(&self, target: &Target) -> Result<(), StoreError> {
        retry_with_backoff(&self.policy, "save_target", || self.inner.save_target(target)).await
    }

    async fn load_targets(&self) -> Result<Vec<Target>, StoreError> {
        self.inner.load_targets().await
    }

    async fn save_scan(&self, scan: &ScanSnapshot) -> Result<(), StoreError> {
        retry_with_backoff(&self.policy, "save_scan", || self.inner.save_scan(scan)).await
    }

    async fn save_job(&self, job: &JobSnapshot) -> Result<(), StoreError> {
        retry_with_backoff(&self.policy, "save_job", || self.inner.save_job(job)).await
    }

    async fn load_scan(&self, id: ScanId) -> Result<Option<ScanSnapshot>, StoreError> {
        retry_with_backoff(&self.policy, "load_scan", || self.inner.load_scan(id)).await
    }

    async fn load_latest_scans(&self) -> Result<Vec<ScanSnapshot>, StoreError> {
        self.inner.load_latest_scans().await
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobSnapshot>, StoreError> {
        retry_with_backoff(&self.policy, "load_job", || self.inner.load_job(id)).await
    }

    async fn load_jobs(&self, scan: ScanId) -> Result<Vec<JobSnapshot>, StoreError> {
        retry_with_backoff(&self.policy, "load_jobs", || self.inner.load_jobs(scan)).await
    }

    async fn fail_interrupted_jobs(&self) -> Result<u64, StoreError> {
        self.inner.fail_interrupted_jobs().await
    }
}
