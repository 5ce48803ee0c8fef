use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{InventoryStore, ScanSnapshot, StatusStore};
use crate::{
    error::StoreError,
    jobs::JobSnapshot,
    models::{
        AssetRecord, JobId, RecordFilter, RecordKind, ScanId, Scope, StoredRecord, Target,
        TargetId, UpsertOutcome,
    },
};

const LOCK_STRIPES: usize = 64;
const DEFAULT_LIST_LIMIT: u32 = 1000;

/// SQLite-backed gateway. Writes to the same natural key are serialized by a
/// striped lock so the read-compare-write in [`InventoryStore::upsert`] never
/// interleaves for one key.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    stripes: Vec<Mutex<()>>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn stripe(&self, target: TargetId, kind: RecordKind, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        (target, kind, key).hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}

/// Escapes `%`, `_` and the escape character itself for `LIKE ... ESCAPE '\'`.
fn like_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("{what} id {raw}")))
}

const SCAN_COLUMNS: &str = "id, target_id, pipeline, status, created_at, finished_at, stages";
const JOB_COLUMNS: &str = "id, scan_id, target_id, stage_index, stage, tool, arguments, state, reason, \
     exit_code, created_at, started_at, finished_at, timeout_secs, stats";

fn scan_from_row(row: &SqliteRow) -> Result<ScanSnapshot, StoreError> {
    let status: String = row.try_get("status")?;
    let stages: String = row.try_get("stages")?;
    Ok(ScanSnapshot {
        id: parse_id(&row.try_get::<String, _>("id")?, "scan")?,
        target_id: parse_id(&row.try_get::<String, _>("target_id")?, "target")?,
        pipeline: row.try_get("pipeline")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
        stages: serde_json::from_str(&stages)?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<JobSnapshot, StoreError> {
    let state: String = row.try_get("state")?;
    let arguments: String = row.try_get("arguments")?;
    let stats: String = row.try_get("stats")?;
    Ok(JobSnapshot {
        id: parse_id(&row.try_get::<String, _>("id")?, "job")?,
        scan_id: parse_id(&row.try_get::<String, _>("scan_id")?, "scan")?,
        target_id: parse_id(&row.try_get::<String, _>("target_id")?, "target")?,
        stage_index: row.try_get::<i64, _>("stage_index")?.max(0) as usize,
        stage: row.try_get("stage")?,
        tool: row.try_get("tool")?,
        arguments: serde_json::from_str(&arguments)?,
        state: state.parse().map_err(StoreError::Corrupt)?,
        reason: row.try_get("reason")?,
        exit_code: row.try_get("exit_code")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        timeout_secs: row
            .try_get::<Option<i64>, _>("timeout_secs")?
            .map(|t| t.max(0) as u64),
        stats: serde_json::from_str(&stats)?,
    })
}

fn tags_column(record: &AssetRecord) -> String {
    if record.tags().is_empty() {
        String::new()
    } else {
        format!(",{},", record.tags().join(","))
    }
}

#[async_trait]
impl InventoryStore for SqliteStore {
    async fn upsert(
        &self,
        target: TargetId,
        source_tool: &str,
        record: &AssetRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let kind = record.kind();
        let key = record.natural_key();
        let _guard = self.stripe(target, kind, &key).lock().await;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT data FROM assets WHERE target_id = ? AND kind = ? AND natural_key = ?",
        )
        .bind(target.to_string())
        .bind(kind.as_str())
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO assets(target_id, kind, natural_key, source_tool, data, tags, first_seen, last_seen) \
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(target.to_string())
                .bind(kind.as_str())
                .bind(&key)
                .bind(source_tool)
                .bind(serde_json::to_string(record)?)
                .bind(tags_column(record))
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(raw) => {
                let current: AssetRecord = serde_json::from_str(&raw)?;
                let merged = current.merged_with(record);
                if merged == current {
                    sqlx::query(
                        "UPDATE assets SET last_seen = ? WHERE target_id = ? AND kind = ? AND natural_key = ?",
                    )
                    .bind(now)
                    .bind(target.to_string())
                    .bind(kind.as_str())
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(
                        "UPDATE assets SET data = ?, tags = ?, last_seen = ? \
                         WHERE target_id = ? AND kind = ? AND natural_key = ?",
                    )
                    .bind(serde_json::to_string(&merged)?)
                    .bind(tags_column(&merged))
                    .bind(now)
                    .bind(target.to_string())
                    .bind(kind.as_str())
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn exists(&self, target: TargetId, kind: RecordKind, key: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM assets WHERE target_id = ? AND kind = ? AND natural_key = ?",
        )
        .bind(target.to_string())
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn list(
        &self,
        target: TargetId,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let search = filter.search.as_deref().map(|s| format!("%{}%", like_literal(s)));
        let tag = filter.tag.as_deref().map(|t| format!("%,{},%", like_literal(t)));
        let rows = sqlx::query(
            "SELECT natural_key, source_tool, data, first_seen, last_seen FROM assets \
             WHERE target_id = ? AND kind = ? \
             AND (? IS NULL OR natural_key LIKE ? ESCAPE '\\') \
             AND (? IS NULL OR tags LIKE ? ESCAPE '\\') \
             ORDER BY id ASC LIMIT ?",
        )
        .bind(target.to_string())
        .bind(kind.as_str())
        .bind(&search)
        .bind(&search)
        .bind(&tag)
        .bind(&tag)
        .bind(i64::from(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let data: String = row.try_get("data")?;
                Ok(StoredRecord {
                    target_id: target,
                    kind,
                    natural_key: row.try_get("natural_key")?,
                    source_tool: row.try_get("source_tool")?,
                    first_seen: row.try_get::<DateTime<Utc>, _>("first_seen")?,
                    last_seen: row.try_get::<DateTime<Utc>, _>("last_seen")?,
                    record: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    async fn count(&self, target: TargetId, kind: RecordKind) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets WHERE target_id = ? AND kind = ?")
            .bind(target.to_string())
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn purge_target(&self, target: TargetId) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM assets WHERE target_id = ?")
            .bind(target.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn save_target(&self, target: &Target) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO targets(id, scope_key, scope, created_at) VALUES(?, ?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(target.id.to_string())
        .bind(target.scope.key())
        .bind(serde_json::to_string(&target.scope)?)
        .bind(target.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_targets(&self) -> Result<Vec<Target>, StoreError> {
        let rows = sqlx::query("SELECT id, scope, created_at FROM targets ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let scope: String = row.try_get("scope")?;
                Ok(Target {
                    id: id
                        .parse()
                        .map_err(|_| StoreError::Corrupt(format!("target id {id}")))?,
                    scope: serde_json::from_str::<Scope>(&scope)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn save_scan(&self, scan: &ScanSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scans(id, target_id, pipeline, status, created_at, finished_at, stages) \
             VALUES(?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, \
             finished_at = excluded.finished_at, stages = excluded.stages",
        )
        .bind(scan.id.to_string())
        .bind(scan.target_id.to_string())
        .bind(&scan.pipeline)
        .bind(scan.status.as_str())
        .bind(scan.created_at)
        .bind(scan.finished_at)
        .bind(serde_json::to_string(&scan.stages)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_scan(&self, id: ScanId) -> Result<Option<ScanSnapshot>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SCAN_COLUMNS} FROM scans WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn load_latest_scans(&self) -> Result<Vec<ScanSnapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans \
             WHERE rowid IN (SELECT MAX(rowid) FROM scans GROUP BY target_id)"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scan_from_row).collect()
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobSnapshot>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn load_jobs(&self, scan: ScanId) -> Result<Vec<JobSnapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE scan_id = ? ORDER BY rowid ASC"
        ))
        .bind(scan.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn save_job(&self, job: &JobSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs(id, scan_id, target_id, stage_index, stage, tool, arguments, state, reason, \
             exit_code, created_at, started_at, finished_at, timeout_secs, stats) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, reason = excluded.reason, \
             exit_code = excluded.exit_code, arguments = excluded.arguments, \
             started_at = excluded.started_at, finished_at = excluded.finished_at, \
             stats = excluded.stats",
        )
        .bind(job.id.to_string())
        .bind(job.scan_id.to_string())
        .bind(job.target_id.to_string())
        .bind(job.stage_index as i64)
        .bind(&job.stage)
        .bind(&job.tool)
        .bind(serde_json::to_string(&job.arguments)?)
        .bind(job.state.as_str())
        .bind(&job.reason)
        .bind(job.exit_code)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.timeout_secs.map(|t| t as i64))
        .bind(serde_json::to_string(&job.stats)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_interrupted_jobs(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "UPDATE jobs SET state = 'failed', reason = 'interrupted by restart', finished_at = ? \
             WHERE state IN ('queued', 'running')",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE scans SET status = 'failed', finished_at = ? WHERE status = 'running'")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::{
        db,
        jobs::{Job, JobState},
        jobs::IngestStats,
        models::{LiveHost, ScanStatus, StageStatus, Subdomain, UrlRecord},
        store::StageSummary,
    };

    async fn store() -> SqliteStore {
        let pool = db::memory_pool().await.expect("memory pool");
        db::run_migrations(&pool).await.expect("migrations");
        SqliteStore::new(pool)
    }

    fn sub(host: &str) -> AssetRecord {
        AssetRecord::Subdomain(Subdomain {
            hostname: host.into(),
        })
    }

    fn live(status: Option<u16>) -> AssetRecord {
        AssetRecord::LiveHost(LiveHost {
            url: "https://api.example.com".into(),
            host: "api.example.com".into(),
            status_code: status,
            title: None,
            technologies: vec![],
        })
    }

    #[tokio::test]
    async fn reingesting_is_idempotent_on_identity() {
        let store = store().await;
        let target = Uuid::new_v4();

        assert_eq!(
            store.upsert(target, "subfinder", &sub("api.example.com")).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(target, "assetfinder", &sub("api.example.com")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(store.count(target, RecordKind::Subdomain).await.unwrap(), 1);

        let listed = store
            .list(target, RecordKind::Subdomain, &RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(listed[0].source_tool, "subfinder");
        assert!(listed[0].last_seen >= listed[0].first_seen);
        assert!(store
            .exists(target, RecordKind::Subdomain, "api.example.com")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn mutable_fields_update_in_place() {
        let store = store().await;
        let target = Uuid::new_v4();
        store.upsert(target, "httpx", &live(Some(200))).await.unwrap();
        assert_eq!(
            store.upsert(target, "httpx", &live(Some(503))).await.unwrap(),
            UpsertOutcome::Updated
        );
        // A sighting without status keeps the last known one.
        assert_eq!(
            store.upsert(target, "httpx", &live(None)).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        let listed = store
            .list(target, RecordKind::LiveHost, &RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        let AssetRecord::LiveHost(host) = &listed[0].record else {
            panic!("wrong kind");
        };
        assert_eq!(host.status_code, Some(503));
    }

    #[tokio::test]
    async fn records_are_scoped_per_target_and_filterable() {
        let store = store().await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert(a, "gau", &AssetRecord::Url(UrlRecord {
            url: "https://example.com/item?id=1".into(),
            status_code: None,
            content_length: None,
            tags: vec!["sqli".into(), "xss".into()],
        })).await.unwrap();
        store.upsert(a, "gau", &AssetRecord::Url(UrlRecord {
            url: "https://example.com/about".into(),
            status_code: None,
            content_length: None,
            tags: vec![],
        })).await.unwrap();
        store.upsert(b, "subfinder", &sub("api.example.com")).await.unwrap();

        let tagged = RecordFilter {
            tag: Some("sqli".into()),
            ..Default::default()
        };
        let hits = store.list(a, RecordKind::Url, &tagged).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].natural_key, "https://example.com/item?id=1");

        let search = RecordFilter {
            search: Some("about".into()),
            ..Default::default()
        };
        assert_eq!(store.list(a, RecordKind::Url, &search).await.unwrap().len(), 1);
        assert_eq!(store.count(a, RecordKind::Subdomain).await.unwrap(), 0);

        assert_eq!(store.purge_target(a).await.unwrap(), 2);
        assert_eq!(store.count(b, RecordKind::Subdomain).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_key_yield_one_row() {
        let store = Arc::new(store().await);
        let target = Uuid::new_v4();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let tool = if i % 2 == 0 { "subfinder" } else { "findomain" };
                store.upsert(target, tool, &sub("www.example.com")).await.unwrap()
            }));
        }
        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() == UpsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.count(target, RecordKind::Subdomain).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn targets_round_trip_through_status_tables() {
        let store = store().await;
        let target = Target {
            id: Uuid::new_v4(),
            scope: Scope::parse("example.com").unwrap(),
            created_at: Utc::now(),
        };
        store.save_target(&target).await.unwrap();
        store.save_target(&target).await.unwrap();
        let loaded = store.load_targets().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, target.id);
        assert_eq!(loaded[0].scope, target.scope);
    }

    #[tokio::test]
    async fn interrupted_jobs_fail_on_restart() {
        let store = store().await;
        let target = Target {
            id: Uuid::new_v4(),
            scope: Scope::parse("example.com").unwrap(),
            created_at: Utc::now(),
        };
        store.save_target(&target).await.unwrap();
        let scan = ScanSnapshot {
            id: Uuid::new_v4(),
            target_id: target.id,
            pipeline: "quick".into(),
            status: ScanStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            stages: vec![],
        };
        store.save_scan(&scan).await.unwrap();

        let mut running = Job::new(scan.id, target.id, 0, "subdomains", "subfinder", 0, None);
        running.transition(JobState::Running, None).unwrap();
        let mut done = Job::new(scan.id, target.id, 0, "subdomains", "gau", 1, None);
        done.transition(JobState::Running, None).unwrap();
        done.transition(JobState::Succeeded, None).unwrap();
        let queued = Job::new(scan.id, target.id, 1, "probe", "httpx", 2, None);
        for job in [&running, &done, &queued] {
            store.save_job(&job.snapshot()).await.unwrap();
        }

        assert_eq!(store.fail_interrupted_jobs().await.unwrap(), 2);
        let interrupted = Some("interrupted by restart".to_string());

        let rows: Vec<(String, String, Option<String>)> =
            sqlx::query_as("SELECT tool, state, reason FROM jobs ORDER BY tool")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(
            rows,
            vec![
                ("gau".to_string(), "succeeded".to_string(), None),
                ("httpx".to_string(), "failed".to_string(), interrupted.clone()),
                ("subfinder".to_string(), "failed".to_string(), interrupted),
            ]
        );
        let status: String = sqlx::query_scalar("SELECT status FROM scans")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn like_wildcards_in_filters_match_literally() {
        let store = store().await;
        let target = Uuid::new_v4();
        for url in ["https://example.com/a_b", "https://example.com/axb", "https://example.com/100%"] {
            store.upsert(target, "gau", &AssetRecord::Url(UrlRecord {
                url: url.into(),
                status_code: None,
                content_length: None,
                tags: vec![],
            })).await.unwrap();
        }
        let search = |s: &str| RecordFilter {
            search: Some(s.into()),
            ..Default::default()
        };
        let keys = |records: Vec<StoredRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.natural_key).collect()
        };

        let hits = store.list(target, RecordKind::Url, &search("a_b")).await.unwrap();
        assert_eq!(keys(hits), vec!["https://example.com/a_b"]);
        let hits = store.list(target, RecordKind::Url, &search("_")).await.unwrap();
        assert_eq!(keys(hits), vec!["https://example.com/a_b"]);
        let hits = store.list(target, RecordKind::Url, &search("0%")).await.unwrap();
        assert_eq!(keys(hits), vec!["https://example.com/100%"]);

        let tag = RecordFilter {
            tag: Some("%".into()),
            ..Default::default()
        };
        assert!(store.list(target, RecordKind::Url, &tag).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scans_and_jobs_read_back_as_written() {
        let store = store().await;
        let target = Target {
            id: Uuid::new_v4(),
            scope: Scope::parse("example.com").unwrap(),
            created_at: Utc::now(),
        };
        store.save_target(&target).await.unwrap();
        let mut scan = ScanSnapshot {
            id: Uuid::new_v4(),
            target_id: target.id,
            pipeline: "quick".into(),
            status: ScanStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            stages: vec![
                StageSummary { name: "subdomains".into(), status: StageStatus::Released },
                StageSummary { name: "probe".into(), status: StageStatus::Pending },
            ],
        };
        store.save_scan(&scan).await.unwrap();

        let mut first = Job::new(scan.id, target.id, 0, "subdomains", "subfinder", 0, Some(std::time::Duration::from_secs(90)));
        first.arguments = vec!["-d".into(), "example.com".into()];
        first.transition(JobState::Running, None).unwrap();
        first.exit_code = Some(0);
        first.stats = IngestStats { lines: 3, parsed: 2, inserted: 2, ..Default::default() };
        first.transition(JobState::Succeeded, None).unwrap();
        let mut second = Job::new(scan.id, target.id, 1, "probe", "httpx", 1, None);
        second.transition(JobState::Cancelled, Some("upstream failure".into())).unwrap();
        store.save_job(&first.snapshot()).await.unwrap();
        store.save_job(&second.snapshot()).await.unwrap();

        scan.status = ScanStatus::Completed;
        scan.finished_at = Some(Utc::now());
        scan.stages[1].status = StageStatus::Skipped;
        store.save_scan(&scan).await.unwrap();

        assert_eq!(store.load_scan(scan.id).await.unwrap(), Some(scan.clone()));
        assert_eq!(store.load_scan(Uuid::new_v4()).await.unwrap(), None);
        assert_eq!(
            store.load_jobs(scan.id).await.unwrap(),
            vec![first.snapshot(), second.snapshot()]
        );
        assert_eq!(store.load_job(second.id).await.unwrap(), Some(second.snapshot()));
        assert_eq!(store.load_job(Uuid::new_v4()).await.unwrap(), None);

        let mut later = scan.clone();
        later.id = Uuid::new_v4();
        later.status = ScanStatus::Cancelled;
        store.save_scan(&later).await.unwrap();
        let latest = store.load_latest_scans().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, later.id);
    }
}
