//! The scan orchestrator.
//!
//! All scheduling state lives in one [`Registry`] behind a single async
//! mutex. A background loop calls [`Orchestrator::advance`] whenever a job
//! finishes and on a fixed interval. `advance` reserves concurrency slots
//! under the lock, so two dispatch decisions never race on the limits, and
//! then reads inputs and spawns processes with the lock released.
//!
//! Finished scans leave the registry once their final state is persisted;
//! reads for them are served from the status store.

mod view;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    io,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time::{interval, timeout, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    adapters::{ToolCatalog, ToolSpec},
    config::AppConfig,
    console::ConsoleBroadcaster,
    error::{JobFailure, OrchestratorError, Result, StoreError},
    jobs::{run_job, Job, JobContext, JobOutcome, JobSnapshot, JobState, Transition},
    models::{
        AssetRecord, JobId, RecordFilter, RecordKind, ScanId, ScanStatus, Scope, StoredRecord,
        Subdomain, Target, TargetId, TargetStatus,
    },
    pipeline::{self, PipelineDefinition, PipelineGraph, StagePolicy},
    runner::ProcessHandle,
    security::ScopeGuard,
    store::{ScanSnapshot, StageSummary, Store},
};

pub use crate::models::StageStatus;
pub use view::{ScanView, StageView, TargetView};

pub const REASON_UPSTREAM_FAILURE: &str = "upstream failure";
pub const REASON_NO_INPUT: &str = "no input records";
pub const REASON_CANCELLED: &str = "cancelled";
pub const REASON_SHUTDOWN: &str = "shutting down";

const SCOPE_SOURCE: &str = "scope";

/// Per-scan choices made at submission.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// File name inside the wordlist directory; replaces `{wordlist}`.
    pub wordlist: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_jobs: usize,
    pub max_jobs_per_target: usize,
    pub grace_period: Duration,
    pub default_job_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub stage_policy: StagePolicy,
    pub console_history_lines: usize,
    pub retained_consoles: usize,
    pub catalog: ToolCatalog,
    pub pipelines: Vec<PipelineDefinition>,
    pub scope: ScopeGuard,
}

impl OrchestratorSettings {
    /// Built-in tools and pipelines, with the config's entries layered on top.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut pipelines = pipeline::builtin();
        for custom in &cfg.pipelines {
            pipelines.retain(|p| p.name != custom.name);
            pipelines.push(custom.clone());
        }
        Self {
            max_concurrent_jobs: cfg.max_concurrent_jobs,
            max_jobs_per_target: cfg.max_jobs_per_target,
            grace_period: cfg.grace_period(),
            default_job_timeout: cfg.default_job_timeout(),
            poll_interval: cfg.poll_interval(),
            stage_policy: cfg.stage_policy,
            console_history_lines: cfg.console_history_lines,
            retained_consoles: cfg.retained_consoles,
            catalog: ToolCatalog::builtin(&cfg.wordlist)
                .with_wordlist_dir(&cfg.wordlist_dir)
                .with_overrides(cfg.tools.iter().cloned()),
            pipelines,
            scope: ScopeGuard::new(&cfg.scope_allowlist),
        }
    }
}


#[derive(Debug)]
struct StageEntry {
    name: String,
    jobs: Vec<JobId>,
    status: StageStatus,
}

#[derive(Debug)]
struct ScanEntry {
    id: ScanId,
    target_id: TargetId,
    pipeline: String,
    graph: PipelineGraph,
    stages: Vec<StageEntry>,
    status: ScanStatus,
    cancel_requested: bool,
    /// False until the scope hosts are in the inventory.
    seeded: bool,
    wordlist: Option<PathBuf>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl ScanEntry {
    fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.stages.iter().flat_map(|s| s.jobs.iter())
    }

    fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            id: self.id,
            target_id: self.target_id,
            pipeline: self.pipeline.clone(),
            status: self.status,
            created_at: self.created_at,
            finished_at: self.finished_at,
            stages: self
                .stages
                .iter()
                .map(|s| StageSummary {
                    name: s.name.clone(),
                    status: s.status,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    targets: HashMap<TargetId, Target>,
    targets_by_scope: HashMap<String, TargetId>,
    /// Scans still running or not yet persisted in their final state.
    scans: HashMap<ScanId, ScanEntry>,
    /// Submission order.
    scan_order: Vec<ScanId>,
    jobs: HashMap<JobId, Job>,
    next_seq: u64,
    /// Slots held by running jobs and by launches in flight.
    occupied_total: usize,
    occupied_by_target: HashMap<TargetId, usize>,
    launching: HashSet<JobId>,
    /// Non-terminal jobs per target.
    active_by_target: HashMap<TargetId, usize>,
    /// Outcome of each target's most recent finished scan.
    last_status: HashMap<TargetId, ScanStatus>,
}

impl Registry {
    fn active_jobs(&self, target: TargetId) -> usize {
        self.active_by_target.get(&target).copied().unwrap_or(0)
    }

    fn has_active_jobs(&self, target: TargetId) -> bool {
        self.active_jobs(target) > 0
    }

    fn target_status(&self, target: TargetId) -> TargetStatus {
        if self.has_active_jobs(target) {
            return TargetStatus::Running;
        }
        self.last_status
            .get(&target)
            .map_or(TargetStatus::Idle, |s| TargetStatus::from(*s))
    }

    fn occupy(&mut self, target: TargetId) {
        self.occupied_total += 1;
        *self.occupied_by_target.entry(target).or_default() += 1;
    }

    fn release(&mut self, target: TargetId) {
        self.occupied_total = self.occupied_total.saturating_sub(1);
        if let Some(n) = self.occupied_by_target.get_mut(&target) {
            *n = n.saturating_sub(1);
        }
    }
}

/// A queued job holding a slot while its inputs are read and its process
/// is spawned.
struct Launch {
    job_id: JobId,
    target_id: TargetId,
    scope: Scope,
    tool: ToolSpec,
    wordlist: Option<PathBuf>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

#[derive(Debug)]
enum Event {
    JobFinished(JobId),
    Wake,
    /// The scan's final snapshot reached the store.
    ScanPersisted(ScanId),
}

#[derive(Debug)]
enum StatusUpdate {
    Target(Target),
    Scan(ScanSnapshot),
    Job(JobSnapshot),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    registry: Mutex<Registry>,
    store: Arc<dyn Store>,
    console: ConsoleBroadcaster,
    settings: OrchestratorSettings,
    pipelines: BTreeMap<String, PipelineDefinition>,
    events: mpsc::UnboundedSender<Event>,
    status: mpsc::UnboundedSender<StatusUpdate>,
    workers: TaskTracker,
    shutdown: CancellationToken,
}

/// Cheap to clone; all clones drive the same registry.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Validates the configured pipelines, restores known targets and spawns
    /// the scheduling loop and the status writer.
    pub async fn start(mut settings: OrchestratorSettings, store: Arc<dyn Store>) -> Result<Self> {
        if settings.max_concurrent_jobs == 0 || settings.max_jobs_per_target == 0 {
            warn!("job limits of zero raised to one");
            settings.max_concurrent_jobs = settings.max_concurrent_jobs.max(1);
            settings.max_jobs_per_target = settings.max_jobs_per_target.max(1);
        }
        let mut pipelines = BTreeMap::new();
        for definition in &settings.pipelines {
            definition.validate(&settings.catalog)?;
            pipelines.insert(definition.name.clone(), definition.clone());
        }

        let mut registry = Registry::default();
        for target in store.load_targets().await? {
            registry
                .targets_by_scope
                .insert(target.scope.key(), target.id);
            registry.targets.insert(target.id, target);
        }
        for scan in store.load_latest_scans().await? {
            registry.last_status.insert(scan.target_id, scan.status);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry: Mutex::new(registry),
            console: ConsoleBroadcaster::new(
                settings.console_history_lines,
                settings.retained_consoles,
            ),
            store: store.clone(),
            pipelines,
            events: events_tx.clone(),
            status: status_tx,
            workers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            settings,
        });

        tokio::spawn(persist_status(store, status_rx, events_tx));
        tokio::spawn(scheduling_loop(inner.clone(), events_rx));
        info!(
            max_concurrent_jobs = inner.settings.max_concurrent_jobs,
            max_jobs_per_target = inner.settings.max_jobs_per_target,
            pipelines = inner.pipelines.len(),
            "orchestrator started"
        );
        Ok(Self { inner })
    }

    pub fn console(&self) -> &ConsoleBroadcaster {
        &self.inner.console
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.inner.settings.catalog
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineDefinition> {
        self.inner.pipelines.get(name)
    }

    pub fn pipelines(&self) -> Vec<&PipelineDefinition> {
        self.inner.pipelines.values().collect()
    }

    /// Wordlists a scan may choose from.
    pub async fn wordlists(&self) -> io::Result<Vec<String>> {
        self.inner.settings.catalog.wordlists().await
    }

    pub async fn submit_scan(&self, target: &str, pipeline: &PipelineDefinition) -> Result<ScanId> {
        self.submit_scan_with(target, pipeline, ScanOptions::default()).await
    }

    /// Accepts a scan of `target` and queues one job per stage tool.
    ///
    /// Fails with [`OrchestratorError::Conflict`] while the target still has
    /// a non-terminal job from an earlier scan.
    pub async fn submit_scan_with(
        &self,
        target: &str,
        pipeline: &PipelineDefinition,
        options: ScanOptions,
    ) -> Result<ScanId> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let scope = Scope::parse(target).map_err(OrchestratorError::InvalidTarget)?;
        if !inner.settings.scope.allows(&scope) {
            return Err(OrchestratorError::OutOfScope(scope.key()));
        }
        let graph = pipeline.validate(&inner.settings.catalog)?;
        let wordlist = match &options.wordlist {
            Some(name) => Some(
                inner
                    .settings
                    .catalog
                    .resolve_wordlist(name)
                    .await
                    .map_err(OrchestratorError::InvalidRequest)?,
            ),
            None => None,
        };

        let mut reg = inner.registry.lock().await;
        let target_id = match reg.targets_by_scope.get(&scope.key()) {
            Some(id) => *id,
            None => {
                let target = Target {
                    id: Uuid::new_v4(),
                    scope: scope.clone(),
                    created_at: Utc::now(),
                };
                info!(target_id = %target.id, target = %scope, "target created");
                inner.persist(StatusUpdate::Target(target.clone()));
                reg.targets_by_scope.insert(scope.key(), target.id);
                reg.targets.insert(target.id, target.clone());
                target.id
            }
        };
        if reg.has_active_jobs(target_id) {
            return Err(OrchestratorError::Conflict(scope.key()));
        }

        let scan_id = Uuid::new_v4();
        let mut stages = Vec::with_capacity(pipeline.stages.len());
        let mut snapshots = Vec::new();
        for (index, stage) in pipeline.stages.iter().enumerate() {
            let mut jobs = Vec::with_capacity(stage.tools.len());
            for tool in &stage.tools {
                let timeout = inner
                    .settings
                    .catalog
                    .get(tool)
                    .and_then(|t| t.timeout_secs)
                    .map(Duration::from_secs)
                    .or(inner.settings.default_job_timeout);
                let job = Job::new(scan_id, target_id, index, &stage.name, tool, reg.next_seq, timeout);
                reg.next_seq += 1;
                inner.console.open(job.id);
                inner.console.publish_control(
                    job.id,
                    format!("queued: {tool} (stage {}, scan {scan_id})", stage.name),
                );
                snapshots.push(job.snapshot());
                jobs.push(job.id);
                reg.jobs.insert(job.id, job);
            }
            *reg.active_by_target.entry(target_id).or_default() += jobs.len();
            stages.push(StageEntry {
                name: stage.name.clone(),
                jobs,
                status: StageStatus::Pending,
            });
        }

        let scan = ScanEntry {
            id: scan_id,
            target_id,
            pipeline: pipeline.name.clone(),
            graph,
            stages,
            status: ScanStatus::Running,
            cancel_requested: false,
            seeded: false,
            wordlist,
            created_at: Utc::now(),
            finished_at: None,
        };
        // Scan row first: job rows reference it.
        inner.persist(StatusUpdate::Scan(scan.snapshot()));
        for snapshot in snapshots {
            inner.persist(StatusUpdate::Job(snapshot));
        }
        reg.scans.insert(scan_id, scan);
        reg.scan_order.push(scan_id);
        drop(reg);

        // The queued jobs keep the target busy, so nothing else touches its
        // inventory while the scope is seeded.
        if let Err(e) = inner.seed_scope(target_id, &scope).await {
            warn!(%scan_id, error = %e, "could not seed scope, failing scan");
            inner.fail_unstarted(scan_id, &e).await;
            inner.wake();
            return Err(e.into());
        }
        if let Some(scan) = inner.registry.lock().await.scans.get_mut(&scan_id) {
            scan.seeded = true;
        }

        info!(%scan_id, %target_id, target = %scope, pipeline = %pipeline.name, "scan submitted");
        inner.wake();
        Ok(scan_id)
    }

    /// Resolves stages, dispatches ready jobs and finalizes finished scans.
    pub async fn advance(&self) {
        self.inner.advance().await;
    }

    /// Cancels every non-terminal job of the scan. Queued jobs end at once;
    /// running jobs end once their process is gone. Returns how many jobs
    /// were affected.
    pub async fn cancel_scan(&self, scan_id: ScanId) -> Result<usize> {
        let inner = &self.inner;
        let mut reg = inner.registry.lock().await;
        let Some(scan) = reg.scans.get_mut(&scan_id) else {
            drop(reg);
            return match inner.store.load_scan(scan_id).await? {
                Some(_) => Ok(0),
                None => Err(OrchestratorError::NotFound(format!("scan {scan_id}"))),
            };
        };
        scan.cancel_requested = true;
        let job_ids: Vec<JobId> = scan.job_ids().copied().collect();

        let mut affected = 0;
        for job_id in job_ids {
            let Some(state) = reg.jobs.get(&job_id).map(|j| j.state) else { continue };
            match state {
                JobState::Queued => {
                    inner.transition(&mut reg, job_id, JobState::Cancelled, Some(REASON_CANCELLED.into()))?;
                    affected += 1;
                }
                JobState::Running => {
                    if let Some(job) = reg.jobs.get(&job_id) {
                        job.cancel.cancel();
                    }
                    inner.console.publish_control(job_id, "cancellation requested");
                    affected += 1;
                }
                _ => {}
            }
        }
        drop(reg);

        info!(%scan_id, affected, "scan cancellation requested");
        inner.wake();
        Ok(affected)
    }

    pub async fn scan_status(&self, scan_id: ScanId) -> Result<ScanView> {
        {
            let reg = self.inner.registry.lock().await;
            if let Some(scan) = reg.scans.get(&scan_id) {
                return Ok(ScanView {
                    id: scan.id,
                    target_id: scan.target_id,
                    target: target_key(&reg, scan.target_id),
                    pipeline: scan.pipeline.clone(),
                    status: scan.status,
                    created_at: scan.created_at,
                    finished_at: scan.finished_at,
                    stages: scan
                        .stages
                        .iter()
                        .map(|stage| StageView {
                            name: stage.name.clone(),
                            status: stage.status,
                            jobs: stage
                                .jobs
                                .iter()
                                .filter_map(|id| reg.jobs.get(id).map(Job::snapshot))
                                .collect(),
                        })
                        .collect(),
                });
            }
        }
        self.stored_scan_view(scan_id).await
    }

    async fn stored_scan_view(&self, scan_id: ScanId) -> Result<ScanView> {
        let store = &self.inner.store;
        let scan = store
            .load_scan(scan_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("scan {scan_id}")))?;
        let jobs = store.load_jobs(scan_id).await?;
        let target = target_key(&*self.inner.registry.lock().await, scan.target_id);

        let mut stages: Vec<StageView> = scan
            .stages
            .into_iter()
            .map(|s| StageView {
                name: s.name,
                status: s.status,
                jobs: Vec::new(),
            })
            .collect();
        for job in jobs {
            let slot = match stages.get(job.stage_index) {
                Some(stage) if stage.name == job.stage => Some(job.stage_index),
                _ => stages.iter().position(|s| s.name == job.stage),
            };
            match slot {
                Some(i) => stages[i].jobs.push(job),
                // Rows written before stage state was recorded.
                None => stages.push(StageView {
                    name: job.stage.clone(),
                    status: StageStatus::Released,
                    jobs: vec![job],
                }),
            }
        }

        Ok(ScanView {
            id: scan.id,
            target_id: scan.target_id,
            target,
            pipeline: scan.pipeline,
            status: scan.status,
            created_at: scan.created_at,
            finished_at: scan.finished_at,
            stages,
        })
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobSnapshot> {
        if let Some(job) = self.inner.registry.lock().await.jobs.get(&job_id) {
            return Ok(job.snapshot());
        }
        self.inner
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))
    }

    /// Jobs of a scan in creation order.
    pub async fn jobs_for_scan(&self, scan_id: ScanId) -> Result<Vec<JobSnapshot>> {
        {
            let reg = self.inner.registry.lock().await;
            if let Some(scan) = reg.scans.get(&scan_id) {
                let mut jobs: Vec<&Job> = scan.job_ids().filter_map(|id| reg.jobs.get(id)).collect();
                jobs.sort_by_key(|j| j.created_seq);
                return Ok(jobs.into_iter().map(Job::snapshot).collect());
            }
        }
        let store = &self.inner.store;
        if store.load_scan(scan_id).await?.is_none() {
            return Err(OrchestratorError::NotFound(format!("scan {scan_id}")));
        }
        Ok(store.load_jobs(scan_id).await?)
    }

    pub async fn targets(&self) -> Vec<TargetView> {
        let reg = self.inner.registry.lock().await;
        let mut targets: Vec<TargetView> = reg
            .targets
            .values()
            .map(|t| TargetView {
                id: t.id,
                scope: t.scope.clone(),
                created_at: t.created_at,
                status: reg.target_status(t.id),
                active_jobs: reg.active_jobs(t.id),
            })
            .collect();
        targets.sort_by_key(|t| t.created_at);
        targets
    }

    async fn known_target(&self, target_id: TargetId) -> Result<Target> {
        self.inner
            .registry
            .lock()
            .await
            .targets
            .get(&target_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("target {target_id}")))
    }

    /// Lists inventory records of a known target.
    pub async fn inventory(
        &self,
        target_id: TargetId,
        kind: RecordKind,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>> {
        self.known_target(target_id).await?;
        Ok(self.inner.store.list(target_id, kind, filter).await?)
    }

    /// Number of stored records of each kind for a known target.
    pub async fn inventory_counts(&self, target_id: TargetId) -> Result<BTreeMap<RecordKind, u64>> {
        self.known_target(target_id).await?;
        let mut counts = BTreeMap::new();
        for kind in RecordKind::ALL {
            counts.insert(kind, self.inner.store.count(target_id, kind).await?);
        }
        Ok(counts)
    }

    /// Sorted, unique URLs of the target, optionally only those with `tag`.
    /// Without a tag the subdomains are included as well.
    pub async fn export(&self, target_id: TargetId, tag: Option<&str>) -> Result<(Target, Vec<String>)> {
        let target = self.known_target(target_id).await?;
        let filter = RecordFilter {
            tag: tag.map(str::to_string),
            limit: Some(u32::MAX),
            ..Default::default()
        };
        let mut kinds = vec![RecordKind::Url];
        if tag.is_none() {
            kinds.push(RecordKind::Subdomain);
        }

        let mut lines = BTreeSet::new();
        for kind in kinds {
            let records = self.inner.store.list(target_id, kind, &filter).await?;
            lines.extend(records.iter().map(|r| r.record.input_value().to_string()));
        }
        Ok((target, lines.into_iter().collect()))
    }

    /// Deletes every inventory record of the target. The target itself stays
    /// so its scan history keeps resolving.
    pub async fn purge_target(&self, target_id: TargetId) -> Result<u64> {
        let reg = self.inner.registry.lock().await;
        let target = reg
            .targets
            .get(&target_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("target {target_id}")))?;
        if reg.has_active_jobs(target_id) {
            return Err(OrchestratorError::TargetBusy(target.scope.key()));
        }
        // Held across the purge so no scan can start mid-way.
        let removed = self.inner.store.purge_target(target_id).await?;
        info!(%target_id, removed, "target inventory purged");
        Ok(removed)
    }

    /// Stops accepting scans, cancels everything in flight and waits for the
    /// running jobs and pending status writes to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        {
            let mut reg = inner.registry.lock().await;
            let active: Vec<(JobId, JobState)> = reg
                .jobs
                .values()
                .filter(|j| j.is_active())
                .map(|j| (j.id, j.state))
                .collect();
            for (job_id, state) in active {
                if state == JobState::Queued {
                    if let Err(e) =
                        inner.transition(&mut reg, job_id, JobState::Cancelled, Some(REASON_SHUTDOWN.into()))
                    {
                        warn!(%job_id, error = %e, "could not cancel queued job on shutdown");
                    }
                } else if let Some(job) = reg.jobs.get(&job_id) {
                    job.cancel.cancel();
                }
            }
        }

        inner.workers.close();
        let budget = inner.settings.grace_period + Duration::from_secs(5);
        if timeout(budget, inner.workers.wait()).await.is_err() {
            warn!("jobs still running after shutdown budget");
        }
        inner.finalize_scans(&mut *inner.registry.lock().await);

        let (tx, rx) = oneshot::channel();
        if inner.status.send(StatusUpdate::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
        info!("orchestrator stopped");
    }
}

fn target_key(reg: &Registry, target_id: TargetId) -> String {
    reg.targets
        .get(&target_id)
        .map(|t| t.scope.key())
        .unwrap_or_default()
}

impl Inner {
    fn wake(&self) {
        let _ = self.events.send(Event::Wake);
    }

    fn persist(&self, update: StatusUpdate) {
        if self.status.send(update).is_err() {
            warn!("status writer is gone, update dropped");
        }
    }

    /// Tools reading subdomains need the scope itself on their input.
    async fn seed_scope(&self, target_id: TargetId, scope: &Scope) -> Result<(), StoreError> {
        for host in scope.hosts() {
            let record = AssetRecord::Subdomain(Subdomain { hostname: host });
            self.store.upsert(target_id, SCOPE_SOURCE, &record).await?;
        }
        Ok(())
    }

    /// Fails every job of a scan that never got to run.
    async fn fail_unstarted(&self, scan_id: ScanId, cause: &StoreError) {
        let mut reg = self.registry.lock().await;
        let Some(scan) = reg.scans.get(&scan_id) else { return };
        let queued: Vec<JobId> = scan.job_ids().copied().collect();
        let reason = JobFailure::Input(cause.to_string()).to_string();
        for job_id in queued {
            if reg.jobs.get(&job_id).is_some_and(|j| j.state == JobState::Queued) {
                if let Err(e) = self.transition(&mut reg, job_id, JobState::Failed, Some(reason.clone())) {
                    warn!(%job_id, error = %e, "could not fail unseeded job");
                }
            }
        }
        self.finalize_scans(&mut reg);
    }

    /// Applies a state change, announces it on the job console and queues
    /// the snapshot for persistence.
    fn transition(
        &self,
        reg: &mut Registry,
        job_id: JobId,
        to: JobState,
        reason: Option<String>,
    ) -> Result<Transition> {
        let job = reg
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?;
        let transition = job.transition(to, reason)?;

        let line = match &job.reason {
            Some(reason) if to.is_terminal() => format!("{} -> {}: {reason}", transition.from, to),
            _ => format!("{} -> {}", transition.from, to),
        };
        self.console.publish_control(job_id, line);
        if to.is_terminal() {
            self.console.close(job_id);
        }
        debug!(%job_id, tool = %job.tool, from = %transition.from, to = %to, "job transition");
        self.persist(StatusUpdate::Job(job.snapshot()));

        if to.is_terminal() {
            let target_id = job.target_id;
            if let Some(n) = reg.active_by_target.get_mut(&target_id) {
                *n = n.saturating_sub(1);
            }
        }
        Ok(transition)
    }

    async fn advance(self: &Arc<Self>) {
        let launches = {
            let mut reg = self.registry.lock().await;
            self.resolve_stages(&mut reg);
            let launches = if self.shutdown.is_cancelled() {
                Vec::new()
            } else {
                self.reserve_ready(&mut reg)
            };
            self.finalize_scans(&mut reg);
            launches
        };

        let mut aborted = false;
        for launch in launches {
            aborted |= !self.launch(launch).await;
        }
        // A job that ended without a process may complete its stage or scan.
        if aborted {
            self.wake();
        }
    }

    /// Releases or skips every pending stage whose predecessors are done.
    fn resolve_stages(&self, reg: &mut Registry) {
        let scan_ids: Vec<ScanId> = reg
            .scan_order
            .iter()
            .filter(|id| {
                reg.scans.get(*id).is_some_and(|s| {
                    s.status == ScanStatus::Running && s.seeded && !s.cancel_requested
                })
            })
            .copied()
            .collect();

        for scan_id in scan_ids {
            let mut changed = false;
            loop {
                let Some(scan) = reg.scans.get(&scan_id) else { break };
                let mut decisions = Vec::new();
                for (index, stage) in scan.stages.iter().enumerate() {
                    if stage.status != StageStatus::Pending {
                        continue;
                    }
                    let states: Option<Vec<JobState>> = scan.graph.predecessors[index]
                        .iter()
                        .flat_map(|p| scan.stages[*p].jobs.iter())
                        .map(|id| reg.jobs.get(id).map(|j| j.state).filter(|s| s.is_terminal()))
                        .collect();
                    if let Some(states) = states {
                        decisions.push((index, self.settings.stage_policy.allows(&states)));
                    }
                }
                if decisions.is_empty() {
                    break;
                }
                changed = true;

                for (index, allowed) in decisions {
                    let Some(scan) = reg.scans.get_mut(&scan_id) else { break };
                    let stage = &mut scan.stages[index];
                    stage.status = if allowed {
                        StageStatus::Released
                    } else {
                        StageStatus::Skipped
                    };
                    let (name, jobs) = (stage.name.clone(), stage.jobs.clone());
                    if allowed {
                        info!(%scan_id, stage = %name, jobs = jobs.len(), "stage released");
                        continue;
                    }
                    info!(%scan_id, stage = %name, "stage skipped, no predecessor satisfied the policy");
                    for job_id in jobs {
                        if let Err(e) = self.transition(
                            reg,
                            job_id,
                            JobState::Cancelled,
                            Some(REASON_UPSTREAM_FAILURE.into()),
                        ) {
                            warn!(%job_id, error = %e, "could not skip job");
                        }
                    }
                }
            }
            if changed {
                if let Some(scan) = reg.scans.get(&scan_id) {
                    self.persist(StatusUpdate::Scan(scan.snapshot()));
                }
            }
        }
    }

    /// Picks queued jobs of released stages, oldest first, and reserves a
    /// slot for each within the global and per-target limits.
    fn reserve_ready(&self, reg: &mut Registry) -> Vec<Launch> {
        let mut ready: Vec<(u64, usize, JobId)> = reg
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued && !reg.launching.contains(&j.id))
            .filter(|j| {
                reg.scans.get(&j.scan_id).is_some_and(|s| {
                    s.status == ScanStatus::Running
                        && s.stages[j.stage_index].status == StageStatus::Released
                })
            })
            .map(|j| (j.created_seq, j.stage_index, j.id))
            .collect();
        ready.sort_unstable();

        let mut launches = Vec::new();
        for (_, _, job_id) in ready {
            if reg.occupied_total >= self.settings.max_concurrent_jobs {
                debug!(running = reg.occupied_total, "global job limit reached");
                break;
            }
            let Some(job) = reg.jobs.get(&job_id) else { continue };
            let (target_id, scan_id) = (job.target_id, job.scan_id);
            let per_target = reg.occupied_by_target.get(&target_id).copied().unwrap_or(0);
            if per_target >= self.settings.max_jobs_per_target {
                continue;
            }

            let Some(tool) = self.settings.catalog.get(&job.tool).cloned() else {
                let failure = JobFailure::Input(format!("tool {} is not in the catalog", job.tool));
                warn!(%job_id, error = %failure, "job could not be launched");
                if let Err(e) = self.transition(reg, job_id, JobState::Failed, Some(failure.to_string())) {
                    warn!(%job_id, error = %e, "could not fail job");
                }
                continue;
            };
            let Some(scope) = reg.targets.get(&target_id).map(|t| t.scope.clone()) else {
                continue;
            };
            let launch = Launch {
                job_id,
                target_id,
                scope,
                tool,
                wordlist: reg.scans.get(&scan_id).and_then(|s| s.wordlist.clone()),
                cancel: job.cancel.clone(),
                timeout: job.timeout,
            };
            reg.launching.insert(job_id);
            reg.occupy(target_id);
            launches.push(launch);
        }
        launches
    }

    /// Reads the tool's inputs and spawns its process without holding the
    /// registry lock. Returns whether a worker now owns the job.
    async fn launch(self: &Arc<Self>, launch: Launch) -> bool {
        let job_id = launch.job_id;
        let tool_name = launch.tool.name.clone();

        let inputs = match self.collect_inputs(&launch).await {
            Ok(inputs) => inputs,
            Err(e) => {
                let failure = JobFailure::Input(e.to_string());
                warn!(%job_id, tool = %tool_name, error = %failure, "job could not be launched");
                self.abort_launch(&launch, JobState::Failed, failure.to_string()).await;
                return false;
            }
        };
        if launch.tool.input.selector().is_some() && inputs.is_empty() {
            info!(%job_id, tool = %tool_name, "no input records, not launching");
            self.abort_launch(&launch, JobState::Cancelled, REASON_NO_INPUT.into()).await;
            return false;
        }

        let started = self
            .settings
            .catalog
            .build_command(&launch.tool, &launch.scope, &inputs, launch.wordlist.as_deref())
            .and_then(|prepared| ProcessHandle::start(&prepared.spec).map(|process| (prepared, process)));
        let (prepared, process) = match started {
            Ok(started) => started,
            Err(e) => {
                let failure = JobFailure::Launch(e);
                warn!(%job_id, tool = %tool_name, error = %failure, "job could not be launched");
                self.abort_launch(&launch, JobState::Failed, failure.to_string()).await;
                return false;
            }
        };

        let mut reg = self.registry.lock().await;
        reg.launching.remove(&job_id);
        let Some(job) = reg.jobs.get_mut(&job_id).filter(|j| j.state == JobState::Queued) else {
            // Cancelled while launching; dropping the handle kills the process.
            debug!(%job_id, tool = %tool_name, "job left the queue during launch");
            reg.release(launch.target_id);
            return false;
        };
        job.arguments = prepared.spec.args.clone();
        if let Err(e) = self.transition(&mut reg, job_id, JobState::Running, None) {
            warn!(%job_id, error = %e, "dispatch raced a transition");
            reg.release(launch.target_id);
            return false;
        }
        drop(reg);

        self.console.publish_control(
            job_id,
            format!("started: {} {}", prepared.spec.program, prepared.spec.args.join(" ")),
        );
        info!(
            %job_id,
            tool = %tool_name,
            target = %launch.scope,
            pid = ?process.pid(),
            inputs = inputs.len(),
            "job started"
        );

        let ctx = JobContext {
            job_id,
            target_id: launch.target_id,
            tool: tool_name,
            parser: launch.tool.parser.build(&launch.scope),
            store: self.store.clone(),
            console: self.console.clone(),
            cancel: launch.cancel,
            timeout: launch.timeout,
            grace: self.settings.grace_period,
            input_file: prepared.input_file,
        };
        let inner = self.clone();
        self.workers.spawn(async move {
            let outcome = run_job(process, ctx).await;
            inner.finish_job(outcome).await;
            let _ = inner.events.send(Event::JobFinished(job_id));
        });
        true
    }

    /// Stored records selected by the tool's input, deduplicated in order.
    async fn collect_inputs(&self, launch: &Launch) -> Result<Vec<String>, StoreError> {
        let Some(selector) = launch.tool.input.selector() else {
            return Ok(Vec::new());
        };
        let filter = RecordFilter {
            tag: selector.tag.clone(),
            limit: Some(u32::MAX),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut inputs = Vec::new();
        for kind in &selector.kinds {
            for record in self.store.list(launch.target_id, *kind, &filter).await? {
                let value = record.record.input_value().to_string();
                if seen.insert(value.clone()) {
                    inputs.push(value);
                }
            }
        }
        Ok(inputs)
    }

    /// Ends a reserved job that never got a process.
    async fn abort_launch(&self, launch: &Launch, to: JobState, reason: String) {
        let mut reg = self.registry.lock().await;
        reg.launching.remove(&launch.job_id);
        reg.release(launch.target_id);
        // A cancel may have beaten us to it.
        if reg.jobs.get(&launch.job_id).is_some_and(|j| j.state == JobState::Queued) {
            if let Err(e) = self.transition(&mut reg, launch.job_id, to, Some(reason)) {
                warn!(job_id = %launch.job_id, error = %e, "could not record launch outcome");
            }
        }
    }

    async fn finish_job(&self, outcome: JobOutcome) {
        let mut reg = self.registry.lock().await;
        let Some(job) = reg.jobs.get_mut(&outcome.job_id) else {
            warn!(job_id = %outcome.job_id, "finished job is not registered");
            return;
        };
        if job.state != JobState::Running {
            warn!(job_id = %job.id, state = %job.state, "finished job was not running");
            return;
        }
        job.stats = outcome.stats;
        job.exit_code = outcome.exit_code;
        let target_id = job.target_id;

        if let Err(e) = self.transition(&mut reg, outcome.job_id, outcome.state, outcome.reason) {
            warn!(job_id = %outcome.job_id, error = %e, "could not record job outcome");
        }
        reg.release(target_id);
    }

    /// Marks scans whose jobs are all terminal as finished. A scan completes
    /// when at least one job succeeded.
    fn finalize_scans(&self, reg: &mut Registry) {
        let mut finished = Vec::new();
        for scan in reg.scans.values() {
            if scan.status != ScanStatus::Running {
                continue;
            }
            let states: Option<Vec<JobState>> = scan
                .job_ids()
                .map(|id| reg.jobs.get(id).map(|j| j.state).filter(|s| s.is_terminal()))
                .collect();
            let Some(states) = states else { continue };
            let status = if scan.cancel_requested {
                ScanStatus::Cancelled
            } else if states.contains(&JobState::Succeeded) {
                ScanStatus::Completed
            } else {
                ScanStatus::Failed
            };
            finished.push((scan.id, status));
        }

        for (scan_id, status) in finished {
            let Some(scan) = reg.scans.get_mut(&scan_id) else { continue };
            scan.status = status;
            scan.finished_at = Some(Utc::now());
            for stage in &mut scan.stages {
                if stage.status == StageStatus::Pending {
                    stage.status = StageStatus::Skipped;
                }
            }
            info!(%scan_id, status = status.as_str(), "scan finished");
            let snapshot = scan.snapshot();
            reg.last_status.insert(snapshot.target_id, status);
            self.persist(StatusUpdate::Scan(snapshot));
        }
    }

    /// Drops a finished scan and its jobs from memory. Only called once the
    /// final snapshot is durable, so reads fall through to the store.
    async fn evict_scan(&self, scan_id: ScanId) {
        let mut reg = self.registry.lock().await;
        let Some(scan) = reg.scans.get(&scan_id) else { return };
        let job_ids: Vec<JobId> = scan.job_ids().copied().collect();
        if scan.status == ScanStatus::Running
            || job_ids.iter().any(|id| reg.jobs.get(id).is_some_and(Job::is_active))
        {
            return;
        }
        for job_id in &job_ids {
            reg.jobs.remove(job_id);
        }
        reg.scans.remove(&scan_id);
        reg.scan_order.retain(|id| *id != scan_id);
        debug!(%scan_id, jobs = job_ids.len(), "finished scan evicted from memory");
    }
}

async fn scheduling_loop(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<Event>) {
    let mut tick = interval(inner.settings.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(Event::ScanPersisted(scan_id)) => inner.evict_scan(scan_id).await,
                Some(event) => debug!(?event, "scheduler woken"),
                None => break,
            },
            _ = tick.tick() => {}
        }
        inner.advance().await;
    }
    debug!("scheduling loop stopped");
}

/// Writes status snapshots in the order they were produced.
async fn persist_status(
    store: Arc<dyn Store>,
    mut updates: mpsc::UnboundedReceiver<StatusUpdate>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(update) = updates.recv().await {
        let result = match &update {
            StatusUpdate::Target(target) => store.save_target(target).await,
            StatusUpdate::Scan(scan) => store.save_scan(scan).await,
            StatusUpdate::Job(job) => store.save_job(job).await,
            StatusUpdate::Flush(_) => Ok(()),
        };
        match (result, update) {
            (Err(e), _) => warn!(error = %e, "failed to persist status"),
            (Ok(()), StatusUpdate::Scan(scan)) if scan.status != ScanStatus::Running => {
                let _ = events.send(Event::ScanPersisted(scan.id));
            }
            (Ok(()), StatusUpdate::Flush(done)) => {
                let _ = done.send(());
            }
            _ => {}
        }
    }
}
