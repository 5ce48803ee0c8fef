//! Job records and their lifecycle.

mod worker;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{OrchestratorError, Result},
    models::{JobId, ScanId, TargetId},
};

pub use worker::{run_job, JobContext, JobOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// `Queued -> Failed` covers launch failures: no process ever existed.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        use JobState::*;
        [Queued, Running, Succeeded, Failed, Cancelled]
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingestion counters for one job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestStats {
    pub lines: u64,
    pub parsed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub warnings: u64,
    pub store_failures: u64,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub scan_id: ScanId,
    pub target_id: TargetId,
    pub stage_index: usize,
    pub stage: String,
    pub tool: String,
    pub arguments: Vec<String>,
    pub state: JobState,
    /// Global creation order, used for FIFO dispatch.
    pub created_seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub timeout: Option<Duration>,
    pub stats: IngestStats,
    pub cancel: CancellationToken,
}

/// A state change that was applied to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        scan_id: ScanId,
        target_id: TargetId,
        stage_index: usize,
        stage: impl Into<String>,
        tool: impl Into<String>,
        created_seq: u64,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scan_id,
            target_id,
            stage_index,
            stage: stage.into(),
            tool: tool.into(),
            arguments: Vec::new(),
            state: JobState::Queued,
            created_seq,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            reason: None,
            timeout,
            stats: IngestStats::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Applies `to`, stamping timestamps. Illegal moves leave the job as is.
    pub fn transition(&mut self, to: JobState, reason: Option<String>) -> Result<Transition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::IllegalTransition { from, to });
        }
        let now = Utc::now();
        self.state = to;
        if to == JobState::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
            if reason.is_some() {
                self.reason = reason;
            }
        }
        Ok(Transition {
            job_id: self.id,
            from,
            to,
            at: now,
        })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            scan_id: self.scan_id,
            target_id: self.target_id,
            stage_index: self.stage_index,
            stage: self.stage.clone(),
            tool: self.tool.clone(),
            arguments: self.arguments.clone(),
            state: self.state,
            reason: self.reason.clone(),
            exit_code: self.exit_code,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            timeout_secs: self.timeout.map(|t| t.as_secs()),
            stats: self.stats,
        }
    }
}

/// Read-only copy of a job handed to the API and the status store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub scan_id: ScanId,
    pub target_id: TargetId,
    pub stage_index: usize,
    pub stage: String,
    pub tool: String,
    pub arguments: Vec<String>,
    pub state: JobState,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timeout_secs: Option<u64>,
    pub stats: IngestStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(Uuid::new_v4(), Uuid::new_v4(), 0, "subdomains", "subfinder", 0, None)
    }

    #[test]
    fn happy_path_stamps_timestamps() {
        let mut job = job();
        let t = job.transition(JobState::Running, None).unwrap();
        assert_eq!((t.from, t.to), (JobState::Queued, JobState::Running));
        assert!(job.started_at.is_some());
        job.transition(JobState::Succeeded, None).unwrap();
        assert!(job.finished_at.is_some());
        assert!(!job.is_active());
    }

    #[test]
    fn terminal_states_are_immutable() {
        for terminal in [JobState::Succeeded, JobState::Failed, JobState::Cancelled] {
            for next in [
                JobState::Queued,
                JobState::Running,
                JobState::Succeeded,
                JobState::Failed,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn illegal_transition_is_rejected_and_not_applied() {
        let mut job = job();
        job.transition(JobState::Cancelled, Some("cancelled".into()))
            .unwrap();
        let err = job.transition(JobState::Running, None).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::IllegalTransition {
                from: JobState::Cancelled,
                to: JobState::Running
            }
        ));
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.started_at.is_none());
        assert_eq!(job.reason.as_deref(), Some("cancelled"));
    }

    #[test]
    fn queued_cannot_succeed_without_running() {
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(JobState::Queued.can_transition_to(JobState::Failed));
    }

    #[test]
    fn snapshot_serializes_state_lowercase() {
        let snap = job().snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["tool"], "subfinder");
        assert_eq!("cancelled".parse::<JobState>(), Ok(JobState::Cancelled));
        assert!("done".parse::<JobState>().is_err());
    }
}
