use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    jobs::JobSnapshot,
    models::{ScanId, ScanStatus, Scope, StageStatus, TargetId, TargetStatus},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageView {
    pub name: String,
    pub status: StageStatus,
    pub jobs: Vec<JobSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanView {
    pub id: ScanId,
    pub target_id: TargetId,
    pub target: String,
    pub pipeline: String,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageView>,
}

impl ScanView {
    pub fn jobs(&self) -> impl Iterator<Item = &JobSnapshot> {
        self.stages.iter().flat_map(|s| s.jobs.iter())
    }

    pub fn job_by_tool(&self, tool: &str) -> Option<&JobSnapshot> {
        self.jobs().find(|j| j.tool == tool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetView {
    pub id: TargetId,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    pub status: TargetStatus,
    pub active_jobs: usize,
}
