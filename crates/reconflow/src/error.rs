use std::io;

use thiserror::Error;

use crate::jobs::JobState;

/// The executable could not be started at all.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("executable not permitted: {0}")]
    PermissionDenied(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare input for {program}: {source}")]
    Input {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub fn from_spawn(program: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound(program.to_string()),
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program.to_string()),
            _ => LaunchError::Spawn {
                program: program.to_string(),
                source: err,
            },
        }
    }
}

/// Why a job ended in `Failed`.
#[derive(Error, Debug)]
pub enum JobFailure {
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("exited with status {0}")]
    NonZeroExit(i32),

    #[error("terminated by signal")]
    Signaled,

    #[error("input unavailable: {0}")]
    Input(String),

    #[error("output unreadable: {0}")]
    Output(String),
}

/// A single line of tool output that could not be turned into a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("skipped malformed line: {reason}")]
pub struct ParseWarning {
    pub reason: String,
}

impl ParseWarning {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Errors worth retrying: pool exhaustion, I/O hiccups and SQLite lock
    /// contention.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Io(_)) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                let message = db.message().to_ascii_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("target {0} already has an active scan")]
    Conflict(String),

    #[error("target {0} is outside the configured scope")]
    OutOfScope(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("target {0} still has active jobs")]
    TargetBusy(String),

    #[error("illegal job transition {from:?} -> {to:?}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
