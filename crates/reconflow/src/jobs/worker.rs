use std::{sync::Arc, time::Duration};

use tempfile::TempPath;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{IngestStats, JobState};
use crate::{
    console::ConsoleBroadcaster,
    error::JobFailure,
    models::{JobId, TargetId, UpsertOutcome},
    parser::{LineParser, ToolParser},
    runner::{OutputStream, ProcessHandle},
    store::Store,
};

pub const REASON_CANCELLED: &str = "cancelled";
pub const REASON_TIMED_OUT: &str = "timed out";

/// Everything a running job needs besides its process.
pub struct JobContext {
    pub job_id: JobId,
    pub target_id: TargetId,
    pub tool: String,
    pub parser: ToolParser,
    pub store: Arc<dyn Store>,
    pub console: ConsoleBroadcaster,
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
    pub grace: Duration,
    /// Input list handed to the tool; removed when the job ends.
    pub input_file: Option<TempPath>,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub stats: IngestStats,
}

#[derive(Debug, Clone, Copy)]
enum StopCause {
    Cancelled,
    TimedOut,
}

impl StopCause {
    fn reason(self) -> &'static str {
        match self {
            StopCause::Cancelled => REASON_CANCELLED,
            StopCause::TimedOut => REASON_TIMED_OUT,
        }
    }
}

/// Drives one launched tool to completion: streams its lines to the console,
/// parses stdout into records and ingests them, and stops the process on
/// cancellation or timeout.
pub async fn run_job(mut process: ProcessHandle, mut ctx: JobContext) -> JobOutcome {
    let mut stats = IngestStats::default();
    let deadline = sleep(ctx.timeout.unwrap_or(Duration::MAX));
    tokio::pin!(deadline);
    let has_deadline = ctx.timeout.is_some();
    let cancel = ctx.cancel.clone();

    let mut stop = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Some(StopCause::Cancelled),
            _ = &mut deadline, if has_deadline => break Some(StopCause::TimedOut),
            line = process.next_line() => match line {
                Some((stream, text)) => ingest_line(&mut ctx, &mut stats, stream, text).await,
                None => break None,
            },
        }
    };

    // Pipes are closed but the process may linger.
    let mut exit = None;
    if stop.is_none() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => stop = Some(StopCause::Cancelled),
            _ = &mut deadline, if has_deadline => stop = Some(StopCause::TimedOut),
            status = process.wait() => exit = Some(status),
        }
    }

    let outcome = match stop {
        Some(cause) => {
            ctx.console
                .publish_control(ctx.job_id, format!("stopping: {}", cause.reason()));
            let code = match process.terminate(ctx.grace).await {
                Ok(code) => code,
                Err(e) => {
                    warn!(job_id = %ctx.job_id, tool = %ctx.tool, error = %e, "terminate failed");
                    None
                }
            };
            // Output read before teardown is still ingested.
            let drain_for = ctx.grace.max(Duration::from_secs(1));
            let drain = async {
                while let Some((stream, text)) = process.next_line().await {
                    ingest_line(&mut ctx, &mut stats, stream, text).await;
                }
            };
            if timeout(drain_for, drain).await.is_err() {
                debug!(job_id = %ctx.job_id, "output still open after termination, giving up");
            }
            JobOutcome {
                job_id: ctx.job_id,
                state: JobState::Cancelled,
                exit_code: code,
                reason: Some(cause.reason().to_string()),
                stats,
            }
        }
        None => {
            let (state, exit_code, failure) = match exit {
                Some(Ok(Some(0))) => (JobState::Succeeded, Some(0), None),
                Some(Ok(Some(code))) => (JobState::Failed, Some(code), Some(JobFailure::NonZeroExit(code))),
                Some(Ok(None)) => (JobState::Failed, None, Some(JobFailure::Signaled)),
                Some(Err(e)) => (JobState::Failed, None, Some(JobFailure::Output(e.to_string()))),
                None => (JobState::Failed, None, Some(JobFailure::Output("no exit status".into()))),
            };
            JobOutcome {
                job_id: ctx.job_id,
                state,
                exit_code,
                reason: failure.map(|f| f.to_string()),
                stats,
            }
        }
    };

    info!(
        job_id = %ctx.job_id,
        tool = %ctx.tool,
        state = %outcome.state,
        exit_code = ?outcome.exit_code,
        lines = stats.lines,
        inserted = stats.inserted,
        updated = stats.updated,
        warnings = stats.warnings,
        store_failures = stats.store_failures,
        "job finished"
    );
    drop(ctx.input_file.take());
    outcome
}

async fn ingest_line(ctx: &mut JobContext, stats: &mut IngestStats, stream: OutputStream, text: String) {
    stats.lines += 1;
    ctx.console.publish(ctx.job_id, stream.into(), text.as_str());
    if stream != OutputStream::Stdout {
        return;
    }

    let records = match ctx.parser.parse_line(&text) {
        Ok(records) => records,
        Err(warning) => {
            stats.warnings += 1;
            debug!(job_id = %ctx.job_id, tool = %ctx.tool, %warning, "line skipped");
            return;
        }
    };

    for record in records {
        stats.parsed += 1;
        match ctx.store.upsert(ctx.target_id, &ctx.tool, &record).await {
            Ok(UpsertOutcome::Inserted) => stats.inserted += 1,
            Ok(UpsertOutcome::Updated) => stats.updated += 1,
            Ok(UpsertOutcome::Unchanged) => stats.unchanged += 1,
            Err(e) => {
                stats.store_failures += 1;
                warn!(
                    job_id = %ctx.job_id,
                    tool = %ctx.tool,
                    key = %record.natural_key(),
                    error = %e,
                    "record ingestion failed"
                );
            }
        }
    }
}
