use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::{
    console::ConsoleSubscription,
    error::OrchestratorError,
    models::{JobId, RecordFilter, RecordKind, ScanId, StoredRecord, TargetId},
    orchestrator::{Orchestrator, ScanOptions},
    pipeline::{PipelineDefinition, StageDefinition},
};

const DEFAULT_PIPELINE: &str = "full";
const INLINE_PIPELINE: &str = "custom";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/scans", post(create_scan))
        .route("/api/scans/{id}", get(get_scan))
        .route("/api/scans/{id}/jobs", get(list_scan_jobs))
        .route("/api/scans/{id}/cancel", post(cancel_scan))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/console", get(job_console))
        .route("/api/targets", get(list_targets))
        .route("/api/targets/{id}", delete(purge_target))
        .route("/api/targets/{id}/counts", get(target_counts))
        .route("/api/inventory", get(list_inventory))
        .route("/api/pipelines", get(list_pipelines))
        .route("/api/export/{format}", get(export))
        .route("/api/wordlists", get(list_wordlists))
        .with_state(state)
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::Conflict(_)
            | OrchestratorError::TargetBusy(_)
            | OrchestratorError::IllegalTransition { .. } => StatusCode::CONFLICT,
            OrchestratorError::OutOfScope(_) => StatusCode::FORBIDDEN,
            OrchestratorError::InvalidTarget(_)
            | OrchestratorError::InvalidPipeline(_)
            | OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Store(e) => {
                error!(error = %e, "store error while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg.into() }))).into_response()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "service": "reconflow"}))
}

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    target: String,
    /// Name of a configured pipeline.
    #[serde(default)]
    pipeline: Option<String>,
    /// Inline stages; take precedence over `pipeline`.
    #[serde(default)]
    stages: Option<Vec<StageDefinition>>,
    /// File name from `/api/wordlists`.
    #[serde(default)]
    wordlist: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateScanResponse {
    pub scan_id: ScanId,
}

fn resolve_pipeline(
    orch: &Orchestrator,
    req: &CreateScanRequest,
) -> Result<PipelineDefinition, OrchestratorError> {
    if let Some(stages) = &req.stages {
        return Ok(PipelineDefinition {
            name: req.pipeline.clone().unwrap_or_else(|| INLINE_PIPELINE.to_string()),
            description: String::new(),
            stages: stages.clone(),
        });
    }
    let name = req.pipeline.as_deref().unwrap_or(DEFAULT_PIPELINE);
    orch.pipeline(name)
        .cloned()
        .ok_or_else(|| OrchestratorError::InvalidPipeline(format!("unknown pipeline {name:?}")))
}

pub async fn create_scan(
    State(state): State<AppState>,
    Json(req): Json<CreateScanRequest>,
) -> Result<Response, OrchestratorError> {
    let pipeline = resolve_pipeline(&state.orchestrator, &req)?;
    let options = ScanOptions {
        wordlist: req.wordlist.clone(),
    };
    let scan_id = state
        .orchestrator
        .submit_scan_with(&req.target, &pipeline, options)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateScanResponse { scan_id })).into_response())
}

pub async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<Response, OrchestratorError> {
    Ok(Json(state.orchestrator.scan_status(id).await?).into_response())
}

pub async fn list_scan_jobs(
    State(state): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<Response, OrchestratorError> {
    Ok(Json(state.orchestrator.jobs_for_scan(id).await?).into_response())
}

pub async fn cancel_scan(
    State(state): State<AppState>,
    Path(id): Path<ScanId>,
) -> Result<Response, OrchestratorError> {
    let cancelled = state.orchestrator.cancel_scan(id).await?;
    let body = json!({ "scan_id": id, "cancelled": cancelled });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Response, OrchestratorError> {
    Ok(Json(state.orchestrator.job(id).await?).into_response())
}

pub async fn list_targets(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.targets().await).into_response()
}

pub async fn target_counts(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
) -> Result<Response, OrchestratorError> {
    Ok(Json(state.orchestrator.inventory_counts(id).await?).into_response())
}

pub async fn purge_target(
    State(state): State<AppState>,
    Path(id): Path<TargetId>,
) -> Result<Response, OrchestratorError> {
    let removed = state.orchestrator.purge_target(id).await?;
    Ok(Json(json!({ "target_id": id, "removed": removed })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct InventoryQuery {
    target: TargetId,
    kind: Option<String>,
    search: Option<String>,
    tag: Option<String>,
    limit: Option<u32>,
}

/// Records of one kind, or of every kind when `kind` is omitted.
pub async fn list_inventory(
    State(state): State<AppState>,
    Query(query): Query<InventoryQuery>,
) -> Result<Response, OrchestratorError> {
    let kinds = match query.kind.as_deref() {
        Some(raw) => match raw.parse::<RecordKind>() {
            Ok(kind) => vec![kind],
            Err(msg) => return Ok(bad_request(msg)),
        },
        None => RecordKind::ALL.to_vec(),
    };
    let filter = RecordFilter {
        search: query.search,
        tag: query.tag,
        limit: query.limit,
    };

    let mut records: Vec<StoredRecord> = Vec::new();
    for kind in kinds {
        records.extend(state.orchestrator.inventory(query.target, kind, &filter).await?);
    }
    Ok(Json(records).into_response())
}

pub async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<PipelineDefinition>> {
    Json(state.orchestrator.pipelines().into_iter().cloned().collect())
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    target: TargetId,
    tag: Option<String>,
}

/// Downloads a target's URLs, one per line. Without a tag the subdomains
/// are included.
pub async fn export(
    State(state): State<AppState>,
    Path(format): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, OrchestratorError> {
    if format != "txt" {
        return Ok(bad_request(format!("unsupported export format {format:?}")));
    }
    let tag = query.tag.as_deref().filter(|t| !t.is_empty());
    let (target, lines) = state.orchestrator.export(query.target, tag).await?;

    let name = match tag {
        Some(tag) => format!("{}_{}.txt", target.scope.primary(), tag),
        None => format!("{}_full_assets.txt", target.scope.primary()),
    };
    let disposition = format!("attachment; filename=\"{}\"", file_name_safe(&name));
    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (header::CONTENT_DISPOSITION, disposition),
    ];
    Ok((headers, lines.join("\n")).into_response())
}

fn file_name_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

pub async fn list_wordlists(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.orchestrator.wordlists().await {
        Ok(wordlists) => Json(json!({ "wordlists": wordlists })),
        Err(e) => {
            warn!(error = %e, "could not list wordlists");
            Json(json!({ "wordlists": [], "error": e.to_string() }))
        }
    }
}

/// Streams a job's console as JSON lines: history first, then live output.
/// The socket is closed once the job's console closes.
pub async fn job_console(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Response {
    match state.orchestrator.console().subscribe(id) {
        Some(subscription) => ws.on_upgrade(move |socket| stream_console(socket, subscription)),
        None => OrchestratorError::NotFound(format!("console for job {id}")).into_response(),
    }
}

async fn stream_console(socket: WebSocket, mut subscription: ConsoleSubscription) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            line = subscription.recv() => {
                let Some(line) = line else {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let payload = match serde_json::to_string(&line) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to encode console line");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "console websocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
