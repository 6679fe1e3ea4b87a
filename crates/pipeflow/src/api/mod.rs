use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::models::JobListItem;
use crate::jobs::budget::{BudgetGuard, BudgetStatus};
use crate::jobs::dlq::{cutoff_days, DlqListItem, DlqManager};
use crate::jobs::error::{DlqError, LedgerError};
use crate::jobs::ledger::{JobFilter, JobLedger, TransitionRow};
use crate::jobs::metrics::{MetricsRepo, StageMetrics};
use crate::jobs::model::{Job, JobStatus, NewJob, Stage};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub ledger: JobLedger,
    pub dlq: DlqManager,
    pub budget: BudgetGuard,
    pub metrics: MetricsRepo,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Jobs
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/timeline", get(get_timeline))
        // DLQ
        .route("/dlq", get(list_dlq))
        .route("/dlq/:id/requeue", post(requeue_dlq))
        .route("/dlq/purge", post(purge_dlq))
        // Budget + metrics
        .route("/budget", get(budget_status))
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

fn internal_err(e: anyhow::Error) -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {e}"),
    )
}

fn ledger_err(e: LedgerError) -> (StatusCode, String) {
    match e {
        LedgerError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        LedgerError::Duplicate { .. } | LedgerError::Conflict { .. } => {
            (StatusCode::CONFLICT, e.to_string())
        }
        other => internal_err(other.into()),
    }
}

fn dlq_err(e: DlqError) -> (StatusCode, String) {
    match e {
        DlqError::EntryNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        DlqError::NotTerminal { .. } => (StatusCode::CONFLICT, e.to_string()),
        DlqError::Ledger(inner) => ledger_err(inner),
        other => internal_err(other.into()),
    }
}

// ----------------------------
// Jobs
// ----------------------------

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub stage: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub cursor_created_at: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<JobListItem>,
    pub next_cursor_created_at: Option<DateTime<Utc>>,
    pub next_cursor_id: Option<Uuid>,
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, (StatusCode, String)> {
    let stage = match q.stage.as_deref() {
        Some(s) => Some(
            Stage::parse(s).ok_or((StatusCode::BAD_REQUEST, format!("unknown stage: {s}")))?,
        ),
        None => None,
    };
    let status = match q.status.as_deref() {
        Some(s) => Some(
            JobStatus::parse(s).ok_or((StatusCode::BAD_REQUEST, format!("unknown status: {s}")))?,
        ),
        None => None,
    };

    let jobs = state
        .ledger
        .query(&JobFilter {
            stage,
            status,
            limit: q.limit.unwrap_or(100),
            cursor_created_at: q.cursor_created_at,
            cursor_id: q.cursor_id,
        })
        .await
        .map_err(ledger_err)?;

    let (next_cursor_created_at, next_cursor_id) = jobs
        .last()
        .map(|j| (Some(j.created_at), Some(j.id)))
        .unwrap_or((None, None));

    Ok(Json(ListJobsResponse {
        items: jobs.into_iter().map(JobListItem::from).collect(),
        next_cursor_created_at,
        next_cursor_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub source_entity_id: String,
    /// Defaults to `discovery`, the pipeline's external entry point.
    pub stage: Option<String>,
    pub payload_json: Option<Value>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    /// False when a live job already held the dedupe key and the caller was
    /// attached to it.
    pub created: bool,
}

pub async fn create_job(
    State(state): State<ApiState>,
    Json(body): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, (StatusCode, String)> {
    if body.source_entity_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "source_entity_id is required".into()));
    }

    let stage = match body.stage.as_deref() {
        Some(s) => {
            Stage::parse(s).ok_or((StatusCode::BAD_REQUEST, format!("unknown stage: {s}")))?
        }
        None => Stage::Discovery,
    };

    let max_attempts = body.max_attempts.unwrap_or(5);
    if max_attempts <= 0 {
        return Err((StatusCode::BAD_REQUEST, "max_attempts must be > 0".into()));
    }

    let (job_id, created) = state
        .ledger
        .create_or_attach(NewJob {
            source_entity_id: body.source_entity_id,
            stage,
            payload_json: body.payload_json.unwrap_or_else(|| Value::Object(Default::default())),
            max_attempts,
            requeue_of_job_id: None,
        })
        .await
        .map_err(ledger_err)?;

    Ok(Json(CreateJobResponse { job_id, created }))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, String)> {
    let job = state.ledger.get(id).await.map_err(ledger_err)?;
    Ok(Json(job))
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub suggested_action: Option<String>,
    pub transitions: Vec<TransitionRow>,
}

pub async fn get_timeline(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TimelineResponse>, (StatusCode, String)> {
    let job = state.ledger.get(id).await.map_err(ledger_err)?;
    let transitions = state.ledger.timeline(id).await.map_err(ledger_err)?;

    let suggested_action = job
        .last_error_kind
        .as_deref()
        .map(|kind| crate::jobs::error::suggested_action(kind).to_string());

    Ok(Json(TimelineResponse {
        job_id: id,
        status: job.status,
        last_error_kind: job.last_error_kind,
        last_error_message: job.last_error_message,
        suggested_action,
        transitions,
    }))
}

// ----------------------------
// DLQ
// ----------------------------

#[derive(Debug, Deserialize)]
pub struct ListDlqQuery {
    pub stage: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_dlq(
    State(state): State<ApiState>,
    Query(q): Query<ListDlqQuery>,
) -> Result<Json<Vec<DlqListItem>>, (StatusCode, String)> {
    let stage = match q.stage.as_deref() {
        Some(s) => Some(
            Stage::parse(s).ok_or((StatusCode::BAD_REQUEST, format!("unknown stage: {s}")))?,
        ),
        None => None,
    };

    let rows = state
        .dlq
        .list(stage, q.limit.unwrap_or(100))
        .await
        .map_err(dlq_err)?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub new_job_id: Uuid,
    pub requeue_of_job_id: Uuid,
}

pub async fn requeue_dlq(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RequeueResponse>, (StatusCode, String)> {
    let entry = state.dlq.get(id).await.map_err(dlq_err)?;
    let new_job_id = state.dlq.requeue(id, &state.ledger).await.map_err(dlq_err)?;
    Ok(Json(RequeueResponse {
        new_job_id,
        requeue_of_job_id: entry.job_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub older_than_days: i64,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

pub async fn purge_dlq(
    State(state): State<ApiState>,
    Json(body): Json<PurgeRequest>,
) -> Result<Json<PurgeResponse>, (StatusCode, String)> {
    if body.older_than_days < 0 {
        return Err((StatusCode::BAD_REQUEST, "older_than_days must be >= 0".into()));
    }
    let purged = state
        .dlq
        .purge(cutoff_days(body.older_than_days))
        .await
        .map_err(dlq_err)?;
    Ok(Json(PurgeResponse { purged }))
}

// ----------------------------
// Budget + metrics
// ----------------------------

#[derive(Debug, Serialize)]
pub struct BudgetResponse {
    pub now_utc: DateTime<Utc>,
    pub classes: Vec<BudgetStatus>,
}

pub async fn budget_status(
    State(state): State<ApiState>,
) -> Result<Json<BudgetResponse>, (StatusCode, String)> {
    let classes = state
        .budget
        .summary()
        .await
        .map_err(|e| internal_err(e.into()))?;
    Ok(Json(BudgetResponse {
        now_utc: Utc::now(),
        classes,
    }))
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub now_utc: DateTime<Utc>,
    pub stages: Vec<StageMetrics>,
}

pub async fn metrics(
    State(state): State<ApiState>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    let stages = state.metrics.snapshot_all().await.map_err(internal_err)?;
    Ok(Json(MetricsResponse {
        now_utc: Utc::now(),
        stages,
    }))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> impl IntoResponse {
    // Minimal Prometheus text format (no extra crate needed).
    match state.metrics.totals().await {
        Ok((pending, in_flight, succeeded_last_60s, failed_last_60s)) => {
            let body = format!(
                concat!(
                    "# HELP pipeflow_pending_jobs Number of pending jobs\n",
                    "# TYPE pipeflow_pending_jobs gauge\n",
                    "pipeflow_pending_jobs {}\n",
                    "# HELP pipeflow_in_flight_jobs Number of dispatched or running jobs\n",
                    "# TYPE pipeflow_in_flight_jobs gauge\n",
                    "pipeflow_in_flight_jobs {}\n",
                    "# HELP pipeflow_jobs_succeeded_last_60s Jobs succeeded in last 60s\n",
                    "# TYPE pipeflow_jobs_succeeded_last_60s gauge\n",
                    "pipeflow_jobs_succeeded_last_60s {}\n",
                    "# HELP pipeflow_jobs_failed_last_60s Jobs failed or dead-lettered in last 60s\n",
                    "# TYPE pipeflow_jobs_failed_last_60s gauge\n",
                    "pipeflow_jobs_failed_last_60s {}\n"
                ),
                pending, in_flight, succeeded_last_60s, failed_last_60s
            );
            (StatusCode::OK, body).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
