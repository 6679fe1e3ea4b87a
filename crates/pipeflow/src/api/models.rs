use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus, Stage};

#[derive(Debug, Clone, Serialize)]
pub struct JobListItem {
    pub id: Uuid,
    pub source_entity_id: String,
    pub stage: Stage,
    pub status: JobStatus,

    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub cost_usd: Option<f64>,

    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobListItem {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            source_entity_id: job.source_entity_id,
            stage: job.stage,
            status: job.status,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            next_retry_at: job.next_retry_at,
            cost_usd: job.cost_usd,
            last_error_kind: job.last_error_kind,
            last_error_message: job.last_error_message,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
