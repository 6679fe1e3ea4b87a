use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Raised when a TEXT column holds a value outside the closed enum set.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized {field} value: {value}")]
pub struct ParseEnumError {
    pub field: &'static str,
    pub value: String,
}

/// One phase of the content pipeline. A job's stage never changes after
/// creation; advancing the pipeline creates a new job for the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Transcription,
    Summarization,
    Ingestion,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Discovery,
        Stage::Transcription,
        Stage::Summarization,
        Stage::Ingestion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Transcription => "transcription",
            Stage::Summarization => "summarization",
            Stage::Ingestion => "ingestion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovery" => Some(Stage::Discovery),
            "transcription" => Some(Stage::Transcription),
            "summarization" => Some(Stage::Summarization),
            "ingestion" => Some(Stage::Ingestion),
            _ => None,
        }
    }

    /// The stage that consumes this stage's output, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Discovery => Some(Stage::Transcription),
            Stage::Transcription => Some(Stage::Summarization),
            Stage::Summarization => Some(Stage::Ingestion),
            Stage::Ingestion => None,
        }
    }

    /// Resource class charged for this stage's execution.
    pub fn resource_class(&self) -> &'static str {
        match self {
            Stage::Discovery => "scraping",
            Stage::Transcription => "transcription",
            Stage::Summarization => "llm",
            Stage::Ingestion => "knowledge_base",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Stage {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Stage::parse(&value).ok_or(ParseEnumError {
            field: "stage",
            value,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "dispatched" => Some(JobStatus::Dispatched),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "dead_letter" => Some(JobStatus::DeadLetter),
            _ => None,
        }
    }

    /// Terminal jobs are retained for audit and excluded from live dedupe.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLetter)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for JobStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        JobStatus::parse(&value).ok_or(ParseEnumError {
            field: "status",
            value,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub source_entity_id: String,
    #[sqlx(try_from = "String")]
    pub stage: Stage,
    pub dedupe_key: String,
    pub payload_json: Value,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,

    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub cost_usd: Option<f64>,

    pub requeue_of_job_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_entity_id: String,
    pub stage: Stage,
    pub payload_json: Value,
    pub max_attempts: i32,
    /// Set when this job is a DLQ requeue of a dead predecessor.
    pub requeue_of_job_id: Option<Uuid>,
}

impl NewJob {
    pub fn new(source_entity_id: impl Into<String>, stage: Stage, payload_json: Value) -> Self {
        Self {
            source_entity_id: source_entity_id.into(),
            stage,
            payload_json,
            max_attempts: 5,
            requeue_of_job_id: None,
        }
    }
}
