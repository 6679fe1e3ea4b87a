use uuid::Uuid;

use crate::jobs::model::JobStatus;

/// Ledger-level failures. `Duplicate` and `Conflict` are recoverable by the
/// caller: attach to the existing job, or re-read and retry your own logic.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("live job {existing_job_id} already holds dedupe key {dedupe_key}")]
    Duplicate {
        dedupe_key: String,
        existing_job_id: Uuid,
    },

    #[error("job {job_id} is {actual}, expected {expected}")]
    Conflict {
        job_id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, LedgerError::Duplicate { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dlq entry {0} not found")]
    EntryNotFound(Uuid),

    #[error("job {job_id} is {status}, requeue requires a terminal job")]
    NotTerminal { job_id: Uuid, status: JobStatus },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Closed set of executor failure kinds. The retry engine never inspects
/// these; they exist for audit rows, DLQ reasons, and operator guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    DependencyDown,
    BadPayload,
    UnsupportedStage,
    StuckTimeout,
    Unknown,
}

impl ErrorKind {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "RATE_LIMIT" => Self::RateLimit,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            "BAD_PAYLOAD" => Self::BadPayload,
            "UNSUPPORTED_STAGE" => Self::UnsupportedStage,
            "STUCK_TIMEOUT" => Self::StuckTimeout,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::UnsupportedStage => "UNSUPPORTED_STAGE",
            Self::StuckTimeout => "STUCK_TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

pub fn suggested_action(kind: &str) -> &'static str {
    match ErrorKind::from_str(kind) {
        ErrorKind::Timeout => {
            "Raise the stage timeout or shrink the work unit. Check downstream latency."
        }
        ErrorKind::RateLimit => {
            "Back off. Lower worker concurrency or raise the provider quota."
        }
        ErrorKind::DependencyDown => {
            "Retry later. Check the external service's status page and credentials."
        }
        ErrorKind::BadPayload => {
            "Will not succeed on retry. Fix the upstream stage's output or the payload schema."
        }
        ErrorKind::UnsupportedStage => {
            "No executor registered for this stage. Fix the worker's registry wiring."
        }
        ErrorKind::StuckTimeout => {
            "A worker crashed or hung mid-flight. Check worker logs around dispatched_at."
        }
        ErrorKind::Unknown => {
            "Inspect error_message and logs; add a kind mapping once understood."
        }
    }
}

/// Failure reported by a stage executor. `cost_usd` is whatever spend the
/// executor incurred before failing; it is committed against the budget even
/// though the attempt failed.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
    pub cost_usd: f64,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cost_usd: 0.0,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}
