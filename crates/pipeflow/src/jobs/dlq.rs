use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::error::DlqError;
use crate::jobs::ledger::JobLedger;
use crate::jobs::model::{JobStatus, NewJob, Stage};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub reason: String,
    pub first_failed_at: DateTime<Utc>,
    pub requeue_count: i32,
    pub created_at: DateTime<Utc>,
}

/// DLQ entry joined with the wrapped job, for operator listings.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct DlqListItem {
    pub id: Uuid,
    pub job_id: Uuid,
    pub reason: String,
    pub first_failed_at: DateTime<Utc>,
    pub requeue_count: i32,
    pub created_at: DateTime<Utc>,

    pub source_entity_id: String,
    pub stage: String,
    pub attempt_count: i32,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
}

/// Holds terminally-failed jobs for inspection. A job never re-enters active
/// processing from here; `requeue` is an audited action that starts a fresh
/// attempt chain under the same dedupe policy.
#[derive(Clone)]
pub struct DlqManager {
    pool: PgPool,
}

impl DlqManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a dead-lettered job. Idempotent per job: a second enqueue for
    /// the same job refreshes the reason and changes nothing else.
    /// `first_failed_at` comes from the earliest failed transition on record.
    pub async fn enqueue(&self, job_id: Uuid, reason: &str) -> Result<DlqEntry, DlqError> {
        let entry = sqlx::query_as::<_, DlqEntry>(
            r#"
            INSERT INTO dlq_entries (job_id, reason, first_failed_at)
            VALUES (
                $1,
                $2,
                COALESCE(
                    (SELECT MIN(recorded_at) FROM job_transitions
                     WHERE job_id = $1 AND to_status = 'failed'),
                    now()
                )
            )
            ON CONFLICT (job_id) DO UPDATE SET reason = EXCLUDED.reason
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        Ok(entry)
    }

    pub async fn get(&self, entry_id: Uuid) -> Result<DlqEntry, DlqError> {
        sqlx::query_as::<_, DlqEntry>("SELECT * FROM dlq_entries WHERE id = $1")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(DlqError::EntryNotFound(entry_id))
    }

    pub async fn list(
        &self,
        stage: Option<Stage>,
        limit: i64,
    ) -> Result<Vec<DlqListItem>, DlqError> {
        let limit = limit.clamp(1, 500);

        let rows = match stage {
            Some(stage) => {
                sqlx::query_as::<_, DlqListItem>(
                    r#"
                    SELECT
                        d.id, d.job_id, d.reason, d.first_failed_at, d.requeue_count, d.created_at,
                        j.source_entity_id, j.stage, j.attempt_count,
                        j.last_error_kind, j.last_error_message
                    FROM dlq_entries d
                    JOIN jobs j ON j.id = d.job_id
                    WHERE j.stage = $1
                    ORDER BY d.created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(stage.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DlqListItem>(
                    r#"
                    SELECT
                        d.id, d.job_id, d.reason, d.first_failed_at, d.requeue_count, d.created_at,
                        j.source_entity_id, j.stage, j.attempt_count,
                        j.last_error_kind, j.last_error_message
                    FROM dlq_entries d
                    JOIN jobs j ON j.id = d.job_id
                    ORDER BY d.created_at DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    /// Start a fresh attempt chain for a dead-lettered job: a new job with
    /// `attempt_count = 0` under the same dedupe policy, linked back through
    /// `requeue_of_job_id`. The prior job must be terminal and remains
    /// `dead_letter` permanently.
    pub async fn requeue(&self, entry_id: Uuid, ledger: &JobLedger) -> Result<Uuid, DlqError> {
        let entry = self.get(entry_id).await?;
        let job = ledger.get(entry.job_id).await?;

        if job.status != JobStatus::DeadLetter {
            return Err(DlqError::NotTerminal {
                job_id: job.id,
                status: job.status,
            });
        }

        let new_id = ledger
            .create(NewJob {
                source_entity_id: job.source_entity_id.clone(),
                stage: job.stage,
                payload_json: job.payload_json.clone(),
                max_attempts: job.max_attempts,
                requeue_of_job_id: Some(job.id),
            })
            .await?;

        sqlx::query("UPDATE dlq_entries SET requeue_count = requeue_count + 1 WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;

        Ok(new_id)
    }

    /// Drop DLQ entries older than the cutoff. The wrapped jobs stay in the
    /// ledger for audit.
    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, DlqError> {
        let res = sqlx::query("DELETE FROM dlq_entries WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

/// Convenience: compute a cutoff like "now - N days".
pub fn cutoff_days(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}
