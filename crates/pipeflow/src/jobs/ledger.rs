use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::jobs::dedupe::dedupe_key;
use crate::jobs::error::LedgerError;
use crate::jobs::model::{Job, JobStatus, NewJob, Stage};

/// Single source of truth for job state. No component caches status across
/// calls; every mutation goes through a conditional write here.
#[derive(Clone)]
pub struct JobLedger {
    pool: PgPool,
}

/// Optional fields applied alongside a CAS transition. `None` leaves the
/// stored value untouched; `next_retry_at` distinguishes "set" from "clear".
#[derive(Debug, Default, Clone)]
pub struct TransitionFields {
    pub attempt_count: Option<i32>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub stage: Option<Stage>,
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub cursor_created_at: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TransitionRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub from_status: String,
    pub to_status: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl JobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Create / attach
    // ----------------------------

    /// Insert a new pending job. At most one non-terminal job may hold a
    /// dedupe key; if one already does, fails with `Duplicate` carrying the
    /// live job's id so callers can attach to it instead.
    pub async fn create(&self, new: NewJob) -> Result<Uuid, LedgerError> {
        let key = dedupe_key(&new.source_entity_id, new.stage);

        // The live job may go terminal between our insert attempt and the
        // duplicate lookup; retry the insert once more before giving up.
        for _ in 0..3 {
            let inserted = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO jobs (source_entity_id, stage, dedupe_key, payload_json, status, max_attempts, requeue_of_job_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (dedupe_key) WHERE status NOT IN ('succeeded', 'dead_letter')
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(new.source_entity_id.trim())
            .bind(new.stage.as_str())
            .bind(&key)
            .bind(&new.payload_json)
            .bind(JobStatus::Pending.as_str())
            .bind(new.max_attempts)
            .bind(new.requeue_of_job_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                return Ok(id);
            }

            if let Some(existing) = self.live_job_for_key(&key).await? {
                return Err(LedgerError::Duplicate {
                    dedupe_key: key,
                    existing_job_id: existing,
                });
            }
        }

        Err(LedgerError::Db(sqlx::Error::RowNotFound))
    }

    /// `create`, but a duplicate attaches to the live job. Returns the job id
    /// and whether this call created it.
    pub async fn create_or_attach(&self, new: NewJob) -> Result<(Uuid, bool), LedgerError> {
        match self.create(new).await {
            Ok(id) => Ok((id, true)),
            Err(LedgerError::Duplicate {
                existing_job_id, ..
            }) => Ok((existing_job_id, false)),
            Err(e) => Err(e),
        }
    }

    pub async fn live_job_for_key(&self, key: &str) -> Result<Option<Uuid>, LedgerError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM jobs
            WHERE dedupe_key = $1
              AND status NOT IN ('succeeded', 'dead_letter')
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get(&self, job_id: Uuid) -> Result<Job, LedgerError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        job.ok_or(LedgerError::NotFound(job_id))
    }

    /// Cursor-paginated query, ordered by (created_at, id) DESC.
    pub async fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, LedgerError> {
        let limit = if filter.limit <= 0 {
            100
        } else {
            filter.limit.min(500)
        };

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM jobs WHERE TRUE");
        if let Some(stage) = filter.stage {
            qb.push(" AND stage = ").push_bind(stage.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let (Some(ca), Some(cid)) = (filter.cursor_created_at, filter.cursor_id) {
            qb.push(" AND (created_at, id) < (")
                .push_bind(ca)
                .push(", ")
                .push_bind(cid)
                .push(")");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit);

        let rows = qb.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    // ----------------------------
    // Compare-and-swap transition
    // ----------------------------

    /// Conditional status write: succeeds only if the stored status still
    /// matches `from`. Losing the race yields `Conflict` with the status that
    /// won, so at most one worker ever holds a job in flight. Every applied
    /// transition also appends a job_transitions audit row.
    ///
    /// `cost_usd` is write-once: a value already present is never replaced.
    pub async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let (set_retry, retry_value) = match fields.next_retry_at {
            Some(v) => (true, v),
            None => (false, None),
        };

        let updated = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs SET
                status = $3,
                attempt_count = COALESCE($4, attempt_count),
                last_error_kind = COALESCE($5, last_error_kind),
                last_error_message = COALESCE($6, last_error_message),
                next_retry_at = CASE WHEN $7 THEN $8 ELSE next_retry_at END,
                cost_usd = CASE WHEN cost_usd IS NULL THEN $9 ELSE cost_usd END,
                dispatched_at = CASE WHEN $3 = 'dispatched' THEN now() ELSE dispatched_at END,
                terminal_at = CASE
                    WHEN $3 IN ('succeeded', 'dead_letter') THEN now()
                    ELSE terminal_at
                END,
                updated_at = now()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(fields.attempt_count)
        .bind(&fields.error_kind)
        .bind(&fields.error_message)
        .bind(set_retry)
        .bind(retry_value)
        .bind(fields.cost_usd)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = updated else {
            drop(tx);
            let current = self.get(job_id).await?;
            return Err(LedgerError::Conflict {
                job_id,
                expected: from,
                actual: current.status,
            });
        };

        sqlx::query(
            r#"
            INSERT INTO job_transitions (job_id, from_status, to_status, error_kind, error_message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(&fields.error_kind)
        .bind(&fields.error_message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    // ----------------------------
    // Worker claims
    // ----------------------------

    /// Atomically move up to `limit` due pending jobs to `dispatched` and
    /// return them. SKIP LOCKED keeps concurrent workers from claiming the
    /// same rows; the status predicate is the CAS.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<Job>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let jobs = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs j SET
                status = 'dispatched',
                dispatched_at = now(),
                updated_at = now()
            FROM (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= now())
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ) due
            WHERE j.id = due.id
            RETURNING j.*
            "#,
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&mut *tx)
        .await?;

        if !jobs.is_empty() {
            let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
            sqlx::query(
                r#"
                INSERT INTO job_transitions (job_id, from_status, to_status)
                SELECT id, 'pending', 'dispatched' FROM unnest($1::uuid[]) AS t(id)
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(jobs)
    }

    /// In-flight jobs whose dispatch is older than `stale_after_secs`:
    /// candidates for the stuck-job scanner.
    pub async fn stale_in_flight(&self, stale_after_secs: i64) -> Result<Vec<Job>, LedgerError> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('dispatched', 'running')
              AND dispatched_at IS NOT NULL
              AND dispatched_at < now() - ($1::bigint * interval '1 second')
            ORDER BY dispatched_at ASC
            "#,
        )
        .bind(stale_after_secs)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    // ----------------------------
    // Audit
    // ----------------------------

    pub async fn timeline(&self, job_id: Uuid) -> Result<Vec<TransitionRow>, LedgerError> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT * FROM job_transitions
            WHERE job_id = $1
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
