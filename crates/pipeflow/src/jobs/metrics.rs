use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::jobs::model::Stage;

#[derive(Debug, Serialize)]
pub struct StageMetrics {
    pub at: DateTime<Utc>,
    pub stage: String,

    /// Pending jobs whose retry time (if any) has passed.
    pub runnable_depth: i64,
    pub in_flight: i64,

    // last 60s window
    pub succeeded_last_60s: i64,
    pub failed_last_60s: i64,

    pub dead_letter_total: i64,
}

#[derive(Clone)]
pub struct MetricsRepo {
    pool: PgPool,
}

impl MetricsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn snapshot_all(&self) -> anyhow::Result<Vec<StageMetrics>> {
        let mut out = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            out.push(self.snapshot_for_stage(stage).await?);
        }
        Ok(out)
    }

    pub async fn snapshot_for_stage(&self, stage: Stage) -> anyhow::Result<StageMetrics> {
        let runnable_depth: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE stage = $1
              AND status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= now())
            "#,
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;

        let in_flight: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE stage = $1 AND status IN ('dispatched', 'running')
            "#,
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;

        let succeeded_last_60s: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE stage = $1
              AND status = 'succeeded'
              AND updated_at >= now() - interval '60 seconds'
            "#,
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;

        let failed_last_60s: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE stage = $1
              AND status IN ('failed', 'dead_letter')
              AND updated_at >= now() - interval '60 seconds'
            "#,
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;

        let dead_letter_total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE stage = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(StageMetrics {
            at: Utc::now(),
            stage: stage.as_str().to_string(),
            runnable_depth,
            in_flight,
            succeeded_last_60s,
            failed_last_60s,
            dead_letter_total,
        })
    }

    /// Pipeline-wide counters for the Prometheus endpoint:
    /// (pending, in_flight, succeeded_last_60s, failed_or_dead_last_60s).
    pub async fn totals(&self) -> anyhow::Result<(i64, i64, i64, i64)> {
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;

        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('dispatched', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;

        let succeeded_last_60s: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE status = 'succeeded'
              AND updated_at >= now() - interval '60 seconds'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let failed_last_60s: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE status IN ('failed', 'dead_letter')
              AND updated_at >= now() - interval '60 seconds'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((pending, in_flight, succeeded_last_60s, failed_last_60s))
    }
}
