use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};

use pipeflow::events::TracingSink;
use pipeflow::jobs::{
    BudgetGuard, BudgetLimits, Dispatcher, DlqManager, ErrorKind, ExecutionReport,
    ExecutorRegistry, Job, JobLedger, RetryConfig, RetryPolicy, Stage, StageError, StageExecutor,
};

/// Connects to TEST_DATABASE_URL, migrates, and wipes state. Returns None
/// (and the caller skips) when no test database is configured, so the suite
/// stays green on checkouts without Postgres.
pub async fn try_setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping db-backed test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query(
        r#"
        TRUNCATE TABLE
            dlq_entries,
            budget_entries,
            budget_days,
            job_transitions,
            jobs
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate failed");

    Some(pool)
}

/// Deterministic backoff for tests: tiny delays, no jitter.
#[allow(dead_code)]
pub fn test_retry_config() -> RetryConfig {
    RetryConfig {
        base_seconds: 1,
        max_seconds: 2,
        jitter_pct: 0.0,
    }
}

/// Scripted executor: succeeds with a fixed cost, or always fails with the
/// given kind (reporting `cost_on_failure` as partial spend).
#[allow(dead_code)]
pub struct StubExecutor {
    pub estimate: f64,
    pub cost: f64,
    pub fail_kind: Option<ErrorKind>,
    pub cost_on_failure: f64,
}

#[allow(dead_code)]
impl StubExecutor {
    pub fn succeeding(estimate: f64, cost: f64) -> Self {
        Self {
            estimate,
            cost,
            fail_kind: None,
            cost_on_failure: 0.0,
        }
    }

    pub fn failing(estimate: f64, kind: ErrorKind) -> Self {
        Self {
            estimate,
            cost: 0.0,
            fail_kind: Some(kind),
            cost_on_failure: 0.0,
        }
    }
}

#[async_trait]
impl StageExecutor for StubExecutor {
    fn estimated_cost(&self, _job: &Job) -> f64 {
        self.estimate
    }

    async fn execute(&self, _job: &Job) -> Result<ExecutionReport, StageError> {
        match self.fail_kind {
            Some(kind) => {
                Err(StageError::new(kind, "scripted failure").with_cost(self.cost_on_failure))
            }
            None => Ok(ExecutionReport {
                cost_usd: self.cost,
            }),
        }
    }
}

/// Register the same executor for every stage.
#[allow(dead_code)]
pub fn registry_of(executor: StubExecutor) -> Arc<ExecutorRegistry> {
    let executor: Arc<dyn StageExecutor> = Arc::new(executor);
    let mut registry = ExecutorRegistry::new();
    for stage in Stage::ALL {
        registry.register(stage, executor.clone());
    }
    Arc::new(registry)
}

#[allow(dead_code)]
pub fn dispatcher_with(
    pool: &PgPool,
    registry: Arc<ExecutorRegistry>,
    limits: BudgetLimits,
) -> Dispatcher {
    Dispatcher::new(
        JobLedger::new(pool.clone()),
        BudgetGuard::new(pool.clone(), limits),
        RetryPolicy::new(test_retry_config()),
        DlqManager::new(pool.clone()),
        registry,
        Arc::new(TracingSink),
    )
}

#[allow(dead_code)]
pub fn open_limits() -> BudgetLimits {
    BudgetLimits {
        default_limit_usd: 1_000.0,
        per_class_usd: Default::default(),
    }
}

/// Make a job's pending retry due immediately.
#[allow(dead_code)]
pub async fn force_due(pool: &PgPool, job_id: uuid::Uuid) {
    sqlx::query("UPDATE jobs SET next_retry_at = now() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await
        .expect("force_due failed");
}
