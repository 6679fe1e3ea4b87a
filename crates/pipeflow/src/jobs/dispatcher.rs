use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::events::{Event, EventType, NotificationSink};
use crate::jobs::budget::{Admission, BudgetGuard, BudgetLevel};
use crate::jobs::dlq::DlqManager;
use crate::jobs::error::{ErrorKind, LedgerError, StageError};
use crate::jobs::ledger::{JobLedger, TransitionFields};
use crate::jobs::model::{Job, JobStatus, NewJob, Stage};
use crate::jobs::retry::{RetryDecision, RetryPolicy};

pub const DLQ_REASON_EXHAUSTED: &str = "MAX_ATTEMPTS_EXCEEDED";

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Successful stage execution. `cost_usd` is the spend actually incurred,
/// which may differ from the pre-dispatch estimate.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub cost_usd: f64,
}

/// The capability every stage collaborator implements. Executors must be
/// idempotent at their own boundary: a retried job may reach them twice.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Cost estimate used to reserve budget before any spend occurs.
    fn estimated_cost(&self, job: &Job) -> f64;

    async fn execute(&self, job: &Job) -> Result<ExecutionReport, StageError>;
}

#[derive(Clone)]
struct ExecutorEntry {
    executor: Arc<dyn StageExecutor>,
    timeout: Duration,
}

/// Executors keyed by stage, so the dispatcher needs no per-stage branching.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    entries: HashMap<Stage, ExecutorEntry>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, executor: Arc<dyn StageExecutor>) {
        self.register_with_timeout(stage, executor, DEFAULT_STAGE_TIMEOUT);
    }

    pub fn register_with_timeout(
        &mut self,
        stage: Stage,
        executor: Arc<dyn StageExecutor>,
        timeout: Duration,
    ) {
        self.entries.insert(stage, ExecutorEntry { executor, timeout });
    }

    fn entry_for(&self, stage: Stage) -> Option<ExecutorEntry> {
        self.entries.get(&stage).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    Succeeded {
        job_id: Uuid,
        next_job_id: Option<Uuid>,
    },
    Retrying {
        job_id: Uuid,
        next_retry_at: chrono::DateTime<Utc>,
    },
    DeadLettered {
        job_id: Uuid,
    },
    /// Budget denied: back to pending with a short fixed delay, no attempt
    /// consumed.
    BudgetDeferred {
        job_id: Uuid,
    },
    /// Another actor moved the job first (operator dead-letter, concurrent
    /// worker). Nothing to do; the ledger state that won stands.
    LostRace {
        job_id: Uuid,
    },
}

/// Routing and bookkeeping only: look up the executor, gate on budget, run
/// under the stage timeout, settle cost and status, then either advance the
/// pipeline or hand the failure to the retry engine.
#[derive(Clone)]
pub struct Dispatcher {
    ledger: JobLedger,
    budget: BudgetGuard,
    retry: RetryPolicy,
    dlq: DlqManager,
    registry: Arc<ExecutorRegistry>,
    sink: Arc<dyn NotificationSink>,
    budget_defer_seconds: i64,
}

impl Dispatcher {
    pub fn new(
        ledger: JobLedger,
        budget: BudgetGuard,
        retry: RetryPolicy,
        dlq: DlqManager,
        registry: Arc<ExecutorRegistry>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            ledger,
            budget,
            retry,
            dlq,
            registry,
            sink,
            budget_defer_seconds: 60,
        }
    }

    pub fn with_budget_defer_seconds(mut self, secs: i64) -> Self {
        self.budget_defer_seconds = secs;
        self
    }

    /// Execute one claimed job (status `dispatched`) end to end.
    pub async fn dispatch(&self, job: Job) -> anyhow::Result<DispatchResult> {
        let Some(entry) = self.registry.entry_for(job.stage) else {
            let err = StageError::new(
                ErrorKind::UnsupportedStage,
                format!("no executor registered for stage {}", job.stage),
            );
            return self.fail(job, JobStatus::Dispatched, err).await;
        };

        let class = job.stage.resource_class();
        let estimate = entry.executor.estimated_cost(&job);

        match self.budget.reserve(class, estimate).await? {
            Admission::Approved => {}
            Admission::Denied { reason } => {
                return self.defer_for_budget(job, class, reason).await;
            }
        }

        let job = match self
            .ledger
            .transition(
                job.id,
                JobStatus::Dispatched,
                JobStatus::Running,
                TransitionFields::default(),
            )
            .await
        {
            Ok(j) => j,
            Err(LedgerError::Conflict { .. }) => {
                self.budget.release(class, estimate).await?;
                return Ok(DispatchResult::LostRace { job_id: job.id });
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match tokio::time::timeout(entry.timeout, entry.executor.execute(&job)).await
        {
            Ok(res) => res,
            Err(_) => Err(StageError::new(
                ErrorKind::Timeout,
                format!("stage timed out after {}s", entry.timeout.as_secs()),
            )),
        };

        match outcome {
            Ok(report) => {
                self.budget
                    .commit(class, Some(job.id), estimate, report.cost_usd)
                    .await?;
                self.emit_budget_level(class).await?;

                let fields = TransitionFields {
                    cost_usd: Some(report.cost_usd),
                    ..Default::default()
                };
                match self
                    .ledger
                    .transition(job.id, JobStatus::Running, JobStatus::Succeeded, fields)
                    .await
                {
                    Ok(done) => {
                        let next_job_id = self.advance(&done).await?;
                        Ok(DispatchResult::Succeeded {
                            job_id: done.id,
                            next_job_id,
                        })
                    }
                    // Dead-lettered by an operator mid-flight: the terminal
                    // status wins, the committed cost stands.
                    Err(LedgerError::Conflict { .. }) => {
                        Ok(DispatchResult::LostRace { job_id: job.id })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(err) => {
                if err.cost_usd > 0.0 {
                    self.budget
                        .commit(class, Some(job.id), estimate, err.cost_usd)
                        .await?;
                } else {
                    self.budget.release(class, estimate).await?;
                }
                self.emit_budget_level(class).await?;
                self.fail(job, JobStatus::Running, err).await
            }
        }
    }

    async fn defer_for_budget(
        &self,
        job: Job,
        class: &str,
        reason: String,
    ) -> anyhow::Result<DispatchResult> {
        let fields = TransitionFields {
            next_retry_at: Some(Some(
                Utc::now() + chrono::Duration::seconds(self.budget_defer_seconds),
            )),
            ..Default::default()
        };
        match self
            .ledger
            .transition(job.id, JobStatus::Dispatched, JobStatus::Pending, fields)
            .await
        {
            Ok(_) => {}
            Err(LedgerError::Conflict { .. }) => {
                return Ok(DispatchResult::LostRace { job_id: job.id });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(job_id = %job.id, %class, %reason, "budget denied, job deferred");
        self.emit_budget_level(class).await?;
        Ok(DispatchResult::BudgetDeferred { job_id: job.id })
    }

    /// Record a failed attempt and apply the retry decision: back to pending
    /// with backoff, or dead-letter when attempts are spent.
    pub async fn fail(
        &self,
        job: Job,
        from: JobStatus,
        err: StageError,
    ) -> anyhow::Result<DispatchResult> {
        let fields = TransitionFields {
            error_kind: Some(err.kind.as_str().to_string()),
            error_message: Some(err.message.clone()),
            cost_usd: (err.cost_usd > 0.0).then_some(err.cost_usd),
            ..Default::default()
        };
        let job = match self
            .ledger
            .transition(job.id, from, JobStatus::Failed, fields)
            .await
        {
            Ok(j) => j,
            Err(LedgerError::Conflict { .. }) => {
                return Ok(DispatchResult::LostRace { job_id: job.id });
            }
            Err(e) => return Err(e.into()),
        };

        self.settle_failure(job).await
    }

    /// Retry-or-DLQ for a job already in `failed`. The stuck-job scanner
    /// funnels reclaimed jobs through here as well.
    pub async fn settle_failure(&self, job: Job) -> anyhow::Result<DispatchResult> {
        match self.retry.decide(&job) {
            RetryDecision::ScheduleRetry {
                attempt_count,
                next_retry_at,
            } => {
                let fields = TransitionFields {
                    attempt_count: Some(attempt_count),
                    next_retry_at: Some(Some(next_retry_at)),
                    ..Default::default()
                };
                match self
                    .ledger
                    .transition(job.id, JobStatus::Failed, JobStatus::Pending, fields)
                    .await
                {
                    Ok(_) => Ok(DispatchResult::Retrying {
                        job_id: job.id,
                        next_retry_at,
                    }),
                    Err(LedgerError::Conflict { .. }) => {
                        Ok(DispatchResult::LostRace { job_id: job.id })
                    }
                    Err(e) => Err(e.into()),
                }
            }
            RetryDecision::Exhausted { attempt_count } => {
                let fields = TransitionFields {
                    attempt_count: Some(attempt_count),
                    ..Default::default()
                };
                let job = match self
                    .ledger
                    .transition(job.id, JobStatus::Failed, JobStatus::DeadLetter, fields)
                    .await
                {
                    Ok(j) => j,
                    Err(LedgerError::Conflict { .. }) => {
                        return Ok(DispatchResult::LostRace { job_id: job.id });
                    }
                    Err(e) => return Err(e.into()),
                };

                self.dlq.enqueue(job.id, DLQ_REASON_EXHAUSTED).await?;
                self.sink
                    .notify(Event::new(
                        EventType::JobDeadLettered,
                        Some(job.id),
                        json!({
                            "stage": job.stage.as_str(),
                            "source_entity_id": job.source_entity_id,
                            "attempt_count": job.attempt_count,
                            "last_error_kind": job.last_error_kind,
                            "last_error_message": job.last_error_message,
                        }),
                    ))
                    .await;
                Ok(DispatchResult::DeadLettered { job_id: job.id })
            }
        }
    }

    /// A finished stage creates the next stage's job for the same entity.
    /// A live duplicate means someone already advanced the pipeline; attach.
    async fn advance(&self, done: &Job) -> anyhow::Result<Option<Uuid>> {
        let Some(next_stage) = done.stage.next() else {
            return Ok(None);
        };

        let (next_id, created) = self
            .ledger
            .create_or_attach(NewJob {
                source_entity_id: done.source_entity_id.clone(),
                stage: next_stage,
                payload_json: done.payload_json.clone(),
                max_attempts: done.max_attempts,
                requeue_of_job_id: None,
            })
            .await?;

        debug!(
            job_id = %done.id,
            next_job_id = %next_id,
            next_stage = %next_stage,
            created,
            "pipeline advanced"
        );
        Ok(Some(next_id))
    }

    async fn emit_budget_level(&self, class: &str) -> anyhow::Result<()> {
        let status = self.budget.status(class).await?;
        let event_type = match status.level {
            BudgetLevel::Warning => EventType::BudgetWarning,
            BudgetLevel::Exceeded => EventType::BudgetExceeded,
            BudgetLevel::Ok | BudgetLevel::Caution => return Ok(()),
        };
        self.sink
            .notify(Event::new(
                event_type,
                None,
                serde_json::to_value(&status).unwrap_or_default(),
            ))
            .await;
        Ok(())
    }
}
