mod common;

use common::{dispatcher_with, force_due, open_limits, registry_of, try_setup_db, StubExecutor};
use serial_test::serial;

use pipeflow::jobs::{
    BudgetLimits, DispatchResult, DlqManager, ErrorKind, JobLedger, JobStatus, NewJob, Stage,
};

#[tokio::test]
#[serial]
async fn three_failures_exhaust_into_the_dlq() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());
    let dispatcher = dispatcher_with(
        &pool,
        registry_of(StubExecutor::failing(0.01, ErrorKind::DependencyDown)),
        open_limits(),
    );

    let mut new_job = NewJob::new("vid-1", Stage::Transcription, serde_json::json!({}));
    new_job.max_attempts = 3;
    let job_id = ledger.create(new_job).await.unwrap();

    // attempts 1 and 2: failure -> back to pending with backoff
    for expected_attempts in 1..=2 {
        force_due(&pool, job_id).await;
        let job = ledger.claim_due(1).await.unwrap().pop().expect("claimable");
        assert_eq!(job.id, job_id);

        let outcome = dispatcher.dispatch(job).await.unwrap();
        assert!(
            matches!(outcome, DispatchResult::Retrying { .. }),
            "attempt {expected_attempts}: {outcome:?}"
        );

        let job = ledger.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, expected_attempts);
        assert!(job.next_retry_at.is_some());
        assert_eq!(job.last_error_kind.as_deref(), Some("DEPENDENCY_DOWN"));
    }

    // attempt 3: exhausted -> dead_letter
    force_due(&pool, job_id).await;
    let job = ledger.claim_due(1).await.unwrap().pop().expect("claimable");
    let outcome = dispatcher.dispatch(job).await.unwrap();
    assert!(matches!(outcome, DispatchResult::DeadLettered { .. }));

    let job = ledger.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempt_count, 3);
    assert!(job.terminal_at.is_some());

    // a fourth attempt is impossible: the job is terminal and unclaimable
    force_due(&pool, job_id).await;
    assert!(ledger.claim_due(10).await.unwrap().is_empty());

    let entries = DlqManager::new(pool.clone()).list(None, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, job_id);
    assert_eq!(entries[0].reason, "MAX_ATTEMPTS_EXCEEDED");
}

#[tokio::test]
#[serial]
async fn retry_backoff_grows_between_failures() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());
    let dispatcher = dispatcher_with(
        &pool,
        registry_of(StubExecutor::failing(0.0, ErrorKind::Timeout)),
        open_limits(),
    );

    let mut new_job = NewJob::new("vid-1", Stage::Summarization, serde_json::json!({}));
    new_job.max_attempts = 10;
    let job_id = ledger.create(new_job).await.unwrap();

    let mut delays = Vec::new();
    for _ in 0..2 {
        force_due(&pool, job_id).await;
        let job = ledger.claim_due(1).await.unwrap().pop().unwrap();
        let dispatched_at = chrono::Utc::now();
        dispatcher.dispatch(job).await.unwrap();

        let job = ledger.get(job_id).await.unwrap();
        let delay = job.next_retry_at.unwrap() - dispatched_at;
        delays.push(delay.num_milliseconds());
    }

    assert!(
        delays[1] >= delays[0],
        "backoff should not shrink: {delays:?}"
    );
}

#[tokio::test]
#[serial]
async fn budget_denial_defers_without_consuming_an_attempt() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());

    // a zero limit denies everything
    let dispatcher = dispatcher_with(
        &pool,
        registry_of(StubExecutor::succeeding(0.5, 0.5)),
        BudgetLimits {
            default_limit_usd: 0.0,
            per_class_usd: Default::default(),
        },
    );

    let job_id = ledger
        .create(NewJob::new("vid-1", Stage::Transcription, serde_json::json!({})))
        .await
        .unwrap();

    let job = ledger.claim_due(1).await.unwrap().pop().unwrap();
    let outcome = dispatcher.dispatch(job).await.unwrap();
    assert!(matches!(outcome, DispatchResult::BudgetDeferred { .. }));

    let job = ledger.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0, "denial must not consume an attempt");
    assert!(job.next_retry_at.is_some(), "deferred with a redispatch time");
    assert!(job.last_error_kind.is_none());
}

#[tokio::test]
#[serial]
async fn partial_cost_on_failure_is_committed() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());

    let dispatcher = dispatcher_with(
        &pool,
        registry_of(StubExecutor {
            estimate: 0.10,
            cost: 0.0,
            fail_kind: Some(ErrorKind::DependencyDown),
            cost_on_failure: 0.04,
        }),
        open_limits(),
    );

    let job_id = ledger
        .create(NewJob::new("vid-1", Stage::Summarization, serde_json::json!({})))
        .await
        .unwrap();
    let job = ledger.claim_due(1).await.unwrap().pop().unwrap();
    dispatcher.dispatch(job).await.unwrap();

    let (committed, reserved): (f64, f64) = sqlx::query_as(
        "SELECT committed_usd, reserved_usd FROM budget_days WHERE resource_class = 'llm'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(committed, 0.04, "partial spend lands in the ledger");
    assert_eq!(reserved, 0.0, "the reservation is gone");

    let job = ledger.get(job_id).await.unwrap();
    assert_eq!(job.cost_usd, Some(0.04));
}
