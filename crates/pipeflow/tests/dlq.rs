mod common;

use common::try_setup_db;
use serial_test::serial;

use pipeflow::jobs::{
    DlqError, DlqManager, JobLedger, JobStatus, NewJob, Stage, TransitionFields,
};

/// Walk a fresh job to dead_letter the way the dispatcher would.
async fn dead_letter_job(ledger: &JobLedger, dlq: &DlqManager, entity: &str) -> uuid::Uuid {
    let mut new_job = NewJob::new(entity, Stage::Transcription, serde_json::json!({"k": 1}));
    new_job.max_attempts = 1;
    let job_id = ledger.create(new_job).await.unwrap();

    for (from, to, fields) in [
        (
            JobStatus::Pending,
            JobStatus::Dispatched,
            TransitionFields::default(),
        ),
        (
            JobStatus::Dispatched,
            JobStatus::Running,
            TransitionFields::default(),
        ),
        (
            JobStatus::Running,
            JobStatus::Failed,
            TransitionFields {
                error_kind: Some("DEPENDENCY_DOWN".into()),
                error_message: Some("scripted".into()),
                ..Default::default()
            },
        ),
        (
            JobStatus::Failed,
            JobStatus::DeadLetter,
            TransitionFields {
                attempt_count: Some(1),
                ..Default::default()
            },
        ),
    ] {
        ledger.transition(job_id, from, to, fields).await.unwrap();
    }

    dlq.enqueue(job_id, "MAX_ATTEMPTS_EXCEEDED").await.unwrap();
    job_id
}

#[tokio::test]
#[serial]
async fn requeue_starts_a_fresh_attempt_chain() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());
    let dlq = DlqManager::new(pool.clone());

    let old_job_id = dead_letter_job(&ledger, &dlq, "vid-1").await;
    let entry = dlq.list(None, 10).await.unwrap().pop().unwrap();
    assert_eq!(entry.job_id, old_job_id);

    let new_job_id = dlq.requeue(entry.id, &ledger).await.unwrap();
    assert_ne!(new_job_id, old_job_id);

    let new_job = ledger.get(new_job_id).await.unwrap();
    assert_eq!(new_job.status, JobStatus::Pending);
    assert_eq!(new_job.attempt_count, 0);
    assert_eq!(new_job.stage, Stage::Transcription);
    assert_eq!(new_job.source_entity_id, "vid-1");
    assert_eq!(new_job.requeue_of_job_id, Some(old_job_id));

    // same dedupe key, and the old job stays dead_letter forever
    let old_job = ledger.get(old_job_id).await.unwrap();
    assert_eq!(old_job.dedupe_key, new_job.dedupe_key);
    assert_eq!(old_job.status, JobStatus::DeadLetter);

    let entry = dlq.get(entry.id).await.unwrap();
    assert_eq!(entry.requeue_count, 1);
}

#[tokio::test]
#[serial]
async fn requeue_while_a_live_successor_exists_is_rejected() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());
    let dlq = DlqManager::new(pool.clone());

    let _old = dead_letter_job(&ledger, &dlq, "vid-1").await;
    let entry = dlq.list(None, 10).await.unwrap().pop().unwrap();

    dlq.requeue(entry.id, &ledger).await.unwrap();

    // the first requeue's job is still live, so the key is taken
    let err = dlq.requeue(entry.id, &ledger).await.unwrap_err();
    assert!(
        matches!(err, DlqError::Ledger(ref inner) if inner.is_duplicate()),
        "got {err:?}"
    );
}

#[tokio::test]
#[serial]
async fn requeue_requires_a_terminal_job() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());
    let dlq = DlqManager::new(pool.clone());

    // a failed (non-terminal) job wrongly pushed at the DLQ
    let job_id = ledger
        .create(NewJob::new("vid-2", Stage::Ingestion, serde_json::json!({})))
        .await
        .unwrap();
    ledger
        .transition(
            job_id,
            JobStatus::Pending,
            JobStatus::Dispatched,
            TransitionFields::default(),
        )
        .await
        .unwrap();
    let entry = dlq.enqueue(job_id, "operator_push").await.unwrap();

    let err = dlq.requeue(entry.id, &ledger).await.unwrap_err();
    assert!(matches!(err, DlqError::NotTerminal { .. }), "got {err:?}");
}

#[tokio::test]
#[serial]
async fn first_failed_at_comes_from_the_transition_history() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());
    let dlq = DlqManager::new(pool.clone());

    let job_id = dead_letter_job(&ledger, &dlq, "vid-3").await;

    let entry = dlq.list(None, 10).await.unwrap().pop().unwrap();
    let first_failed: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(
        "SELECT MIN(recorded_at) FROM job_transitions WHERE job_id = $1 AND to_status = 'failed'",
    )
    .bind(job_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(entry.first_failed_at, first_failed);
}

#[tokio::test]
#[serial]
async fn purge_drops_old_entries_but_keeps_jobs() {
    let Some(pool) = try_setup_db().await else { return };
    let ledger = JobLedger::new(pool.clone());
    let dlq = DlqManager::new(pool.clone());

    let job_id = dead_letter_job(&ledger, &dlq, "vid-4").await;
    assert_eq!(dlq.list(None, 10).await.unwrap().len(), 1);

    // cutoff in the near future so DB/app clock skew cannot hide the entry
    let purged = dlq
        .purge(chrono::Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(dlq.list(None, 10).await.unwrap().is_empty());

    // the job itself is retained for audit
    let job = ledger.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
}
