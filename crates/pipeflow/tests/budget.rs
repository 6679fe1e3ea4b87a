mod common;

use common::try_setup_db;
use serial_test::serial;

use pipeflow::jobs::{Admission, BudgetGuard, BudgetLevel, BudgetLimits};

fn limits(default: f64) -> BudgetLimits {
    BudgetLimits {
        default_limit_usd: default,
        per_class_usd: Default::default(),
    }
}

#[tokio::test]
#[serial]
async fn reserve_denies_what_would_overshoot_the_limit() {
    let Some(pool) = try_setup_db().await else { return };
    let guard = BudgetGuard::new(pool, limits(5.0));

    // committed 4.50 on the books
    assert!(guard
        .reserve("llm", 4.5)
        .await
        .unwrap()
        .is_approved());
    guard.commit("llm", None, 4.5, 4.5).await.unwrap();

    // 4.50 + 0.65 = 5.15 > 5.00
    match guard.reserve("llm", 0.65).await.unwrap() {
        Admission::Denied { reason } => assert!(reason.contains("5.00"), "reason: {reason}"),
        Admission::Approved => panic!("expected denial"),
    }

    // 4.50 + 0.40 = 4.90 <= 5.00
    assert!(guard.reserve("llm", 0.40).await.unwrap().is_approved());
}

#[tokio::test]
#[serial]
async fn concurrent_reserves_never_overshoot() {
    let Some(pool) = try_setup_db().await else { return };
    let guard = BudgetGuard::new(pool, limits(5.0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let guard = guard.clone();
        handles.push(tokio::spawn(
            async move { guard.reserve("llm", 1.0).await },
        ));
    }

    let mut approved = 0;
    for h in handles {
        if h.await.unwrap().unwrap().is_approved() {
            approved += 1;
        }
    }
    assert_eq!(approved, 5, "exactly the limit's worth of reservations");

    let status = guard.status("llm").await.unwrap();
    assert!(status.committed_usd + status.reserved_usd <= 5.0 + f64::EPSILON);
}

#[tokio::test]
#[serial]
async fn commit_replaces_the_reservation_with_actual_cost() {
    let Some(pool) = try_setup_db().await else { return };
    let guard = BudgetGuard::new(pool.clone(), limits(5.0));

    assert!(guard.reserve("transcription", 0.50).await.unwrap().is_approved());
    guard.commit("transcription", None, 0.50, 0.30).await.unwrap();

    let status = guard.status("transcription").await.unwrap();
    assert_eq!(status.reserved_usd, 0.0);
    assert_eq!(status.committed_usd, 0.30);

    // the audit trail is append-only: one entry per commit
    let entries: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM budget_entries WHERE resource_class = 'transcription'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(entries, 1);
}

#[tokio::test]
#[serial]
async fn release_frees_an_abandoned_reservation() {
    let Some(pool) = try_setup_db().await else { return };
    let guard = BudgetGuard::new(pool, limits(1.0));

    assert!(guard.reserve("scraping", 0.8).await.unwrap().is_approved());
    // the hold blocks further admissions...
    assert!(!guard.reserve("scraping", 0.8).await.unwrap().is_approved());

    guard.release("scraping", 0.8).await.unwrap();
    // ...and releasing it reopens the day
    assert!(guard.reserve("scraping", 0.8).await.unwrap().is_approved());
}

#[tokio::test]
#[serial]
async fn status_levels_track_usage() {
    let Some(pool) = try_setup_db().await else { return };
    let guard = BudgetGuard::new(pool, limits(1.0));

    assert_eq!(guard.status("llm").await.unwrap().level, BudgetLevel::Ok);

    assert!(guard.reserve("llm", 0.95).await.unwrap().is_approved());
    assert_eq!(
        guard.status("llm").await.unwrap().level,
        BudgetLevel::Warning
    );

    guard.commit("llm", None, 0.95, 1.0).await.unwrap();
    assert_eq!(
        guard.status("llm").await.unwrap().level,
        BudgetLevel::Exceeded
    );
}
