use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use pipeflow::api;
use pipeflow::config::Config;
use pipeflow::db;
use pipeflow::events::TracingSink;
use pipeflow::jobs::{
    BudgetGuard, Dispatcher, DlqManager, JobLedger, MetricsRepo, RetryPolicy, StuckJobScanner,
};

mod executors;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env()?;

    info!(
        worker_id = %cfg.worker_id,
        claim_batch_size = cfg.claim_batch_size,
        poll_interval_ms = cfg.poll_interval_ms,
        stage_timeout_secs = cfg.stage_timeout_secs,
        scan_interval_secs = cfg.scan_interval_secs,
        stale_after_secs = cfg.stale_after_secs,
        admin_addr = %cfg.admin_addr.clone().unwrap_or_else(|| "disabled".to_string()),
        migrate_on_startup = cfg.migrate_on_startup,
        "pipeflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let ledger = JobLedger::new(pool.clone());
    let budget = BudgetGuard::new(pool.clone(), cfg.budget.clone());
    let dlq = DlqManager::new(pool.clone());
    let metrics = MetricsRepo::new(pool.clone());
    let retry = RetryPolicy::new(cfg.retry.clone());
    let sink = Arc::new(TracingSink);

    let registry = executors::build_registry(Duration::from_secs(cfg.stage_timeout_secs));
    let dispatcher = Dispatcher::new(
        ledger.clone(),
        budget.clone(),
        retry,
        dlq.clone(),
        registry,
        sink.clone(),
    )
    .with_budget_defer_seconds(cfg.budget_defer_secs);

    // ---- API task ----
    let api_addr = cfg.admin_addr.clone();
    let api_state = api::ApiState {
        ledger: ledger.clone(),
        dlq: dlq.clone(),
        budget: budget.clone(),
        metrics,
    };
    let app = api::router(api_state);

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Stuck-job sweep task ----
    let scanner_handle = {
        let scanner = StuckJobScanner::new(ledger.clone(), dispatcher.clone(), sink.clone());
        let stale_after_secs = cfg.stale_after_secs;
        let interval = Duration::from_secs(cfg.scan_interval_secs);
        tokio::spawn(async move {
            loop {
                match scanner.scan(stale_after_secs).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        warn!(count = reclaimed.len(), "reclaimed stuck jobs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "stuck-job sweep failed"),
                }
                tokio::time::sleep(interval).await;
            }
            #[allow(unreachable_code)]
            Ok::<(), anyhow::Error>(())
        })
    };

    // ---- Worker loop task ----
    let worker_handle = {
        let ledger = ledger.clone();
        let dispatcher = dispatcher.clone();
        let batch_size = cfg.claim_batch_size;
        let poll_interval = Duration::from_millis(cfg.poll_interval_ms);

        tokio::spawn(async move {
            loop {
                let batch = ledger.claim_due(batch_size).await?;

                if batch.is_empty() {
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }

                let mut join_set = tokio::task::JoinSet::new();
                for job in batch {
                    let dispatcher = dispatcher.clone();
                    join_set.spawn(async move {
                        let job_id = job.id;
                        let stage = job.stage;
                        match dispatcher.dispatch(job).await {
                            Ok(outcome) => {
                                tracing::debug!(%job_id, %stage, ?outcome, "dispatch settled");
                            }
                            // A single job's failure to settle must not take
                            // the loop down; the scanner backstops it.
                            Err(e) => error!(%job_id, %stage, error = %e, "dispatch error"),
                        }
                    });
                }

                while let Some(joined) = join_set.join_next().await {
                    if let Err(e) = joined {
                        error!(error = %e, "dispatch task panicked");
                    }
                }
            }

            #[allow(unreachable_code)]
            Ok::<(), anyhow::Error>(())
        })
    };

    tokio::select! {
        res = api_handle => res??,
        res = scanner_handle => res??,
        res = worker_handle => res??,
    }

    Ok(())
}
