use std::sync::Arc;

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::events::{Event, EventType, NotificationSink};
use crate::jobs::dispatcher::{DispatchResult, Dispatcher};
use crate::jobs::error::{ErrorKind, StageError};
use crate::jobs::ledger::JobLedger;

/// Periodic backstop for crashed or hung workers: one idempotent sweep over
/// the ledger instead of a timer per in-flight job. Reclaimed jobs take the
/// normal failure path, so the attempt is consumed exactly once.
#[derive(Clone)]
pub struct StuckJobScanner {
    ledger: JobLedger,
    dispatcher: Dispatcher,
    sink: Arc<dyn NotificationSink>,
}

impl StuckJobScanner {
    pub fn new(ledger: JobLedger, dispatcher: Dispatcher, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            ledger,
            dispatcher,
            sink,
        }
    }

    /// Reclassify in-flight jobs dispatched more than `stale_after_secs` ago
    /// as failed. Lost CAS races mean the original worker finished after all;
    /// those are skipped. Returns the ids actually reclaimed.
    pub async fn scan(&self, stale_after_secs: i64) -> anyhow::Result<Vec<Uuid>> {
        let stale = self.ledger.stale_in_flight(stale_after_secs).await?;
        let mut reclaimed = Vec::new();

        for job in stale {
            let job_id = job.id;
            let stage = job.stage;
            let from = job.status;
            let err = StageError::new(
                ErrorKind::StuckTimeout,
                format!("no terminal transition within {stale_after_secs}s of dispatch"),
            );

            match self.dispatcher.fail(job, from, err).await {
                Ok(DispatchResult::LostRace { .. }) => {}
                Ok(outcome) => {
                    self.sink
                        .notify(Event::new(
                            EventType::JobReclaimed,
                            Some(job_id),
                            json!({
                                "stage": stage.as_str(),
                                "stalled_in": from.as_str(),
                                "stale_after_secs": stale_after_secs,
                                "outcome": format!("{outcome:?}"),
                            }),
                        ))
                        .await;
                    reclaimed.push(job_id);
                }
                // One stuck job must not halt the sweep.
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to reclaim stuck job"),
            }
        }

        Ok(reclaimed)
    }
}
