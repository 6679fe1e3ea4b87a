use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Events the core pushes toward an external alerting channel. The core only
/// emits the structured payload; formatting and delivery live outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BudgetWarning,
    BudgetExceeded,
    JobDeadLettered,
    JobReclaimed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub job_id: Option<Uuid>,
    pub details: Value,
}

impl Event {
    pub fn new(event_type: EventType, job_id: Option<Uuid>, details: Value) -> Self {
        Self {
            event_type,
            job_id,
            details,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: Event);
}

/// Default sink: structured log lines. Deployments that alert through a chat
/// channel or pager implement their own sink at the worker boundary.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, event: Event) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match event.event_type {
            EventType::BudgetExceeded | EventType::JobDeadLettered => {
                tracing::warn!(target: "pipeflow::events", %payload, "pipeline event");
            }
            EventType::BudgetWarning | EventType::JobReclaimed => {
                tracing::info!(target: "pipeflow::events", %payload, "pipeline event");
            }
        }
    }
}
