use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use pipeflow::jobs::{
    ErrorKind, ExecutionReport, ExecutorRegistry, Job, Stage, StageError, StageExecutor,
};

// Demo executors. Each real deployment replaces these with clients for its
// scraper, transcription provider, summarizer, and knowledge base; the
// contract (estimate up front, report actual cost, be idempotent per job)
// stays the same.

fn parse_payload<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, StageError> {
    serde_json::from_value(job.payload_json.clone())
        .map_err(|e| StageError::new(ErrorKind::BadPayload, e.to_string()))
}

#[derive(Deserialize)]
struct DiscoveryPayload {
    channel_url: String,
}

struct DiscoveryExecutor;

#[async_trait]
impl StageExecutor for DiscoveryExecutor {
    fn estimated_cost(&self, _job: &Job) -> f64 {
        0.0
    }

    async fn execute(&self, job: &Job) -> Result<ExecutionReport, StageError> {
        let payload: DiscoveryPayload = parse_payload(job)?;
        tracing::debug!(job_id = %job.id, url = %payload.channel_url, "scraping listing");
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(ExecutionReport { cost_usd: 0.0 })
    }
}

struct TranscriptionExecutor;

#[async_trait]
impl StageExecutor for TranscriptionExecutor {
    fn estimated_cost(&self, _job: &Job) -> f64 {
        0.12
    }

    async fn execute(&self, job: &Job) -> Result<ExecutionReport, StageError> {
        tracing::debug!(job_id = %job.id, entity = %job.source_entity_id, "transcribing");
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(ExecutionReport { cost_usd: 0.11 })
    }
}

struct SummarizationExecutor;

#[async_trait]
impl StageExecutor for SummarizationExecutor {
    fn estimated_cost(&self, _job: &Job) -> f64 {
        0.03
    }

    async fn execute(&self, job: &Job) -> Result<ExecutionReport, StageError> {
        tracing::debug!(job_id = %job.id, entity = %job.source_entity_id, "summarizing");
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(ExecutionReport { cost_usd: 0.02 })
    }
}

struct IngestionExecutor;

#[async_trait]
impl StageExecutor for IngestionExecutor {
    fn estimated_cost(&self, _job: &Job) -> f64 {
        0.01
    }

    async fn execute(&self, job: &Job) -> Result<ExecutionReport, StageError> {
        tracing::debug!(job_id = %job.id, entity = %job.source_entity_id, "ingesting");
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(ExecutionReport { cost_usd: 0.01 })
    }
}

pub fn build_registry(stage_timeout: Duration) -> Arc<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    registry.register_with_timeout(Stage::Discovery, Arc::new(DiscoveryExecutor), stage_timeout);
    registry.register_with_timeout(
        Stage::Transcription,
        Arc::new(TranscriptionExecutor),
        stage_timeout,
    );
    registry.register_with_timeout(
        Stage::Summarization,
        Arc::new(SummarizationExecutor),
        stage_timeout,
    );
    registry.register_with_timeout(Stage::Ingestion, Arc::new(IngestionExecutor), stage_timeout);
    Arc::new(registry)
}
