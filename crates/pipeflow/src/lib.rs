//! Orchestration core for a multi-stage content pipeline
//! (discovery → transcription → summarization → ingestion) running against
//! independently failing external services under a daily spend limit.
//!
//! The ledger is the single source of truth; every status change is a
//! compare-and-swap. Stage executors are external collaborators behind the
//! [`jobs::StageExecutor`] capability.

pub mod api;
pub mod config;
pub mod db;
pub mod events;
pub mod jobs;
