use std::collections::HashMap;

use crate::jobs::budget::BudgetLimits;
use crate::jobs::model::Stage;
use crate::jobs::retry::RetryConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,

    pub claim_batch_size: i64,
    pub poll_interval_ms: u64,
    pub stage_timeout_secs: u64,

    pub scan_interval_secs: u64,
    pub stale_after_secs: i64,

    pub budget: BudgetLimits,
    pub budget_defer_secs: i64,
    pub retry: RetryConfig,

    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("PIPEFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let claim_batch_size = env_parsed("PIPEFLOW_CLAIM_BATCH_SIZE").unwrap_or(10);
        let poll_interval_ms = env_parsed("PIPEFLOW_POLL_INTERVAL_MS").unwrap_or(500);
        let stage_timeout_secs = env_parsed("PIPEFLOW_STAGE_TIMEOUT_SECS").unwrap_or(120);

        let scan_interval_secs = env_parsed("PIPEFLOW_SCAN_INTERVAL_SECS").unwrap_or(60);
        let stale_after_secs = env_parsed("PIPEFLOW_STALE_AFTER_SECS").unwrap_or(15 * 60);

        let budget_defer_secs = env_parsed("PIPEFLOW_BUDGET_DEFER_SECS").unwrap_or(60);

        let retry = RetryConfig {
            base_seconds: env_parsed("PIPEFLOW_RETRY_BASE_SECS")
                .unwrap_or(RetryConfig::default().base_seconds),
            max_seconds: env_parsed("PIPEFLOW_RETRY_MAX_SECS")
                .unwrap_or(RetryConfig::default().max_seconds),
            jitter_pct: env_parsed("PIPEFLOW_RETRY_JITTER_PCT")
                .unwrap_or(RetryConfig::default().jitter_pct),
        };

        let admin_addr = env_or_fallback("PIPEFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("PIPEFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        Ok(Self {
            database_url,
            worker_id,
            claim_batch_size,
            poll_interval_ms,
            stage_timeout_secs,
            scan_interval_secs,
            stale_after_secs,
            budget: budget_limits_from_env(),
            budget_defer_secs,
            retry,
            admin_addr,
            migrate_on_startup,
        })
    }
}

/// Daily limits: `PIPEFLOW_DAILY_LIMIT_USD` sets the default, and each
/// resource class can be pinned with e.g. `PIPEFLOW_DAILY_LIMIT_LLM_USD`.
pub fn budget_limits_from_env() -> BudgetLimits {
    let default_limit_usd =
        env_parsed("PIPEFLOW_DAILY_LIMIT_USD").unwrap_or(BudgetLimits::default().default_limit_usd);

    let mut per_class_usd = HashMap::new();
    for stage in Stage::ALL {
        let class = stage.resource_class();
        let var = format!("PIPEFLOW_DAILY_LIMIT_{}_USD", class.to_uppercase());
        if let Some(limit) = env_parsed_named(&var) {
            per_class_usd.insert(class.to_string(), limit);
        }
    }

    BudgetLimits {
        default_limit_usd,
        per_class_usd,
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_parsed_named(key)
}

fn env_parsed_named<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
