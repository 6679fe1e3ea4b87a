use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::jobs::model::Job;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_seconds: i64,
    pub max_seconds: i64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_seconds: 5,
            max_seconds: 10 * 60,
            jitter_pct: 0.15,
        }
    }
}

/// Exponential backoff with cap: `base * 2^attempt_count`, clamped to
/// `max_seconds`, then jittered by up to ±`jitter_pct` so a burst of failures
/// does not re-dispatch as a herd.
pub fn backoff_delay_seconds(attempt_count: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> i64 {
    let exp = attempt_count.max(0) as u32;

    // 2^exp, saturating; the cap takes over well before overflow matters.
    let pow2 = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);
    let delay = cfg.base_seconds.saturating_mul(pow2).min(cfg.max_seconds);

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    ((delay as f64 + jitter).round() as i64).clamp(0, cfg.max_seconds)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Record the failed attempt and return the job to pending.
    ScheduleRetry {
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts are spent; the caller hands the job to the DLQ manager.
    Exhausted { attempt_count: i32 },
}

/// Error-kind-agnostic: consumes only attempt counts and timestamps. Budget
/// denials never reach this engine; they requeue without consuming attempts.
#[derive(Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    pub fn decide(&self, job: &Job) -> RetryDecision {
        let mut rng = StdRng::from_entropy();
        self.decide_with_rng(job, &mut rng)
    }

    pub fn decide_with_rng(&self, job: &Job, rng: &mut impl Rng) -> RetryDecision {
        let recorded = job.attempt_count + 1;
        if recorded >= job.max_attempts {
            return RetryDecision::Exhausted {
                attempt_count: recorded.min(job.max_attempts),
            };
        }

        let delay = backoff_delay_seconds(job.attempt_count, &self.cfg, rng);
        RetryDecision::ScheduleRetry {
            attempt_count: recorded,
            next_retry_at: Utc::now() + Duration::seconds(delay),
        }
    }
}
