use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// Daily spend limits per resource class, in USD. Classes without an explicit
/// limit fall back to `default_limit_usd`.
#[derive(Debug, Clone)]
pub struct BudgetLimits {
    pub default_limit_usd: f64,
    pub per_class_usd: HashMap<String, f64>,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            default_limit_usd: 5.0,
            per_class_usd: HashMap::new(),
        }
    }
}

impl BudgetLimits {
    pub fn limit_for(&self, resource_class: &str) -> f64 {
        self.per_class_usd
            .get(resource_class)
            .copied()
            .unwrap_or(self.default_limit_usd)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Approved,
    Denied { reason: String },
}

impl Admission {
    pub fn is_approved(&self) -> bool {
        matches!(self, Admission::Approved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetLevel {
    Ok,
    Caution,
    Warning,
    Exceeded,
}

/// Informational level for a class's usage against its daily limit.
/// Usage counts committed plus reserved spend, so warnings fire before
/// in-flight work lands.
pub fn level_for(usage_usd: f64, limit_usd: f64) -> BudgetLevel {
    if limit_usd <= 0.0 {
        return BudgetLevel::Exceeded;
    }
    let ratio = usage_usd / limit_usd;
    if ratio >= 1.0 {
        BudgetLevel::Exceeded
    } else if ratio >= 0.9 {
        BudgetLevel::Warning
    } else if ratio >= 0.7 {
        BudgetLevel::Caution
    } else {
        BudgetLevel::Ok
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub resource_class: String,
    pub day: NaiveDate,
    pub committed_usd: f64,
    pub reserved_usd: f64,
    pub daily_limit_usd: f64,
    pub level: BudgetLevel,
}

/// Admission control for external spend. The only writers to the daily
/// aggregate are `reserve`, `commit`, and `release`, and each is a single
/// conditional statement, so concurrent workers cannot overshoot the limit
/// even though any read they did beforehand is stale.
#[derive(Clone)]
pub struct BudgetGuard {
    pool: PgPool,
    limits: BudgetLimits,
}

impl BudgetGuard {
    pub fn new(pool: PgPool, limits: BudgetLimits) -> Self {
        Self { pool, limits }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Hold `estimated_cost` against today's budget for the class. Admits only
    /// if committed + reserved + estimate stays within the daily limit; the
    /// check and the increment are one atomic UPDATE.
    pub async fn reserve(
        &self,
        resource_class: &str,
        estimated_cost: f64,
    ) -> Result<Admission, sqlx::Error> {
        let day = Self::today();
        let limit = self.limits.limit_for(resource_class);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO budget_days (resource_class, day)
            VALUES ($1, $2)
            ON CONFLICT (resource_class, day) DO NOTHING
            "#,
        )
        .bind(resource_class)
        .bind(day)
        .execute(&mut *tx)
        .await?;

        let admitted = sqlx::query_as::<_, (f64, f64)>(
            r#"
            UPDATE budget_days
            SET reserved_usd = reserved_usd + $3,
                updated_at = now()
            WHERE resource_class = $1
              AND day = $2
              AND committed_usd + reserved_usd + $3 <= $4
            RETURNING committed_usd, reserved_usd
            "#,
        )
        .bind(resource_class)
        .bind(day)
        .bind(estimated_cost)
        .bind(limit)
        .fetch_optional(&mut *tx)
        .await?;

        if admitted.is_some() {
            tx.commit().await?;
            return Ok(Admission::Approved);
        }

        let (committed, reserved) = sqlx::query_as::<_, (f64, f64)>(
            r#"
            SELECT committed_usd, reserved_usd FROM budget_days
            WHERE resource_class = $1 AND day = $2
            "#,
        )
        .bind(resource_class)
        .bind(day)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Admission::Denied {
            reason: format!(
                "daily limit {limit:.2} would be exceeded: committed {committed:.2} + reserved {reserved:.2} + estimate {estimated_cost:.2}"
            ),
        })
    }

    /// Replace a reservation with the cost actually incurred and append the
    /// audit entry. The actual may differ from the estimate; the aggregate
    /// reconciles here. Commits land on the current UTC day even if the
    /// reservation was made just before midnight.
    pub async fn commit(
        &self,
        resource_class: &str,
        job_id: Option<Uuid>,
        estimated_cost: f64,
        actual_cost: f64,
    ) -> Result<(), sqlx::Error> {
        let day = Self::today();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE budget_days
            SET reserved_usd = GREATEST(reserved_usd - $3, 0),
                committed_usd = committed_usd + $4,
                updated_at = now()
            WHERE resource_class = $1 AND day = $2
            "#,
        )
        .bind(resource_class)
        .bind(day)
        .bind(estimated_cost)
        .bind(actual_cost)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO budget_entries (resource_class, day, job_id, amount_usd)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(resource_class)
        .bind(day)
        .bind(job_id)
        .bind(actual_cost)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Drop a reservation that will never be committed (the job failed before
    /// incurring cost, or lost its claim).
    pub async fn release(
        &self,
        resource_class: &str,
        estimated_cost: f64,
    ) -> Result<(), sqlx::Error> {
        let day = Self::today();
        sqlx::query(
            r#"
            UPDATE budget_days
            SET reserved_usd = GREATEST(reserved_usd - $3, 0),
                updated_at = now()
            WHERE resource_class = $1 AND day = $2
            "#,
        )
        .bind(resource_class)
        .bind(day)
        .bind(estimated_cost)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn status(&self, resource_class: &str) -> Result<BudgetStatus, sqlx::Error> {
        let day = Self::today();
        let row = sqlx::query_as::<_, (f64, f64)>(
            r#"
            SELECT committed_usd, reserved_usd FROM budget_days
            WHERE resource_class = $1 AND day = $2
            "#,
        )
        .bind(resource_class)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        let (committed_usd, reserved_usd) = row.unwrap_or((0.0, 0.0));
        let daily_limit_usd = self.limits.limit_for(resource_class);
        Ok(BudgetStatus {
            resource_class: resource_class.to_string(),
            day,
            committed_usd,
            reserved_usd,
            daily_limit_usd,
            level: level_for(committed_usd + reserved_usd, daily_limit_usd),
        })
    }

    /// Today's status for every class known to the pipeline.
    pub async fn summary(&self) -> Result<Vec<BudgetStatus>, sqlx::Error> {
        let mut out = Vec::new();
        for stage in crate::jobs::model::Stage::ALL {
            out.push(self.status(stage.resource_class()).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_follow_thresholds() {
        assert_eq!(level_for(0.0, 5.0), BudgetLevel::Ok);
        assert_eq!(level_for(3.4, 5.0), BudgetLevel::Ok);
        assert_eq!(level_for(3.5, 5.0), BudgetLevel::Caution);
        assert_eq!(level_for(4.5, 5.0), BudgetLevel::Warning);
        assert_eq!(level_for(5.0, 5.0), BudgetLevel::Exceeded);
        assert_eq!(level_for(7.2, 5.0), BudgetLevel::Exceeded);
    }

    #[test]
    fn zero_limit_is_always_exceeded() {
        assert_eq!(level_for(0.0, 0.0), BudgetLevel::Exceeded);
    }

    #[test]
    fn per_class_limit_overrides_default() {
        let limits = BudgetLimits {
            default_limit_usd: 5.0,
            per_class_usd: HashMap::from([("llm".to_string(), 2.5)]),
        };
        assert_eq!(limits.limit_for("llm"), 2.5);
        assert_eq!(limits.limit_for("transcription"), 5.0);
    }
}
