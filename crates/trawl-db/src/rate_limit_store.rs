use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use trawl_core::error::AppError;
use trawl_core::rate_limit::{
    RateLimitConfig, RateLimitDecision, RateLimitStore, RateLimitStrategy, window_cutoff, window_end,
    window_start,
};

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

/// Cluster-wide admission store in PostgreSQL.
///
/// Every check runs in one transaction holding a per-bucket advisory lock
/// (`pg_advisory_xact_lock(hashtext(bucket))`), so concurrent checks on the
/// same bucket from any number of processes are serialized.
#[derive(Clone)]
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete sliding-window events older than `cutoff` across all buckets.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let events = sqlx::query("DELETE FROM rate_limit_events WHERE admitted_at <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        let windows = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(events.rows_affected() + windows.rows_affected())
    }

    async fn sliding(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let window = config.window_delta();

        sqlx::query("DELETE FROM rate_limit_events WHERE bucket = $1 AND admitted_at <= $2")
            .bind(key)
            .bind(window_cutoff(now, window))
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;

        let (count, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(admitted_at) FROM rate_limit_events WHERE bucket = $1",
        )
        .bind(key)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        let max = i64::from(config.max_requests);
        let allowed = count < max;
        if allowed {
            sqlx::query("INSERT INTO rate_limit_events (bucket, admitted_at) VALUES ($1, $2)")
                .bind(key)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
        }

        let used = if allowed { count + 1 } else { count };
        Ok(RateLimitDecision {
            allowed,
            limit: config.max_requests,
            remaining: u32::try_from((max - used).max(0)).unwrap_or(0),
            reset_at: window_end(oldest.unwrap_or(now), window),
        })
    }

    async fn fixed(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let window = config.window_delta();
        let current = window_start(now, window);

        // Counter resets when the stored window is not the current one.
        let (count,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO rate_limit_windows (bucket, window_start, request_count)
            VALUES ($1, $2, 0)
            ON CONFLICT (bucket) DO UPDATE SET
                request_count = CASE
                    WHEN rate_limit_windows.window_start = EXCLUDED.window_start
                    THEN rate_limit_windows.request_count
                    ELSE 0
                END,
                window_start = EXCLUDED.window_start
            RETURNING request_count
            "#,
        )
        .bind(key)
        .bind(current)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        let count = u32::try_from(count).unwrap_or(0);
        let allowed = count < config.max_requests;
        if allowed {
            sqlx::query(
                "UPDATE rate_limit_windows SET request_count = request_count + 1 WHERE bucket = $1",
            )
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        let used = if allowed { count + 1 } else { count };
        Ok(RateLimitDecision {
            allowed,
            limit: config.max_requests,
            remaining: config.max_requests.saturating_sub(used),
            reset_at: window_end(current, window),
        })
    }
}

impl RateLimitStore for PgRateLimitStore {
    async fn check_and_record(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let decision = match config.strategy {
            RateLimitStrategy::Sliding => Self::sliding(&mut tx, key, config, now).await?,
            RateLimitStrategy::Fixed => Self::fixed(&mut tx, key, config, now).await?,
        };

        tx.commit().await.map_err(db_err)?;

        tracing::debug!(
            key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Shared rate limit checked"
        );
        Ok(decision)
    }
}
