//! Durable metric storage on an embedded libsql database.
//!
//! One row per request in `request_metrics`, with an `hourly_aggregates`
//! rollup maintained on every batch insert. Retention pruning deletes both
//! tables past the configured horizon.

use std::path::Path;

use libsql::params;

use crate::error::StoreError;
use crate::metrics::RequestMetric;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_metrics (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp     INTEGER NOT NULL,
    session_id    TEXT NOT NULL,
    provider      TEXT NOT NULL,
    model         TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    duration_ms   INTEGER NOT NULL,
    status_code   INTEGER NOT NULL,
    success       INTEGER NOT NULL,
    error_kind    TEXT
);
CREATE INDEX IF NOT EXISTS idx_request_metrics_timestamp ON request_metrics (timestamp);
CREATE INDEX IF NOT EXISTS idx_request_metrics_provider_model ON request_metrics (provider, model);
CREATE INDEX IF NOT EXISTS idx_request_metrics_success ON request_metrics (success);
CREATE INDEX IF NOT EXISTS idx_request_metrics_status ON request_metrics (status_code);
CREATE TABLE IF NOT EXISTS hourly_aggregates (
    hour_start        INTEGER NOT NULL,
    provider          TEXT NOT NULL,
    model             TEXT NOT NULL,
    requests          INTEGER NOT NULL DEFAULT 0,
    successes         INTEGER NOT NULL DEFAULT 0,
    input_tokens      INTEGER NOT NULL DEFAULT 0,
    output_tokens     INTEGER NOT NULL DEFAULT 0,
    total_duration_ms INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (hour_start, provider, model)
);
"#;

/// Per provider+model rollup across the retained window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderRollup {
    pub provider: String,
    pub model: String,
    pub requests: u64,
    pub successes: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub avg_duration_ms: f64,
}

/// One hourly (or daily) bucket.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimeBucket {
    /// Unix seconds at the start of the bucket.
    pub bucket_start: i64,
    pub requests: u64,
    pub successes: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Durable totals for one session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Handle over the embedded database.
pub struct MetricStore {
    db: libsql::Database,
}

impl MetricStore {
    /// Open (creating if needed) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let conn = db.connect().map_err(|e| StoreError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        conn.execute_batch(SCHEMA).await?;
        Ok(Self { db })
    }

    fn connect(&self) -> Result<libsql::Connection, StoreError> {
        Ok(self.db.connect()?)
    }

    /// Insert a batch of rows and fold them into the hourly rollup.
    pub async fn insert_batch(&self, batch: &[RequestMetric]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let conn = self.connect()?;
        let tx = conn.transaction().await?;
        for metric in batch {
            let ts = metric.timestamp.timestamp();
            tx.execute(
                r#"
                INSERT INTO request_metrics
                    (timestamp, session_id, provider, model, input_tokens,
                     output_tokens, duration_ms, status_code, success, error_kind)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    ts,
                    metric.session_id.as_str(),
                    metric.provider.as_str(),
                    metric.model.as_str(),
                    metric.input_tokens as i64,
                    metric.output_tokens as i64,
                    metric.duration_ms as i64,
                    i64::from(metric.status_code),
                    i64::from(metric.success),
                    metric.error_kind,
                ],
            )
            .await?;

            let hour_start = ts - ts.rem_euclid(3600);
            tx.execute(
                r#"
                INSERT INTO hourly_aggregates
                    (hour_start, provider, model, requests, successes,
                     input_tokens, output_tokens, total_duration_ms)
                VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)
                ON CONFLICT (hour_start, provider, model) DO UPDATE SET
                    requests = requests + 1,
                    successes = successes + excluded.successes,
                    input_tokens = input_tokens + excluded.input_tokens,
                    output_tokens = output_tokens + excluded.output_tokens,
                    total_duration_ms = total_duration_ms + excluded.total_duration_ms
                "#,
                params![
                    hour_start,
                    metric.provider.as_str(),
                    metric.model.as_str(),
                    i64::from(metric.success),
                    metric.input_tokens as i64,
                    metric.output_tokens as i64,
                    metric.duration_ms as i64,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete rows older than `retention_days`. Returns rows removed from
    /// the per-request table.
    pub async fn prune(&self, retention_days: u32) -> Result<u64, StoreError> {
        let cutoff =
            chrono::Utc::now().timestamp() - i64::from(retention_days) * 24 * 3600;
        let conn = self.connect()?;
        let removed = conn
            .execute(
                "DELETE FROM request_metrics WHERE timestamp < ?1",
                params![cutoff],
            )
            .await?;
        conn.execute(
            "DELETE FROM hourly_aggregates WHERE hour_start < ?1",
            params![cutoff],
        )
        .await?;
        Ok(removed)
    }

    /// Rollups per (provider, model), highest request count first.
    pub async fn provider_rollups(&self) -> Result<Vec<ProviderRollup>, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                r#"
                SELECT provider, model, SUM(requests), SUM(successes),
                       SUM(input_tokens), SUM(output_tokens),
                       SUM(total_duration_ms)
                FROM hourly_aggregates
                GROUP BY provider, model
                ORDER BY SUM(requests) DESC
                "#,
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let requests = row.get::<i64>(2)? as u64;
            let total_duration = row.get::<i64>(6)? as f64;
            out.push(ProviderRollup {
                provider: row.get::<String>(0)?,
                model: row.get::<String>(1)?,
                requests,
                successes: row.get::<i64>(3)? as u64,
                input_tokens: row.get::<i64>(4)? as u64,
                output_tokens: row.get::<i64>(5)? as u64,
                avg_duration_ms: if requests == 0 {
                    0.0
                } else {
                    total_duration / requests as f64
                },
            });
        }
        Ok(out)
    }

    /// The `limit` most-requested models.
    pub async fn top_models(&self, limit: u32) -> Result<Vec<ProviderRollup>, StoreError> {
        let mut rollups = self.provider_rollups().await?;
        rollups.truncate(limit as usize);
        Ok(rollups)
    }

    /// Hourly buckets covering the trailing `hours`.
    pub async fn hourly_buckets(&self, hours: u32) -> Result<Vec<TimeBucket>, StoreError> {
        self.buckets(3600, i64::from(hours) * 3600).await
    }

    /// Daily buckets covering the trailing `days`.
    pub async fn daily_buckets(&self, days: u32) -> Result<Vec<TimeBucket>, StoreError> {
        self.buckets(86_400, i64::from(days) * 86_400).await
    }

    async fn buckets(&self, width: i64, span: i64) -> Result<Vec<TimeBucket>, StoreError> {
        let since = chrono::Utc::now().timestamp() - span;
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                r#"
                SELECT hour_start - (hour_start % ?1) AS bucket,
                       SUM(requests), SUM(successes),
                       SUM(input_tokens), SUM(output_tokens)
                FROM hourly_aggregates
                WHERE hour_start >= ?2
                GROUP BY bucket
                ORDER BY bucket
                "#,
                params![width, since],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(TimeBucket {
                bucket_start: row.get::<i64>(0)?,
                requests: row.get::<i64>(1)? as u64,
                successes: row.get::<i64>(2)? as u64,
                input_tokens: row.get::<i64>(3)? as u64,
                output_tokens: row.get::<i64>(4)? as u64,
            });
        }
        Ok(out)
    }

    /// Durable totals for one session.
    pub async fn session_summary(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSummary>, StoreError> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                r#"
                SELECT COUNT(*), COALESCE(SUM(input_tokens), 0),
                       COALESCE(SUM(output_tokens), 0),
                       COALESCE(MIN(timestamp), 0), COALESCE(MAX(timestamp), 0)
                FROM request_metrics
                WHERE session_id = ?1
                "#,
                params![session_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let requests = row.get::<i64>(0)? as u64;
        if requests == 0 {
            return Ok(None);
        }
        Ok(Some(SessionSummary {
            session_id: session_id.to_string(),
            requests,
            input_tokens: row.get::<i64>(1)? as u64,
            output_tokens: row.get::<i64>(2)? as u64,
            first_seen: row.get::<i64>(3)?,
            last_seen: row.get::<i64>(4)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;

    use super::*;

    fn metric(session: &str, provider: &str, success: bool) -> RequestMetric {
        RequestMetric {
            timestamp: Utc::now(),
            session_id: session.to_string(),
            provider: provider.to_string(),
            model: "model-x".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            duration_ms: 120,
            status_code: if success { 200 } else { 502 },
            success,
            error_kind: if success { None } else { Some("upstream_error") },
        }
    }

    async fn open_temp() -> (tempfile::TempDir, MetricStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricStore::open(&dir.path().join("metrics.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn insert_and_rollup_round_trip() {
        let (_dir, store) = open_temp().await;

        store
            .insert_batch(&[
                metric("s1", "anthropic", true),
                metric("s1", "anthropic", true),
                metric("s2", "openai", false),
            ])
            .await
            .unwrap();

        let rollups = store.provider_rollups().await.unwrap();
        assert_eq!(rollups.len(), 2);
        assert_eq!(rollups[0].provider, "anthropic");
        assert_eq!(rollups[0].requests, 2);
        assert_eq!(rollups[0].successes, 2);
        assert_eq!(rollups[0].input_tokens, 20);
        assert!((rollups[0].avg_duration_ms - 120.0).abs() < f64::EPSILON);

        assert_eq!(rollups[1].provider, "openai");
        assert_eq!(rollups[1].successes, 0);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let (_dir, store) = open_temp().await;
        store.insert_batch(&[]).await.unwrap();
        assert!(store.provider_rollups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_summary_totals() {
        let (_dir, store) = open_temp().await;
        store
            .insert_batch(&[metric("s1", "anthropic", true), metric("s1", "anthropic", true)])
            .await
            .unwrap();

        let summary = store.session_summary("s1").await.unwrap().unwrap();
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.input_tokens, 20);
        assert_eq!(summary.output_tokens, 40);

        assert!(store.session_summary("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hourly_buckets_cover_recent_rows() {
        let (_dir, store) = open_temp().await;
        store
            .insert_batch(&[metric("s1", "anthropic", true)])
            .await
            .unwrap();

        let buckets = store.hourly_buckets(24).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].requests, 1);
        assert_eq!(buckets[0].bucket_start % 3600, 0);

        let daily = store.daily_buckets(7).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].bucket_start % 86_400, 0);
    }

    #[tokio::test]
    async fn prune_removes_old_rows() {
        let (_dir, store) = open_temp().await;
        let mut old = metric("s1", "anthropic", true);
        old.timestamp = Utc::now() - ChronoDuration::days(120);
        store
            .insert_batch(&[old, metric("s2", "anthropic", true)])
            .await
            .unwrap();

        let removed = store.prune(90).await.unwrap();
        assert_eq!(removed, 1);

        let summary = store.session_summary("s2").await.unwrap();
        assert!(summary.is_some(), "recent row survives pruning");
        assert!(store.session_summary("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn top_models_limits() {
        let (_dir, store) = open_temp().await;
        store
            .insert_batch(&[
                metric("s", "a", true),
                metric("s", "b", true),
                metric("s", "c", true),
            ])
            .await
            .unwrap();
        assert_eq!(store.top_models(2).await.unwrap().len(), 2);
    }
}
