//! Metrics collection: real-time aggregates plus durable rollups.
//!
//! The collector keeps rolling in-memory aggregates (rates, latency
//! percentiles, status distribution, per-session usage) and batches raw
//! records into the embedded store. Subscribers receive a snapshot on
//! every aggregation change over a broadcast channel; slow subscribers
//! lose snapshots rather than ever blocking the hot path.
//!
//! Lifecycle is explicit: [`MetricsCollector::start`] launches the flush
//! and retention tasks, [`MetricsCollector::stop`] cancels them, performs
//! a final flush, and closes the store.

pub mod store;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::MetricsConfig;
use crate::error::StoreError;

pub use store::{MetricStore, ProviderRollup, SessionSummary, TimeBucket};

/// Window for rate aggregates (requests per minute, tokens per second).
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// A session counts as active this long after its last request.
const SESSION_ACTIVE_WINDOW: Duration = Duration::from_secs(300);

/// Latency samples kept for percentile estimation.
const LATENCY_SAMPLES: usize = 2_048;

/// Broadcast channel depth; laggards skip ahead.
const STREAM_DEPTH: usize = 32;

/// One per-request record.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub status_code: u16,
    pub success: bool,
    pub error_kind: Option<&'static str>,
}

impl RequestMetric {
    /// A malformed metric is dropped with a warning, never persisted.
    fn is_valid(&self) -> bool {
        (100..=599).contains(&self.status_code) && !self.session_id.is_empty()
    }
}

/// Latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
}

/// Point-in-time aggregate view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub requests_per_minute: f64,
    pub input_tokens_per_second: f64,
    pub output_tokens_per_second: f64,
    pub total_tokens_per_second: f64,
    pub active_sessions: usize,
    /// Error rate over the rolling window, in `[0, 1]`.
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub latency: LatencyPercentiles,
    pub status_distribution: HashMap<u16, u64>,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionUsage {
    pub session_id: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

struct RateSample {
    at: Instant,
    input_tokens: u64,
    output_tokens: u64,
    success: bool,
}

struct SessionEntry {
    requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    last_seen: Instant,
}

struct Aggregates {
    window: VecDeque<RateSample>,
    latencies: VecDeque<u64>,
    status_distribution: HashMap<u16, u64>,
    sessions: HashMap<String, SessionEntry>,
    total_latency_ms: u64,
}

impl Aggregates {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            latencies: VecDeque::new(),
            status_distribution: HashMap::new(),
            sessions: HashMap::new(),
            total_latency_ms: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(sample) = self.window.front() {
            if now.duration_since(sample.at) > RATE_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
        self.sessions
            .retain(|_, s| now.duration_since(s.last_seen) <= SESSION_ACTIVE_WINDOW);
    }

    fn observe(&mut self, metric: &RequestMetric, now: Instant) {
        self.window.push_back(RateSample {
            at: now,
            input_tokens: metric.input_tokens,
            output_tokens: metric.output_tokens,
            success: metric.success,
        });
        self.latencies.push_back(metric.duration_ms);
        while self.latencies.len() > LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        *self
            .status_distribution
            .entry(metric.status_code)
            .or_insert(0) += 1;
        self.total_latency_ms += metric.duration_ms;

        let session = self
            .sessions
            .entry(metric.session_id.clone())
            .or_insert(SessionEntry {
                requests: 0,
                input_tokens: 0,
                output_tokens: 0,
                last_seen: now,
            });
        session.requests += 1;
        session.input_tokens += metric.input_tokens;
        session.output_tokens += metric.output_tokens;
        session.last_seen = now;

        self.prune(now);
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// The process-wide metrics collector.
pub struct MetricsCollector {
    config: MetricsConfig,
    store: Option<Arc<MetricStore>>,
    aggregates: Mutex<Aggregates>,
    pending: Mutex<Vec<RequestMetric>>,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    dropped_total: AtomicU64,
    started_at: Instant,
    stream: broadcast::Sender<MetricsSnapshot>,
    cancel: CancellationToken,
    flush_wakeup: tokio::sync::Notify,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig, store: Option<Arc<MetricStore>>) -> Self {
        let (stream, _) = broadcast::channel(STREAM_DEPTH);
        Self {
            config,
            store,
            aggregates: Mutex::new(Aggregates::new()),
            pending: Mutex::new(Vec::new()),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            started_at: Instant::now(),
            stream,
            cancel: CancellationToken::new(),
            flush_wakeup: tokio::sync::Notify::new(),
        }
    }

    /// Launch the periodic flush and retention tasks.
    pub fn start(self: Arc<Self>) {
        let collector = self;
        tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(collector.config.flush_interval());
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Retention pruning is cheap; hourly is plenty.
            let mut prune_tick = tokio::time::interval(Duration::from_secs(3600));
            prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = collector.cancel.cancelled() => break,
                    _ = flush_tick.tick() => collector.flush().await,
                    _ = collector.flush_wakeup.notified() => collector.flush().await,
                    _ = prune_tick.tick() => {
                        if let Some(store) = &collector.store {
                            match store.prune(collector.config.retention_days).await {
                                Ok(removed) if removed > 0 => {
                                    tracing::info!(removed, "pruned metric rows past retention");
                                }
                                Ok(_) => {}
                                Err(e) => tracing::warn!(error = %e, "metric retention prune failed"),
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stop the background tasks and flush whatever is pending.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.flush().await;
    }

    /// Record one request. Never fails; malformed metrics are dropped with
    /// a warning.
    pub fn record(&self, metric: RequestMetric) {
        if !metric.is_valid() {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                status = metric.status_code,
                session = %metric.session_id,
                "dropping malformed metric"
            );
            return;
        }

        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !metric.success {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut aggregates = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
            aggregates.observe(&metric, Instant::now());
        }

        let batch_full = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.push(metric);
            pending.len() >= self.config.batch_size
        };
        if batch_full {
            self.flush_wakeup.notify_one();
        }

        // Streaming is best-effort: no subscribers, no work.
        let _ = self.stream.send(self.snapshot());
    }

    /// Drain pending records into the store. On failure the most recent
    /// batch is retained and everything older is dropped, bounding memory.
    pub async fn flush(&self) {
        let batch: Vec<RequestMetric> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };

        if let Err(e) = store.insert_batch(&batch).await {
            tracing::warn!(error = %e, rows = batch.len(), "metric flush failed, retaining latest batch");
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let mut retained = batch;
            retained.extend(pending.drain(..));
            let keep_from = retained.len().saturating_sub(self.config.batch_size);
            *pending = retained.split_off(keep_from);
        }
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.stream.subscribe()
    }

    /// Current rolling aggregates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let errors_total = self.errors_total.load(Ordering::Relaxed);

        let mut aggregates = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
        aggregates.prune(Instant::now());

        let window_len = aggregates.window.len();
        let window_failures = aggregates.window.iter().filter(|s| !s.success).count();
        let (input_tokens, output_tokens) = aggregates
            .window
            .iter()
            .fold((0u64, 0u64), |(i, o), s| {
                (i + s.input_tokens, o + s.output_tokens)
            });
        let secs = RATE_WINDOW.as_secs_f64();

        let mut sorted: Vec<u64> = aggregates.latencies.iter().copied().collect();
        sorted.sort_unstable();

        MetricsSnapshot {
            requests_total,
            errors_total,
            requests_per_minute: window_len as f64,
            input_tokens_per_second: input_tokens as f64 / secs,
            output_tokens_per_second: output_tokens as f64 / secs,
            total_tokens_per_second: (input_tokens + output_tokens) as f64 / secs,
            active_sessions: aggregates.sessions.len(),
            // All derived rates divide safely: zero denominator means zero.
            error_rate: if window_len == 0 {
                0.0
            } else {
                window_failures as f64 / window_len as f64
            },
            avg_latency_ms: if requests_total == 0 {
                0.0
            } else {
                aggregates.total_latency_ms as f64 / requests_total as f64
            },
            latency: LatencyPercentiles {
                p50: percentile(&sorted, 50.0),
                p90: percentile(&sorted, 90.0),
                p95: percentile(&sorted, 95.0),
                p99: percentile(&sorted, 99.0),
                p999: percentile(&sorted, 99.9),
            },
            status_distribution: aggregates.status_distribution.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Live per-session usage, most recent first.
    pub fn session_usage(&self) -> Vec<SessionUsage> {
        let mut aggregates = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
        aggregates.prune(Instant::now());
        let mut out: Vec<(Instant, SessionUsage)> = aggregates
            .sessions
            .iter()
            .map(|(id, s)| {
                (
                    s.last_seen,
                    SessionUsage {
                        session_id: id.clone(),
                        requests: s.requests,
                        input_tokens: s.input_tokens,
                        output_tokens: s.output_tokens,
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        out.into_iter().map(|(_, usage)| usage).collect()
    }

    /// Metrics the durable store can answer (rollups, buckets, sessions).
    pub fn store(&self) -> Option<&Arc<MetricStore>> {
        self.store.as_ref()
    }

    /// How many malformed metrics were dropped since start.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Pending rows not yet flushed (for tests and the health endpoint).
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Build a [`RequestMetric`] helper used by the pipeline.
#[allow(clippy::too_many_arguments)]
pub fn metric_for(
    session_id: &str,
    provider: &str,
    model: &str,
    usage: Option<crate::usage::TokenUsage>,
    duration_ms: u64,
    status_code: u16,
    success: bool,
    error_kind: Option<&'static str>,
) -> RequestMetric {
    let usage = usage.unwrap_or_default();
    RequestMetric {
        timestamp: Utc::now(),
        session_id: session_id.to_string(),
        provider: provider.to_string(),
        model: model.to_string(),
        input_tokens: usage.input,
        output_tokens: usage.output,
        duration_ms,
        status_code,
        success,
        error_kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new(MetricsConfig::default(), None))
    }

    fn metric(success: bool, duration_ms: u64) -> RequestMetric {
        metric_for(
            "s1",
            "anthropic",
            "claude-sonnet",
            Some(crate::usage::TokenUsage::new(30, 60)),
            duration_ms,
            if success { 200 } else { 502 },
            success,
            if success { None } else { Some("upstream_error") },
        )
    }

    #[tokio::test]
    async fn snapshot_aggregates_counts_and_rates() {
        let collector = collector();
        for _ in 0..3 {
            collector.record(metric(true, 100));
        }
        collector.record(metric(false, 300));

        let snap = collector.snapshot();
        assert_eq!(snap.requests_total, 4);
        assert_eq!(snap.errors_total, 1);
        assert!((snap.requests_per_minute - 4.0).abs() < f64::EPSILON);
        assert!((snap.error_rate - 0.25).abs() < f64::EPSILON);
        assert!((snap.avg_latency_ms - 150.0).abs() < f64::EPSILON);
        // 4 requests × 90 tokens over the 60s window.
        assert!((snap.total_tokens_per_second - 6.0).abs() < 1e-9);
        assert_eq!(snap.status_distribution[&200], 3);
        assert_eq!(snap.status_distribution[&502], 1);
        assert_eq!(snap.active_sessions, 1);
    }

    #[tokio::test]
    async fn empty_snapshot_has_zero_rates_not_nan() {
        let snap = collector().snapshot();
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.avg_latency_ms, 0.0);
        assert_eq!(snap.latency.p99, 0);
        assert!(snap.error_rate.is_finite());
    }

    #[tokio::test]
    async fn malformed_metric_is_dropped_not_fatal() {
        let collector = collector();
        let mut bad = metric(true, 100);
        bad.status_code = 42;
        collector.record(bad);

        let mut bad = metric(true, 100);
        bad.session_id = String::new();
        collector.record(bad);

        assert_eq!(collector.snapshot().requests_total, 0);
        assert_eq!(collector.dropped_total(), 2);
    }

    #[tokio::test]
    async fn percentiles_come_from_sorted_samples() {
        let collector = collector();
        for duration in 1..=100u64 {
            collector.record(metric(true, duration));
        }
        let latency = collector.snapshot().latency;
        assert_eq!(latency.p50, 50);
        assert_eq!(latency.p90, 90);
        assert_eq!(latency.p95, 95);
        assert_eq!(latency.p99, 99);
        assert_eq!(latency.p999, 100);
    }

    #[tokio::test]
    async fn subscribers_receive_snapshots() {
        let collector = collector();
        let mut rx = collector.subscribe();
        collector.record(metric(true, 50));

        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.requests_total, 1);
    }

    #[tokio::test]
    async fn flush_drains_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MetricStore::open(&dir.path().join("m.db")).await.unwrap(),
        );
        let collector = Arc::new(MetricsCollector::new(
            MetricsConfig::default(),
            Some(Arc::clone(&store)),
        ));

        collector.record(metric(true, 50));
        collector.record(metric(false, 70));
        assert_eq!(collector.pending_len(), 2);

        collector.flush().await;
        assert_eq!(collector.pending_len(), 0);

        let rollups = store.provider_rollups().await.unwrap();
        assert_eq!(rollups[0].requests, 2);
    }

    #[tokio::test]
    async fn stop_performs_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MetricStore::open(&dir.path().join("m.db")).await.unwrap(),
        );
        let collector = Arc::new(MetricsCollector::new(
            MetricsConfig::default(),
            Some(Arc::clone(&store)),
        ));
        Arc::clone(&collector).start();

        collector.record(metric(true, 50));
        collector.stop().await;

        assert_eq!(collector.pending_len(), 0);
        assert_eq!(store.provider_rollups().await.unwrap()[0].requests, 1);
    }

    #[tokio::test]
    async fn session_usage_tracks_totals() {
        let collector = collector();
        collector.record(metric(true, 50));
        collector.record(metric(true, 50));

        let usage = collector.session_usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].session_id, "s1");
        assert_eq!(usage[0].requests, 2);
        assert_eq!(usage[0].input_tokens, 60);
        assert_eq!(usage[0].output_tokens, 120);
    }
}
