//! Per (provider, model) circuit breakers.
//!
//! Three states: closed → open → half-open → closed. A breaker opens when
//! consecutive failures reach the threshold or the rolling failure ratio
//! does; an open breaker fast-rejects until its probe time, then admits a
//! bounded number of half-open probes. Probe failure re-opens with an
//! exponentially increased (capped) duration.
//!
//! All transitions happen under one per-breaker mutex, so concurrent
//! readers always observe a consistent (state, counters) tuple.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;
use crate::context::ProviderModel;

/// Retry hint returned while half-open probes are already in flight.
const HALF_OPEN_RETRY_HINT: Duration = Duration::from_secs(1);

/// How a request was admitted through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; normal traffic.
    Normal,
    /// Breaker half-open; this request is a probe and its outcome decides
    /// the next transition.
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: State,
    consecutive_failures: u32,
    /// Rolling window of recent outcomes, `true` = success.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    /// Consecutive re-opens, drives the exponential open duration.
    reopen_count: u32,
    probes_in_flight: u32,
    probe_successes: u32,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            window: VecDeque::new(),
            opened_at: None,
            next_probe_at: None,
            reopen_count: 0,
            probes_in_flight: 0,
            probe_successes: 0,
        }
    }

    fn rolling_error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn push_outcome(&mut self, success: bool, window_size: usize) {
        self.window.push_back(success);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn open_duration(&self, config: &BreakerConfig) -> Duration {
        let base = config.open_duration();
        let factor = 2u32.saturating_pow(self.reopen_count.min(16));
        (base * factor).min(config.open_duration_cap())
    }

    fn trip_open(&mut self, config: &BreakerConfig, now: Instant) {
        let duration = self.open_duration(config);
        self.state = State::Open;
        self.opened_at = Some(now);
        self.next_probe_at = Some(now + duration);
        self.probes_in_flight = 0;
        self.probe_successes = 0;
    }

    fn close(&mut self) {
        self.state = State::Closed;
        self.consecutive_failures = 0;
        self.window.clear();
        self.opened_at = None;
        self.next_probe_at = None;
        self.reopen_count = 0;
        self.probes_in_flight = 0;
        self.probe_successes = 0;
    }
}

/// A point-in-time view of one breaker, for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub model: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub rolling_error_rate: f64,
    /// How long the breaker has been open, when open.
    pub open_for_ms: Option<u64>,
    /// Milliseconds until the next half-open probe, when open.
    pub next_probe_in_ms: Option<u64>,
}

/// Registry of circuit breakers keyed by (provider, model).
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<ProviderModel, Arc<Mutex<BreakerInner>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn breaker(&self, pm: &ProviderModel) -> Arc<Mutex<BreakerInner>> {
        // Fast path under the read lock.
        {
            let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = map.get(pm) {
                return Arc::clone(b);
            }
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(pm.clone())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerInner::new()))),
        )
    }

    /// Gate a request. `Ok` admits (normally or as a probe); `Err` carries
    /// the time until the next probe slot.
    pub fn admit(&self, pm: &ProviderModel) -> Result<Admission, Duration> {
        let breaker = self.breaker(pm);
        let mut inner = breaker.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        match inner.state {
            State::Closed => Ok(Admission::Normal),
            State::Open => {
                let next_probe = inner.next_probe_at.unwrap_or(now);
                if now < next_probe {
                    return Err(next_probe - now);
                }
                // Probe time reached: half-open, this caller is the first probe.
                inner.state = State::HalfOpen;
                inner.probes_in_flight = 1;
                inner.probe_successes = 0;
                tracing::info!(breaker = %pm, "circuit half-open, admitting probe");
                Ok(Admission::Probe)
            }
            State::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_probes {
                    inner.probes_in_flight += 1;
                    Ok(Admission::Probe)
                } else {
                    Err(HALF_OPEN_RETRY_HINT)
                }
            }
        }
    }

    /// Record the outcome of an admitted request.
    pub fn record(&self, pm: &ProviderModel, admission: Admission, success: bool) {
        let breaker = self.breaker(pm);
        let mut inner = breaker.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        inner.push_outcome(success, self.config.window_size);

        match (inner.state, admission) {
            (State::HalfOpen, Admission::Probe) => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if success {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.config.half_open_probes {
                        tracing::info!(breaker = %pm, "circuit closed after successful probes");
                        inner.close();
                    }
                } else {
                    inner.reopen_count += 1;
                    tracing::warn!(
                        breaker = %pm,
                        reopen_count = inner.reopen_count,
                        "probe failed, circuit re-opened"
                    );
                    inner.trip_open(&self.config, now);
                }
            }
            (State::Closed, _) => {
                if success {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                    let ratio_tripped = inner.window.len() >= self.config.window_size
                        && inner.rolling_error_rate() >= self.config.failure_ratio;
                    if inner.consecutive_failures >= self.config.failure_threshold || ratio_tripped
                    {
                        tracing::warn!(
                            breaker = %pm,
                            consecutive = inner.consecutive_failures,
                            error_rate = inner.rolling_error_rate(),
                            "circuit opened"
                        );
                        inner.trip_open(&self.config, now);
                    }
                }
            }
            // A straggler finishing after the breaker moved on; the window
            // update above is all that applies.
            _ => {}
        }
    }

    /// Manually close a breaker (management API).
    pub fn reset(&self, pm: &ProviderModel) -> bool {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        match map.get(pm) {
            Some(b) => {
                b.lock().unwrap_or_else(|e| e.into_inner()).close();
                true
            }
            None => false,
        }
    }

    /// Snapshot every breaker the registry has seen.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut out: Vec<BreakerSnapshot> = map
            .iter()
            .map(|(pm, b)| {
                let inner = b.lock().unwrap_or_else(|e| e.into_inner());
                BreakerSnapshot {
                    provider: pm.provider.clone(),
                    model: pm.model.clone(),
                    state: inner.state.as_str(),
                    consecutive_failures: inner.consecutive_failures,
                    rolling_error_rate: inner.rolling_error_rate(),
                    open_for_ms: inner
                        .opened_at
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                    next_probe_in_ms: inner.next_probe_at.map(|at| {
                        at.checked_duration_since(now)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0)
                    }),
                }
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Zero open duration makes the probe transition immediate, which keeps
    /// these tests free of sleeps.
    fn config(failure_threshold: u32, open_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            failure_ratio: 0.5,
            window_size: 20,
            open_secs,
            half_open_probes: 1,
            open_secs_cap: 300,
        }
    }

    fn pm() -> ProviderModel {
        ProviderModel::new("openai", "gpt-x")
    }

    #[test]
    fn closed_admits_normally() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        assert_eq!(registry.admit(&pm()).unwrap(), Admission::Normal);
    }

    #[test]
    fn opens_at_exact_consecutive_threshold() {
        let registry = BreakerRegistry::new(config(3, 0));
        let pm = pm();

        for _ in 0..2 {
            let admission = registry.admit(&pm).unwrap();
            registry.record(&pm, admission, false);
        }
        // Two failures: still closed.
        assert_eq!(registry.admit(&pm).unwrap(), Admission::Normal);
        registry.record(&pm, Admission::Normal, false);

        // Third failure tripped it; with open duration zero the next admit
        // is a half-open probe rather than a rejection.
        assert_eq!(registry.admit(&pm).unwrap(), Admission::Probe);
    }

    #[test]
    fn open_rejects_with_retry_hint() {
        let mut cfg = config(1, 0);
        cfg.open_secs = 30;
        let registry = BreakerRegistry::new(cfg);
        let pm = pm();

        let admission = registry.admit(&pm).unwrap();
        registry.record(&pm, admission, false);

        let retry_after = registry.admit(&pm).unwrap_err();
        assert!(retry_after > Duration::from_secs(29));
        assert!(retry_after <= Duration::from_secs(30));
    }

    #[test]
    fn successful_probe_closes() {
        let registry = BreakerRegistry::new(config(1, 0));
        let pm = pm();

        registry.record(&pm, registry.admit(&pm).unwrap(), false);

        let admission = registry.admit(&pm).unwrap();
        assert_eq!(admission, Admission::Probe);
        registry.record(&pm, admission, true);

        assert_eq!(registry.admit(&pm).unwrap(), Admission::Normal);
        let snap = &registry.snapshot()[0];
        assert_eq!(snap.state, "closed");
        assert_eq!(snap.consecutive_failures, 0);
    }

    #[test]
    fn failed_probe_reopens() {
        let registry = BreakerRegistry::new(config(1, 0));
        let pm = pm();

        registry.record(&pm, registry.admit(&pm).unwrap(), false);

        let admission = registry.admit(&pm).unwrap();
        assert_eq!(admission, Admission::Probe);
        registry.record(&pm, admission, false);

        assert_eq!(registry.snapshot()[0].state, "open");
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let mut cfg = config(1, 0);
        cfg.half_open_probes = 2;
        let registry = BreakerRegistry::new(cfg);
        let pm = pm();

        registry.record(&pm, registry.admit(&pm).unwrap(), false);

        // Two probes admitted, the third waits.
        assert_eq!(registry.admit(&pm).unwrap(), Admission::Probe);
        assert_eq!(registry.admit(&pm).unwrap(), Admission::Probe);
        assert_eq!(registry.admit(&pm).unwrap_err(), HALF_OPEN_RETRY_HINT);

        // Both probes must succeed before the breaker closes.
        registry.record(&pm, Admission::Probe, true);
        assert_eq!(registry.snapshot()[0].state, "half_open");
        registry.record(&pm, Admission::Probe, true);
        assert_eq!(registry.snapshot()[0].state, "closed");
    }

    #[test]
    fn ratio_trips_at_boundary() {
        let cfg = BreakerConfig {
            failure_threshold: 100, // out of reach; only the ratio applies
            failure_ratio: 0.5,
            window_size: 4,
            open_secs: 30,
            half_open_probes: 1,
            open_secs_cap: 300,
        };
        let registry = BreakerRegistry::new(cfg);
        let pm = pm();

        // success, success, failure: window not yet full, ratio ignored.
        for success in [true, true, false] {
            registry.record(&pm, registry.admit(&pm).unwrap(), success);
        }
        assert!(registry.admit(&pm).is_ok());

        // Fourth outcome fills the window at exactly 2/4 = 0.5.
        registry.record(&pm, Admission::Normal, false);
        assert!(registry.admit(&pm).is_err(), "ratio boundary is inclusive");
    }

    #[test]
    fn breakers_are_isolated_per_provider_model() {
        let registry = BreakerRegistry::new(config(1, 0));
        let a = ProviderModel::new("openai", "gpt-x");
        let b = ProviderModel::new("openai", "gpt-y");

        registry.record(&a, registry.admit(&a).unwrap(), false);

        assert_eq!(registry.admit(&b).unwrap(), Admission::Normal);
    }

    #[test]
    fn manual_reset_closes() {
        let mut cfg = config(1, 0);
        cfg.open_secs = 60;
        let registry = BreakerRegistry::new(cfg);
        let pm = pm();

        registry.record(&pm, registry.admit(&pm).unwrap(), false);
        assert!(registry.admit(&pm).is_err());

        assert!(registry.reset(&pm));
        assert_eq!(registry.admit(&pm).unwrap(), Admission::Normal);

        assert!(!registry.reset(&ProviderModel::new("nobody", "nothing")));
    }

    #[test]
    fn snapshot_reports_error_rate() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let pm = pm();
        for success in [true, false, true, false] {
            registry.record(&pm, registry.admit(&pm).unwrap(), success);
        }
        let snap = &registry.snapshot()[0];
        assert!((snap.rolling_error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snap.state, "closed");
    }
}
