//! Hybrid rate limiting: token buckets plus optional sliding windows.
//!
//! Each configured scope class (global, per-provider, per-session, per-key)
//! gets a lazily created bucket per scope instance. Admission requires every
//! applicable bucket to admit; scopes compose by logical AND. Refill is
//! computed lazily from the monotonic clock, so there is no refill timer to
//! run or stop.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::{BucketConfig, RateLimitConfig};

/// The dimension a bucket is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Provider(String),
    Session(String),
    Key(String),
}

impl Scope {
    /// Stable identifier, used for bucket keys, error bodies, and stats.
    pub fn id(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Provider(name) => format!("provider:{name}"),
            Scope::Session(id) => format!("session:{id}"),
            Scope::Key(id) => format!("key:{id}"),
        }
    }
}

/// A denied admission: which scope denied and when to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub scope: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct SlidingWindow {
    window: Duration,
    max_in_window: u64,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest hit leaves the window, making room.
    fn retry_after(&self, now: Instant) -> Duration {
        match self.hits.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
    window: Option<SlidingWindow>,
}

impl Bucket {
    fn from_config(config: &BucketConfig, now: Instant) -> Self {
        let window = match (config.window_secs, config.max_in_window) {
            (Some(secs), Some(max)) => Some(SlidingWindow {
                window: Duration::from_secs(secs),
                max_in_window: max,
                hits: VecDeque::new(),
            }),
            _ => None,
        };
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            tokens: config.capacity,
            last_refill: now,
            window,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take `cost` tokens. On deny, returns when admission would
    /// next have been possible (never negative).
    fn take(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        let mut retry_after = Duration::ZERO;
        if self.tokens < cost {
            let missing = cost - self.tokens;
            let secs = if self.refill_per_sec > 0.0 {
                missing / self.refill_per_sec
            } else {
                // No refill configured: admission will never be possible;
                // report the window-equivalent of "much later".
                f64::MAX
            };
            retry_after = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        }

        if let Some(window) = &mut self.window {
            window.evict(now);
            if window.hits.len() as u64 >= window.max_in_window {
                retry_after = retry_after.max(window.retry_after(now));
            }
        }

        if retry_after > Duration::ZERO {
            return Err(retry_after);
        }

        self.tokens -= cost;
        if let Some(window) = &mut self.window {
            window.hits.push_back(now);
        }
        Ok(())
    }

    /// Give back tokens taken by a reservation that later failed.
    fn refund(&mut self, cost: f64) {
        self.tokens = (self.tokens + cost).min(self.capacity);
        if let Some(window) = &mut self.window {
            window.hits.pop_back();
        }
    }

    /// A bucket at full capacity with no recent hits holds no state worth
    /// keeping.
    fn is_idle(&self) -> bool {
        self.tokens >= self.capacity && self.window.as_ref().is_none_or(|w| w.hits.is_empty())
    }
}

/// Per-scope view for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScopeStats {
    pub scope: String,
    pub tokens: f64,
    pub capacity: f64,
    pub in_window: Option<u64>,
}

/// Process-wide rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn config_for(&self, scope: &Scope) -> Option<&BucketConfig> {
        match scope {
            Scope::Global => self.config.global.as_ref(),
            Scope::Provider(_) => self.config.per_provider.as_ref(),
            Scope::Session(_) => self.config.per_session.as_ref(),
            Scope::Key(_) => self.config.per_key.as_ref(),
        }
    }

    fn bucket(&self, key: &str, config: &BucketConfig, now: Instant) -> Arc<Mutex<Bucket>> {
        {
            let map = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = map.get(key) {
                return Arc::clone(b);
            }
        }
        let mut map = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::from_config(config, now)))),
        )
    }

    /// Evaluate admission across every applicable scope.
    ///
    /// Scopes with no configured bucket class are skipped. Tokens taken
    /// from earlier scopes are refunded if a later one denies, so a denial
    /// does not consume budget anywhere.
    pub fn allow(&self, scopes: &[Scope], cost: f64) -> Result<(), Denied> {
        let now = Instant::now();
        let mut taken: Vec<(Arc<Mutex<Bucket>>, f64)> = Vec::new();

        for scope in scopes {
            let Some(config) = self.config_for(scope) else {
                continue;
            };
            let bucket = self.bucket(&scope.id(), config, now);
            let result = {
                let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
                guard.take(cost, now)
            };
            match result {
                Ok(()) => taken.push((bucket, cost)),
                Err(retry_after) => {
                    for (bucket, cost) in taken {
                        bucket
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .refund(cost);
                    }
                    tracing::debug!(scope = %scope.id(), ?retry_after, "rate limit denied");
                    return Err(Denied {
                        scope: scope.id(),
                        retry_after,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drop buckets that have refilled completely and have an empty window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut map = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, bucket| {
            let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
            guard.refill(now);
            !guard.is_idle()
        });
    }

    /// Current state of every live bucket.
    pub fn stats(&self) -> Vec<ScopeStats> {
        let now = Instant::now();
        let map = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ScopeStats> = map
            .iter()
            .map(|(key, bucket)| {
                let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
                guard.refill(now);
                if let Some(w) = &mut guard.window {
                    w.evict(now);
                }
                ScopeStats {
                    scope: key.clone(),
                    tokens: guard.tokens,
                    capacity: guard.capacity,
                    in_window: guard.window.as_ref().map(|w| w.hits.len() as u64),
                }
            })
            .collect();
        out.sort_by(|a, b| a.scope.cmp(&b.scope));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_only(capacity: f64, refill: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            global: None,
            per_provider: None,
            per_session: Some(BucketConfig {
                capacity,
                refill_per_sec: refill,
                window_secs: None,
                max_in_window: None,
            }),
            per_key: None,
        })
    }

    #[test]
    fn bucket_admits_until_empty_then_reports_retry() {
        let limiter = session_only(2.0, 1.0);
        let scopes = [Scope::Session("s1".to_string())];

        assert!(limiter.allow(&scopes, 1.0).is_ok());
        assert!(limiter.allow(&scopes, 1.0).is_ok());

        let denied = limiter.allow(&scopes, 1.0).unwrap_err();
        assert_eq!(denied.scope, "session:s1");
        // Third request needs ~1 token at 1 token/sec.
        assert!(denied.retry_after > Duration::from_millis(900));
        assert!(denied.retry_after <= Duration::from_secs(1));
    }

    #[test]
    fn sessions_are_isolated() {
        let limiter = session_only(1.0, 0.0);
        assert!(limiter.allow(&[Scope::Session("a".to_string())], 1.0).is_ok());
        assert!(limiter.allow(&[Scope::Session("b".to_string())], 1.0).is_ok());
        assert!(limiter.allow(&[Scope::Session("a".to_string())], 1.0).is_err());
    }

    #[test]
    fn unconfigured_scopes_are_skipped() {
        let limiter = session_only(1.0, 0.0);
        // No global bucket configured: global-only requests always pass.
        for _ in 0..10 {
            assert!(limiter.allow(&[Scope::Global], 1.0).is_ok());
        }
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = session_only(1.0, 1000.0);
        let scopes = [Scope::Session("s".to_string())];

        assert!(limiter.allow(&scopes, 1.0).is_ok());
        std::thread::sleep(Duration::from_millis(5));
        // 5ms at 1000 tokens/sec refills well past one token (capped at capacity).
        assert!(limiter.allow(&scopes, 1.0).is_ok());
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let limiter = session_only(2.0, 1000.0);
        let scopes = [Scope::Session("s".to_string())];

        // Create the bucket, then let the aggressive refill run for a while.
        assert!(limiter.allow(&scopes, 1.0).is_ok());
        std::thread::sleep(Duration::from_millis(10));

        let stats = limiter.stats();
        let bucket = &stats[0];
        assert!(
            bucket.tokens <= bucket.capacity,
            "tokens {} exceed capacity {}",
            bucket.tokens,
            bucket.capacity
        );
    }

    #[test]
    fn denial_refunds_earlier_scopes() {
        let limiter = RateLimiter::new(RateLimitConfig {
            global: Some(BucketConfig {
                capacity: 10.0,
                refill_per_sec: 0.0,
                window_secs: None,
                max_in_window: None,
            }),
            per_provider: None,
            per_session: Some(BucketConfig {
                capacity: 1.0,
                refill_per_sec: 0.0,
                window_secs: None,
                max_in_window: None,
            }),
            per_key: None,
        });
        let scopes = [Scope::Global, Scope::Session("s".to_string())];

        assert!(limiter.allow(&scopes, 1.0).is_ok());
        // Session bucket is now empty; the global tokens taken for these
        // denied attempts must be refunded.
        for _ in 0..20 {
            assert!(limiter.allow(&scopes, 1.0).is_err());
        }
        let stats = limiter.stats();
        let global = stats.iter().find(|s| s.scope == "global").unwrap();
        assert!((global.tokens - 9.0).abs() < 1e-6, "tokens: {}", global.tokens);
    }

    #[test]
    fn sliding_window_caps_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            global: None,
            per_provider: None,
            per_session: Some(BucketConfig {
                capacity: 100.0,
                refill_per_sec: 100.0,
                window_secs: Some(60),
                max_in_window: Some(3),
            }),
            per_key: None,
        });
        let scopes = [Scope::Session("s".to_string())];

        for _ in 0..3 {
            assert!(limiter.allow(&scopes, 1.0).is_ok());
        }
        let denied = limiter.allow(&scopes, 1.0).unwrap_err();
        // Plenty of tokens, but the window is full for ~60s.
        assert!(denied.retry_after > Duration::from_secs(59));
    }

    #[test]
    fn retry_after_is_never_negative() {
        let limiter = session_only(0.0, 1.0);
        let denied = limiter
            .allow(&[Scope::Session("s".to_string())], 1.0)
            .unwrap_err();
        assert!(denied.retry_after >= Duration::ZERO);
    }

    #[test]
    fn sweep_drops_idle_buckets_only() {
        let limiter = session_only(1.0, 1000.0);
        assert!(limiter.allow(&[Scope::Session("a".to_string())], 1.0).is_ok());
        assert_eq!(limiter.stats().len(), 1);

        // After refill the bucket is idle again and sweepable.
        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep();
        assert!(limiter.stats().is_empty());
    }

    #[test]
    fn scope_ids_are_stable() {
        assert_eq!(Scope::Global.id(), "global");
        assert_eq!(Scope::Provider("openai".to_string()).id(), "provider:openai");
        assert_eq!(Scope::Key("k1".to_string()).id(), "key:k1");
    }
}
