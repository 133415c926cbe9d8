//! Response cache: L1 in-memory LRU with an optional durable L2 tier.
//!
//! Keys are fingerprints over a configurable projection of the request
//! body (see [`fingerprint`]). Lookup order is L1, then L2 (with promotion
//! back into L1), then — when enabled — a token-set similarity scan over
//! live L1 entries. Concurrent requests for the same fingerprint coalesce
//! onto one origin call unless `coalesce` is off.
//!
//! Only eligible requests touch the cache: non-streaming, temperature at
//! or under the ceiling, and not opted out via metadata.

mod disk;
pub mod fingerprint;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use lru::LruCache;
use rand::Rng;
use serde_json::Value;
use tokio::sync::Notify;

use crate::config::CacheConfig;
use crate::usage::TokenUsage;

pub use disk::{DiskEntry, DiskTier};
pub use fingerprint::Projection;

/// A cached upstream response.
#[derive(Debug)]
pub struct CachedResponse {
    pub fingerprint: String,
    pub payload: Value,
    pub provider: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    /// Request text kept for similarity matching.
    pub input_text: String,
    expires_at: Instant,
    size_bytes: usize,
    hits: AtomicU64,
}

impl CachedResponse {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Which tier satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTier {
    L1,
    L2,
    /// A similarity neighbor, not an exact fingerprint match.
    Similar,
}

impl HitTier {
    /// Value for the response's cache annotation header.
    pub fn annotation(self) -> &'static str {
        match self {
            HitTier::L1 | HitTier::L2 => "hit",
            HitTier::Similar => "similar",
        }
    }
}

/// Result of a cache lookup.
pub enum Lookup {
    Hit {
        entry: Arc<CachedResponse>,
        tier: HitTier,
    },
    /// Miss. When this request won the single-flight race, `flight` holds
    /// the ticket whose drop (or completion) wakes coalesced waiters.
    Miss { flight: Option<FlightTicket> },
}

/// Held by the request performing the origin call for a fingerprint.
pub struct FlightTicket {
    pending: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    fingerprint: String,
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        let notify = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&self.fingerprint)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

struct L1 {
    entries: LruCache<String, Arc<CachedResponse>>,
    bytes: usize,
}

/// Aggregate statistics for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub similar_hits: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub bytes: usize,
    pub l2_entries: Option<usize>,
    /// Most-accessed fingerprints, highest first.
    pub top_fingerprints: Vec<TopFingerprint>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TopFingerprint {
    pub fingerprint: String,
    pub hits: u64,
}

const TOP_N: usize = 10;

/// Upper bound on one single-flight wait; the lookup loop re-checks the
/// cache at this cadence in case a wakeup was lost to a race.
const FLIGHT_RECHECK: Duration = Duration::from_millis(100);

/// The process-wide cache store.
pub struct CacheStore {
    config: CacheConfig,
    projection: Projection,
    l1: Mutex<L1>,
    l2: Option<DiskTier>,
    pending: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    similar_hits: AtomicU64,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        let projection = Projection::new(
            config.include_fields.clone(),
            config.exclude_fields.clone(),
        );
        let l2 = config
            .l2_dir
            .as_deref()
            .filter(|_| config.enabled)
            .and_then(DiskTier::open);
        let capacity = NonZeroUsize::new(config.max_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            projection,
            l1: Mutex::new(L1 {
                entries: LruCache::new(capacity),
                bytes: 0,
            }),
            l2,
            pending: Arc::new(Mutex::new(HashMap::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            similar_hits: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_secs)
    }

    /// Whether a request body may consult or populate the cache.
    pub fn eligible(&self, body: &Value) -> bool {
        if !self.config.enabled {
            return false;
        }
        if body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false) {
            return false;
        }
        if let Some(temp) = body.get("temperature").and_then(|t| t.as_f64()) {
            if temp > self.config.temp_ceiling {
                return false;
            }
        }
        // Explicit opt-outs: metadata.no_cache or a top-level cache:false.
        if body
            .pointer("/metadata/no_cache")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return false;
        }
        if body.get("cache").and_then(|v| v.as_bool()) == Some(false) {
            return false;
        }
        true
    }

    /// Fingerprint of the projected request body.
    pub fn fingerprint(&self, body: &Value) -> String {
        fingerprint::fingerprint(&self.projection, body)
    }

    /// Look up a fingerprint, coalescing with any in-flight origin call.
    ///
    /// The returned [`Lookup::Miss`] carries the single-flight ticket when
    /// this caller should perform the origin call. Waiters re-check the
    /// cache once the flight completes; if it failed (nothing was written)
    /// the first waiter inherits the flight.
    pub async fn lookup(&self, fingerprint: &str, input_text: &str) -> Lookup {
        loop {
            if let Some((entry, tier)) = self.get(fingerprint, input_text) {
                return Lookup::Hit { entry, tier };
            }

            if !self.config.coalesce {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Lookup::Miss { flight: None };
            }

            let waiter = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                match pending.get(fingerprint) {
                    Some(notify) => Arc::clone(notify),
                    None => {
                        pending.insert(fingerprint.to_string(), Arc::new(Notify::new()));
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        return Lookup::Miss {
                            flight: Some(FlightTicket {
                                pending: Arc::clone(&self.pending),
                                fingerprint: fingerprint.to_string(),
                            }),
                        };
                    }
                }
            };
            // The flight may complete between the map read above and the
            // wakeup registering, so the wait is bounded and the loop
            // re-checks rather than trusting the notification alone.
            let _ = tokio::time::timeout(FLIGHT_RECHECK, waiter.notified()).await;
        }
    }

    fn get(&self, fingerprint: &str, input_text: &str) -> Option<(Arc<CachedResponse>, HitTier)> {
        let now = Instant::now();

        {
            let mut l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = l1.entries.get(fingerprint) {
                if entry.is_expired(now) {
                    let removed = l1.entries.pop(fingerprint);
                    if let Some(removed) = removed {
                        l1.bytes = l1.bytes.saturating_sub(removed.size_bytes);
                    }
                } else {
                    let entry = Arc::clone(entry);
                    entry.hits.fetch_add(1, Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some((entry, HitTier::L1));
                }
            }
        }

        // L1 missed; consult the durable tier and promote.
        if let Some(l2) = &self.l2 {
            if let Some(disk_entry) = l2.get(fingerprint) {
                let remaining = (disk_entry.expires_at_unix - Utc::now().timestamp()).max(0);
                let entry = Arc::new(CachedResponse {
                    fingerprint: disk_entry.fingerprint,
                    size_bytes: disk_entry.payload.to_string().len(),
                    payload: disk_entry.payload,
                    provider: disk_entry.provider,
                    model: disk_entry.model,
                    usage: disk_entry.usage,
                    input_text: disk_entry.input_text,
                    expires_at: now + Duration::from_secs(remaining as u64),
                    hits: AtomicU64::new(1),
                });
                self.insert_l1(Arc::clone(&entry));
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some((entry, HitTier::L2));
            }
        }

        if self.config.similarity && !input_text.is_empty() {
            if let Some(entry) = self.find_similar(input_text, now) {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                self.similar_hits.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some((entry, HitTier::Similar));
            }
        }

        None
    }

    fn find_similar(&self, input_text: &str, now: Instant) -> Option<Arc<CachedResponse>> {
        let l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<(f64, Arc<CachedResponse>)> = None;
        for (_, entry) in l1.entries.iter() {
            if entry.is_expired(now) || entry.input_text.is_empty() {
                continue;
            }
            let score = fingerprint::similarity(input_text, &entry.input_text);
            if score >= self.config.similarity_threshold
                && best.as_ref().is_none_or(|(b, _)| score > *b)
            {
                best = Some((score, Arc::clone(entry)));
            }
        }
        best.map(|(_, entry)| entry)
    }

    /// Store a successful response. TTL jitter (±`ttl_variance_pct`) keeps
    /// a burst of writes from expiring in lockstep.
    pub fn put(
        &self,
        fingerprint: String,
        payload: Value,
        provider: String,
        model: String,
        usage: Option<TokenUsage>,
        input_text: String,
    ) {
        if !self.config.enabled {
            return;
        }
        let ttl = self.jittered_ttl();
        let size_bytes = payload.to_string().len();
        let entry = Arc::new(CachedResponse {
            fingerprint: fingerprint.clone(),
            payload,
            provider,
            model,
            usage,
            input_text,
            expires_at: Instant::now() + ttl,
            size_bytes,
            hits: AtomicU64::new(0),
        });

        if let Some(l2) = &self.l2 {
            let now_unix = Utc::now().timestamp();
            l2.put(&DiskEntry {
                fingerprint,
                payload: entry.payload.clone(),
                provider: entry.provider.clone(),
                model: entry.model.clone(),
                usage: entry.usage,
                input_text: entry.input_text.clone(),
                inserted_at_unix: now_unix,
                expires_at_unix: now_unix + ttl.as_secs() as i64,
            });
        }

        self.insert_l1(entry);
    }

    fn insert_l1(&self, entry: Arc<CachedResponse>) {
        let mut l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
        l1.bytes += entry.size_bytes;
        if let Some((_, replaced)) = l1.entries.push(entry.fingerprint.clone(), entry) {
            l1.bytes = l1.bytes.saturating_sub(replaced.size_bytes);
        }
        while l1.bytes > self.config.max_bytes {
            match l1.entries.pop_lru() {
                Some((_, evicted)) => {
                    l1.bytes = l1.bytes.saturating_sub(evicted.size_bytes);
                }
                None => break,
            }
        }
    }

    fn jittered_ttl(&self) -> Duration {
        let ttl = self.config.ttl();
        let variance = f64::from(self.config.ttl_variance_pct) / 100.0;
        if variance <= 0.0 {
            return ttl;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-variance..variance);
        ttl.mul_f64(factor.max(0.0))
    }

    /// Remove entries whose `provider/model/fingerprint` path matches the
    /// glob pattern. Returns how many entries were dropped (L1 count).
    pub fn invalidate(&self, pattern: &str) -> usize {
        let Ok(glob) = glob::Pattern::new(pattern) else {
            return 0;
        };
        let matches_entry = |provider: &str, model: &str, fp: &str| {
            glob.matches(&format!("{provider}/{model}/{fp}")) || glob.matches(fp)
        };

        let removed_keys: Vec<String> = {
            let l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
            l1.entries
                .iter()
                .filter(|(_, e)| matches_entry(&e.provider, &e.model, &e.fingerprint))
                .map(|(k, _)| k.clone())
                .collect()
        };
        {
            let mut l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
            for key in &removed_keys {
                if let Some(entry) = l1.entries.pop(key) {
                    l1.bytes = l1.bytes.saturating_sub(entry.size_bytes);
                }
            }
        }
        if let Some(l2) = &self.l2 {
            l2.remove_matching(|e| matches_entry(&e.provider, &e.model, &e.fingerprint));
        }
        removed_keys.len()
    }

    /// Drop every entry in both tiers.
    pub fn flush(&self) {
        {
            let mut l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
            l1.entries.clear();
            l1.bytes = 0;
        }
        if let Some(l2) = &self.l2 {
            l2.flush();
        }
    }

    /// Background sweep: drop expired entries in both tiers.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
            l1.entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect()
        };
        if !expired.is_empty() {
            let mut l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());
            for key in expired {
                if let Some(entry) = l1.entries.pop(&key) {
                    l1.bytes = l1.bytes.saturating_sub(entry.size_bytes);
                }
            }
        }
        if let Some(l2) = &self.l2 {
            l2.sweep();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let l1 = self.l1.lock().unwrap_or_else(|e| e.into_inner());

        let mut top: Vec<TopFingerprint> = l1
            .entries
            .iter()
            .map(|(k, e)| TopFingerprint {
                fingerprint: k.clone(),
                hits: e.hits.load(Ordering::Relaxed),
            })
            .collect();
        top.sort_by(|a, b| b.hits.cmp(&a.hits));
        top.truncate(TOP_N);

        CacheStats {
            hits,
            misses,
            similar_hits: self.similar_hits.load(Ordering::Relaxed),
            // Zero total divides to zero, not NaN.
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            entries: l1.entries.len(),
            bytes: l1.bytes,
            l2_entries: self.l2.as_ref().map(|l2| l2.len()),
            top_fingerprints: top,
        }
    }
}
