//! Multi-key API credential pool with health tracking.
//!
//! Keys rotate under a strategy fixed at construction (round-robin,
//! weighted, least-used, or strict priority). Failures move keys through
//! `healthy → cooling → disabled`; a reaper promotes cooled keys back once
//! their backoff expires. Leases are RAII: dropping one returns the
//! concurrency slot even on a panic path, while explicit release feeds the
//! health machine.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use secrecy::SecretString;

use crate::config::{KeyConfig, KeyPoolConfig};

/// Consecutive failures that send a key into cooling even without an
/// auth-class status.
const COOL_AFTER_CONSECUTIVE: u32 = 3;

/// Jitter applied to cooldown backoff, as a fraction of the base.
const COOLDOWN_JITTER: f64 = 0.2;

/// Key selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastUsed,
    Priority,
}

impl Strategy {
    /// Parse a strategy name. Accepts the documented aliases
    /// (`least-loaded` for `least-used`, `rr`, `weighted`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "rr" => Some(Strategy::RoundRobin),
            "weighted-round-robin" | "weighted_round_robin" | "weighted" => {
                Some(Strategy::WeightedRoundRobin)
            }
            "least-used" | "least_used" | "least-loaded" | "least_loaded" => {
                Some(Strategy::LeastUsed)
            }
            "priority" => Some(Strategy::Priority),
            _ => None,
        }
    }
}

/// Health state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Healthy,
    Degraded,
    Cooling,
    Disabled,
}

/// Outcome reported when a lease is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Success,
    /// Upstream failure; `status` carries the HTTP status when one exists.
    Failure { status: Option<u16> },
    /// The request never reached the provider (e.g. cancelled); only the
    /// concurrency slot is returned.
    Aborted,
}

#[derive(Debug)]
struct KeyEntry {
    id: String,
    secret: SecretString,
    weight: u32,
    max_concurrent: u32,
    priority: u32,
    state: KeyState,
    cooldown_until: Option<Instant>,
    /// Consecutive cooldowns, drives the exponential backoff.
    cooldown_count: u32,
    in_flight: u32,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    last_used: Option<Instant>,
}

impl KeyEntry {
    fn from_config(config: &KeyConfig) -> Self {
        Self {
            id: config.id.clone(),
            secret: config.key.clone(),
            weight: config.weight.max(1),
            max_concurrent: config.max_concurrent,
            priority: config.priority,
            state: KeyState::Healthy,
            cooldown_until: None,
            cooldown_count: 0,
            in_flight: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            last_used: None,
        }
    }

    /// Promote an expired cooldown. Called lazily on selection and by the
    /// reaper, so a key never stays cooled past its deadline.
    fn maybe_promote(&mut self, now: Instant) {
        if self.state == KeyState::Cooling
            && self.cooldown_until.is_some_and(|until| until <= now)
        {
            // The failure streak survives promotion: a key that fails again
            // right after cooling keeps marching toward disablement.
            self.state = KeyState::Healthy;
            self.cooldown_until = None;
        }
    }

    fn available(&self, now: Instant) -> bool {
        let state_ok = match self.state {
            KeyState::Healthy | KeyState::Degraded => true,
            KeyState::Cooling => self.cooldown_until.is_some_and(|until| until <= now),
            KeyState::Disabled => false,
        };
        state_ok && self.in_flight < self.max_concurrent
    }

    fn success_ratio(&self) -> f64 {
        self.successes as f64 / (self.successes + self.failures).max(1) as f64
    }
}

#[derive(Debug)]
struct ProviderKeys {
    entries: Vec<KeyEntry>,
    /// Round-robin cursor; for the weighted strategy this indexes the
    /// deterministic weight expansion.
    cursor: usize,
}

/// Per-key view for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeySnapshot {
    pub id: String,
    pub provider: String,
    pub state: KeyState,
    pub in_flight: u32,
    pub max_concurrent: u32,
    pub successes: u64,
    pub failures: u64,
    pub cooldown_remaining_ms: Option<u64>,
}

/// A borrowed key. Holds the concurrency slot until released or dropped.
pub struct ApiKeyLease {
    pool: Arc<KeyPoolShared>,
    provider: String,
    key_id: String,
    secret: SecretString,
    released: bool,
}

impl ApiKeyLease {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// Release the lease, reporting how the request went. Consumes the
    /// lease so a double release cannot compile.
    pub fn release(mut self, outcome: LeaseOutcome) {
        self.released = true;
        self.pool.release(&self.provider, &self.key_id, outcome);
    }
}

impl Drop for ApiKeyLease {
    fn drop(&mut self) {
        if !self.released {
            // Dropped without an explicit outcome (cancellation, panic
            // unwind): return the slot without touching health counters.
            self.pool
                .release(&self.provider, &self.key_id, LeaseOutcome::Aborted);
        }
    }
}

struct KeyPoolShared {
    strategy: Strategy,
    cooldown_base: Duration,
    cooldown_cap: Duration,
    disable_after_failures: u32,
    providers: Mutex<std::collections::HashMap<String, ProviderKeys>>,
}

impl KeyPoolShared {
    fn release(&self, provider: &str, key_id: &str, outcome: LeaseOutcome) {
        let mut map = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(keys) = map.get_mut(provider) else {
            return;
        };
        let Some(entry) = keys.entries.iter_mut().find(|e| e.id == key_id) else {
            return;
        };

        entry.in_flight = entry.in_flight.saturating_sub(1);

        match outcome {
            LeaseOutcome::Success => {
                entry.successes += 1;
                entry.consecutive_failures = 0;
                if entry.state == KeyState::Degraded {
                    entry.state = KeyState::Healthy;
                }
                // A run of successes earns back a shorter future cooldown.
                entry.cooldown_count = entry.cooldown_count.saturating_sub(1);
            }
            LeaseOutcome::Failure { status } => {
                entry.failures += 1;
                entry.consecutive_failures += 1;

                let auth_class = matches!(status, Some(401) | Some(403) | Some(429));
                if entry.consecutive_failures >= self.disable_after_failures {
                    tracing::warn!(key = %entry.id, provider, "key disabled after sustained failures");
                    entry.state = KeyState::Disabled;
                    entry.cooldown_until = None;
                } else if auth_class || entry.consecutive_failures >= COOL_AFTER_CONSECUTIVE {
                    let backoff = cooldown_backoff(
                        self.cooldown_base,
                        self.cooldown_cap,
                        entry.cooldown_count,
                    );
                    tracing::info!(
                        key = %entry.id,
                        provider,
                        ?backoff,
                        status = ?status,
                        "key cooling"
                    );
                    entry.state = KeyState::Cooling;
                    entry.cooldown_until = Some(Instant::now() + backoff);
                    entry.cooldown_count += 1;
                } else {
                    entry.state = KeyState::Degraded;
                }
            }
            LeaseOutcome::Aborted => {}
        }
    }
}

/// Exponential cooldown with ±20% jitter, capped.
fn cooldown_backoff(base: Duration, cap: Duration, cooldown_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(cooldown_count.min(16));
    let raw = (base * factor).min(cap);
    let jitter = 1.0 + rand::thread_rng().gen_range(-COOLDOWN_JITTER..COOLDOWN_JITTER);
    raw.mul_f64(jitter.max(0.0))
}

/// The process-wide key pool.
pub struct KeyPool {
    shared: Arc<KeyPoolShared>,
    reap_interval: Duration,
}

impl KeyPool {
    pub fn new(config: &KeyPoolConfig) -> Self {
        let strategy = Strategy::parse(&config.strategy).unwrap_or(Strategy::RoundRobin);
        let mut providers: std::collections::HashMap<String, ProviderKeys> =
            std::collections::HashMap::new();
        for key in &config.keys {
            providers
                .entry(key.provider.clone())
                .or_insert_with(|| ProviderKeys {
                    entries: Vec::new(),
                    cursor: 0,
                })
                .entries
                .push(KeyEntry::from_config(key));
        }
        // Priority order is fixed once, so the priority strategy is a
        // plain front-to-back walk.
        for keys in providers.values_mut() {
            keys.entries.sort_by_key(|e| e.priority);
        }
        Self {
            shared: Arc::new(KeyPoolShared {
                strategy,
                cooldown_base: Duration::from_secs(config.cooldown_base_secs),
                cooldown_cap: Duration::from_secs(config.cooldown_cap_secs),
                disable_after_failures: config.disable_after_failures,
                providers: Mutex::new(providers),
            }),
            reap_interval: Duration::from_secs(config.reap_interval_secs),
        }
    }

    pub fn reap_interval(&self) -> Duration {
        self.reap_interval
    }

    /// Borrow a key for `provider`, or `None` when every key is cooling,
    /// disabled, or at its concurrency limit.
    pub fn lease(&self, provider: &str) -> Option<ApiKeyLease> {
        let mut map = self
            .shared
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let keys = map.get_mut(provider)?;
        let now = Instant::now();

        for entry in keys.entries.iter_mut() {
            entry.maybe_promote(now);
        }

        let picked = match self.shared.strategy {
            Strategy::RoundRobin => pick_round_robin(keys, now),
            Strategy::WeightedRoundRobin => pick_weighted(keys, now),
            Strategy::LeastUsed => pick_least_used(keys, now),
            Strategy::Priority => keys.entries.iter().position(|e| e.available(now)),
        }?;

        let entry = &mut keys.entries[picked];
        entry.in_flight += 1;
        debug_assert!(entry.in_flight <= entry.max_concurrent);
        entry.last_used = Some(now);

        Some(ApiKeyLease {
            pool: Arc::clone(&self.shared),
            provider: provider.to_string(),
            key_id: entry.id.clone(),
            secret: entry.secret.clone(),
            released: false,
        })
    }

    /// Promote cooled keys whose backoff has expired. Run periodically.
    pub fn reap(&self) {
        let mut map = self
            .shared
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        for keys in map.values_mut() {
            for entry in keys.entries.iter_mut() {
                entry.maybe_promote(now);
            }
        }
    }

    /// Manually re-enable a disabled or cooling key (management API).
    pub fn reactivate(&self, provider: &str, key_id: &str) -> bool {
        let mut map = self
            .shared
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(keys) = map.get_mut(provider) else {
            return false;
        };
        let Some(entry) = keys.entries.iter_mut().find(|e| e.id == key_id) else {
            return false;
        };
        entry.state = KeyState::Healthy;
        entry.cooldown_until = None;
        entry.cooldown_count = 0;
        entry.consecutive_failures = 0;
        true
    }

    /// Snapshot every key across providers.
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let map = self
            .shared
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut out = Vec::new();
        for (provider, keys) in map.iter() {
            for entry in &keys.entries {
                out.push(KeySnapshot {
                    id: entry.id.clone(),
                    provider: provider.clone(),
                    state: entry.state,
                    in_flight: entry.in_flight,
                    max_concurrent: entry.max_concurrent,
                    successes: entry.successes,
                    failures: entry.failures,
                    cooldown_remaining_ms: entry.cooldown_until.map(|until| {
                        until
                            .checked_duration_since(now)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0)
                    }),
                });
            }
        }
        out.sort_by(|a, b| (&a.provider, &a.id).cmp(&(&b.provider, &b.id)));
        out
    }
}

fn pick_round_robin(keys: &mut ProviderKeys, now: Instant) -> Option<usize> {
    let len = keys.entries.len();
    if len == 0 {
        return None;
    }
    for offset in 0..len {
        let idx = (keys.cursor + offset) % len;
        if keys.entries[idx].available(now) {
            keys.cursor = (idx + 1) % len;
            return Some(idx);
        }
    }
    None
}

fn pick_weighted(keys: &mut ProviderKeys, now: Instant) -> Option<usize> {
    let total_weight: usize = keys
        .entries
        .iter()
        .map(|e| e.weight as usize)
        .sum::<usize>()
        .max(1);
    // Walk the deterministic weight expansion from the cursor, skipping
    // unavailable keys, so a weight-2 key takes two consecutive turns.
    for offset in 0..total_weight {
        let virtual_idx = (keys.cursor + offset) % total_weight;
        let mut cumulative = 0usize;
        for (idx, entry) in keys.entries.iter().enumerate() {
            cumulative += entry.weight as usize;
            if virtual_idx < cumulative {
                if entry.available(now) {
                    keys.cursor = (virtual_idx + 1) % total_weight;
                    return Some(idx);
                }
                break;
            }
        }
    }
    None
}

fn pick_least_used(keys: &mut ProviderKeys, now: Instant) -> Option<usize> {
    keys.entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.available(now))
        .min_by(|(_, a), (_, b)| {
            a.in_flight
                .cmp(&b.in_flight)
                // Better success ratio first.
                .then_with(|| {
                    b.success_ratio()
                        .partial_cmp(&a.success_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                // Older last-use first.
                .then_with(|| match (a.last_used, b.last_used) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp(&y),
                })
        })
        .map(|(idx, _)| idx)
}
