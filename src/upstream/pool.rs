//! Per-origin keep-alive connection pool.
//!
//! Each origin owns a bounded set of slots; a slot wraps a dedicated
//! `reqwest::Client` capped at one idle connection, so checkout/checkin of
//! a slot maps one-to-one onto reuse of an upstream socket. Acquire prefers
//! a session's previously bound slot (affinity), then the most recently
//! released idle slot, then creates, then parks bounded by `wait_timeout`.
//!
//! Invariant: `active + idle <= max_per_origin` per origin, and a slot
//! handed out is never handed out again until released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::PoolConfig;

/// Why an acquire failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// No slot became available within `wait_timeout`.
    Timeout,
    /// The pool is shutting down.
    Closed,
    /// The underlying HTTP client could not be built.
    Build(String),
}

/// Outcome reported when a connection is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    /// The request failed; the slot is closed rather than reused.
    Failure,
}

struct Slot {
    id: u64,
    client: reqwest::Client,
    created_at: Instant,
    last_used: Instant,
    requests_served: u64,
}

struct AffinityBinding {
    slot_id: u64,
    last_used: Instant,
}

struct OriginInner {
    /// Idle slots, most recently released at the back (LIFO reuse keeps
    /// sockets warm and lets the oldest time out).
    idle: VecDeque<Slot>,
    active: usize,
    affinity: HashMap<String, AffinityBinding>,
    next_slot_id: u64,
    closed: bool,
}

struct OriginPool {
    origin: String,
    inner: Mutex<OriginInner>,
    available: Notify,
    created_total: AtomicU64,
    reuse_total: AtomicU64,
}

/// Recycling thresholds copied into each checked-out connection so a
/// release never needs the pool's config back.
#[derive(Debug, Clone, Copy)]
struct RecyclePolicy {
    max_requests: u64,
    max_lifetime: Duration,
    max_affine_sessions: usize,
}

/// A borrowed connection slot. Release it with an outcome; dropping it
/// without one closes the underlying client (never silently re-pools).
pub struct Connection {
    pool: Arc<OriginPool>,
    slot: Option<Slot>,
    session_id: Option<String>,
    policy: RecyclePolicy,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("origin", &self.pool.origin)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Connection {
    pub fn client(&self) -> &reqwest::Client {
        // Present from acquire until release consumes self.
        &self.slot.as_ref().expect("slot present until release").client
    }

    pub fn origin(&self) -> &str {
        &self.pool.origin
    }

    /// Slot identity, stable across reuses of the same underlying client.
    pub fn slot_id(&self) -> u64 {
        self.slot.as_ref().expect("slot present until release").id
    }

    /// Return the slot to the pool. Failed outcomes, worn-out slots
    /// (request count) and aged slots (lifetime) close instead of re-idling.
    pub fn release(mut self, outcome: ReleaseOutcome) {
        let mut slot = self.slot.take().expect("slot present until release");
        let now = Instant::now();
        slot.requests_served += 1;
        slot.last_used = now;

        let recycle = outcome == ReleaseOutcome::Failure
            || slot.requests_served >= self.policy.max_requests
            || now.duration_since(slot.created_at) >= self.policy.max_lifetime;

        let mut inner = self.pool.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.active = inner.active.saturating_sub(1);

        if let Some(session_id) = self.session_id.take() {
            bind_affinity(
                &mut inner,
                session_id,
                slot.id,
                now,
                self.policy.max_affine_sessions,
            );
        }

        if recycle || inner.closed {
            inner.affinity.retain(|_, b| b.slot_id != slot.id);
            tracing::debug!(origin = %self.pool.origin, slot = slot.id, "closing connection slot");
            // Dropping the slot drops its client and with it the socket.
        } else {
            inner.idle.push_back(slot);
        }
        drop(inner);
        self.pool.available.notify_one();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Dropped without release (cancellation or panic unwind): close the
        // slot and free capacity.
        if self.slot.take().is_some() {
            let mut inner = self.pool.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.active = inner.active.saturating_sub(1);
            drop(inner);
            self.pool.available.notify_one();
        }
    }
}

fn bind_affinity(
    inner: &mut OriginInner,
    session_id: String,
    slot_id: u64,
    now: Instant,
    max_affine_sessions: usize,
) {
    inner.affinity.insert(
        session_id,
        AffinityBinding {
            slot_id,
            last_used: now,
        },
    );
    // LRU-evict bindings (not connections) beyond the cap.
    while inner.affinity.len() > max_affine_sessions {
        let oldest = inner
            .affinity
            .iter()
            .min_by_key(|(_, b)| b.last_used)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                inner.affinity.remove(&key);
            }
            None => break,
        }
    }
}

/// Per-origin counters for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OriginStats {
    pub origin: String,
    pub active: usize,
    pub idle: usize,
    pub created_total: u64,
    pub reuse_total: u64,
    pub reuse_rate: f64,
    pub affine_sessions: usize,
}

/// The process-wide outbound connection pool.
pub struct ConnectionPool {
    config: PoolConfig,
    origins: Mutex<HashMap<String, Arc<OriginPool>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            origins: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn origin_pool(&self, origin: &str) -> Arc<OriginPool> {
        let mut map = self.origins.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(origin.to_string()).or_insert_with(|| {
            Arc::new(OriginPool {
                origin: origin.to_string(),
                inner: Mutex::new(OriginInner {
                    idle: VecDeque::new(),
                    active: 0,
                    affinity: HashMap::new(),
                    next_slot_id: 0,
                    closed: false,
                }),
                available: Notify::new(),
                created_total: AtomicU64::new(0),
                reuse_total: AtomicU64::new(0),
            })
        }))
    }

    fn build_client(&self) -> Result<reqwest::Client, AcquireError> {
        reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout())
            // One idle upstream socket per slot keeps slot checkout
            // equivalent to socket reuse.
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(self.config.free_socket_timeout())
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| AcquireError::Build(e.to_string()))
    }

    /// Borrow a slot for `origin`, honoring session affinity.
    pub async fn acquire(
        &self,
        origin: &str,
        session_id: Option<&str>,
    ) -> Result<Connection, AcquireError> {
        let pool = self.origin_pool(origin);
        let deadline = Instant::now() + self.config.wait_timeout();

        loop {
            {
                let mut inner = pool.inner.lock().unwrap_or_else(|e| e.into_inner());
                if inner.closed {
                    return Err(AcquireError::Closed);
                }
                let now = Instant::now();

                // Affinity first: the session's bound slot, if idle.
                if let Some(session_id) = session_id {
                    if let Some(binding) = inner.affinity.get_mut(session_id) {
                        binding.last_used = now;
                        let slot_id = binding.slot_id;
                        if let Some(pos) = inner.idle.iter().position(|s| s.id == slot_id) {
                            let slot = inner.idle.remove(pos).expect("position just found");
                            inner.active += 1;
                            pool.reuse_total.fetch_add(1, Ordering::Relaxed);
                            drop(inner);
                            return Ok(self.checkout(&pool, slot, Some(session_id)));
                        }
                        // Bound slot is busy or gone; fall through.
                    }
                }

                // Discard stale idle slots, then reuse the most recently
                // released one — preferring slots not bound to some other
                // session so affinity bindings stay useful.
                let free_socket_timeout = self.config.free_socket_timeout();
                let max_lifetime = self.config.max_lifetime();
                let stale_ids: Vec<u64> = inner
                    .idle
                    .iter()
                    .filter(|slot| {
                        now.duration_since(slot.last_used) >= free_socket_timeout
                            || now.duration_since(slot.created_at) >= max_lifetime
                    })
                    .map(|slot| slot.id)
                    .collect();
                if !stale_ids.is_empty() {
                    inner.idle.retain(|slot| !stale_ids.contains(&slot.id));
                    inner.affinity.retain(|_, b| !stale_ids.contains(&b.slot_id));
                }

                let bound: std::collections::HashSet<u64> =
                    inner.affinity.values().map(|b| b.slot_id).collect();
                let unbound_pos = inner
                    .idle
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, slot)| !bound.contains(&slot.id))
                    .map(|(pos, _)| pos);
                // Idle slots bound to other sessions are a last resort:
                // prefer them only over waiting, never over creating.
                let at_capacity =
                    inner.active + inner.idle.len() >= self.config.max_per_origin;
                let pos = unbound_pos.or_else(|| {
                    at_capacity
                        .then(|| inner.idle.len().checked_sub(1))
                        .flatten()
                });
                if let Some(pos) = pos {
                    let slot = inner.idle.remove(pos).expect("position just found");
                    inner.active += 1;
                    pool.reuse_total.fetch_add(1, Ordering::Relaxed);
                    drop(inner);
                    return Ok(self.checkout(&pool, slot, session_id));
                }

                // Room to create a fresh slot.
                if inner.active + inner.idle.len() < self.config.max_per_origin {
                    let id = inner.next_slot_id;
                    inner.next_slot_id += 1;
                    inner.active += 1;
                    drop(inner);

                    let client = match self.build_client() {
                        Ok(client) => client,
                        Err(e) => {
                            let mut inner =
                                pool.inner.lock().unwrap_or_else(|e| e.into_inner());
                            inner.active = inner.active.saturating_sub(1);
                            drop(inner);
                            pool.available.notify_one();
                            return Err(e);
                        }
                    };
                    pool.created_total.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    return Ok(self.checkout(
                        &pool,
                        Slot {
                            id,
                            client,
                            created_at: now,
                            last_used: now,
                            requests_served: 0,
                        },
                        session_id,
                    ));
                }
            }

            // Saturated: park until a release, bounded by the wait timeout.
            let remaining = deadline.checked_duration_since(Instant::now());
            let Some(remaining) = remaining else {
                return Err(AcquireError::Timeout);
            };
            if tokio::time::timeout(remaining, pool.available.notified())
                .await
                .is_err()
            {
                return Err(AcquireError::Timeout);
            }
        }
    }

    fn checkout(
        &self,
        pool: &Arc<OriginPool>,
        slot: Slot,
        session_id: Option<&str>,
    ) -> Connection {
        Connection {
            pool: Arc::clone(pool),
            slot: Some(slot),
            session_id: session_id.map(str::to_string),
            policy: RecyclePolicy {
                max_requests: self.config.max_requests_per_connection,
                max_lifetime: self.config.max_lifetime(),
                max_affine_sessions: self.config.max_affine_sessions,
            },
        }
    }

    /// Release helper mirroring `acquire` for call-site symmetry.
    pub fn release(&self, connection: Connection, outcome: ReleaseOutcome) {
        connection.release(outcome);
    }

    /// Background maintenance: close idle slots past `free_socket_timeout`
    /// and expire affinity bindings past `affinity_idle`.
    pub fn maintain(&self) {
        let now = Instant::now();
        let map = self.origins.lock().unwrap_or_else(|e| e.into_inner());
        for pool in map.values() {
            let mut inner = pool.inner.lock().unwrap_or_else(|e| e.into_inner());
            let timeout = self.config.free_socket_timeout();
            let lifetime = self.config.max_lifetime();
            let before = inner.idle.len();
            inner.idle.retain(|slot| {
                now.duration_since(slot.last_used) < timeout
                    && now.duration_since(slot.created_at) < lifetime
            });
            let closed = before - inner.idle.len();
            if closed > 0 {
                tracing::debug!(origin = %pool.origin, closed, "closed idle connections");
            }
            let affinity_idle = self.config.affinity_idle();
            inner
                .affinity
                .retain(|_, binding| now.duration_since(binding.last_used) < affinity_idle);
            // Drop bindings whose slot no longer exists in the idle set or
            // in flight; a stale binding can only misdirect.
            let live: std::collections::HashSet<u64> =
                inner.idle.iter().map(|s| s.id).collect();
            let active = inner.active;
            if active == 0 {
                inner.affinity.retain(|_, b| live.contains(&b.slot_id));
            }
        }
    }

    /// Close every idle connection and refuse new acquires. In-flight
    /// connections drain through their normal release path.
    pub fn close(&self) {
        let map = self.origins.lock().unwrap_or_else(|e| e.into_inner());
        for pool in map.values() {
            let mut inner = pool.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closed = true;
            inner.idle.clear();
            inner.affinity.clear();
            drop(inner);
            pool.available.notify_waiters();
        }
    }

    pub fn stats(&self) -> Vec<OriginStats> {
        let map = self.origins.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<OriginStats> = map
            .values()
            .map(|pool| {
                let inner = pool.inner.lock().unwrap_or_else(|e| e.into_inner());
                let created = pool.created_total.load(Ordering::Relaxed);
                let reused = pool.reuse_total.load(Ordering::Relaxed);
                let denom = created + reused;
                OriginStats {
                    origin: pool.origin.clone(),
                    active: inner.active,
                    idle: inner.idle.len(),
                    created_total: created,
                    reuse_total: reused,
                    reuse_rate: if denom == 0 {
                        0.0
                    } else {
                        reused as f64 / denom as f64
                    },
                    affine_sessions: inner.affinity.len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.origin.cmp(&b.origin));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://api.example.com:443";

    fn pool(max_per_origin: usize, wait_timeout_ms: u64) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_per_origin,
            wait_timeout_ms,
            ..PoolConfig::default()
        })
    }

    #[tokio::test]
    async fn acquire_release_reuses_the_slot() {
        let pool = pool(4, 100);

        let conn = pool.acquire(ORIGIN, None).await.unwrap();
        let first_id = conn.slot_id();
        pool.release(conn, ReleaseOutcome::Success);

        let conn = pool.acquire(ORIGIN, None).await.unwrap();
        assert_eq!(conn.slot_id(), first_id, "idle slot should be reused");
        pool.release(conn, ReleaseOutcome::Success);

        let stats = &pool.stats()[0];
        assert_eq!(stats.created_total, 1);
        assert_eq!(stats.reuse_total, 1);
        assert!((stats.reuse_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn release_restores_active_and_idle() {
        let pool = pool(4, 100);

        let conn = pool.acquire(ORIGIN, None).await.unwrap();
        let stats = &pool.stats()[0];
        assert_eq!((stats.active, stats.idle), (1, 0));

        pool.release(conn, ReleaseOutcome::Success);
        let stats = &pool.stats()[0];
        assert_eq!((stats.active, stats.idle), (0, 1));
    }

    #[tokio::test]
    async fn failure_outcome_closes_instead_of_idling() {
        let pool = pool(4, 100);

        let conn = pool.acquire(ORIGIN, None).await.unwrap();
        pool.release(conn, ReleaseOutcome::Failure);

        let stats = &pool.stats()[0];
        assert_eq!((stats.active, stats.idle), (0, 0));
    }

    #[tokio::test]
    async fn saturation_blocks_then_times_out() {
        let pool = pool(1, 50);

        let held = pool.acquire(ORIGIN, None).await.unwrap();
        let started = Instant::now();
        let err = pool.acquire(ORIGIN, None).await.unwrap_err();
        assert_eq!(err, AcquireError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));

        pool.release(held, ReleaseOutcome::Success);
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let pool = Arc::new(pool(1, 1_000));

        let held = pool.acquire(ORIGIN, None).await.unwrap();
        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire(ORIGIN, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(held, ReleaseOutcome::Success);
        let conn = waiter.await.unwrap().unwrap();
        pool.release(conn, ReleaseOutcome::Success);
    }

    #[tokio::test]
    async fn active_plus_idle_never_exceeds_cap() {
        let pool = pool(2, 50);

        let a = pool.acquire(ORIGIN, None).await.unwrap();
        let b = pool.acquire(ORIGIN, None).await.unwrap();
        assert!(pool.acquire(ORIGIN, None).await.is_err());

        pool.release(a, ReleaseOutcome::Success);
        pool.release(b, ReleaseOutcome::Success);
        let stats = &pool.stats()[0];
        assert!(stats.active + stats.idle <= 2);
    }

    #[tokio::test]
    async fn session_affinity_returns_bound_slot() {
        let pool = pool(4, 100);

        let conn = pool.acquire(ORIGIN, Some("session-1")).await.unwrap();
        let bound_id = conn.slot_id();
        pool.release(conn, ReleaseOutcome::Success);

        // Another session takes a different slot even though the bound one
        // is idle and most recently used.
        let other = pool.acquire(ORIGIN, Some("session-2")).await.unwrap();
        let conn = pool.acquire(ORIGIN, Some("session-1")).await.unwrap();
        assert_eq!(conn.slot_id(), bound_id);

        pool.release(conn, ReleaseOutcome::Success);
        pool.release(other, ReleaseOutcome::Success);
    }

    #[tokio::test]
    async fn affinity_bindings_evict_lru_beyond_cap() {
        let pool = ConnectionPool::new(PoolConfig {
            max_per_origin: 8,
            wait_timeout_ms: 100,
            max_affine_sessions: 2,
            ..PoolConfig::default()
        });

        for session in ["s1", "s2", "s3"] {
            let conn = pool.acquire(ORIGIN, Some(session)).await.unwrap();
            pool.release(conn, ReleaseOutcome::Success);
        }
        assert_eq!(pool.stats()[0].affine_sessions, 2, "oldest binding evicted");
    }

    #[tokio::test]
    async fn worn_out_slot_is_recycled() {
        let pool = ConnectionPool::new(PoolConfig {
            max_per_origin: 4,
            wait_timeout_ms: 100,
            max_requests_per_connection: 1,
            ..PoolConfig::default()
        });

        let conn = pool.acquire(ORIGIN, None).await.unwrap();
        pool.release(conn, ReleaseOutcome::Success);
        // Slot served its single allowed request and was closed.
        assert_eq!(pool.stats()[0].idle, 0);

        let conn = pool.acquire(ORIGIN, None).await.unwrap();
        pool.release(conn, ReleaseOutcome::Success);
        assert_eq!(pool.stats()[0].created_total, 2);
    }

    #[tokio::test]
    async fn dropped_connection_frees_capacity() {
        let pool = pool(1, 200);

        {
            let _conn = pool.acquire(ORIGIN, None).await.unwrap();
        }
        // Drop released capacity; a new acquire succeeds immediately.
        let conn = pool.acquire(ORIGIN, None).await.unwrap();
        pool.release(conn, ReleaseOutcome::Success);
    }

    #[tokio::test]
    async fn close_refuses_new_acquires() {
        let pool = pool(2, 50);
        let conn = pool.acquire(ORIGIN, None).await.unwrap();

        pool.close();
        assert_eq!(pool.acquire(ORIGIN, None).await.unwrap_err(), AcquireError::Closed);

        // In-flight connection still drains cleanly.
        pool.release(conn, ReleaseOutcome::Success);
        assert_eq!(pool.stats()[0].idle, 0, "closed pool keeps nothing idle");
    }

    #[tokio::test]
    async fn origins_are_isolated() {
        let pool = pool(1, 50);

        let a = pool.acquire("https://a.example:443", None).await.unwrap();
        // Different origin has its own budget.
        let b = pool.acquire("https://b.example:443", None).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.len(), 2);
        pool.release(a, ReleaseOutcome::Success);
        pool.release(b, ReleaseOutcome::Success);
    }
}
