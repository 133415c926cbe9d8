//! Per-request bookkeeping: IDs, priorities, deadlines.
//!
//! A [`RequestContext`] is created at ingress, owned by the pipeline for the
//! lifetime of the call, and consumed when the final metric is recorded.
//! Resource leases (API key, connection, queue slot) are RAII guards held by
//! the pipeline itself, so release-exactly-once holds by construction.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::usage::TokenUsage;

/// Priority tier for queue ordering. Lower `rank()` admits first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Ordering rank: critical first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Parse a client-supplied priority string; unknown values fall back to
    /// normal rather than failing the request.
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Priority::Critical,
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

/// A concrete (provider, model) pair — the router's output and the key for
/// circuit breakers, sequential queues, and connection origins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
}

impl ProviderModel {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse the explicit `provider,model` client form. Whitespace around
    /// either half is ignored. Returns `None` unless both halves are
    /// non-empty.
    pub fn parse_comma_form(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once(',')?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl std::fmt::Display for ProviderModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Final disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Pending,
    Success { status: u16 },
    Failure { kind: ErrorKind, status: u16 },
}

impl RequestOutcome {
    pub fn failure(kind: ErrorKind) -> Self {
        RequestOutcome::Failure {
            kind,
            status: kind.status(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }
}

/// Per-call record owned by the pipeline.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    /// Stable across a client conversation; see [`derive_session_id`].
    pub session_id: String,
    /// Monotonic arrival time, basis for `duration_ms`.
    pub arrival: Instant,
    /// Wall-clock arrival, used only for persistence and display.
    pub arrival_wall: DateTime<Utc>,
    /// The client-supplied model identifier, before routing.
    pub logical_model: String,
    /// Set by the router.
    pub resolved: Option<ProviderModel>,
    pub priority: Priority,
    pub stream: bool,
    pub cache_fingerprint: Option<String>,
    pub usage: Option<TokenUsage>,
    pub outcome: RequestOutcome,
    /// Absolute deadline; every suspension point respects it.
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(logical_model: impl Into<String>, session_id: impl Into<String>, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            request_id: Uuid::new_v4(),
            session_id: session_id.into(),
            arrival: now,
            arrival_wall: Utc::now(),
            logical_model: logical_model.into(),
            resolved: None,
            priority: Priority::Normal,
            stream: false,
            cache_fingerprint: None,
            usage: None,
            outcome: RequestOutcome::Pending,
            deadline: now + timeout,
        }
    }

    /// Time left before the deadline, or `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.checked_duration_since(Instant::now())
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.remaining().is_none()
    }

    /// Milliseconds since arrival.
    pub fn elapsed_ms(&self) -> u64 {
        self.arrival.elapsed().as_millis() as u64
    }
}

/// Derive a session identifier for a request.
///
/// Precedence: body metadata (`metadata.user_id`), then the `x-session-id`
/// header, then a synthesized one-off id. Synthesized sessions still get
/// per-session isolation; they just never aggregate across calls.
pub fn derive_session_id(metadata_user_id: Option<&str>, header: Option<&str>) -> String {
    if let Some(id) = metadata_user_id.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    if let Some(id) = header.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    format!("anon-{}", Uuid::new_v4().simple())
}
