//! Configuration for Switchboard.
//!
//! A single immutable snapshot loaded at startup from a JSON-with-comments
//! file (parsed with `json5`). Environment references in the form `$NAME` or
//! `${NAME}` are substituted before parsing, so API keys never have to live
//! in the file itself. Reloads are not supported; restart to apply changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Main configuration snapshot for the proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub keys: KeyPoolConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file path.
    ///
    /// Reads the file, substitutes `$NAME` / `${NAME}` environment
    /// references, parses the result as JSON5, and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&raw)
    }

    /// Parse configuration from a string (after env interpolation).
    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env(raw);
        let config: Config = json5::from_str(&interpolated)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a provider section by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "providers".to_string(),
                hint: "configure at least one upstream provider".to_string(),
            });
        }
        for provider in &self.providers {
            url::Url::parse(&provider.base_url).map_err(|e| ConfigError::InvalidValue {
                key: format!("providers.{}.base_url", provider.name),
                message: e.to_string(),
            })?;
        }
        for key in &self.keys.keys {
            if self.provider(&key.provider).is_none() {
                return Err(ConfigError::InvalidValue {
                    key: format!("keys.keys.{}", key.id),
                    message: format!("references unknown provider {}", key.provider),
                });
            }
            if key.weight == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("keys.keys.{}.weight", key.id),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        crate::keys::Strategy::parse(&self.keys.strategy).ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "keys.strategy".to_string(),
                message: format!("unknown strategy {:?}", self.keys.strategy),
            }
        })?;
        if !(0.0..=1.0).contains(&self.breaker.failure_ratio) {
            return Err(ConfigError::InvalidValue {
                key: "breaker.failure_ratio".to_string(),
                message: "must be within [0, 1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "cache.similarity_threshold".to_string(),
                message: "must be within [0, 1]".to_string(),
            });
        }
        let routing_targets = [
            ("routing.default", self.routing.default.as_ref()),
            ("routing.intents.background", self.routing.intents.background.as_ref()),
            ("routing.intents.long_context", self.routing.intents.long_context.as_ref()),
            ("routing.intents.reasoning", self.routing.intents.reasoning.as_ref()),
            ("routing.intents.web_search", self.routing.intents.web_search.as_ref()),
            ("routing.intents.image", self.routing.intents.image.as_ref()),
            ("routing.intents.subagent", self.routing.intents.subagent.as_ref()),
        ];
        for (key, target) in routing_targets {
            if let Some(target) = target {
                if crate::context::ProviderModel::parse_comma_form(target).is_none() {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: format!("expected \"provider,model\", got {target:?}"),
                    });
                }
            }
        }
        if self.server.auth.scheme == AuthScheme::Static && self.server.auth.api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "server.auth.api_key".to_string(),
                hint: "static auth requires an api_key (use $ENV_NAME to inject it)".to_string(),
            });
        }
        if self.server.auth.scheme == AuthScheme::Jwt && self.server.auth.jwt_secret.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "server.auth.jwt_secret".to_string(),
                hint: "jwt auth requires a signing secret".to_string(),
            });
        }
        Ok(())
    }
}

/// Substitute `$NAME` and `${NAME}` with environment values.
///
/// Unset variables are left untouched so a missing secret fails loudly at
/// validation rather than silently becoming an empty string. `$$` escapes a
/// literal dollar sign.
pub fn interpolate_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                match std::env::var(&name) {
                    Ok(val) if closed => out.push_str(&val),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match std::env::var(&name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Authentication scheme for inbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// No authentication; only safe when bound to loopback.
    #[default]
    None,
    /// A single static API key compared in constant time.
    Static,
    /// HS256 bearer tokens verified against `jwt_secret`.
    Jwt,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub scheme: AuthScheme,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub jwt_secret: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Absolute per-request deadline, from ingress to response completion.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long shutdown waits for in-flight requests to drain.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// One upstream provider endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    /// Origin plus base path, e.g. `https://api.anthropic.com/v1`.
    pub base_url: String,
    /// Messages path appended to `base_url` on dispatch.
    #[serde(default = "default_messages_path")]
    pub messages_path: String,
    /// Whether requests to this provider pass through the sequential queue.
    #[serde(default)]
    pub sequential: bool,
    /// Total retries permitted against this provider before the budget
    /// counter refuses further retries.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

impl ProviderConfig {
    /// The (scheme, host, port) tuple identifying this provider's endpoint.
    pub fn origin(&self) -> String {
        match url::Url::parse(&self.base_url) {
            Ok(url) => {
                let scheme = url.scheme();
                let host = url.host_str().unwrap_or_default();
                match url.port_or_known_default() {
                    Some(port) => format!("{scheme}://{host}:{port}"),
                    None => format!("{scheme}://{host}"),
                }
            }
            // Unparseable URLs are rejected at load; fall back for safety.
            Err(_) => self.base_url.clone(),
        }
    }
}

/// One configured API key.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    pub id: String,
    pub provider: String,
    pub key: SecretString,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Lower numbers are tried first under the priority strategy.
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyPoolConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    /// Base cooldown applied when a key starts failing; doubles per
    /// consecutive cooldown up to `cooldown_cap_secs`.
    #[serde(default = "default_cooldown_base_secs")]
    pub cooldown_base_secs: u64,
    #[serde(default = "default_cooldown_cap_secs")]
    pub cooldown_cap_secs: u64,
    /// Consecutive failures after which a key is disabled outright.
    #[serde(default = "default_disable_after")]
    pub disable_after_failures: u32,
    /// How often the reaper re-promotes cooled keys.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            keys: Vec::new(),
            cooldown_base_secs: default_cooldown_base_secs(),
            cooldown_cap_secs: default_cooldown_cap_secs(),
            disable_after_failures: default_disable_after(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// Intent-to-target mapping consulted by the router. Each value is a
/// `provider,model` pair.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IntentTargets {
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub long_context: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub web_search: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub subagent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// Fallback `provider,model` when no rule matches.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub intents: IntentTargets,
    /// Prompt-token estimate above which the long-context mapping applies.
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default: None,
            intents: IntentTargets::default(),
            long_context_threshold: default_long_context_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_max_per_origin")]
    pub max_per_origin: usize,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_max_requests_per_connection")]
    pub max_requests_per_connection: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_free_socket_timeout_secs")]
    pub free_socket_timeout_secs: u64,
    #[serde(default = "default_affinity_idle_secs")]
    pub affinity_idle_secs: u64,
    #[serde(default = "default_max_affine_sessions")]
    pub max_affine_sessions: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn free_socket_timeout(&self) -> Duration {
        Duration::from_secs(self.free_socket_timeout_secs)
    }

    pub fn affinity_idle(&self) -> Duration {
        Duration::from_secs(self.affinity_idle_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_origin: default_max_per_origin(),
            wait_timeout_ms: default_wait_timeout_ms(),
            max_requests_per_connection: default_max_requests_per_connection(),
            max_lifetime_secs: default_max_lifetime_secs(),
            free_socket_timeout_secs: default_free_socket_timeout_secs(),
            affinity_idle_secs: default_affinity_idle_secs(),
            max_affine_sessions: default_max_affine_sessions(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// TTL jitter in percent, applied as ±variance on write.
    #[serde(default = "default_ttl_variance_pct")]
    pub ttl_variance_pct: u8,
    /// Requests with temperature above this are never cached.
    #[serde(default = "default_temp_ceiling")]
    pub temp_ceiling: f64,
    /// When non-empty, only these top-level body fields participate in the
    /// fingerprint. Mutually exclusive with `exclude_fields`.
    #[serde(default)]
    pub include_fields: Vec<String>,
    /// Body fields excluded from the fingerprint.
    #[serde(default = "default_exclude_fields")]
    pub exclude_fields: Vec<String>,
    #[serde(default)]
    pub similarity: bool,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Whether concurrent identical requests wait on the in-flight one.
    #[serde(default = "default_true")]
    pub coalesce: bool,
    /// Directory for the durable L2 tier; unset disables L2.
    #[serde(default)]
    pub l2_dir: Option<PathBuf>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            ttl_secs: default_cache_ttl_secs(),
            ttl_variance_pct: default_ttl_variance_pct(),
            temp_ceiling: default_temp_ceiling(),
            include_fields: Vec::new(),
            exclude_fields: default_exclude_fields(),
            similarity: false,
            similarity_threshold: default_similarity_threshold(),
            coalesce: true,
            l2_dir: None,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// One token bucket (plus optional sliding window) for a rate-limit scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub max_in_window: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub global: Option<BucketConfig>,
    #[serde(default)]
    pub per_provider: Option<BucketConfig>,
    #[serde(default)]
    pub per_session: Option<BucketConfig>,
    #[serde(default)]
    pub per_key: Option<BucketConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    #[serde(default = "default_breaker_window")]
    pub window_size: usize,
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
    /// Cap for the exponentially growing re-open duration.
    #[serde(default = "default_open_secs_cap")]
    pub open_secs_cap: u64,
}

impl BreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }

    pub fn open_duration_cap(&self) -> Duration {
        Duration::from_secs(self.open_secs_cap)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_ratio: default_failure_ratio(),
            window_size: default_breaker_window(),
            open_secs: default_open_secs(),
            half_open_probes: default_half_open_probes(),
            open_secs_cap: default_open_secs_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_depth")]
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: default_queue_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl MetricsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            db_path: default_metrics_db_path(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3456
}
fn default_request_timeout_ms() -> u64 {
    120_000
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_messages_path() -> String {
    "/messages".to_string()
}
fn default_retry_budget() -> u32 {
    10
}
fn default_weight() -> u32 {
    1
}
fn default_max_concurrent() -> u32 {
    16
}
fn default_strategy() -> String {
    "round-robin".to_string()
}
fn default_cooldown_base_secs() -> u64 {
    10
}
fn default_cooldown_cap_secs() -> u64 {
    600
}
fn default_disable_after() -> u32 {
    8
}
fn default_reap_interval_secs() -> u64 {
    15
}
fn default_long_context_threshold() -> u64 {
    60_000
}
fn default_max_per_origin() -> usize {
    16
}
fn default_wait_timeout_ms() -> u64 {
    5_000
}
fn default_max_requests_per_connection() -> u64 {
    1_000
}
fn default_max_lifetime_secs() -> u64 {
    600
}
fn default_free_socket_timeout_secs() -> u64 {
    90
}
fn default_affinity_idle_secs() -> u64 {
    120
}
fn default_max_affine_sessions() -> usize {
    1_024
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_cache_max_entries() -> usize {
    1_000
}
fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_ttl_variance_pct() -> u8 {
    10
}
fn default_temp_ceiling() -> f64 {
    0.7
}
fn default_exclude_fields() -> Vec<String> {
    // Noisy fields that do not change the semantic answer.
    ["request_id", "metadata", "stream", "timestamp", "user"]
        .into_iter()
        .map(str::to_string)
        .collect()
}
fn default_similarity_threshold() -> f64 {
    0.92
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_ratio() -> f64 {
    0.5
}
fn default_breaker_window() -> usize {
    20
}
fn default_open_secs() -> u64 {
    30
}
fn default_half_open_probes() -> u32 {
    1
}
fn default_open_secs_cap() -> u64 {
    300
}
fn default_queue_max_depth() -> usize {
    100
}
fn default_metrics_db_path() -> PathBuf {
    PathBuf::from("switchboard-metrics.db")
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_secs() -> u64 {
    5
}
fn default_retention_days() -> u32 {
    90
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const MINIMAL: &str = r#"
    {
        // comments are allowed
        providers: [
            { name: "anthropic", base_url: "https://api.anthropic.com/v1" },
        ],
    }
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.server.port, 3456);
        assert_eq!(config.cache.ttl_secs, 600);
        assert!((config.cache.temp_ceiling - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.metrics.batch_size, 100);
        assert_eq!(config.metrics.retention_days, 90);
        assert_eq!(config.breaker.half_open_probes, 1);
    }

    #[test]
    fn empty_providers_is_rejected() {
        let err = Config::from_str("{ providers: [] }").unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let raw = r#"{ providers: [{ name: "x", base_url: "not a url" }] }"#;
        let err = Config::from_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn key_referencing_unknown_provider_is_rejected() {
        let raw = r#"
        {
            providers: [{ name: "anthropic", base_url: "https://api.anthropic.com" }],
            keys: { keys: [{ id: "k1", provider: "openai", key: "sk-test" }] },
        }
        "#;
        let err = Config::from_str(raw).unwrap_err();
        assert!(err.to_string().contains("unknown provider"), "{err}");
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let raw = r#"
        {
            providers: [{ name: "a", base_url: "https://a.example" }],
            keys: { strategy: "mystery" },
        }
        "#;
        let err = Config::from_str(raw).unwrap_err();
        assert!(err.to_string().contains("strategy"), "{err}");
    }

    #[test]
    fn static_auth_requires_api_key() {
        let raw = r#"
        {
            providers: [{ name: "a", base_url: "https://a.example" }],
            server: { auth: { scheme: "static" } },
        }
        "#;
        let err = Config::from_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn origin_strips_base_path_and_keeps_port() {
        let provider = ProviderConfig {
            name: "local".to_string(),
            base_url: "http://localhost:8080/v1/beta".to_string(),
            messages_path: default_messages_path(),
            sequential: false,
            retry_budget: 10,
        };
        assert_eq!(provider.origin(), "http://localhost:8080");

        let provider = ProviderConfig {
            name: "anthropic".to_string(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            messages_path: default_messages_path(),
            sequential: false,
            retry_budget: 10,
        };
        assert_eq!(provider.origin(), "https://api.anthropic.com:443");
    }

    #[test]
    fn interpolates_braced_and_bare_env_references() {
        unsafe {
            std::env::set_var("SWB_TEST_TOKEN", "sk-12345");
        }
        assert_eq!(
            interpolate_env(r#"{"key": "${SWB_TEST_TOKEN}"}"#),
            r#"{"key": "sk-12345"}"#
        );
        assert_eq!(
            interpolate_env(r#"{"key": "$SWB_TEST_TOKEN"}"#),
            r#"{"key": "sk-12345"}"#
        );
        unsafe {
            std::env::remove_var("SWB_TEST_TOKEN");
        }
    }

    #[test]
    fn unset_references_are_left_untouched() {
        assert_eq!(
            interpolate_env("$SWB_DEFINITELY_UNSET_VAR"),
            "$SWB_DEFINITELY_UNSET_VAR"
        );
        assert_eq!(
            interpolate_env("${SWB_DEFINITELY_UNSET_VAR}"),
            "${SWB_DEFINITELY_UNSET_VAR}"
        );
    }

    #[test]
    fn dollar_dollar_escapes_literal() {
        assert_eq!(interpolate_env("cost: $$5"), "cost: $5");
        assert_eq!(interpolate_env("trailing $"), "trailing $");
    }

    #[test]
    fn full_config_round_trip() {
        let raw = r#"
        {
            server: {
                host: "0.0.0.0",
                port: 9000,
                auth: { scheme: "static", api_key: "secret-key" },
            },
            providers: [
                { name: "anthropic", base_url: "https://api.anthropic.com/v1", sequential: false },
                { name: "openai", base_url: "https://api.openai.com/v1", sequential: true },
            ],
            keys: {
                strategy: "least-loaded", // alias of least-used
                keys: [
                    { id: "a1", provider: "anthropic", key: "sk-a", weight: 2 },
                    { id: "o1", provider: "openai", key: "sk-o", max_concurrent: 4 },
                ],
            },
            routing: {
                default: "anthropic,claude-sonnet",
                intents: { background: "openai,gpt-mini" },
            },
            rate_limit: {
                per_session: { capacity: 2, refill_per_sec: 1 },
            },
            cache: { l2_dir: "/tmp/swb-cache", similarity: true },
        }
        "#;
        let config = Config::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(config.provider("openai").unwrap().sequential);
        assert_eq!(config.keys.keys[0].weight, 2);
        assert_eq!(
            config.routing.intents.background.as_deref(),
            Some("openai,gpt-mini")
        );
        assert!(config.rate_limit.per_session.is_some());
        assert!(config.cache.similarity);
    }
}
