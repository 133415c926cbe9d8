//! The request pipeline: composes every subsystem into one lifecycle.
//!
//! Per request: stamp IDs, consult the cache, evaluate rate limits, route,
//! check the circuit breaker, pass the sequential gate, lease a key,
//! acquire a connection, dispatch, extract usage, write back to the cache,
//! release everything, and record a metric. Every early exit releases all
//! resources acquired so far exactly once and still records a metric —
//! streaming responses defer that to the relay's end-of-stream observer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::breaker::{Admission, BreakerRegistry};
use crate::cache::{fingerprint, CacheStore, FlightTicket, HitTier, Lookup};
use crate::config::{Config, ProviderConfig};
use crate::context::{derive_session_id, Priority, ProviderModel, RequestContext, RequestOutcome};
use crate::error::{ErrorKind, ProxyError, ProxyResult};
use crate::keys::{ApiKeyLease, KeyPool, LeaseOutcome};
use crate::metrics::{metric_for, MetricStore, MetricsCollector};
use crate::queue::{EnterError, SequentialQueues};
use crate::ratelimit::{RateLimiter, Scope};
use crate::router::{RouteRequest, Router};
use crate::upstream::{
    dispatch, ConnectionPool, IdentityShaper, ReleaseOutcome, RequestShaper, StreamRelay,
};
use crate::usage::{self, Confidence, TokenUsage};

/// Base backoff before the single idempotent retry.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Label used in metrics when a request fails before routing resolves.
const UNROUTED: &str = "unrouted";

/// One inbound chat-completion call, already parsed from JSON.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub body: Value,
    /// Session hint from the `x-session-id` header.
    pub session_header: Option<String>,
}

/// What the pipeline hands back to the HTTP layer.
pub enum PipelineReply {
    Json {
        status: u16,
        body: Value,
        /// `hit` / `miss` / `similar`, or `None` when the cache was not
        /// consulted.
        cache: Option<&'static str>,
        request_id: String,
    },
    Stream {
        status: u16,
        relay: StreamRelay,
        request_id: String,
    },
}

impl std::fmt::Debug for PipelineReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineReply::Json {
                status,
                body,
                cache,
                request_id,
            } => f
                .debug_struct("Json")
                .field("status", status)
                .field("body", body)
                .field("cache", cache)
                .field("request_id", request_id)
                .finish(),
            PipelineReply::Stream {
                status, request_id, ..
            } => f
                .debug_struct("Stream")
                .field("status", status)
                .field("request_id", request_id)
                .finish(),
        }
    }
}

/// Per-provider retry accounting against the configured budget.
#[derive(Debug, Default)]
struct RetryLedger {
    used: HashMap<String, u32>,
}

/// Per-provider retry stats for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetryStats {
    pub provider: String,
    pub used: u32,
    pub budget: u32,
}

/// Process-wide proxy state: the composition of every subsystem.
pub struct Proxy {
    pub config: Arc<Config>,
    pub router: Router,
    pub cache: Arc<CacheStore>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub queues: SequentialQueues,
    pub keys: Arc<KeyPool>,
    pub pool: Arc<ConnectionPool>,
    pub metrics: Arc<MetricsCollector>,
    pub shaper: Box<dyn RequestShaper>,
    retries: Mutex<RetryLedger>,
    background: CancellationToken,
}

impl Proxy {
    /// Build the full proxy from a config snapshot, opening the durable
    /// metric store.
    pub async fn new(config: Config) -> Result<Arc<Self>, crate::error::Error> {
        let store = Arc::new(MetricStore::open(&config.metrics.db_path).await?);
        Ok(Self::assemble(config, Some(store), Box::new(IdentityShaper)))
    }

    /// Build without a durable store (tests, ephemeral runs).
    pub fn new_in_memory(config: Config) -> Arc<Self> {
        Self::assemble(config, None, Box::new(IdentityShaper))
    }

    /// Build with a custom transformer seam.
    pub fn with_shaper(config: Config, shaper: Box<dyn RequestShaper>) -> Arc<Self> {
        Self::assemble(config, None, shaper)
    }

    fn assemble(
        config: Config,
        store: Option<Arc<MetricStore>>,
        shaper: Box<dyn RequestShaper>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let sequential = config
            .providers
            .iter()
            .filter(|p| p.sequential)
            .map(|p| p.name.clone());
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone(), store));
        Arc::new(Self {
            router: Router::new(config.routing.clone()),
            cache: Arc::new(CacheStore::new(config.cache.clone())),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            breakers: Arc::new(BreakerRegistry::new(config.breaker.clone())),
            queues: SequentialQueues::new(config.queue.max_depth, sequential),
            keys: Arc::new(KeyPool::new(&config.keys)),
            pool: Arc::new(ConnectionPool::new(config.pool.clone())),
            metrics,
            shaper,
            retries: Mutex::new(RetryLedger::default()),
            background: CancellationToken::new(),
            config,
        })
    }

    /// Launch the periodic maintenance tasks (cache sweeper, pool
    /// maintainer, key reaper, limiter sweeper) and the metrics flusher.
    pub fn start(&self) {
        Arc::clone(&self.metrics).start();

        let cache = Arc::clone(&self.cache);
        let pool = Arc::clone(&self.pool);
        let keys = Arc::clone(&self.keys);
        let limiter = Arc::clone(&self.limiter);
        let cancel = self.background.clone();
        tokio::spawn(async move {
            let mut cache_tick = tokio::time::interval(cache.sweep_interval());
            let mut pool_tick = tokio::time::interval(Duration::from_secs(10));
            let mut reap_tick = tokio::time::interval(keys.reap_interval());
            let mut limiter_tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = cache_tick.tick() => cache.sweep(),
                    _ = pool_tick.tick() => pool.maintain(),
                    _ = reap_tick.tick() => keys.reap(),
                    _ = limiter_tick.tick() => limiter.sweep(),
                }
            }
        });
    }

    /// Ordered teardown: stop intake first (the server's job), then flush
    /// metrics, close the pool, and sweep the cache tiers one last time.
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.metrics.stop().await;
        self.pool.close();
        self.cache.sweep();
        tracing::info!("proxy shut down");
    }

    /// Record a failure that happened before the pipeline ran (e.g. auth).
    pub fn record_rejected(&self, session_id: &str, kind: ErrorKind, duration_ms: u64) {
        self.metrics.record(metric_for(
            session_id,
            UNROUTED,
            UNROUTED,
            None,
            duration_ms,
            kind.status(),
            false,
            Some(kind.as_str()),
        ));
    }

    /// Retry accounting: returns whether the provider still has budget,
    /// consuming one unit when it does.
    fn try_spend_retry(&self, provider: &ProviderConfig) -> bool {
        let mut ledger = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        let used = ledger.used.entry(provider.name.clone()).or_insert(0);
        if *used >= provider.retry_budget {
            return false;
        }
        *used += 1;
        true
    }

    pub fn retry_stats(&self) -> Vec<RetryStats> {
        let ledger = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<RetryStats> = self
            .config
            .providers
            .iter()
            .map(|p| RetryStats {
                provider: p.name.clone(),
                used: ledger.used.get(&p.name).copied().unwrap_or(0),
                budget: p.retry_budget,
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    /// Run the full pipeline for one request.
    ///
    /// Failures record their metric here; successes record either inline
    /// (buffered replies) or from the stream observer (streamed replies).
    pub async fn execute(&self, inbound: InboundRequest) -> ProxyResult<PipelineReply> {
        let mut ctx = match self.ingress(&inbound) {
            Ok(ctx) => ctx,
            Err(e) => {
                // Rejected before a context existed; the metric still lands.
                let session = inbound
                    .body
                    .pointer("/metadata/user_id")
                    .and_then(|v| v.as_str())
                    .or(inbound.session_header.as_deref())
                    .unwrap_or("invalid");
                self.record_rejected(session, e.kind(), 0);
                return Err(e);
            }
        };
        let result = self.run(&mut ctx, &inbound.body).await;

        if let Err(e) = &result {
            let kind = e.kind();
            ctx.outcome = RequestOutcome::failure(kind);
            let (provider, model) = ctx
                .resolved
                .as_ref()
                .map(|pm| (pm.provider.as_str(), pm.model.as_str()))
                .unwrap_or((UNROUTED, UNROUTED));
            self.metrics.record(metric_for(
                &ctx.session_id,
                provider,
                model,
                ctx.usage,
                ctx.elapsed_ms(),
                kind.status(),
                false,
                Some(kind.as_str()),
            ));
            tracing::info!(
                request_id = %ctx.request_id,
                session = %ctx.session_id,
                error = %e,
                kind = %kind,
                "request failed"
            );
        }
        result
    }

    /// Step 1: validate shape, stamp request and session IDs.
    fn ingress(&self, inbound: &InboundRequest) -> ProxyResult<RequestContext> {
        let body = &inbound.body;
        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ProxyError::BadRequest {
                reason: "missing required field: model".to_string(),
            })?;
        if !body.get("messages").is_some_and(|m| m.is_array()) {
            return Err(ProxyError::BadRequest {
                reason: "missing required field: messages".to_string(),
            });
        }

        let metadata_user = body
            .pointer("/metadata/user_id")
            .and_then(|v| v.as_str());
        let session_id = derive_session_id(metadata_user, inbound.session_header.as_deref());

        let mut ctx = RequestContext::new(model, session_id, self.config.server.request_timeout());
        ctx.stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
        ctx.priority = body
            .pointer("/metadata/priority")
            .and_then(|p| p.as_str())
            .map(Priority::parse_lossy)
            .unwrap_or_default();
        tracing::debug!(
            request_id = %ctx.request_id,
            session = %ctx.session_id,
            model = %ctx.logical_model,
            stream = ctx.stream,
            "request admitted"
        );
        Ok(ctx)
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        body: &Value,
    ) -> ProxyResult<PipelineReply> {
        // Step 3: cache read.
        let input_text = fingerprint::message_text(body);
        let mut flight: Option<FlightTicket> = None;
        let cache_eligible = self.cache.eligible(body);
        if cache_eligible {
            let fp = self.cache.fingerprint(body);
            ctx.cache_fingerprint = Some(fp.clone());
            let remaining = ctx.remaining().ok_or(ProxyError::DeadlineExceeded)?;
            let lookup = tokio::time::timeout(remaining, self.cache.lookup(&fp, &input_text))
                .await
                .map_err(|_| ProxyError::DeadlineExceeded)?;
            match lookup {
                Lookup::Hit { entry, tier } => {
                    return Ok(self.reply_from_cache(ctx, &entry, tier));
                }
                Lookup::Miss { flight: f } => flight = f,
            }
        }

        // Step 4: rate limit on the scopes known before routing.
        self.allow(&[Scope::Global, Scope::Session(ctx.session_id.clone())])?;

        // Step 5: route.
        let route_request = build_route_request(ctx, body, &input_text);
        let decision = self
            .router
            .route(&route_request)
            .ok_or_else(|| ProxyError::BadRequest {
                reason: format!("no route for model {:?}", ctx.logical_model),
            })?;
        let target = decision.target.clone();
        let provider_cfg = self
            .config
            .provider(&target.provider)
            .ok_or_else(|| ProxyError::BadRequest {
                reason: format!("unknown provider {:?}", target.provider),
            })?
            .clone();
        ctx.resolved = Some(target.clone());
        tracing::debug!(
            request_id = %ctx.request_id,
            target = %target,
            rule = decision.rule,
            "routed"
        );

        // Provider scope becomes applicable once routing resolves.
        self.allow(&[Scope::Provider(target.provider.clone())])?;

        // Step 6: circuit check.
        let admission =
            self.breakers
                .admit(&target)
                .map_err(|retry_after| ProxyError::CircuitOpen {
                    provider: target.provider.clone(),
                    model: target.model.clone(),
                    retry_after,
                })?;

        // Step 7: sequential gate.
        let slot = if self.queues.is_sequential(&target.provider) {
            match self
                .queues
                .enter(&target.provider, ctx.priority, ctx.deadline)
                .await
            {
                Ok(slot) => Some(slot),
                Err(EnterError::Full | EnterError::DeadlineExceeded) => {
                    return Err(ProxyError::QueueTimeout {
                        provider: target.provider.clone(),
                    });
                }
            }
        } else {
            None
        };

        // Steps 8–11, with one idempotent retry for retryable failures.
        let shaped = self.shaper.shape(&target, body);
        let mut slot = slot;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self
                .attempt(
                    ctx,
                    &provider_cfg,
                    &target,
                    admission,
                    &shaped,
                    &input_text,
                    &mut slot,
                )
                .await;
            match outcome {
                Ok(AttemptReply::Json {
                    status,
                    body: reply_body,
                    usage,
                }) => {
                    ctx.usage = Some(usage);
                    ctx.outcome = RequestOutcome::Success { status };
                    if let Some(slot) = slot.take() {
                        slot.release();
                    }
                    // Step 12: cache write.
                    if cache_eligible {
                        if let Some(fp) = &ctx.cache_fingerprint {
                            self.cache.put(
                                fp.clone(),
                                reply_body.clone(),
                                target.provider.clone(),
                                target.model.clone(),
                                ctx.usage,
                                input_text.clone(),
                            );
                        }
                    }
                    drop(flight);
                    // Step 14: metric.
                    self.metrics.record(metric_for(
                        &ctx.session_id,
                        &target.provider,
                        &target.model,
                        ctx.usage,
                        ctx.elapsed_ms(),
                        status,
                        true,
                        None,
                    ));
                    return Ok(PipelineReply::Json {
                        status,
                        body: reply_body,
                        cache: cache_eligible.then_some("miss"),
                        request_id: ctx.request_id.to_string(),
                    });
                }
                Ok(AttemptReply::Stream { status, relay }) => {
                    // The relay's observer took the queue slot and owns its
                    // release along with the final metric; see `attempt`.
                    ctx.outcome = RequestOutcome::Success { status };
                    return Ok(PipelineReply::Stream {
                        status,
                        relay,
                        request_id: ctx.request_id.to_string(),
                    });
                }
                Err(e) => {
                    let retryable = e.kind().is_retryable()
                        && !ctx.stream
                        && attempt == 1
                        && self.try_spend_retry(&provider_cfg);
                    if retryable {
                        let backoff = retry_backoff(attempt);
                        let Some(remaining) = ctx.remaining() else {
                            return Err(ProxyError::DeadlineExceeded);
                        };
                        tracing::info!(
                            request_id = %ctx.request_id,
                            provider = %target.provider,
                            ?backoff,
                            error = %e,
                            "retrying after backoff"
                        );
                        tokio::time::sleep(backoff.min(remaining)).await;
                        continue;
                    }
                    if let Some(slot) = slot.take() {
                        slot.release();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn reply_from_cache(
        &self,
        ctx: &mut RequestContext,
        entry: &crate::cache::CachedResponse,
        tier: HitTier,
    ) -> PipelineReply {
        ctx.usage = entry.usage;
        ctx.outcome = RequestOutcome::Success { status: 200 };
        let target = ProviderModel::new(entry.provider.clone(), entry.model.clone());
        ctx.resolved = Some(target.clone());
        // Cache hits carry zero upstream latency but still count.
        self.metrics.record(metric_for(
            &ctx.session_id,
            &target.provider,
            &target.model,
            entry.usage,
            ctx.elapsed_ms(),
            200,
            true,
            None,
        ));
        tracing::debug!(
            request_id = %ctx.request_id,
            tier = tier.annotation(),
            "served from cache"
        );
        PipelineReply::Json {
            status: 200,
            body: entry.payload.clone(),
            cache: Some(tier.annotation()),
            request_id: ctx.request_id.to_string(),
        }
    }

    fn allow(&self, scopes: &[Scope]) -> ProxyResult<()> {
        self.limiter
            .allow(scopes, 1.0)
            .map_err(|denied| ProxyError::RateLimited {
                scope: denied.scope,
                retry_after: denied.retry_after,
            })
    }

    /// Steps 8–11 for one attempt: key lease, connection, dispatch.
    ///
    /// Releases the key and connection itself on every failure path; on
    /// streamed success it also takes the queue slot so the relay observer
    /// can release everything when the stream ends.
    async fn attempt(
        &self,
        ctx: &RequestContext,
        provider_cfg: &ProviderConfig,
        target: &ProviderModel,
        admission: Admission,
        shaped: &dispatch::ShapedRequest,
        input_text: &str,
        slot: &mut Option<crate::queue::QueueSlot>,
    ) -> ProxyResult<AttemptReply> {
        // Step 8: key lease.
        let key = self
            .keys
            .lease(&target.provider)
            .ok_or_else(|| ProxyError::NoKeyAvailable {
                provider: target.provider.clone(),
            })?;
        if let Err(denied) = self.limiter.allow(&[Scope::Key(key.key_id().to_string())], 1.0) {
            key.release(LeaseOutcome::Aborted);
            return Err(ProxyError::RateLimited {
                scope: denied.scope,
                retry_after: denied.retry_after,
            });
        }

        // Step 9: connection acquire, bounded by both the pool's wait
        // timeout and the request deadline.
        let Some(remaining) = ctx.remaining() else {
            key.release(LeaseOutcome::Aborted);
            return Err(ProxyError::DeadlineExceeded);
        };
        let origin = provider_cfg.origin();
        let acquired = tokio::time::timeout(
            remaining,
            self.pool.acquire(&origin, Some(&ctx.session_id)),
        )
        .await;
        let connection = match acquired {
            Ok(Ok(connection)) => connection,
            Ok(Err(crate::upstream::AcquireError::Timeout)) => {
                key.release(LeaseOutcome::Aborted);
                return Err(ProxyError::PoolExhausted { origin });
            }
            Ok(Err(e)) => {
                key.release(LeaseOutcome::Aborted);
                return Err(ProxyError::Internal {
                    reason: format!("connection pool: {e:?}"),
                });
            }
            Err(_) => {
                key.release(LeaseOutcome::Aborted);
                return Err(ProxyError::DeadlineExceeded);
            }
        };

        // Step 10: dispatch.
        let Some(remaining) = ctx.remaining() else {
            self.pool.release(connection, ReleaseOutcome::Failure);
            key.release(LeaseOutcome::Aborted);
            return Err(ProxyError::DeadlineExceeded);
        };
        let sent = dispatch::send(&connection, provider_cfg, &key, shaped, remaining).await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                let status = match &e {
                    ProxyError::Upstream { status, .. } => Some(*status),
                    ProxyError::UpstreamRateLimited { .. } => Some(429),
                    _ => None,
                };
                self.pool.release(connection, ReleaseOutcome::Failure);
                // A client-side deadline says nothing about key health.
                if matches!(e, ProxyError::DeadlineExceeded) {
                    key.release(LeaseOutcome::Aborted);
                } else {
                    key.release(LeaseOutcome::Failure { status });
                }
                self.breakers.record(target, admission, false);
                return Err(e);
            }
        };

        if ctx.stream {
            let prompt_chars = input_text.chars().count() as u64;
            return Ok(self.stream_reply(
                ctx,
                target,
                admission,
                key,
                connection,
                slot.take(),
                prompt_chars,
                response,
            ));
        }

        // Step 11 (buffered): read, extract usage, release.
        match dispatch::read_json(&target.provider, response).await {
            Ok((status, body, found)) => {
                self.pool.release(connection, ReleaseOutcome::Success);
                key.release(LeaseOutcome::Success);
                self.breakers.record(target, admission, true);
                let usage = found.map(|f| f.usage).unwrap_or_else(|| {
                    // Last resort: estimate from text length.
                    estimate_usage(input_text, &body)
                });
                Ok(AttemptReply::Json {
                    status,
                    body,
                    usage,
                })
            }
            Err(e) => {
                self.pool.release(connection, ReleaseOutcome::Failure);
                key.release(LeaseOutcome::Failure { status: None });
                self.breakers.record(target, admission, false);
                Err(e)
            }
        }
    }

    /// Streamed replies: wrap the byte stream in a relay whose observer
    /// performs step 13 (releases) and step 14 (metric) at stream end.
    #[allow(clippy::too_many_arguments)]
    fn stream_reply(
        &self,
        ctx: &RequestContext,
        target: &ProviderModel,
        admission: Admission,
        key: ApiKeyLease,
        connection: crate::upstream::Connection,
        slot: Option<crate::queue::QueueSlot>,
        prompt_chars: u64,
        response: reqwest::Response,
    ) -> AttemptReply {
        let status = response.status().as_u16();
        let breakers = Arc::clone(&self.breakers);
        let metrics = Arc::clone(&self.metrics);
        let target = target.clone();
        let session_id = ctx.session_id.clone();
        let request_id = ctx.request_id;
        let arrival = ctx.arrival;

        let mut key = Some(key);
        let mut connection = Some(connection);
        let mut slot = slot;
        let observer: dispatch::StreamObserver = Box::new(move |summary| {
            let outcome = if summary.success {
                ReleaseOutcome::Success
            } else {
                ReleaseOutcome::Failure
            };
            if let Some(connection) = connection.take() {
                connection.release(outcome);
            }
            if let Some(key) = key.take() {
                key.release(if summary.success {
                    LeaseOutcome::Success
                } else {
                    LeaseOutcome::Failure { status: None }
                });
            }
            if let Some(slot) = slot.take() {
                slot.release();
            }
            breakers.record(&target, admission, summary.success);
            let usage = summary.usage.map(|f| f.usage);
            metrics.record(metric_for(
                &session_id,
                &target.provider,
                &target.model,
                usage,
                arrival.elapsed().as_millis() as u64,
                if summary.success { status } else { 502 },
                summary.success,
                (!summary.success).then_some("upstream_error"),
            ));
            tracing::debug!(
                request_id = %request_id,
                success = summary.success,
                sse_bytes = summary.bytes,
                "stream finished"
            );
        });

        AttemptReply::Stream {
            status,
            relay: StreamRelay::new(response.bytes_stream(), prompt_chars, observer),
        }
    }

    /// Queries answered by the durable store, if one is open.
    pub fn metric_store(&self) -> Option<&Arc<MetricStore>> {
        self.metrics.store()
    }
}

enum AttemptReply {
    Json {
        status: u16,
        body: Value,
        usage: TokenUsage,
    },
    Stream {
        status: u16,
        relay: StreamRelay,
    },
}

fn build_route_request(ctx: &RequestContext, body: &Value, input_text: &str) -> RouteRequest {
    let flag = |names: &[&str]| {
        names.iter().any(|name| {
            body.pointer(&format!("/metadata/{name}"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
    };
    RouteRequest {
        model: ctx.logical_model.clone(),
        background: flag(&["background"]),
        long_context: flag(&["long_context", "longContext"]),
        // A thinking block on the body itself also signals reasoning.
        reasoning: flag(&["reasoning", "thinking"]) || body.get("thinking").is_some(),
        web_search: flag(&["web_search", "webSearch"]),
        image: flag(&["image"]) || has_image_content(body),
        subagent: flag(&["subagent"]),
        prompt_tokens: usage::estimate_tokens(input_text),
    }
}

fn has_image_content(body: &Value) -> bool {
    body.get("messages")
        .and_then(|m| m.as_array())
        .is_some_and(|messages| {
            messages.iter().any(|message| {
                message
                    .get("content")
                    .and_then(|c| c.as_array())
                    .is_some_and(|blocks| {
                        blocks
                            .iter()
                            .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("image"))
                    })
            })
        })
}

/// Length-ratio usage estimate for replies that report nothing.
fn estimate_usage(input_text: &str, reply: &Value) -> TokenUsage {
    let output_text = reply
        .get("content")
        .map(|c| c.to_string())
        .unwrap_or_default();
    let estimate = TokenUsage::new(
        usage::estimate_tokens(input_text),
        usage::estimate_tokens(&output_text),
    );
    tracing::debug!(
        input = estimate.input,
        output = estimate.output,
        confidence = ?Confidence::Low,
        "usage estimated from text length"
    );
    estimate
}

fn retry_backoff(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let base = RETRY_BACKOFF_BASE * factor;
    base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.25))
}
