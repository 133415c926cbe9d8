//! HTTP handlers: the messages API, token counting, health, and the
//! management endpoints over every subsystem.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;

use crate::cache::fingerprint;
use crate::context::ProviderModel;
use crate::error::ProxyError;
use crate::pipeline::{InboundRequest, PipelineReply};
use crate::server::AppState;
use crate::usage::estimate_tokens;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn bad_json(rejection: JsonRejection) -> ProxyError {
    ProxyError::BadRequest {
        reason: format!("invalid JSON body: {rejection}"),
    }
}

/// `POST /v1/messages` — the proxy's main entry point.
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            state.proxy.record_rejected(
                "unparsed",
                crate::error::ErrorKind::BadRequest,
                0,
            );
            return bad_json(rejection).into_response();
        }
    };
    let session_header = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let reply = state
        .proxy
        .execute(InboundRequest {
            body,
            session_header,
        })
        .await;

    match reply {
        Ok(PipelineReply::Json {
            status,
            body,
            cache,
            request_id,
        }) => {
            let mut response = (
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                Json(body),
            )
                .into_response();
            let headers = response.headers_mut();
            if let Some(cache) = cache {
                if let Ok(value) = header::HeaderValue::from_str(cache) {
                    headers.insert("x-cache", value);
                }
            }
            if let Ok(value) = header::HeaderValue::from_str(&request_id) {
                headers.insert("x-request-id", value);
            }
            response
        }
        Ok(PipelineReply::Stream {
            status,
            relay,
            request_id,
        }) => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(relay))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            if let Ok(value) = header::HeaderValue::from_str(&request_id) {
                response.headers_mut().insert("x-request-id", value);
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

/// `POST /v1/messages/count_tokens` — local estimate in the provider shape.
pub async fn count_tokens(
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ProxyError> {
    let Json(body) = body.map_err(bad_json)?;
    let mut text = fingerprint::message_text(&body);
    if let Some(system) = body.get("system") {
        match system {
            Value::String(s) => text.push_str(s),
            other => text.push_str(&other.to_string()),
        }
    }
    Ok(Json(json!({ "input_tokens": estimate_tokens(&text) })))
}

/// `GET /health` — liveness, unauthenticated.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.proxy.metrics.snapshot();
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "uptime_secs": snapshot.uptime_secs,
        "requests_total": snapshot.requests_total,
        "pending_metric_rows": state.proxy.metrics.pending_len(),
    }))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.cache.stats()))
}

pub async fn cache_flush(State(state): State<AppState>) -> Json<Value> {
    state.proxy.cache.flush();
    tracing::info!("cache flushed via management API");
    Json(json!({ "flushed": true }))
}

#[derive(serde::Deserialize)]
pub struct InvalidateBody {
    pattern: String,
}

pub async fn cache_invalidate(
    State(state): State<AppState>,
    Json(body): Json<InvalidateBody>,
) -> Json<Value> {
    let removed = state.proxy.cache.invalidate(&body.pattern);
    Json(json!({ "removed": removed }))
}

pub async fn pool_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.pool.stats()))
}

pub async fn sequential_get(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.queues.stats()))
}

#[derive(serde::Deserialize)]
pub struct SequentialBody {
    provider: String,
    sequential: bool,
}

pub async fn sequential_set(
    State(state): State<AppState>,
    Json(body): Json<SequentialBody>,
) -> Result<Json<Value>, ProxyError> {
    if state.proxy.config.provider(&body.provider).is_none() {
        return Err(ProxyError::BadRequest {
            reason: format!("unknown provider {:?}", body.provider),
        });
    }
    state
        .proxy
        .queues
        .set_sequential(&body.provider, body.sequential);
    Ok(Json(json!({
        "provider": body.provider,
        "sequential": body.sequential,
    })))
}

pub async fn keys_list(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.keys.snapshot()))
}

#[derive(serde::Deserialize)]
pub struct ReactivateBody {
    provider: String,
    id: String,
}

pub async fn keys_reactivate(
    State(state): State<AppState>,
    Json(body): Json<ReactivateBody>,
) -> Result<Json<Value>, ProxyError> {
    if !state.proxy.keys.reactivate(&body.provider, &body.id) {
        return Err(ProxyError::BadRequest {
            reason: format!("unknown key {}/{}", body.provider, body.id),
        });
    }
    tracing::info!(provider = %body.provider, key = %body.id, "key reactivated");
    Ok(Json(json!({ "reactivated": body.id })))
}

pub async fn breakers_list(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.breakers.snapshot()))
}

#[derive(serde::Deserialize)]
pub struct BreakerResetBody {
    provider: String,
    model: String,
}

pub async fn breakers_reset(
    State(state): State<AppState>,
    Json(body): Json<BreakerResetBody>,
) -> Result<Json<Value>, ProxyError> {
    let pm = ProviderModel::new(body.provider.clone(), body.model.clone());
    if !state.proxy.breakers.reset(&pm) {
        return Err(ProxyError::BadRequest {
            reason: format!("no breaker for {pm}"),
        });
    }
    Ok(Json(json!({ "reset": pm.to_string() })))
}

pub async fn limit_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.limiter.stats()))
}

pub async fn retry_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.retry_stats()))
}

pub async fn metrics_snapshot(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.metrics.snapshot()))
}

fn store_unavailable() -> ProxyError {
    ProxyError::Internal {
        reason: "durable metric store not configured".to_string(),
    }
}

pub async fn metrics_rollups(State(state): State<AppState>) -> Result<Json<Value>, ProxyError> {
    let store = state.proxy.metric_store().ok_or_else(store_unavailable)?;
    let rollups = store
        .provider_rollups()
        .await
        .map_err(|e| ProxyError::Internal {
            reason: e.to_string(),
        })?;
    Ok(Json(json!(rollups)))
}

pub async fn metrics_top_models(
    State(state): State<AppState>,
) -> Result<Json<Value>, ProxyError> {
    let store = state.proxy.metric_store().ok_or_else(store_unavailable)?;
    let top = store.top_models(10).await.map_err(|e| ProxyError::Internal {
        reason: e.to_string(),
    })?;
    Ok(Json(json!(top)))
}

pub async fn metrics_hourly(State(state): State<AppState>) -> Result<Json<Value>, ProxyError> {
    let store = state.proxy.metric_store().ok_or_else(store_unavailable)?;
    let buckets = store
        .hourly_buckets(24)
        .await
        .map_err(|e| ProxyError::Internal {
            reason: e.to_string(),
        })?;
    Ok(Json(json!(buckets)))
}

pub async fn metrics_daily(State(state): State<AppState>) -> Result<Json<Value>, ProxyError> {
    let store = state.proxy.metric_store().ok_or_else(store_unavailable)?;
    let buckets = store
        .daily_buckets(30)
        .await
        .map_err(|e| ProxyError::Internal {
            reason: e.to_string(),
        })?;
    Ok(Json(json!(buckets)))
}

pub async fn metrics_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.proxy.metrics.session_usage()))
}

/// Durable per-session totals, from the store rather than the live window.
pub async fn metrics_session_detail(
    State(state): State<AppState>,
    axum::extract::Path(session_id): axum::extract::Path<String>,
) -> Result<Json<Value>, ProxyError> {
    let store = state.proxy.metric_store().ok_or_else(store_unavailable)?;
    let summary = store
        .session_summary(&session_id)
        .await
        .map_err(|e| ProxyError::Internal {
            reason: e.to_string(),
        })?;
    match summary {
        Some(summary) => Ok(Json(json!(summary))),
        None => Err(ProxyError::BadRequest {
            reason: format!("unknown session {session_id:?}"),
        }),
    }
}

/// `GET /api/metrics/stream` — server-sent snapshot updates. Slow
/// consumers skip snapshots (broadcast lag) rather than applying
/// back-pressure to the collector.
pub async fn metrics_stream(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let receiver = state.proxy.metrics.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|snapshot| async move {
        match snapshot {
            Ok(snapshot) => match Event::default().json_data(&snapshot) {
                Ok(event) => Some(Ok(event)),
                Err(_) => None,
            },
            // Lagged: drop and continue.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
