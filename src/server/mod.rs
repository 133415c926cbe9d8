//! Axum HTTP surface: the messages API plus management endpoints.

mod auth;
mod handlers;

use std::sync::Arc;

use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ProxyError;
use crate::pipeline::Proxy;

pub use auth::auth_middleware;

/// Shared state threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<Proxy>,
}

/// Build the full application router.
pub fn app(proxy: Arc<Proxy>) -> Router {
    let state = AppState { proxy };

    let api = Router::new()
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/messages/count_tokens", post(handlers::count_tokens))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .route("/api/cache/flush", post(handlers::cache_flush))
        .route("/api/cache/invalidate", post(handlers::cache_invalidate))
        .route("/api/pool/stats", get(handlers::pool_stats))
        .route("/api/sequential", get(handlers::sequential_get))
        .route("/api/sequential", post(handlers::sequential_set))
        .route("/api/keys", get(handlers::keys_list))
        .route("/api/keys/reactivate", post(handlers::keys_reactivate))
        .route("/api/breakers", get(handlers::breakers_list))
        .route("/api/breakers/reset", post(handlers::breakers_reset))
        .route("/api/limits", get(handlers::limit_stats))
        .route("/api/retries", get(handlers::retry_stats))
        .route("/api/metrics", get(handlers::metrics_snapshot))
        .route("/api/metrics/rollups", get(handlers::metrics_rollups))
        .route("/api/metrics/top-models", get(handlers::metrics_top_models))
        .route("/api/metrics/hourly", get(handlers::metrics_hourly))
        .route("/api/metrics/daily", get(handlers::metrics_daily))
        .route("/api/metrics/sessions", get(handlers::metrics_sessions))
        .route(
            "/api/metrics/sessions/{session_id}",
            get(handlers::metrics_session_detail),
        )
        .route("/api/metrics/stream", get(handlers::metrics_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        // Health stays outside authentication for load balancers.
        .route("/health", get(handlers::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Serve until the shutdown future resolves, then drain and tear down.
pub async fn serve(
    proxy: Arc<Proxy>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), crate::error::Error> {
    let app = app(Arc::clone(&proxy));
    tracing::info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| crate::error::Error::Server(e.to_string()))?;

    // Intake has stopped and in-flight requests drained (bounded by the
    // grace period applied by the caller); tear down in order.
    proxy.shutdown().await;
    Ok(())
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = axum::http::StatusCode::from_u16(kind.status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        // Internal faults never leak detail to clients.
        let message = match &self {
            ProxyError::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        };
        let body = Json(serde_json::json!({
            "type": "error",
            "error": { "type": kind.as_str(), "message": message },
        }));

        let mut response = (status, body).into_response();
        if let Some(retry_after) = self.retry_after() {
            let secs = retry_after.as_secs_f64().ceil().max(0.0) as u64;
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn proxy_error_response_shape() {
        let err = ProxyError::RateLimited {
            scope: "session:s".to_string(),
            retry_after: Duration::from_millis(1500),
        };
        let response = err.into_response();
        assert_eq!(response.status(), 429);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "2",
            "retry-after rounds up to whole seconds"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "rate_limited");
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak() {
        let err = ProxyError::Internal {
            reason: "secret stack trace".to_string(),
        };
        let response = err.into_response();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["message"], "internal error");
    }
}
