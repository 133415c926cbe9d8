//! Inbound authentication middleware.
//!
//! Three schemes: `none` (loopback deployments), `static` (one shared API
//! key, compared in constant time), and `jwt` (HS256 bearer tokens). The
//! credential may arrive as `Authorization: Bearer <token>` or a raw
//! `x-api-key` header. Rejections record an `unauthorized` metric before
//! returning 401.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secrecy::ExposeSecret;
use subtle::ConstantTimeEq;

use crate::config::AuthScheme;
use crate::error::ProxyError;
use crate::server::AppState;

/// Claims we require from JWT credentials. Expiry is validated by the
/// library; no other claims are interpreted.
#[derive(Debug, serde::Deserialize)]
struct Claims {
    #[allow(dead_code)]
    exp: usize,
}

fn presented_credential(request: &Request<Body>) -> Option<&str> {
    if let Some(value) = request.headers().get("authorization") {
        let value = value.to_str().ok()?;
        return value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "));
    }
    request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let auth = &state.proxy.config.server.auth;
    let verdict = match auth.scheme {
        AuthScheme::None => Ok(()),
        AuthScheme::Static => {
            let expected = auth
                .api_key
                .as_ref()
                .map(|k| k.expose_secret().as_bytes().to_vec())
                .unwrap_or_default();
            match presented_credential(&request) {
                Some(presented)
                    if presented.as_bytes().ct_eq(expected.as_slice()).into() =>
                {
                    Ok(())
                }
                Some(_) => Err("invalid API key"),
                None => Err("missing credential"),
            }
        }
        AuthScheme::Jwt => {
            let secret = auth
                .jwt_secret
                .as_ref()
                .map(|s| s.expose_secret().to_string())
                .unwrap_or_default();
            match presented_credential(&request) {
                Some(token) => {
                    let key = jsonwebtoken::DecodingKey::from_secret(secret.as_bytes());
                    let validation =
                        jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
                    match jsonwebtoken::decode::<Claims>(token, &key, &validation) {
                        Ok(_) => Ok(()),
                        Err(_) => Err("invalid token"),
                    }
                }
                None => Err("missing credential"),
            }
        }
    };

    match verdict {
        Ok(()) => next.run(request).await,
        Err(reason) => {
            let session = request
                .headers()
                .get("x-session-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unauthenticated");
            state
                .proxy
                .record_rejected(session, crate::error::ErrorKind::Unauthorized, 0);
            tracing::debug!(reason, "rejected unauthenticated request");
            ProxyError::Unauthorized {
                reason: reason.to_string(),
            }
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_prefers_authorization_header() {
        let request = Request::builder()
            .header("authorization", "Bearer tok-123")
            .header("x-api-key", "other")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_credential(&request), Some("tok-123"));
    }

    #[test]
    fn credential_falls_back_to_x_api_key() {
        let request = Request::builder()
            .header("x-api-key", "raw-key")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_credential(&request), Some("raw-key"));
    }

    #[test]
    fn non_bearer_authorization_is_rejected() {
        let request = Request::builder()
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_credential(&request), None);
    }

    #[test]
    fn no_headers_is_none() {
        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(presented_credential(&request), None);
    }
}
