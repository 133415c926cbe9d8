//! Provider dispatch: shape, send, and relay upstream responses.
//!
//! Body shaping is a seam for the external transformer layer; the core
//! ships an identity shaper that only swaps in the resolved model name.
//! Streaming replies are relayed to the client verbatim while a tee feeds
//! the SSE event stream to the usage extractor, so token counts are
//! collected without touching the bytes the client sees.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::ProviderConfig;
use crate::context::ProviderModel;
use crate::error::{ProxyError, ProxyResult};
use crate::keys::ApiKeyLease;
use crate::upstream::pool::Connection;
use crate::usage::{self, ExtractedUsage, StreamUsageTracker};

/// A provider-ready request: the shaped body plus extra headers.
#[derive(Debug, Clone)]
pub struct ShapedRequest {
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

/// Transformer seam. Implementations map the inbound body to whatever the
/// target provider expects; the core never inspects the result beyond
/// forwarding it.
pub trait RequestShaper: Send + Sync {
    fn shape(&self, target: &ProviderModel, body: &Value) -> ShapedRequest;
}

/// Default shaper: passes the body through, replacing only the logical
/// model identifier with the resolved concrete model.
pub struct IdentityShaper;

impl RequestShaper for IdentityShaper {
    fn shape(&self, target: &ProviderModel, body: &Value) -> ShapedRequest {
        let mut body = body.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert("model".to_string(), Value::String(target.model.clone()));
        }
        ShapedRequest {
            body,
            headers: Vec::new(),
        }
    }
}

/// Classify a non-success upstream status into a proxy error.
///
/// 429 propagates as upstream rate limiting (with any `Retry-After`),
/// everything else surfaces as an upstream error carrying the status.
pub fn classify_status(
    provider: &str,
    status: u16,
    retry_after_secs: Option<u64>,
    body_excerpt: &str,
) -> ProxyError {
    if status == 429 {
        ProxyError::UpstreamRateLimited {
            provider: provider.to_string(),
            retry_after: retry_after_secs.map(Duration::from_secs),
        }
    } else {
        ProxyError::Upstream {
            provider: provider.to_string(),
            status,
            message: truncate(body_excerpt, 512),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Send a shaped request over a leased connection.
///
/// Returns the raw response for the caller to buffer or relay. Any
/// non-success status is already classified into a [`ProxyError`].
pub async fn send(
    connection: &Connection,
    provider: &ProviderConfig,
    key: &ApiKeyLease,
    shaped: &ShapedRequest,
    timeout: Duration,
) -> ProxyResult<reqwest::Response> {
    let url = format!(
        "{}{}",
        provider.base_url.trim_end_matches('/'),
        provider.messages_path
    );

    let mut request = connection
        .client()
        .post(&url)
        .timeout(timeout)
        // Both header conventions; providers ignore the one they don't use.
        .header("x-api-key", key.secret().expose_secret())
        .header(
            "authorization",
            format!("Bearer {}", key.secret().expose_secret()),
        )
        .json(&shaped.body);
    for (name, value) in &shaped.headers {
        request = request.header(name, value);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::DeadlineExceeded
        } else {
            ProxyError::Http(e)
        }
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(
        &provider.name,
        status.as_u16(),
        retry_after,
        &body,
    ))
}

/// Buffer a non-streaming reply and extract its token usage.
pub async fn read_json(
    provider: &str,
    response: reqwest::Response,
) -> ProxyResult<(u16, Value, Option<ExtractedUsage>)> {
    let status = response.status().as_u16();
    let header_usage = usage::extract_from_headers(
        response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    let bytes = response.bytes().await.map_err(ProxyError::Http)?;
    let body: Value = serde_json::from_slice(&bytes).map_err(|e| ProxyError::Upstream {
        provider: provider.to_string(),
        status,
        message: format!("invalid JSON reply: {e}"),
    })?;
    let found = usage::extract(&body).or(header_usage);
    Ok((status, body, found))
}

/// End-of-stream summary handed to the response observer.
#[derive(Debug)]
pub struct StreamSummary {
    pub usage: Option<ExtractedUsage>,
    /// Whether the upstream stream completed without transport error.
    pub success: bool,
    /// Bytes of SSE event data observed by the usage scanner.
    pub bytes: u64,
}

/// Callback invoked exactly once when a relayed stream finishes (complete,
/// errored, or abandoned by the client).
pub type StreamObserver = Box<dyn FnOnce(StreamSummary) + Send + 'static>;

/// Relays upstream bytes to the client verbatim while teeing them into an
/// SSE parser that tracks token usage.
///
/// The observer fires exactly once: on clean end, on transport error, or
/// on drop (client disconnect). Resource releases for streaming requests
/// hang off that observer, which is what makes mid-stream disconnects
/// release leases promptly.
pub struct StreamRelay {
    inner: BoxStream<'static, Result<Bytes, std::io::Error>>,
    tap: Option<mpsc::UnboundedSender<Bytes>>,
    done: Option<oneshot::Sender<bool>>,
}

impl StreamRelay {
    /// Wrap an upstream byte stream. `prompt_chars` seeds the fallback
    /// usage estimate for providers that never report counts.
    pub fn new<S, E>(upstream: S, prompt_chars: u64, observer: StreamObserver) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (tap_tx, tap_rx) = mpsc::unbounded_channel::<Bytes>();
        let (done_tx, done_rx) = oneshot::channel::<bool>();

        tokio::spawn(scan_usage(tap_rx, done_rx, prompt_chars, observer));

        Self {
            inner: upstream.map(|r| r.map_err(std::io::Error::other)).boxed(),
            tap: Some(tap_tx),
            done: Some(done_tx),
        }
    }

    fn finish(&mut self, success: bool) {
        // Drop the tap first so the scanner sees end-of-stream.
        self.tap.take();
        if let Some(done) = self.done.take() {
            let _ = done.send(success);
        }
    }
}

/// Parse the teed SSE byte stream and deliver the summary.
async fn scan_usage(
    tap_rx: mpsc::UnboundedReceiver<Bytes>,
    done_rx: oneshot::Receiver<bool>,
    prompt_chars: u64,
    observer: StreamObserver,
) {
    let mut tracker = StreamUsageTracker::new();
    tracker.set_prompt_chars(prompt_chars);

    let mut events = UnboundedReceiverStream::new(tap_rx)
        .map(Ok::<Bytes, Infallible>)
        .eventsource();
    let mut event_bytes = 0u64;
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                event_bytes += event.data.len() as u64;
                tracker.observe_event(&event.data);
            }
            Err(_) => break,
        }
    }

    let success = done_rx.await.unwrap_or(false);
    observer(StreamSummary {
        usage: tracker.finish(),
        success,
        bytes: event_bytes,
    });
}

impl Stream for StreamRelay {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(tap) = &this.tap {
                    // A closed scanner only costs usage accounting.
                    let _ = tap.send(chunk.clone());
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        // Client went away mid-stream.
        self.finish(false);
    }
}
