//! Provider-agnostic token usage extraction.
//!
//! Upstream replies disagree on where and how they report token counts:
//!
//! | Shape     | Fields |
//! |-----------|--------|
//! | OpenAI    | `usage.prompt_tokens` / `usage.completion_tokens` |
//! | Anthropic | `usage.input_tokens` / `usage.output_tokens` |
//! | Google    | `usageMetadata.promptTokenCount` / `candidatesTokenCount` |
//! | NVIDIA    | counts nested under `metadata.usage`, or response headers |
//!
//! The extractor walks a prioritized list of container paths and field
//! pairs, derives a missing half from `total_tokens` when possible, and
//! falls back to a character-ratio estimate. It never fails a request;
//! absence is an `Option::None`.

use serde_json::Value;

/// Input/output token counts for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// How much the reported counts can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// A successful extraction, tagged with provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractedUsage {
    pub usage: TokenUsage,
    pub confidence: Confidence,
    /// Which rule produced the counts, e.g. `"usage.input_tokens"`.
    pub source: &'static str,
}

/// Field pairs tried on each candidate container, most specific first.
const FIELD_PAIRS: &[(&str, &str, &str)] = &[
    ("input_tokens", "output_tokens", "usage.input_tokens"),
    ("prompt_tokens", "completion_tokens", "usage.prompt_tokens"),
    (
        "promptTokenCount",
        "candidatesTokenCount",
        "usageMetadata.promptTokenCount",
    ),
    ("input", "output", "usage.input"),
];

/// Total-count keys used for subtraction when only one half is present.
const TOTAL_KEYS: &[&str] = &["total_tokens", "totalTokenCount", "total"];

fn as_count(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    // Some gateways report counts as floats.
    value.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)
}

fn field(container: &Value, key: &str) -> Option<u64> {
    container.get(key).and_then(as_count)
}

/// Candidate containers, in priority order: the conventional `usage`
/// object, Google's `usageMetadata`, NVIDIA's nested metadata, then the
/// reply root itself.
fn containers(reply: &Value) -> Vec<&Value> {
    let mut out = Vec::with_capacity(4);
    if let Some(v) = reply.get("usage") {
        out.push(v);
    }
    if let Some(v) = reply.get("usageMetadata") {
        out.push(v);
    }
    if let Some(v) = reply.get("metadata").and_then(|m| m.get("usage")) {
        out.push(v);
    }
    if let Some(v) = reply.get("response").and_then(|r| r.get("usage")) {
        out.push(v);
    }
    out.push(reply);
    out
}

fn extract_from_container(container: &Value) -> Option<ExtractedUsage> {
    for (input_key, output_key, source) in FIELD_PAIRS {
        let input = field(container, input_key);
        let output = field(container, output_key);
        match (input, output) {
            (Some(input), Some(output)) => {
                return Some(ExtractedUsage {
                    usage: TokenUsage::new(input, output),
                    confidence: Confidence::High,
                    source,
                });
            }
            // One half plus a total lets us derive the other.
            (Some(input), None) => {
                if let Some(total) = TOTAL_KEYS.iter().find_map(|k| field(container, k)) {
                    return Some(ExtractedUsage {
                        usage: TokenUsage::new(input, total.saturating_sub(input)),
                        confidence: Confidence::Medium,
                        source: "derived.total_minus_input",
                    });
                }
            }
            (None, Some(output)) => {
                if let Some(total) = TOTAL_KEYS.iter().find_map(|k| field(container, k)) {
                    return Some(ExtractedUsage {
                        usage: TokenUsage::new(total.saturating_sub(output), output),
                        confidence: Confidence::Medium,
                        source: "derived.total_minus_output",
                    });
                }
            }
            (None, None) => {}
        }
    }
    None
}

/// Extract token usage from a complete (non-streamed) reply body.
pub fn extract(reply: &Value) -> Option<ExtractedUsage> {
    containers(reply).into_iter().find_map(extract_from_container)
}

/// Lone halves of a usage record, for streamed events that report only one
/// side at a time (e.g. input counts at stream start, output counts on the
/// terminal event).
fn partial_counts(reply: &Value) -> (Option<u64>, Option<u64>) {
    for container in containers(reply) {
        for (input_key, output_key, _) in FIELD_PAIRS {
            let input = field(container, input_key);
            let output = field(container, output_key);
            if input.is_some() || output.is_some() {
                return (input, output);
            }
        }
    }
    (None, None)
}

/// Extract token usage stashed in response headers (NVIDIA-style).
///
/// `headers` yields `(name, value)` pairs; names are matched
/// case-insensitively.
pub fn extract_from_headers<'a, I>(headers: I) -> Option<ExtractedUsage>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut input = None;
    let mut output = None;
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "x-input-tokens" | "x-prompt-tokens" | "x-usage-input-tokens" => {
                input = value.trim().parse::<u64>().ok().or(input);
            }
            "x-output-tokens" | "x-completion-tokens" | "x-usage-output-tokens" => {
                output = value.trim().parse::<u64>().ok().or(output);
            }
            _ => {}
        }
    }
    match (input, output) {
        (Some(input), Some(output)) => Some(ExtractedUsage {
            usage: TokenUsage::new(input, output),
            confidence: Confidence::High,
            source: "headers",
        }),
        _ => None,
    }
}

/// Rough token estimate from text length (≈4 characters per token).
///
/// Used for the count-tokens endpoint, the router's long-context signal,
/// and the last-resort usage estimate.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Tracks usage across a streamed reply.
///
/// Providers that stream often emit usage only on the terminal event, or
/// split it across events (input counts at stream start, output counts at
/// the end). The tracker merges every observation field-wise, keeping the
/// last value seen for each half, and counts emitted text as a fallback.
#[derive(Debug, Default)]
pub struct StreamUsageTracker {
    input: Option<u64>,
    output: Option<u64>,
    /// Characters of streamed text, for the length-ratio fallback.
    emitted_chars: u64,
    prompt_chars: u64,
}

impl StreamUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the prompt size for the fallback estimate.
    pub fn set_prompt_chars(&mut self, chars: u64) {
        self.prompt_chars = chars;
    }

    /// Feed one SSE event's `data` payload. Non-JSON payloads (`[DONE]`
    /// sentinels, comments) are ignored.
    pub fn observe_event(&mut self, data: &str) {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return;
        };
        self.observe_value(&value);
    }

    /// Feed one already-parsed stream event.
    pub fn observe_value(&mut self, value: &Value) {
        // Merge field-wise: a terminal event may repeat input counts, carry
        // only the output half, or report a zero placeholder.
        let (input, output) = partial_counts(value);
        if let Some(input) = input {
            if input > 0 || self.input.is_none() {
                self.input = Some(input);
            }
        }
        if let Some(output) = output {
            if output > 0 || self.output.is_none() {
                self.output = Some(output);
            }
        }
        // Track streamed text deltas for the fallback estimate.
        for key in ["delta", "content", "text"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                self.emitted_chars += text.chars().count() as u64;
            }
        }
        if let Some(text) = value
            .pointer("/delta/text")
            .or_else(|| value.pointer("/choices/0/delta/content"))
            .and_then(|v| v.as_str())
        {
            self.emitted_chars += text.chars().count() as u64;
        }
    }

    /// Final usage for the stream.
    ///
    /// Reported counts win; otherwise a length-ratio estimate is returned
    /// at low confidence, or `None` when there is nothing to estimate from.
    pub fn finish(&self) -> Option<ExtractedUsage> {
        match (self.input, self.output) {
            (Some(input), Some(output)) => Some(ExtractedUsage {
                usage: TokenUsage::new(input, output),
                confidence: Confidence::High,
                source: "stream.usage",
            }),
            (Some(input), None) => Some(ExtractedUsage {
                usage: TokenUsage::new(input, estimate_tokens_from_chars(self.emitted_chars)),
                confidence: Confidence::Low,
                source: "stream.estimated_output",
            }),
            (None, Some(output)) => Some(ExtractedUsage {
                usage: TokenUsage::new(estimate_tokens_from_chars(self.prompt_chars), output),
                confidence: Confidence::Low,
                source: "stream.estimated_input",
            }),
            (None, None) => {
                if self.emitted_chars == 0 && self.prompt_chars == 0 {
                    return None;
                }
                Some(ExtractedUsage {
                    usage: TokenUsage::new(
                        estimate_tokens_from_chars(self.prompt_chars),
                        estimate_tokens_from_chars(self.emitted_chars),
                    ),
                    confidence: Confidence::Low,
                    source: "stream.estimated",
                })
            }
        }
    }
}

fn estimate_tokens_from_chars(chars: u64) -> u64 {
    chars.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn openai_shape_extracts_high_confidence() {
        let reply = json!({
            "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 }
        });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(10, 20));
        assert_eq!(found.confidence, Confidence::High);
    }

    #[test]
    fn anthropic_shape_extracts_high_confidence() {
        let reply = json!({
            "usage": { "input_tokens": 11, "output_tokens": 22 }
        });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(11, 22));
        assert_eq!(found.confidence, Confidence::High);
    }

    #[test]
    fn google_shape_extracts_from_usage_metadata() {
        let reply = json!({
            "usageMetadata": { "promptTokenCount": 7, "candidatesTokenCount": 13, "totalTokenCount": 20 }
        });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(7, 13));
        assert_eq!(found.confidence, Confidence::High);
    }

    #[test]
    fn nvidia_shape_extracts_from_nested_metadata() {
        let reply = json!({
            "metadata": { "usage": { "prompt_tokens": 5, "completion_tokens": 9 } }
        });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(5, 9));
        assert_eq!(found.confidence, Confidence::High);
    }

    #[test]
    fn counts_at_root_are_found_last() {
        let reply = json!({ "input_tokens": 3, "output_tokens": 4, "id": "msg_1" });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(3, 4));
    }

    #[test]
    fn missing_output_derived_from_total() {
        let reply = json!({
            "usage": { "prompt_tokens": 12, "total_tokens": 30 }
        });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(12, 18));
        assert_eq!(found.confidence, Confidence::Medium);
        assert_eq!(found.source, "derived.total_minus_input");
    }

    #[test]
    fn missing_input_derived_from_total() {
        let reply = json!({
            "usage": { "output_tokens": 25, "total_tokens": 40 }
        });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(15, 25));
        assert_eq!(found.confidence, Confidence::Medium);
    }

    #[test]
    fn float_counts_are_accepted() {
        let reply = json!({ "usage": { "input_tokens": 10.0, "output_tokens": 20.0 } });
        let found = extract(&reply).unwrap();
        assert_eq!(found.usage, TokenUsage::new(10, 20));
    }

    #[test]
    fn absence_is_none_not_error() {
        assert!(extract(&json!({ "id": "msg_1", "content": [] })).is_none());
        assert!(extract(&json!(null)).is_none());
        assert!(extract(&json!("just a string")).is_none());
    }

    #[test]
    fn headers_extraction() {
        let found = extract_from_headers([
            ("X-Input-Tokens", "42"),
            ("x-output-tokens", "17"),
            ("content-type", "application/json"),
        ])
        .unwrap();
        assert_eq!(found.usage, TokenUsage::new(42, 17));
        assert_eq!(found.source, "headers");

        // A single half is not enough.
        assert!(extract_from_headers([("x-input-tokens", "42")]).is_none());
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn stream_tracker_keeps_last_usage_event() {
        let mut tracker = StreamUsageTracker::new();
        // Anthropic-style: input counts on message_start, output on the
        // terminal message_delta.
        tracker.observe_event(r#"{"type":"message_start","usage":{"input_tokens":50,"output_tokens":0}}"#);
        tracker.observe_event(r#"{"type":"content_block_delta","delta":{"text":"hello"}}"#);
        tracker.observe_event(r#"{"type":"message_delta","usage":{"input_tokens":0,"output_tokens":31}}"#);

        let found = tracker.finish().unwrap();
        assert_eq!(found.usage, TokenUsage::new(50, 31));
        assert_eq!(found.confidence, Confidence::High);
    }

    #[test]
    fn stream_tracker_accepts_output_only_terminal_event() {
        let mut tracker = StreamUsageTracker::new();
        tracker.observe_event(r#"{"type":"message_start","usage":{"input_tokens":50,"output_tokens":0}}"#);
        // Terminal event reports only the output half.
        tracker.observe_event(r#"{"type":"message_delta","usage":{"output_tokens":7}}"#);

        let found = tracker.finish().unwrap();
        assert_eq!(found.usage, TokenUsage::new(50, 7));
        assert_eq!(found.confidence, Confidence::High);
    }

    #[test]
    fn stream_tracker_ignores_done_sentinel() {
        let mut tracker = StreamUsageTracker::new();
        tracker.observe_event(r#"{"usage":{"prompt_tokens":8,"completion_tokens":2}}"#);
        tracker.observe_event("[DONE]");
        let found = tracker.finish().unwrap();
        assert_eq!(found.usage, TokenUsage::new(8, 2));
    }

    #[test]
    fn stream_tracker_estimates_when_no_usage_seen() {
        let mut tracker = StreamUsageTracker::new();
        tracker.set_prompt_chars(40);
        tracker.observe_event(r#"{"delta":{"text":"twelve chars"}}"#);
        let found = tracker.finish().unwrap();
        assert_eq!(found.confidence, Confidence::Low);
        assert_eq!(found.usage.input, 10);
        assert_eq!(found.usage.output, 3);
    }

    #[test]
    fn stream_tracker_empty_yields_none() {
        assert!(StreamUsageTracker::new().finish().is_none());
    }
}
