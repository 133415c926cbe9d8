//! Request routing: logical model to concrete (provider, model).
//!
//! Selection walks a fixed rule ladder and the first match wins, so two
//! invocations over the same config snapshot always agree. The router never
//! blocks and never does I/O; it reads only the config snapshot.

use crate::config::RoutingConfig;
use crate::context::ProviderModel;

/// Routing inputs distilled from one client request.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// The client-supplied model identifier (possibly `provider,model`).
    pub model: String,
    pub background: bool,
    pub long_context: bool,
    pub reasoning: bool,
    pub web_search: bool,
    pub image: bool,
    pub subagent: bool,
    /// Local estimate of the prompt size, for the long-context rule.
    pub prompt_tokens: u64,
}

/// A routing decision plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub target: ProviderModel,
    /// Which ladder rung matched, e.g. `"explicit"` or `"intent:background"`.
    pub rule: &'static str,
}

/// Custom routing hook: consulted after intent rules, before the default.
/// A `None` result falls through.
pub type RouteHook = dyn Fn(&RouteRequest) -> Option<ProviderModel> + Send + Sync;

pub struct Router {
    config: RoutingConfig,
    hook: Option<Box<RouteHook>>,
}

impl Router {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config, hook: None }
    }

    /// Register a custom routing hook.
    pub fn with_hook(
        mut self,
        hook: impl Fn(&RouteRequest) -> Option<ProviderModel> + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Resolve a request to a concrete target.
    ///
    /// Rule order: explicit `provider,model`, then long-context (flag or
    /// estimate over the threshold), then the remaining intent flags in
    /// fixed order, then the custom hook, then the configured default.
    pub fn route(&self, request: &RouteRequest) -> Option<RouteDecision> {
        if let Some(target) = ProviderModel::parse_comma_form(&request.model) {
            return Some(RouteDecision {
                target,
                rule: "explicit",
            });
        }

        let long_context =
            request.long_context || request.prompt_tokens >= self.config.long_context_threshold;
        let intents: [(bool, &Option<String>, &'static str); 6] = [
            (
                long_context,
                &self.config.intents.long_context,
                "intent:long_context",
            ),
            (
                request.background,
                &self.config.intents.background,
                "intent:background",
            ),
            (
                request.reasoning,
                &self.config.intents.reasoning,
                "intent:reasoning",
            ),
            (
                request.web_search,
                &self.config.intents.web_search,
                "intent:web_search",
            ),
            (request.image, &self.config.intents.image, "intent:image"),
            (
                request.subagent,
                &self.config.intents.subagent,
                "intent:subagent",
            ),
        ];
        for (flagged, target, rule) in intents {
            if !flagged {
                continue;
            }
            // Targets are validated as comma-form at config load.
            if let Some(target) = target.as_deref().and_then(ProviderModel::parse_comma_form) {
                return Some(RouteDecision { target, rule });
            }
        }

        if let Some(hook) = &self.hook {
            if let Some(target) = hook(request) {
                return Some(RouteDecision {
                    target,
                    rule: "hook",
                });
            }
        }

        self.config
            .default
            .as_deref()
            .and_then(ProviderModel::parse_comma_form)
            .map(|target| RouteDecision {
                target,
                rule: "default",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::IntentTargets;

    fn config() -> RoutingConfig {
        RoutingConfig {
            default: Some("anthropic,claude-sonnet".to_string()),
            intents: IntentTargets {
                background: Some("anthropic,claude-haiku".to_string()),
                long_context: Some("google,gemini-pro".to_string()),
                reasoning: Some("openai,o-large".to_string()),
                web_search: Some("perplexity,sonar".to_string()),
                image: None,
                subagent: None,
            },
            long_context_threshold: 60_000,
        }
    }

    fn request(model: &str) -> RouteRequest {
        RouteRequest {
            model: model.to_string(),
            ..RouteRequest::default()
        }
    }

    #[test]
    fn explicit_comma_form_wins_over_everything() {
        let router = Router::new(config());
        let mut req = request("openai,gpt-x");
        req.background = true;
        req.prompt_tokens = 1_000_000;

        let decision = router.route(&req).unwrap();
        assert_eq!(decision.rule, "explicit");
        assert_eq!(decision.target, ProviderModel::new("openai", "gpt-x"));
    }

    #[test]
    fn background_intent_maps() {
        let router = Router::new(config());
        let mut req = request("claude-sonnet");
        req.background = true;

        let decision = router.route(&req).unwrap();
        assert_eq!(decision.rule, "intent:background");
        assert_eq!(decision.target, ProviderModel::new("anthropic", "claude-haiku"));
    }

    #[test]
    fn long_context_triggers_on_estimate_threshold() {
        let router = Router::new(config());
        let mut req = request("claude-sonnet");
        req.prompt_tokens = 60_000; // boundary is inclusive

        let decision = router.route(&req).unwrap();
        assert_eq!(decision.rule, "intent:long_context");
        assert_eq!(decision.target, ProviderModel::new("google", "gemini-pro"));

        req.prompt_tokens = 59_999;
        assert_eq!(router.route(&req).unwrap().rule, "default");
    }

    #[test]
    fn long_context_outranks_other_intents() {
        let router = Router::new(config());
        let mut req = request("claude-sonnet");
        req.long_context = true;
        req.background = true;

        assert_eq!(router.route(&req).unwrap().rule, "intent:long_context");
    }

    #[test]
    fn unmapped_intent_falls_through() {
        let router = Router::new(config());
        let mut req = request("claude-sonnet");
        req.image = true; // no image mapping configured

        let decision = router.route(&req).unwrap();
        assert_eq!(decision.rule, "default");
    }

    #[test]
    fn hook_beats_default_but_not_intents() {
        let router = Router::new(config())
            .with_hook(|_| Some(ProviderModel::new("custom", "model-x")));

        let decision = router.route(&request("claude-sonnet")).unwrap();
        assert_eq!(decision.rule, "hook");
        assert_eq!(decision.target, ProviderModel::new("custom", "model-x"));

        let mut req = request("claude-sonnet");
        req.reasoning = true;
        assert_eq!(router.route(&req).unwrap().rule, "intent:reasoning");
    }

    #[test]
    fn hook_none_falls_through_to_default() {
        let router = Router::new(config()).with_hook(|_| None);
        let decision = router.route(&request("claude-sonnet")).unwrap();
        assert_eq!(decision.rule, "default");
        assert_eq!(
            decision.target,
            ProviderModel::new("anthropic", "claude-sonnet")
        );
    }

    #[test]
    fn no_default_no_match_is_none() {
        let router = Router::new(RoutingConfig {
            default: None,
            intents: IntentTargets::default(),
            long_context_threshold: 60_000,
        });
        assert!(router.route(&request("claude-sonnet")).is_none());
    }

    #[test]
    fn routing_is_deterministic() {
        let router = Router::new(config());
        let mut req = request("claude-sonnet");
        req.web_search = true;

        let first = router.route(&req).unwrap();
        let second = router.route(&req).unwrap();
        assert_eq!(first, second);
    }
}
