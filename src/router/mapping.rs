//! The model-mapping layer (spec.md §4.3): rewrites a request's model field
//! (and optionally its backend) before the routing table ever sees it.
//! Independent of `RoutingRule` below — see `ModelRouter::resolve` for how
//! the two are composed, and DESIGN.md "Open Question decisions" for the
//! chosen precedence between this layer and `Routing.Rules`.

/// How a rewrite rule (or the fallback rule) matches an inbound model name.
#[derive(Debug, Clone)]
pub enum MappingPredicate {
    Exact(String),
    Prefix(String),
}

impl MappingPredicate {
    fn matches(&self, model: &str) -> bool {
        match self {
            MappingPredicate::Exact(s) => model == s,
            MappingPredicate::Prefix(s) => model.starts_with(s.as_str()),
        }
    }
}

/// One explicit rewrite rule (spec.md §4.3 step 1).
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub predicate: MappingPredicate,
    /// `None` forwards to the mapping layer's configured default backend.
    pub backend: Option<String>,
    /// `None` leaves the model name untouched.
    pub model: Option<String>,
    pub rewrite_response_model: bool,
}

/// The unconditional step-3 rule (spec.md §4.3): "a single fallback rule
/// that applies when nothing else matched." Optional — a mapping config
/// with no fallback simply lets the request fall through to the routing
/// table unchanged.
#[derive(Debug, Clone)]
pub struct FallbackRule {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub rewrite_response_model: bool,
}

/// What the mapping layer decided for one request: which backend to use
/// (if any — `None` means "use the mapping layer's default"), the upstream
/// model name to send, and whether the response's `model` field (and any
/// `ListModels` entry) must be rewritten back to the original alias.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub backend: Option<String>,
    pub model: String,
    pub rewrite_response_model: bool,
    /// The model name as the client originally sent it, restored onto the
    /// response when `rewrite_response_model` is set.
    pub alias: String,
}

/// spec.md §4.3: explicit rewrite rules → slash-prefix routing → a single
/// fallback rule, evaluated in that fixed order.
#[derive(Debug, Clone, Default)]
pub struct ModelMapping {
    pub rewrites: Vec<RewriteRule>,
    /// Backend names registered as slash-prefix targets: a request for
    /// `"anthropic/claude-3-haiku"` where `"anthropic"` is in this set
    /// forwards to backend `anthropic` with model `claude-3-haiku`.
    pub prefix_providers: std::collections::HashSet<String>,
    pub fallback: Option<FallbackRule>,
}

impl ModelMapping {
    pub fn resolve(&self, model: &str) -> Option<Resolved> {
        for rule in &self.rewrites {
            if rule.predicate.matches(model) {
                return Some(Resolved {
                    backend: rule.backend.clone(),
                    model: rule.model.clone().unwrap_or_else(|| model.to_string()),
                    rewrite_response_model: rule.rewrite_response_model,
                    alias: model.to_string(),
                });
            }
        }

        if let Some((prefix, rest)) = model.split_once('/') {
            if self.prefix_providers.contains(prefix) {
                return Some(Resolved {
                    backend: Some(prefix.to_string()),
                    model: rest.to_string(),
                    rewrite_response_model: false,
                    alias: model.to_string(),
                });
            }
        }

        self.fallback.as_ref().map(|fb| Resolved {
            backend: fb.backend.clone(),
            model: fb.model.clone().unwrap_or_else(|| model.to_string()),
            rewrite_response_model: fb.rewrite_response_model,
            alias: model.to_string(),
        })
    }

    /// Idempotence (spec.md §8): applying the mapping twice with the same
    /// config must yield the same selection both times. True by
    /// construction here — `resolve` is a pure function of `(self, model)`
    /// with no mutation — exercised in the unit test below as a guard
    /// against a future change introducing hidden state.
    #[cfg(test)]
    fn is_idempotent(&self, model: &str) -> bool {
        let a = self.resolve(model);
        let b = self.resolve(model);
        match (a, b) {
            (Some(a), Some(b)) => a.backend == b.backend && a.model == b.model,
            (None, None) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> ModelMapping {
        ModelMapping {
            rewrites: vec![RewriteRule {
                predicate: MappingPredicate::Exact("alias".to_string()),
                backend: Some("anthropic".to_string()),
                model: Some("claude-3-haiku".to_string()),
                rewrite_response_model: true,
            }],
            prefix_providers: ["anthropic".to_string()].into_iter().collect(),
            fallback: None,
        }
    }

    #[test]
    fn exact_rewrite_wins_first() {
        let resolved = mapping().resolve("alias").unwrap();
        assert_eq!(resolved.backend.as_deref(), Some("anthropic"));
        assert_eq!(resolved.model, "claude-3-haiku");
        assert!(resolved.rewrite_response_model);
    }

    #[test]
    fn slash_prefix_routes_to_registered_backend() {
        let resolved = mapping().resolve("anthropic/claude-3-opus").unwrap();
        assert_eq!(resolved.backend.as_deref(), Some("anthropic"));
        assert_eq!(resolved.model, "claude-3-opus");
        assert!(!resolved.rewrite_response_model);
    }

    #[test]
    fn untouched_model_flows_through_as_none() {
        assert!(mapping().resolve("gpt-4o").is_none());
    }

    #[test]
    fn resolution_is_idempotent() {
        let m = mapping();
        assert!(m.is_idempotent("alias"));
        assert!(m.is_idempotent("anthropic/claude-3-opus"));
        assert!(m.is_idempotent("gpt-4o"));
    }
}
