//! Routes a canonical request to one of several backend `Provider`s
//! (spec.md §4.3). Two independent layers compose here: the rule-based
//! router below (`RoutingRule` + default) and the `ModelMapping` layer in
//! `mapping.rs`, which may short-circuit the routing table entirely.
//!
//! Grounded on `src/llm/registry.rs::ToolRegistry`'s `HashMap`-keyed
//! lookup, generalized from tool-name lookup to model-name/prefix lookup;
//! the rule-evaluation loop itself has no teacher precedent and is new code
//! in the teacher's plain-iterator style.

mod mapping;

pub use mapping::{FallbackRule, MappingPredicate, ModelMapping, Resolved, RewriteRule};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::{EventStream, ModelDescriptor, Provider};
use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::error::{ApiError, ErrorKind};

/// How a `RoutingRule` matches an inbound (already model-mapped) model name.
#[derive(Debug, Clone)]
pub enum RoutingPredicate {
    ModelExact(String),
    ModelPrefix(String),
}

impl RoutingPredicate {
    fn matches(&self, model: &str) -> bool {
        match self {
            RoutingPredicate::ModelExact(s) => model == s,
            RoutingPredicate::ModelPrefix(s) => model.starts_with(s.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub predicate: RoutingPredicate,
    pub backend: String,
}

/// Selects a backend from `backends` using, in order: the model-mapping
/// layer, then the ordered routing-rules table, then the configured
/// default. Itself a `Provider` (spec.md §4.3: "The router is itself a
/// Provider"), so it composes transparently wherever a single backend
/// would otherwise be used (e.g. a tenant's router can itself be wrapped
/// by `RetryingProvider`, though retries normally live closer to the
/// backend adapters).
pub struct ModelRouter {
    backends: HashMap<String, Arc<dyn Provider>>,
    rules: Vec<RoutingRule>,
    default_backend: Option<String>,
    mapping: ModelMapping,
}

impl ModelRouter {
    pub fn new(
        backends: HashMap<String, Arc<dyn Provider>>,
        rules: Vec<RoutingRule>,
        default_backend: Option<String>,
        mapping: ModelMapping,
    ) -> Self {
        ModelRouter {
            backends,
            rules,
            default_backend,
            mapping,
        }
    }

    fn backend(&self, name: &str) -> Result<&Arc<dyn Provider>, ApiError> {
        self.backends.get(name).ok_or_else(|| {
            ApiError::new(
                ErrorKind::InvalidRequest,
                format!("router has no backend named '{name}'"),
            )
        })
    }

    /// spec.md §4.3 selection algorithm, after the mapping layer has had
    /// first refusal: evaluate rules in order, first match wins; fall back
    /// to the default; fail naming the model if there is no default.
    fn route_by_table(&self, model: &str) -> Result<&str, ApiError> {
        for rule in &self.rules {
            if rule.predicate.matches(model) {
                return Ok(rule.backend.as_str());
            }
        }
        self.default_backend.as_deref().ok_or_else(|| {
            ApiError::new(
                ErrorKind::InvalidRequest,
                format!("no route for model '{model}' and no default backend configured"),
            )
        })
    }

    /// Resolve `(backend name, upstream model name, optional mapping
    /// alias-restore info)` for one request's model field. A mapping rule
    /// that matched but set no backend forwards to this router's default;
    /// a model the mapping layer never touches flows unchanged into the
    /// routing table (DESIGN.md Open Question 1).
    fn resolve(&self, model: &str) -> Result<(String, String, Option<Resolved>), ApiError> {
        match self.mapping.resolve(model) {
            Some(resolved) => {
                let backend = match &resolved.backend {
                    Some(b) => b.clone(),
                    None => self.default_backend.clone().ok_or_else(|| {
                        ApiError::new(
                            ErrorKind::InvalidRequest,
                            format!("mapping rule for model '{model}' has no backend and no default is configured"),
                        )
                    })?,
                };
                let upstream_model = resolved.model.clone();
                Ok((backend, upstream_model, Some(resolved)))
            }
            None => {
                let backend = self.route_by_table(model)?.to_string();
                Ok((backend, model.to_string(), None))
            }
        }
    }
}

#[async_trait]
impl Provider for ModelRouter {
    async fn complete(&self, mut request: CanonicalRequest) -> Result<CanonicalResponse, ApiError> {
        let (backend_name, upstream_model, mapped) = self.resolve(&request.model)?;
        request.model = upstream_model;
        let backend = self.backend(&backend_name)?;
        let mut response = backend.complete(request).await?;
        if let Some(resolved) = mapped {
            if resolved.rewrite_response_model {
                response.model = resolved.alias;
            }
        }
        Ok(response)
    }

    async fn stream(&self, mut request: CanonicalRequest) -> Result<EventStream, ApiError> {
        let (backend_name, upstream_model, _mapped) = self.resolve(&request.model)?;
        request.model = upstream_model;
        let backend = self.backend(&backend_name)?;
        backend.stream(request).await
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ApiError> {
        let mut all = Vec::new();
        for backend in self.backends.values() {
            all.extend(backend.list_models().await?);
        }
        // Inverse rewrite for ListModels output (spec.md §4.1): any exact
        // rewrite rule with `rewrite_response_model` set lists its alias
        // instead of the real served model id.
        for rule in &self.mapping.rewrites {
            if !rule.rewrite_response_model {
                continue;
            }
            if let (MappingPredicate::Exact(alias), Some(served_model)) = (&rule.predicate, &rule.model) {
                if let Some(entry) = all.iter_mut().find(|m| &m.id == served_model) {
                    entry.id = alias.clone();
                }
            }
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{CanonicalResponse, Choice, FinishReason, Message, SourceApiType, Usage};

    struct StubBackend(&'static str);

    #[async_trait]
    impl Provider for StubBackend {
        async fn complete(&self, request: CanonicalRequest) -> Result<CanonicalResponse, ApiError> {
            Ok(CanonicalResponse {
                id: "resp_1".to_string(),
                created: 0,
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.0),
                    finish_reason: FinishReason::Stop,
                }],
                usage: Usage::default(),
            })
        }

        async fn stream(&self, _request: CanonicalRequest) -> Result<EventStream, ApiError> {
            unimplemented!()
        }

        async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ApiError> {
            Ok(vec![ModelDescriptor {
                id: "claude-3-haiku".to_string(),
                owned_by: self.0.to_string(),
            }])
        }
    }

    fn request(model: &str) -> CanonicalRequest {
        CanonicalRequest {
            tenant_id: "default".to_string(),
            model: model.to_string(),
            messages: vec![Message::user("hi")],
            system_prompt: None,
            tools: None,
            stream: false,
            max_tokens: 64,
            temperature: None,
            metadata: Default::default(),
            user_agent: None,
            source_api_type: SourceApiType::OpenAiChat,
        }
    }

    fn router() -> ModelRouter {
        let mut backends: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        backends.insert("openai".to_string(), Arc::new(StubBackend("openai")));
        backends.insert("anthropic".to_string(), Arc::new(StubBackend("anthropic")));

        let rules = vec![
            RoutingRule { predicate: RoutingPredicate::ModelPrefix("claude".to_string()), backend: "anthropic".to_string() },
            RoutingRule { predicate: RoutingPredicate::ModelPrefix("gpt".to_string()), backend: "openai".to_string() },
        ];

        ModelRouter::new(backends, rules, Some("openai".to_string()), ModelMapping::default())
    }

    #[tokio::test]
    async fn routes_by_prefix_with_default_fallback() {
        let r = router();
        assert_eq!(r.complete(request("gpt-4o")).await.unwrap().choices[0].message.content.as_text(), Some("openai"));
        assert_eq!(r.complete(request("claude-3-sonnet")).await.unwrap().choices[0].message.content.as_text(), Some("anthropic"));
        assert_eq!(r.complete(request("gemini-pro")).await.unwrap().choices[0].message.content.as_text(), Some("openai"));
    }

    #[tokio::test]
    async fn no_default_and_no_match_is_invalid_request() {
        let mut backends: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        backends.insert("openai".to_string(), Arc::new(StubBackend("openai")));
        let r = ModelRouter::new(backends, vec![], None, ModelMapping::default());
        let err = r.complete(request("mystery")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn alias_rewrite_bypasses_routing_table_and_restores_model() {
        let mut backends: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        backends.insert("anthropic".to_string(), Arc::new(StubBackend("anthropic")));
        let mapping = ModelMapping {
            rewrites: vec![RewriteRule {
                predicate: MappingPredicate::Exact("alias".to_string()),
                backend: Some("anthropic".to_string()),
                model: Some("claude-3-haiku".to_string()),
                rewrite_response_model: true,
            }],
            prefix_providers: Default::default(),
            fallback: None,
        };
        let r = ModelRouter::new(backends, vec![], None, mapping);
        let response = r.complete(request("alias")).await.unwrap();
        assert_eq!(response.model, "alias");
    }
}
