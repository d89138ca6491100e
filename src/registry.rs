//! Explicit backend + frontdoor registries, keyed by string tag (spec.md
//! §4.5). Grounded on `src/llm/registry.rs::ToolRegistry`'s
//! `HashMap<String, Arc<dyn Trait>>` + builder-style `.register()` /
//! `.register_all_builtin()` shape, generalized to two parallel registries.
//! spec.md §9 "Global mutable state": these are the only legitimate
//! process-wide mutables, gated behind a `RwLock` and frozen (read-only)
//! after bootstrap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::backends::{BackendConfig, Provider};
use crate::frontdoors::FrontdoorFactory;

/// Builds one backend `Provider` instance from its config. A plain
/// function pointer is enough here — every backend constructor is a pure
/// `BackendConfig -> Arc<dyn Provider>` with no extra captured state,
/// mirroring the teacher's `ToolRegistry::register(name, Arc<dyn Tool>)`
/// but deferred to construction time since backend instances are
/// per-tenant, not process-wide singletons.
pub type BackendFactory = fn(BackendConfig) -> Arc<dyn Provider>;

#[derive(Default)]
struct RegistryInner<V> {
    entries: HashMap<String, V>,
}

/// Registration of backend constructors by type tag (`openai-chat`,
/// `anthropic-messages`, `openai-responses`, ...). Duplicate registration
/// of the same tag is a fatal configuration error (spec.md §4.5); looking
/// up an unknown tag returns the full list of known tags so the error
/// message is actionable.
pub struct BackendRegistry {
    inner: RwLock<RegistryInner<BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn register(&self, tag: impl Into<String>, factory: BackendFactory) -> Result<(), String> {
        let tag = tag.into();
        let mut guard = self.inner.write().expect("backend registry lock poisoned");
        if guard.entries.contains_key(&tag) {
            return Err(format!("backend type '{tag}' is already registered"));
        }
        guard.entries.insert(tag, factory);
        Ok(())
    }

    pub fn build(&self, tag: &str, config: BackendConfig) -> Result<Arc<dyn Provider>, String> {
        let guard = self.inner.read().expect("backend registry lock poisoned");
        match guard.entries.get(tag) {
            Some(factory) => Ok(factory(config)),
            None => {
                let mut known: Vec<&str> = guard.entries.keys().map(String::as_str).collect();
                known.sort_unstable();
                Err(format!(
                    "unknown backend type '{tag}'; known types: [{}]",
                    known.join(", ")
                ))
            }
        }
    }

    pub fn known_tags(&self) -> Vec<String> {
        let guard = self.inner.read().expect("backend registry lock poisoned");
        let mut tags: Vec<String> = guard.entries.keys().cloned().collect();
        tags.sort();
        tags
    }
}

/// Registration of frontdoor factories by type tag (`openai-chat`,
/// `anthropic-messages`, `openai-responses`).
pub struct FrontdoorRegistry {
    inner: RwLock<RegistryInner<Arc<dyn FrontdoorFactory>>>,
}

impl FrontdoorRegistry {
    pub fn new() -> Self {
        FrontdoorRegistry {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn register(&self, tag: impl Into<String>, factory: Arc<dyn FrontdoorFactory>) -> Result<(), String> {
        let tag = tag.into();
        let mut guard = self.inner.write().expect("frontdoor registry lock poisoned");
        if guard.entries.contains_key(&tag) {
            return Err(format!("frontdoor type '{tag}' is already registered"));
        }
        guard.entries.insert(tag, factory);
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn FrontdoorFactory>, String> {
        let guard = self.inner.read().expect("frontdoor registry lock poisoned");
        match guard.entries.get(tag) {
            Some(factory) => Ok(factory.clone()),
            None => {
                let mut known: Vec<&str> = guard.entries.keys().map(String::as_str).collect();
                known.sort_unstable();
                Err(format!(
                    "unknown frontdoor type '{tag}'; known types: [{}]",
                    known.join(", ")
                ))
            }
        }
    }

    pub fn known_tags(&self) -> Vec<String> {
        let guard = self.inner.read().expect("frontdoor registry lock poisoned");
        let mut tags: Vec<String> = guard.entries.keys().cloned().collect();
        tags.sort();
        tags
    }
}

/// Register every built-in backend and frontdoor type. Called once from
/// process bootstrap (`main.rs`); tests may construct fresh registries and
/// call this again for isolation (spec.md §4.5, §9 "Registration
/// side-effects").
pub fn register_builtins(backends: &BackendRegistry, frontdoors: &FrontdoorRegistry) -> Result<(), String> {
    backends.register("openai-chat", |config| {
        Arc::new(crate::backends::OpenAiChatBackend::new(config))
    })?;
    backends.register("openai-responses", |config| {
        Arc::new(crate::backends::OpenAiResponsesBackend::new(config))
    })?;
    backends.register("anthropic-messages", |config| {
        Arc::new(crate::backends::AnthropicBackend::new(config))
    })?;

    frontdoors.register("openai-chat", Arc::new(crate::frontdoors::openai_chat::OpenAiChatFrontdoor))?;
    frontdoors.register("anthropic-messages", Arc::new(crate::frontdoors::anthropic::AnthropicFrontdoor))?;
    frontdoors.register("openai-responses", Arc::new(crate::frontdoors::openai_responses::OpenAiResponsesFrontdoor))?;

    Ok(())
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for FrontdoorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_backend_registration_is_an_error() {
        let registry = BackendRegistry::new();
        registry.register("openai-chat", |c| Arc::new(crate::backends::OpenAiChatBackend::new(c))).unwrap();
        let err = registry
            .register("openai-chat", |c| Arc::new(crate::backends::OpenAiChatBackend::new(c)))
            .unwrap_err();
        assert!(err.contains("already registered"));
    }

    #[test]
    fn unknown_tag_error_lists_known_tags() {
        let registry = BackendRegistry::new();
        registry.register("openai-chat", |c| Arc::new(crate::backends::OpenAiChatBackend::new(c))).unwrap();
        let err = registry.build("nope", BackendConfig::new("x", "key")).unwrap_err();
        assert!(err.contains("openai-chat"));
    }

    #[test]
    fn register_builtins_is_idempotent_on_fresh_registries() {
        let backends = BackendRegistry::new();
        let frontdoors = FrontdoorRegistry::new();
        register_builtins(&backends, &frontdoors).unwrap();
        assert_eq!(backends.known_tags(), vec!["anthropic-messages", "openai-chat", "openai-responses"]);
        assert_eq!(frontdoors.known_tags(), vec!["anthropic-messages", "openai-chat", "openai-responses"]);
    }
}
