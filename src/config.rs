//! Configuration surface (spec.md §6, SPEC_FULL.md §2.3). An external
//! collaborator per spec.md §1 — only the documented top-level keys and
//! their effects are this gateway's concern, not the loader's validation
//! rules. Grounded on the teacher's own `serde_yaml` dependency; the
//! `POLY_`-prefixed env overlay and `${NAME}` expansion are new code, no
//! new crate.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub providers: Vec<ProviderConfig>,
    pub apps: Vec<AppConfig>,
    pub routing: RoutingConfig,
    pub tenants: Vec<TenantConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            providers: Vec::new(),
            apps: Vec::new(),
            routing: RoutingConfig::default(),
            tenants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { port: 8080 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Sqlite,
    Memory,
    #[default]
    None,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageType,
    pub sqlite: Option<SqliteStorageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStorageConfig {
    pub path: String,
}

/// Accepted so config files carrying it parse without error; has no
/// execution effect (spec.md §9 "Shadow-mode ... treat as future work").
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ShadowConfig {
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub supports_responses: bool,
    pub enable_passthrough: bool,
    pub use_responses_api: bool,
    pub responses_thread_key_path: Option<String>,
    pub responses_thread_persistence: bool,
    pub shadow: Option<ShadowConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RewriteRuleConfig {
    pub model_prefix: Option<String>,
    pub model_exact: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub rewrite_response_model: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FallbackRuleConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub rewrite_response_model: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ModelRoutingConfig {
    pub prefix_providers: Vec<String>,
    pub rewrites: Vec<RewriteRuleConfig>,
    pub fallback: Option<FallbackRuleConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub frontdoor: String,
    pub path: String,
    pub provider: Option<String>,
    pub default_model: Option<String>,
    pub enable_responses: bool,
    pub model_routing: ModelRoutingConfig,
    pub models: Vec<String>,
    pub force_store: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RoutingRuleConfig {
    pub model_prefix: Option<String>,
    pub model_exact: Option<String>,
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    pub rules: Vec<RoutingRuleConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ApiKeyConfig {
    pub key_hash: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TenantConfig {
    pub id: String,
    pub name: String,
    pub api_keys: Vec<ApiKeyConfig>,
    pub providers: Vec<ProviderConfig>,
    pub routing: RoutingConfig,
}

/// Expand `${NAME}` tokens once, string-wise, before YAML parsing
/// (SPEC_FULL.md §2.3 — "do not re-expand at request time"). Unset
/// variables expand to an empty string, matching common shell behavior.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Walk `POLY_`-prefixed environment variables, splitting the remaining
/// key on `__` to build a `serde_yaml::Value` patch tree, then merge it
/// over the parsed file value (SPEC_FULL.md §2.3).
fn env_overlay() -> Value {
    let mut root = Value::Mapping(Default::default());
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix("POLY_") else { continue };
        let path: Vec<String> = rest.split("__").map(|s| s.to_lowercase()).collect();
        let scalar = serde_yaml::from_str(&value).unwrap_or(Value::String(value));
        set_path(&mut root, &path, scalar);
    }
    root
}

fn set_path(node: &mut Value, path: &[String], value: Value) {
    let Value::Mapping(map) = node else { return };
    if path.len() == 1 {
        map.insert(Value::String(path[0].clone()), value);
        return;
    }
    let key = Value::String(path[0].clone());
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Default::default()));
    set_path(entry, &path[1..], value);
}

/// Deep-merge `overlay` onto `base`: mappings merge key-by-key, any other
/// value in `overlay` replaces the corresponding value in `base`.
fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Load `config.yaml` (or the given path), apply `${NAME}` expansion, then
/// overlay `POLY_`-prefixed environment variables before deserializing
/// into the typed `Config`.
pub fn load(path: &Path) -> Result<Config, ApiError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ApiError::server(format!("failed to read config file '{}': {e}", path.display())))?;
    load_str(&raw)
}

pub fn load_str(raw: &str) -> Result<Config, ApiError> {
    let expanded = expand_env(raw);
    let file_value: Value = serde_yaml::from_str(&expanded)
        .map_err(|e| ApiError::server(format!("invalid config YAML: {e}")))?;
    let merged = merge(file_value, env_overlay());
    serde_yaml::from_value(merged).map_err(|e| ApiError::server(format!("invalid config: {e}")))
}

/// Build the provider-name → config lookup a tenant or app needs to
/// resolve its `providers[]` list by name.
pub fn providers_by_name(providers: &[ProviderConfig]) -> HashMap<String, &ProviderConfig> {
    providers.iter().map(|p| (p.name.clone(), p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_yaml_omits_sections() {
        let config = load_str("server:\n  port: 9000\n").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.kind, StorageType::None);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn env_var_expansion_runs_once_at_load() {
        std::env::set_var("POLYGATE_TEST_KEY", "sk-expanded");
        let config = load_str("providers:\n  - name: openai\n    type: openai-chat\n    api_key: ${POLYGATE_TEST_KEY}\n").unwrap();
        assert_eq!(config.providers[0].api_key.as_deref(), Some("sk-expanded"));
        std::env::remove_var("POLYGATE_TEST_KEY");
    }

    #[test]
    fn env_overlay_overrides_port_with_double_underscore_path() {
        std::env::set_var("POLY_SERVER__PORT", "9999");
        let config = load_str("server:\n  port: 8080\n").unwrap();
        assert_eq!(config.server.port, 9999);
        std::env::remove_var("POLY_SERVER__PORT");
    }
}
