//! Tenant model (spec.md §3, §4.6): a namespace carrying its own set of
//! hashed api keys, backend instances, and routing policy. Grounded on
//! `src/llm/registry.rs::ToolRegistry`'s map-of-name-to-handle shape,
//! reused here for "tenant id → Tenant".

use std::collections::HashMap;
use std::sync::Arc;

use subtle::ConstantTimeEq;

use crate::router::ModelRouter;

/// An empty app-router map, used by every `Tenant` constructor that isn't
/// concerned with per-app routing (tests, `single_tenant` before apps are
/// mounted).
fn no_app_routers() -> HashMap<String, Arc<ModelRouter>> {
    HashMap::new()
}

/// One configured api key. The key string itself is never stored — only
/// its SHA-256 hex digest (spec.md §3 invariant).
#[derive(Debug, Clone)]
pub struct ApiKeyHash {
    pub hash: String,
    pub description: String,
}

/// A tenant: its display identity plus the router that resolves its
/// requests to a backend. `router` already has the tenant's own
/// backend map and routing policy baked in by the time it's constructed
/// (see `config.rs` for how a tenant's `providers[]`/`routing` config
/// becomes this `ModelRouter`).
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub api_keys: Vec<ApiKeyHash>,
    /// This tenant's default router — used by any app mount that doesn't
    /// appear in `app_routers` (spec.md §4.3).
    pub router: Arc<ModelRouter>,
    /// Per-app override routers, keyed by the app's configured `name`
    /// (spec.md §6 `apps[]`): each app may set its own `provider` default
    /// and `model_routing` layered on top of this tenant's shared backend
    /// map, independent of this tenant's default `router` (`server.rs`
    /// builds one entry per configured app at bootstrap).
    pub app_routers: HashMap<String, Arc<ModelRouter>>,
}

impl Tenant {
    /// The router an app mount should use: its own override if `server.rs`
    /// built one for `app_name`, else this tenant's default.
    pub fn router_for_app(&self, app_name: &str) -> Arc<ModelRouter> {
        self.app_routers
            .get(app_name)
            .cloned()
            .unwrap_or_else(|| self.router.clone())
    }
}

/// The process-wide implicit tenant used when no `tenants[]` are
/// configured (spec.md §4.6 "single-tenant mode").
pub const DEFAULT_TENANT_ID: &str = "default";

/// Looks up a tenant by the SHA-256 hash of a presented bearer token.
/// Built once at bootstrap from `Config.tenants`, then read-only for the
/// life of the process (spec.md §5 "the only legitimate process-wide
/// mutables are the two factory registries" — this map is immutable after
/// construction so it needs no lock at all, unlike the registries).
pub struct TenantDirectory {
    /// A flat list rather than a `HashMap`: `by_key_hash` below compares
    /// every entry with `subtle::ConstantTimeEq` and never short-circuits,
    /// so lookup time doesn't vary with which entry (if any) matches —
    /// the same defense `CloudLLM-ai-cloudllm`'s `AuthConfig::validate`
    /// applies to a single bearer token, extended across N tenant keys.
    by_key_hash: Vec<(String, Arc<Tenant>)>,
    by_id: HashMap<String, Arc<Tenant>>,
    /// `None` in multi-tenant mode; `Some` is the implicit tenant used when
    /// no `tenants[]` were configured at all.
    single_tenant: Option<Arc<Tenant>>,
}

impl TenantDirectory {
    pub fn multi_tenant(tenants: Vec<Tenant>) -> Self {
        let mut by_key_hash = Vec::new();
        let mut by_id = HashMap::new();
        for tenant in tenants {
            let tenant = Arc::new(tenant);
            for key in &tenant.api_keys {
                by_key_hash.push((key.hash.clone(), tenant.clone()));
            }
            by_id.insert(tenant.id.clone(), tenant.clone());
        }
        TenantDirectory {
            by_key_hash,
            by_id,
            single_tenant: None,
        }
    }

    pub fn single_tenant(router: Arc<ModelRouter>) -> Self {
        Self::single_tenant_with_apps(router, no_app_routers())
    }

    pub fn single_tenant_with_apps(
        router: Arc<ModelRouter>,
        app_routers: HashMap<String, Arc<ModelRouter>>,
    ) -> Self {
        let tenant = Arc::new(Tenant {
            id: DEFAULT_TENANT_ID.to_string(),
            name: "default".to_string(),
            api_keys: Vec::new(),
            router,
            app_routers,
        });
        let mut by_id = HashMap::new();
        by_id.insert(tenant.id.clone(), tenant.clone());
        TenantDirectory {
            by_key_hash: Vec::new(),
            by_id,
            single_tenant: Some(tenant),
        }
    }

    pub fn is_single_tenant(&self) -> bool {
        self.single_tenant.is_some()
    }

    pub fn implicit_tenant(&self) -> Option<Arc<Tenant>> {
        self.single_tenant.clone()
    }

    /// Constant-time across every configured key hash (spec.md §4.6):
    /// every entry is compared, and the comparison itself uses
    /// `ConstantTimeEq` rather than `==`, so neither which key (if any)
    /// matched nor a partial prefix match of one key is observable from
    /// response latency.
    pub fn by_key_hash(&self, hash: &str) -> Option<Arc<Tenant>> {
        let needle = hash.as_bytes();
        let mut found: Option<Arc<Tenant>> = None;
        for (candidate, tenant) in &self.by_key_hash {
            let candidate = candidate.as_bytes();
            let matches = candidate.len() == needle.len() && bool::from(candidate.ct_eq(needle));
            if matches {
                found = Some(tenant.clone());
            }
        }
        found
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<Tenant>> {
        self.by_id.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ModelMapping;
    use std::collections::HashMap as Map;

    fn empty_router() -> Arc<ModelRouter> {
        Arc::new(ModelRouter::new(Map::new(), vec![], None, ModelMapping::default()))
    }

    #[test]
    fn single_tenant_mode_has_no_key_hashes() {
        let dir = TenantDirectory::single_tenant(empty_router());
        assert!(dir.is_single_tenant());
        assert!(dir.by_key_hash("anything").is_none());
        assert_eq!(dir.implicit_tenant().unwrap().id, DEFAULT_TENANT_ID);
    }

    #[test]
    fn multi_tenant_looks_up_by_key_hash() {
        let tenant = Tenant {
            id: "acme".to_string(),
            name: "Acme".to_string(),
            api_keys: vec![ApiKeyHash { hash: "deadbeef".to_string(), description: "prod".to_string() }],
            router: empty_router(),
            app_routers: no_app_routers(),
        };
        let dir = TenantDirectory::multi_tenant(vec![tenant]);
        assert!(!dir.is_single_tenant());
        assert_eq!(dir.by_key_hash("deadbeef").unwrap().id, "acme");
        assert!(dir.by_key_hash("unknown").is_none());
    }
}
