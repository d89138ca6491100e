//! HTTP server assembly (spec.md §5, §6): turns a validated [`Config`] into
//! a mounted `axum::Router`, wires request-id propagation and bearer auth,
//! and exposes a graceful-shutdown future for `main.rs`. Grounded on
//! `other_examples/...poly-workshop-llm-gateway-rs` for the
//! `Router<Arc<AppState>>` + `tower_http::trace::TraceLayer` stack — no
//! teacher precedent, since `austinjan-km` is a library with no HTTP
//! surface at all (spec.md's "enrich from the rest of the pack" case).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderName;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::backends::{BackendConfig, Provider, RetryingProvider};
use crate::config::{
    AppConfig, Config, FallbackRuleConfig, ModelRoutingConfig, ProviderConfig, RewriteRuleConfig,
    RoutingConfig, StorageType, TenantConfig,
};
use crate::error::ApiError;
use crate::frontdoors::HandlerConfig;
use crate::registry::{register_builtins, BackendRegistry, FrontdoorRegistry};
use crate::router::{
    FallbackRule, MappingPredicate, ModelMapping, ModelRouter, RewriteRule, RoutingPredicate,
    RoutingRule,
};
use crate::store::{MemoryStore, SqliteStore, Store};
use crate::tenant::{ApiKeyHash, Tenant, TenantDirectory};

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_MAX_PREVIOUS_RESPONSE_DEPTH: u32 = 100;

/// Header carrying the per-request id (spec.md §5 "request-id
/// propagation"): generated at the edge if the client didn't send one,
/// echoed back on the response, and entered into the tracing span every
/// handler runs under (SPEC_FULL.md §2.1).
fn request_id_header() -> HeaderName {
    HeaderName::from_static("x-request-id")
}

/// Process-wide state handed to every handler via axum `State`. The two
/// registries and `tenants`/`store` are the only legitimate process-wide
/// mutables (spec.md §5, §9) and are read-only for the life of the process
/// once [`bootstrap`] returns.
pub struct AppState {
    pub tenants: TenantDirectory,
    pub backend_registry: BackendRegistry,
    pub frontdoor_registry: FrontdoorRegistry,
    pub store: Arc<dyn Store>,
}

fn build_store(config: &Config) -> Result<Arc<dyn Store>, ApiError> {
    match config.storage.kind {
        StorageType::None | StorageType::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageType::Sqlite => {
            // `connect` is async; bootstrap runs inside a tokio runtime
            // already (`main.rs`), so resolve it with a blocking wait
            // rather than threading async through every caller of
            // `bootstrap` (spec.md §6 `storage.sqlite.path`).
            let path = config
                .storage
                .sqlite
                .as_ref()
                .map(|s| s.path.clone())
                .ok_or_else(|| ApiError::server("storage.type = sqlite requires storage.sqlite.path"))?;
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(SqliteStore::connect(&path))
            })
            .map(|store| Arc::new(store) as Arc<dyn Store>)
        }
    }
}

fn build_backend(
    registry: &BackendRegistry,
    provider: &ProviderConfig,
) -> Result<Arc<dyn Provider>, ApiError> {
    let api_key = provider.api_key.clone().unwrap_or_default();
    let mut backend_config = BackendConfig::new(provider.name.clone(), api_key);
    backend_config.base_url = provider.base_url.clone();
    backend_config.supports_responses = provider.supports_responses;
    backend_config.max_retries = DEFAULT_MAX_RETRIES;

    let max_retries = backend_config.max_retries;
    let built = registry
        .build(&provider.kind, backend_config)
        .map_err(ApiError::server)?;
    Ok(Arc::new(RetryingProvider::new(built, max_retries)))
}

/// Build the backend-name → `Provider` map for one set of `providers[]`
/// (either the top-level list in single-tenant mode, or one tenant's own
/// list), each wrapped in the overload retry/backoff contract (spec.md
/// §4.2).
fn build_backend_map(
    registry: &BackendRegistry,
    providers: &[ProviderConfig],
) -> Result<HashMap<String, Arc<dyn Provider>>, ApiError> {
    let mut map = HashMap::new();
    for provider in providers {
        map.insert(provider.name.clone(), build_backend(registry, provider)?);
    }
    Ok(map)
}

fn routing_rules(routing: &RoutingConfig) -> Result<(Vec<RoutingRule>, Option<String>), ApiError> {
    let mut rules = Vec::with_capacity(routing.rules.len());
    for rule in &routing.rules {
        let predicate = match (&rule.model_exact, &rule.model_prefix) {
            (Some(exact), _) => RoutingPredicate::ModelExact(exact.clone()),
            (None, Some(prefix)) => RoutingPredicate::ModelPrefix(prefix.clone()),
            (None, None) => {
                return Err(ApiError::server(
                    "routing rule must set model_exact or model_prefix",
                ))
            }
        };
        rules.push(RoutingRule {
            predicate,
            backend: rule.provider.clone(),
        });
    }
    Ok((rules, routing.default_provider.clone()))
}

fn rewrite_rule(rule: &RewriteRuleConfig) -> Result<RewriteRule, ApiError> {
    let predicate = match (&rule.model_exact, &rule.model_prefix) {
        (Some(exact), _) => MappingPredicate::Exact(exact.clone()),
        (None, Some(prefix)) => MappingPredicate::Prefix(prefix.clone()),
        (None, None) => {
            return Err(ApiError::server(
                "model_routing rewrite must set model_exact or model_prefix",
            ))
        }
    };
    Ok(RewriteRule {
        predicate,
        backend: rule.provider.clone(),
        model: rule.model.clone(),
        rewrite_response_model: rule.rewrite_response_model,
    })
}

fn fallback_rule(rule: &FallbackRuleConfig) -> FallbackRule {
    FallbackRule {
        backend: rule.provider.clone(),
        model: rule.model.clone(),
        rewrite_response_model: rule.rewrite_response_model,
    }
}

fn model_mapping(model_routing: &ModelRoutingConfig) -> Result<ModelMapping, ApiError> {
    let rewrites = model_routing
        .rewrites
        .iter()
        .map(rewrite_rule)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ModelMapping {
        rewrites,
        prefix_providers: model_routing.prefix_providers.iter().cloned().collect::<HashSet<_>>(),
        fallback: model_routing.fallback.as_ref().map(fallback_rule),
    })
}

/// Build one app's `ModelRouter` for one tenant: that tenant's own backend
/// map, that tenant's routing table as the shared fallback, and the app's
/// own `model_routing` as the mapping layer that gets first refusal
/// (spec.md §4.3, DESIGN.md Open Question 1). `app.provider`, when set,
/// becomes this router's default backend, overriding the tenant-wide
/// default for requests the mapping layer doesn't otherwise touch.
fn build_app_router(
    backends: HashMap<String, Arc<dyn Provider>>,
    tenant_routing: &RoutingConfig,
    app: &AppConfig,
) -> Result<ModelRouter, ApiError> {
    let (rules, tenant_default) = routing_rules(tenant_routing)?;
    let default_backend = app.provider.clone().or(tenant_default);
    let mapping = model_mapping(&app.model_routing)?;
    Ok(ModelRouter::new(backends, rules, default_backend, mapping))
}

/// Build the tenant-wide default router (equivalent to `build_app_router`
/// with an empty mapping layer) used by any app mount this tenant has no
/// override for, and by a tenant with zero configured apps at all.
fn build_default_router(
    backends: HashMap<String, Arc<dyn Provider>>,
    routing: &RoutingConfig,
) -> Result<ModelRouter, ApiError> {
    let (rules, default_backend) = routing_rules(routing)?;
    Ok(ModelRouter::new(backends, rules, default_backend, ModelMapping::default()))
}

/// Build one tenant: its own backend map and default router from
/// `tenant_backends`/`tenant_routing`, plus one app-router override per
/// entry in the shared, top-level `apps[]` list (spec.md §6: `apps[]` is
/// mounted once globally; which backends an app resolves to depends on
/// which tenant authenticated the request).
fn build_tenant_with_apps(
    id: String,
    name: String,
    api_keys: Vec<ApiKeyHash>,
    tenant_backends: &HashMap<String, Arc<dyn Provider>>,
    tenant_routing: &RoutingConfig,
    apps: &[AppConfig],
) -> Result<Tenant, ApiError> {
    let router = Arc::new(build_default_router(tenant_backends.clone(), tenant_routing)?);
    let mut app_routers = HashMap::with_capacity(apps.len());
    for app in apps {
        let app_router = build_app_router(tenant_backends.clone(), tenant_routing, app)?;
        app_routers.insert(app.name.clone(), Arc::new(app_router));
    }
    Ok(Tenant {
        id,
        name,
        api_keys,
        router,
        app_routers,
    })
}

fn build_tenant(
    backend_registry: &BackendRegistry,
    tenant_config: &TenantConfig,
    apps: &[AppConfig],
) -> Result<Tenant, ApiError> {
    let backends = build_backend_map(backend_registry, &tenant_config.providers)?;
    let api_keys = tenant_config
        .api_keys
        .iter()
        .map(|k| ApiKeyHash {
            hash: k.key_hash.clone(),
            description: k.description.clone(),
        })
        .collect();
    build_tenant_with_apps(
        tenant_config.id.clone(),
        tenant_config.name.clone(),
        api_keys,
        &backends,
        &tenant_config.routing,
        apps,
    )
}

/// Scope the request's authenticated tenant down to one app's own router
/// (spec.md §4.4), re-inserting it over the tenant-wide extension the auth
/// middleware attached. Resolved per request (not baked in at mount time)
/// because in multi-tenant mode the same app path serves every tenant, each
/// with its own backends — `app_name` identifies which of the tenant's
/// `app_routers` entries applies. Keeps the frontdoor handlers (which read
/// `Extension<Arc<Tenant>>` unconditionally) oblivious to per-app routing.
async fn scope_tenant_to_app(
    State(app_name): State<Arc<str>>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(tenant) = request.extensions().get::<Arc<Tenant>>().cloned() {
        let scoped = Arc::new(Tenant {
            id: tenant.id.clone(),
            name: tenant.name.clone(),
            api_keys: tenant.api_keys.clone(),
            router: tenant.router_for_app(&app_name),
            app_routers: HashMap::new(),
        });
        request.extensions_mut().insert(scoped);
    }
    next.run(request).await
}

/// Mount every configured app's frontdoor under its `path` (spec.md §4.4),
/// scoped per request to the authenticated tenant's own router for that
/// app via [`scope_tenant_to_app`].
fn mount_apps(
    mut router: Router<Arc<AppState>>,
    frontdoor_registry: &FrontdoorRegistry,
    store: Arc<dyn Store>,
    apps: &[AppConfig],
    providers: &[ProviderConfig],
) -> Result<Router<Arc<AppState>>, ApiError> {
    let providers_by_name = crate::config::providers_by_name(providers);
    for app in apps {
        let factory = frontdoor_registry.get(&app.frontdoor).map_err(ApiError::server)?;

        // spec.md §6 `responses_thread_key_path` lives on the app's bound
        // provider; resolved against the top-level `providers[]` list since
        // `apps[]` is mounted once globally (DESIGN.md Open Question 2).
        let thread_key_path = app
            .provider
            .as_deref()
            .and_then(|name| providers_by_name.get(name))
            .and_then(|p| p.responses_thread_key_path.clone());

        let handler_config = HandlerConfig {
            store: store.clone(),
            app_name: app.name.clone(),
            base_path: app.path.clone(),
            models: app.models.clone(),
            max_previous_response_depth: DEFAULT_MAX_PREVIOUS_RESPONSE_DEPTH,
            thread_key_path,
            force_store: app.force_store,
        };

        let app_name: Arc<str> = Arc::from(app.name.as_str());
        let nested = factory
            .build(handler_config)
            .route_layer(middleware::from_fn_with_state(app_name, scope_tenant_to_app));

        router = router.nest(&app.path, nested);
    }
    Ok(router)
}

/// Turn a validated [`Config`] into process-wide [`AppState`] and a fully
/// mounted `axum::Router`. Single-tenant mode (`config.tenants` empty)
/// builds one implicit `"default"` tenant from the top-level
/// `providers[]`/`routing`; multi-tenant mode builds one `Tenant` (with its
/// own backends/routing) per `tenants[]` entry. Either way `apps[]` is
/// mounted exactly once, globally — which tenant's backends an app request
/// resolves against is decided per request by [`auth::authenticate`]
/// (spec.md §4.6, §6).
pub fn bootstrap(config: &Config) -> Result<(Arc<AppState>, Router), ApiError> {
    let backend_registry = BackendRegistry::new();
    let frontdoor_registry = FrontdoorRegistry::new();
    register_builtins(&backend_registry, &frontdoor_registry).map_err(ApiError::server)?;

    let store = build_store(config)?;

    let tenants = if config.tenants.is_empty() {
        let backends = build_backend_map(&backend_registry, &config.providers)?;
        let tenant = build_tenant_with_apps(
            crate::tenant::DEFAULT_TENANT_ID.to_string(),
            "default".to_string(),
            Vec::new(),
            &backends,
            &config.routing,
            &config.apps,
        )?;
        TenantDirectory::single_tenant_with_apps(tenant.router.clone(), tenant.app_routers)
    } else {
        let mut built = Vec::with_capacity(config.tenants.len());
        for tenant_config in &config.tenants {
            built.push(build_tenant(&backend_registry, tenant_config, &config.apps)?);
        }
        TenantDirectory::multi_tenant(built)
    };

    let router: Router<Arc<AppState>> = mount_apps(
        Router::new(),
        &frontdoor_registry,
        store.clone(),
        &config.apps,
        &config.providers,
    )?;

    let state = Arc::new(AppState {
        tenants,
        backend_registry,
        frontdoor_registry,
        store,
    });

    let request_id_header = request_id_header();
    let span_header = request_id_header.clone();

    // spec.md §5/§6 "request-id propagation": assign a UUID if the client
    // didn't send one, carry it through the request's tracing span, and
    // echo it back on the response (SPEC_FULL.md §2.1's per-request span).
    let observability = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id_header.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http().make_span_with(move |request: &Request| {
            let request_id = request
                .headers()
                .get(&span_header)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            crate::logging::request_span(&request_id, request.method().as_str(), request.uri().path())
        }))
        .layer(PropagateRequestIdLayer::new(request_id_header));

    let router = router
        .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate))
        .layer(observability)
        .with_state(state.clone());

    Ok((state, router))
}

/// Waits for SIGINT or SIGTERM (spec.md §6 "Signals SIGINT/SIGTERM trigger
/// graceful shutdown").
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
