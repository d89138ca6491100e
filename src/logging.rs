//! `tracing` bootstrap (SPEC_FULL.md §2.1). Replaces the teacher's
//! hand-rolled file ring-buffer (`logger.rs`, a single-user CLI logger
//! with no request scope) with `tracing` + `tracing-subscriber`, the stack
//! this pack's own gateway-shaped repos use for exactly this reason.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global `tracing` subscriber from `RUST_LOG`, defaulting
/// to `info` when unset. Call once from `main` before serving begins.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

/// A per-request span carrying the request id (SPEC_FULL.md §2.1), entered
/// by `server::bootstrap`'s trace layer for the lifetime of the handler.
/// `tenant_id` is unknown at span-creation time (auth runs inside it) so it
/// starts empty and is filled in by `auth::authenticate` once the tenant is
/// resolved, via `tracing::Span::current().record(...)`.
pub fn request_span(request_id: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        request_id = %request_id,
        %method,
        %path,
        tenant_id = tracing::field::Empty,
    )
}
