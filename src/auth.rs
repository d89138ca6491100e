//! Bearer-token auth (spec.md §4.6): extract `Authorization: Bearer <token>`
//! case-insensitively, SHA-256 hash it, look the hash up across all
//! tenants. Single-tenant mode (no `tenants[]` configured) bypasses auth
//! entirely and attaches the implicit `"default"` tenant to every request.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};

use crate::server::AppState;
use crate::tenant::Tenant;

pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Extract the bearer token from an `Authorization` header value, matching
/// the `Bearer ` prefix case-insensitively (spec.md §4.6).
fn extract_bearer(header_value: &str) -> Option<&str> {
    let prefix_len = "bearer ".len();
    if !header_value.is_char_boundary(prefix_len) {
        return None;
    }
    if header_value.len() > prefix_len && header_value[..prefix_len].eq_ignore_ascii_case("bearer ") {
        Some(header_value[prefix_len..].trim())
    } else {
        None
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({
            "error": { "type": "authentication_error", "message": message }
        })),
    )
        .into_response()
}

/// axum middleware: attaches the resolved `Arc<Tenant>` as a request
/// extension. In single-tenant mode every request is treated as the
/// implicit `"default"` tenant with no header required.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.tenants.is_single_tenant() {
        let tenant = state.tenants.implicit_tenant().expect("single-tenant mode always has an implicit tenant");
        tracing::Span::current().record("tenant_id", tenant.id.as_str());
        request.extensions_mut().insert(tenant);
        return next.run(request).await;
    }

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = match header.and_then(extract_bearer) {
        Some(t) if !t.is_empty() => t,
        _ => return unauthorized("missing or malformed Authorization header"),
    };

    let hash = hash_token(token);
    let tenant = match state.tenants.by_key_hash(&hash) {
        Some(t) => t,
        None => return unauthorized("invalid api key"),
    };

    tracing::Span::current().record("tenant_id", tenant.id.as_str());
    request.extensions_mut().insert(tenant);
    next.run(request).await
}

/// Pull the authenticated tenant out of request extensions. Every handler
/// downstream of `authenticate` can rely on this being present.
pub fn current_tenant(request: &Request) -> Option<Arc<Tenant>> {
    request.extensions().get::<Arc<Tenant>>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_is_case_insensitive() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("BEARER abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Basic abc123"), None);
        assert_eq!(extract_bearer("Bearer "), Some(""));
    }

    #[test]
    fn extract_bearer_does_not_panic_on_a_multi_byte_char_straddling_the_prefix() {
        assert_eq!(extract_bearer("123456\u{20ac}rest"), None);
    }

    #[test]
    fn hash_token_is_stable_sha256_hex() {
        let hash = hash_token("sk-test");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("sk-test"));
        assert_ne!(hash, hash_token("sk-other"));
    }
}
