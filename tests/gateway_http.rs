//! End-to-end tests against the assembled `axum::Router` (spec.md §5, §6):
//! config in, HTTP request in via `tower::ServiceExt::oneshot`, response
//! envelope out. No network calls — every config here either avoids
//! touching a backend (static `models` list, an unroutable model) or
//! exercises auth/mounting, which don't need one.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use polygate::config::load_str;
use polygate::server::bootstrap;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn single_tenant_app_serves_static_model_list() {
    let config = load_str(
        r#"
apps:
  - name: chat
    frontdoor: openai-chat
    path: /proxy
    models: ["gpt-4o", "gpt-4o-mini"]
"#,
    )
    .unwrap();
    let (_state, router) = bootstrap(&config).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/proxy/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let ids: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini"]);
}

#[tokio::test]
async fn unrouted_model_is_invalid_request_not_server_error() {
    let config = load_str(
        r#"
apps:
  - name: chat
    frontdoor: openai-chat
    path: /proxy
"#,
    )
    .unwrap();
    let (_state, router) = bootstrap(&config).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/proxy/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "model": "mystery-model",
                        "messages": [{"role": "user", "content": "hi"}],
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn multi_tenant_mode_rejects_missing_and_wrong_bearer_token() {
    let config = load_str(
        r#"
apps:
  - name: chat
    frontdoor: openai-chat
    path: /proxy
tenants:
  - id: acme
    name: Acme
    api_keys:
      - key_hash: "2c70e12b7a0646f92279f427c7b38e7334d8e5389cff167a1dc30e73f826b683"
        description: prod
"#,
    )
    .unwrap();
    let (_state, router) = bootstrap(&config).unwrap();

    let no_header = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/proxy/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(no_header.status(), StatusCode::UNAUTHORIZED);

    let wrong_token = router
        .oneshot(
            Request::builder()
                .uri("/proxy/v1/models")
                .header("authorization", "Bearer not-the-right-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong_token.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn multi_tenant_valid_token_is_authenticated_and_scoped_to_its_own_tenant() {
    let token = "sk-acme-prod-key";
    let hash = polygate::auth::hash_token(token);

    let config = load_str(&format!(
        r#"
apps:
  - name: chat
    frontdoor: openai-chat
    path: /proxy
tenants:
  - id: acme
    name: Acme
    api_keys:
      - key_hash: "{hash}"
        description: prod
"#
    ))
    .unwrap();
    let (_state, router) = bootstrap(&config).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/proxy/v1/models")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_backend_type_fails_bootstrap_with_an_actionable_message() {
    let config = load_str(
        r#"
providers:
  - name: mystery
    type: not-a-real-backend
routing:
  default_provider: mystery
"#,
    )
    .unwrap();

    let err = bootstrap(&config).unwrap_err();
    assert!(err.message.contains("not-a-real-backend"));
    assert!(err.message.contains("known types"));
}

/// A minimal upstream stand-in: replies to `POST /v1/chat/completions`
/// with a canned SSE stream carrying a role announcement, one content
/// delta, a `finish_reason`, and a trailing `stream_options` usage chunk —
/// enough to drive the full frontdoor → backend → encoder round trip
/// without a real network call.
async fn spawn_fake_openai_upstream() -> String {
    async fn chat_completions() -> axum::response::Response {
        let chunks = [
            serde_json::json!({"choices": [{"delta": {"role": "assistant"}}]}),
            serde_json::json!({"choices": [{"delta": {"content": "hi"}}]}),
            serde_json::json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
            serde_json::json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 1}}),
        ];
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");

        axum::response::Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from(body))
            .unwrap()
    }

    let app = axum::Router::new().route(
        "/v1/chat/completions",
        axum::routing::post(chat_completions),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn streaming_chat_completion_carries_real_usage_to_the_client() {
    let base_url = spawn_fake_openai_upstream().await;
    let config = load_str(&format!(
        r#"
providers:
  - name: fake-openai
    type: openai-chat
    base_url: "{base_url}"
    api_key: "test-key"
routing:
  default_provider: fake-openai
apps:
  - name: chat
    frontdoor: openai-chat
    path: /proxy
"#
    ))
    .unwrap();
    let (_state, router) = bootstrap(&config).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/proxy/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "model": "gpt-4o",
                        "messages": [{"role": "user", "content": "hi"}],
                        "stream": true,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(bytes.to_vec()).unwrap();

    let usage_line = body
        .lines()
        .find(|l| l.starts_with("data:") && l.contains("\"usage\""))
        .expect("a usage-carrying data frame");
    let usage_chunk: serde_json::Value =
        serde_json::from_str(usage_line.trim_start_matches("data:").trim()).unwrap();
    assert_eq!(usage_chunk["usage"]["prompt_tokens"], 3);
    assert_eq!(usage_chunk["usage"]["completion_tokens"], 1);
    assert!(body.contains("[DONE]"));
}

#[tokio::test]
async fn anthropic_frontdoor_mounts_alongside_openai_chat_under_different_paths() {
    let config = load_str(
        r#"
apps:
  - name: chat
    frontdoor: openai-chat
    path: /openai
    models: ["gpt-4o"]
  - name: messages
    frontdoor: anthropic-messages
    path: /anthropic
    models: ["claude-3-5-sonnet"]
"#,
    )
    .unwrap();
    let (_state, router) = bootstrap(&config).unwrap();

    let openai_models = router
        .clone()
        .oneshot(Request::builder().uri("/openai/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(openai_models.status(), StatusCode::OK);

    let anthropic_models = router
        .oneshot(Request::builder().uri("/anthropic/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(anthropic_models.status(), StatusCode::OK);
    let json = body_json(anthropic_models).await;
    assert_eq!(json["data"][0]["id"], "claude-3-5-sonnet");
}
