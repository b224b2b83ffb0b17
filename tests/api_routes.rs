mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chat_orchestrator::api::{build_router, AppState};
use chat_orchestrator::auth::TokenVerifier;
use common::{FixedSynthesizer, Harness, HarnessOptions};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    harness: Harness,
    verifier: Arc<TokenVerifier>,
    router: Router,
}

impl TestApp {
    fn new(harness: Harness) -> Self {
        let verifier = Arc::new(TokenVerifier::new(
            SecretString::new("test-secret".to_string()),
            60,
        ));
        let router = build_router(
            AppState {
                orchestrator: harness.orchestrator.clone(),
                verifier: verifier.clone(),
            },
            1024 * 1024,
        );
        Self {
            harness,
            verifier,
            router,
        }
    }

    fn token(&self, user_id: i64) -> String {
        self.verifier.issue(user_id).unwrap()
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }
}

fn json_request(method: Method, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new(Harness::new());

    let (status, body) = app.call(get("/health", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn test_requests_without_valid_token_are_rejected() {
    let app = TestApp::new(Harness::new());

    let (status, body) = app.call(get("/api/conversations", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = app
        .call(get("/api/conversations", Some("1.99999999999.deadbeef")))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_list_and_chat() {
    let app = TestApp::new(Harness::new());
    let token = app.token(7);
    app.harness.summary.push_completion("Greetings");

    let (status, created) = app
        .call(json_request(Method::POST, "/api/conversations", Some(&token), json!({})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["title"], "New conversation");
    let id = created["id"].as_i64().unwrap();

    let (status, exchange) = app
        .call(json_request(
            Method::POST,
            &format!("/api/chat/{}/messages", id),
            Some(&token),
            json!({ "content": "hi" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(exchange["message"]["content"], "hi");
    assert_eq!(exchange["message"]["role"], "user");
    assert_eq!(exchange["assistant_message"]["content"], "Hello there");

    let (status, messages) = app
        .call(get(&format!("/api/chat/{}/messages", id), Some(&token)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().unwrap().len(), 2);

    let (status, listed) = app.call(get("/api/conversations", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_conversation_lifecycle_routes() {
    let app = TestApp::new(Harness::new());
    let token = app.token(1);
    let conversation = app.harness.conversation(1).await;
    let spare = app.harness.conversation(1).await;
    app.harness.seed(conversation.id, &["hi", "hello"]).await;
    let uri = format!("/api/conversations/{}", conversation.id);

    let (status, fetched) = app.call(get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["title"], "Existing chat");

    let (status, renamed) = app
        .call(json_request(Method::PUT, &uri, Some(&token), json!({ "title": "Greetings" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["title"], "Greetings");

    let (status, body) = app
        .call(json_request(Method::PUT, &uri, Some(&token), json!({ "title": " " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, exported) = app.call(get(&format!("{}/export", uri), Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(exported["messages"].as_array().unwrap().len(), 2);
    assert_eq!(exported["messages"][1]["role"], "assistant");

    let (status, exported) = app
        .call(get(&format!("{}/export?format=markdown", uri), Some(&token)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(exported["filename"], "Greetings.md");
    assert!(exported["content"].as_str().unwrap().starts_with("# Greetings"));

    // Someone else cannot delete it
    let (status, _) = app
        .call(json_request(Method::DELETE, &uri, Some(&app.token(2)), json!({})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call(json_request(Method::DELETE, &uri, Some(&token), json!({})))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.call(get(&uri, Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(app.harness.turns(conversation.id).await.is_empty());

    let (status, body) = app
        .call(json_request(
            Method::DELETE,
            "/api/conversations/batch",
            Some(&token),
            json!({ "ids": [conversation.id, spare.id] }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);

    let (_, listed) = app.call(get("/api/conversations", Some(&token))).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_summarize_alias_matches_digest() {
    let app = TestApp::new(Harness::new());
    let conversation = app.harness.conversation(1).await;
    app.harness.seed(conversation.id, &["plan a trip", "sure"]).await;
    app.harness.summary.push_completion("Trip planning");
    app.harness.summary.push_completion("travel");

    let (status, body) = app
        .call(json_request(
            Method::POST,
            &format!("/api/conversations/{}/summarize", conversation.id),
            Some(&app.token(1)),
            json!({}),
        ))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"], "Trip planning");
    assert_eq!(body["tags"], json!(["travel"]));
}

#[tokio::test]
async fn test_blank_message_is_a_validation_error() {
    let app = TestApp::new(Harness::new());
    let conversation = app.harness.conversation(1).await;
    let token = app.token(1);

    let (status, body) = app
        .call(json_request(
            Method::POST,
            &format!("/api/chat/{}/messages", conversation.id),
            Some(&token),
            json!({ "content": "   " }),
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_backend_failure_maps_to_bad_gateway() {
    let app = TestApp::new(Harness::new());
    let conversation = app.harness.conversation(1).await;
    app.harness.chat.push_stream(common::StreamScript::Refuse);

    let (status, body) = app
        .call(json_request(
            Method::POST,
            &format!("/api/chat/{}/messages", conversation.id),
            Some(&app.token(1)),
            json!({ "content": "hello" }),
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["message"], "Failed to get AI response");
}

#[tokio::test]
async fn test_foreign_conversation_looks_missing() {
    let app = TestApp::new(Harness::new());
    let conversation = app.harness.conversation(1).await;
    let intruder = app.token(2);

    let (status, body) = app
        .call(get(&format!("/api/chat/{}/messages", conversation.id), Some(&intruder)))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = app
        .call(get(&format!("/api/chat/{}/messages", 9999), Some(&intruder)))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.harness.store.reads(), 0);
}

#[tokio::test]
async fn test_socket_is_refused_before_upgrade() {
    let app = TestApp::new(Harness::new());
    let conversation = app.harness.conversation(1).await;

    let (status, _) = app
        .call(get(&format!("/api/chat/ws/{}", conversation.id), None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(get(
            &format!("/api/chat/ws/{}?token=not-a-token", conversation.id),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(get(
            &format!("/api/voice/ws/{}?token={}", conversation.id, app.token(2)),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Rejected sockets never read history
    assert_eq!(app.harness.store.reads(), 0);
    assert_eq!(app.harness.orchestrator.registry().total_sessions(), 0);
}

#[tokio::test]
async fn test_owner_without_upgrade_headers_gets_client_error() {
    let app = TestApp::new(Harness::new());
    let conversation = app.harness.conversation(1).await;

    let (status, _) = app
        .call(get(
            &format!("/api/chat/ws/{}?token={}", conversation.id, app.token(1)),
            None,
        ))
        .await;

    assert!(status.is_client_error());
    assert_ne!(status, StatusCode::UNAUTHORIZED);
    assert_ne!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_speech_endpoints() {
    let app = TestApp::new(Harness::with_options(HarnessOptions {
        synthesizer: Some(Arc::new(FixedSynthesizer(true))),
        ..HarnessOptions::default()
    }));
    let token = app.token(1);

    let (status, body) = app
        .call(json_request(
            Method::POST,
            "/api/voice/tts",
            Some(&token),
            json!({ "text": "read this aloud" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["format"], "wav");
    assert_eq!(body["audio"], "UklGRmRhdGE=");

    // No transcriber configured
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/voice/stt")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::from(vec![1u8, 2, 3]))
        .unwrap();
    let (status, body) = app.call(request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "UNAVAILABLE");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/voice/stt")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.call(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let app = TestApp::new(Harness::new());

    let response = app
        .router
        .clone()
        .oneshot(get("/metrics", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("chat_"));
}
