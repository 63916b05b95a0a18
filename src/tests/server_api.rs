//! HTTP surface tests: routing, envelopes, and the shared-key gate,
//! driven through the router with `tower::ServiceExt`.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::server::{build_router, AppState};
use crate::tests::common::fixtures::{file_backend, TestBackend};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("response is JSON")
}

fn app(backend: &TestBackend) -> axum::Router {
    build_router(AppState::new(
        backend.settings.clone(),
        backend.storage.clone(),
    ))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn test_health() {
    let backend = file_backend().await;
    let response = app(&backend).oneshot(get("/health")).await.expect("route");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_full_turn_over_http() {
    let backend = file_backend().await;
    let router = app(&backend);

    // Create a session from the template.
    let response = router
        .clone()
        .oneshot(post("/sessions", json!({"slug": "web-run"})))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::OK);

    // Claim the lock.
    let response = router
        .clone()
        .oneshot(post(
            "/sessions/web-run/lock/claim",
            json!({"owner": "alice", "ttl": 300}),
        ))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::OK);

    // Preview.
    let response = router
        .clone()
        .oneshot(post(
            "/sessions/web-run/turn/preview",
            json!({
                "response": "I look around.",
                "state_patch": {"location": "camp"},
                "transcript_entry": "look",
                "dice_expressions": [],
                "lock_owner": "alice",
            }),
        ))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::OK);
    let preview = body_json(response).await;
    assert_eq!(preview["entropy_plan"]["usage"], json!("0 rolls"));
    assert_eq!(preview["diffs"][0]["path"], json!("location"));
    let preview_id = preview["id"].as_str().expect("preview id").to_string();

    // Commit.
    let response = router
        .clone()
        .oneshot(post(
            "/sessions/web-run/turn/commit",
            json!({"preview_id": preview_id, "lock_owner": "alice"}),
        ))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::OK);
    let commit = body_json(response).await;
    assert_eq!(commit["state"]["turn"], json!(1));
    assert_eq!(commit["state"]["location"], json!("camp"));
    assert_eq!(commit["log_indices"]["transcript"], json!(1));

    // Transcript readback.
    let response = router
        .clone()
        .oneshot(get("/sessions/web-run/transcript?tail=1"))
        .await
        .expect("route");
    let transcript = body_json(response).await;
    assert_eq!(transcript["items"][0]["text"], json!("look"));

    // An unknown preview id is a 404 envelope.
    let response = router
        .clone()
        .oneshot(post(
            "/sessions/web-run/turn/commit",
            json!({"preview_id": "gone", "lock_owner": "alice"}),
        ))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["kind"], json!("PreviewMissing"));
}

#[tokio::test]
async fn test_error_envelope_shape() {
    let backend = file_backend().await;
    let response = app(&backend)
        .oneshot(get("/sessions/ghost/state"))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["kind"], json!("SessionMissing"));
    assert!(envelope["error"]["message"].is_string());
}

#[tokio::test]
async fn test_lock_conflict_carries_owner_details() {
    let backend = file_backend().await;
    let router = app(&backend);
    router
        .clone()
        .oneshot(post("/sessions", json!({"slug": "held"})))
        .await
        .expect("route");
    router
        .clone()
        .oneshot(post(
            "/sessions/held/lock/claim",
            json!({"owner": "alice"}),
        ))
        .await
        .expect("route");

    let response = router
        .clone()
        .oneshot(post("/sessions/held/lock/claim", json!({"owner": "bob"})))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["kind"], json!("LockHeld"));
    assert_eq!(envelope["error"]["details"]["owner"], json!("alice"));
}

#[tokio::test]
async fn test_session_diff_is_reserved() {
    let backend = file_backend().await;
    let response = app(&backend)
        .oneshot(get("/sessions/any/diff"))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["kind"], json!("Unavailable"));
}

#[tokio::test]
async fn test_api_key_gates_writes_only() {
    let mut backend = file_backend().await;
    backend.settings.api_key = Some("sekrit".into());
    let router = app(&backend);

    // Reads stay open.
    let response = router
        .clone()
        .oneshot(get("/sessions"))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::OK);

    // Writes without the key are rejected.
    let response = router
        .clone()
        .oneshot(post("/sessions", json!({"slug": "locked-out"})))
        .await
        .expect("route");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Writes with the key pass.
    let mut request = post("/sessions", json!({"slug": "let-in"}));
    request
        .headers_mut()
        .insert("x-api-key", "sekrit".parse().expect("header"));
    let response = router.clone().oneshot(request).await.expect("route");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_doc_write_requires_lock() {
    let backend = file_backend().await;
    let router = app(&backend);
    router
        .clone()
        .oneshot(post("/sessions", json!({"slug": "unheld"})))
        .await
        .expect("route");

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/sessions/unheld/docs/mood")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"tone": "grim"}).to_string()))
        .expect("request");
    let response = router.clone().oneshot(request).await.expect("route");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let envelope = body_json(response).await;
    assert_eq!(envelope["error"]["kind"], json!("LockRequired"));
}

#[tokio::test]
async fn test_doc_dry_run_does_not_persist() {
    let backend = file_backend().await;
    let router = app(&backend);
    router
        .clone()
        .oneshot(post("/sessions", json!({"slug": "moody"})))
        .await
        .expect("route");
    router
        .clone()
        .oneshot(post(
            "/sessions/moody/lock/claim",
            json!({"owner": "alice"}),
        ))
        .await
        .expect("route");

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/sessions/moody/docs/mood?dry_run=true")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"tone": "grim"}).to_string()))
        .expect("request");
    let response = router.clone().oneshot(request).await.expect("route");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["dry_run"], json!(true));
    assert_eq!(body["diffs"][0]["path"], json!("tone"));

    // Nothing was written.
    let response = router
        .clone()
        .oneshot(get("/sessions/moody/docs/mood"))
        .await
        .expect("route");
    assert_eq!(body_json(response).await, json!({}));
}
