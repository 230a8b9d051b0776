mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::Rig;
use howdy_edge::http::{router, HttpState, DEVICE_TYPE};
use howdy_edge::stats::StatsHub;
use howdy_edge::{ConversationState, EdgeConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceExt;

fn http_state(rig: &Rig) -> Arc<HttpState> {
    let config = EdgeConfig::default();
    Arc::new(HttpState::new(
        config.device.clone(),
        config.udp.server_port,
        config.control.port,
        rig.handle.clone(),
        Arc::new(StatsHub::new(config.device.device_id.clone())),
    ))
}

async fn call(state: &Arc<HttpState>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_state_push_reaches_processor() {
    let mut rig = Rig::new(EdgeConfig::default());
    let state = http_state(&rig);

    let (status, body) = call(&state, Method::POST, "/state", Some(json!({"state": "listening"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    assert_eq!(rig.silence(1), ConversationState::Listening);
    assert_eq!(state.counters().state_requests.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_unknown_state_is_ignored() {
    let mut rig = Rig::new(EdgeConfig::default());
    let state = http_state(&rig);

    let (status, body) = call(&state, Method::POST, "/state", Some(json!({"state": "dancing"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    assert_eq!(rig.silence(1), ConversationState::Waiting);
}

#[tokio::test]
async fn test_speak_push() {
    let mut rig = Rig::new(EdgeConfig::default());
    let state = http_state(&rig);

    let (status, body) = call(
        &state,
        Method::POST,
        "/speak",
        Some(json!({"text": "Howdy partner"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (_, body) = call(&state, Method::POST, "/speak", Some(json!({"state": "yodel"}))).await;
    assert_eq!(body["status"], "ignored");

    // Speaking from the server alone does not start playback.
    assert_eq!(rig.silence(1), ConversationState::Waiting);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let rig = Rig::new(EdgeConfig::default());
    let state = http_state(&rig);

    let (status, _) = call(&state, Method::POST, "/state", Some(json!({"text": "no state"}))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_status_and_discover_views() {
    let rig = Rig::new(EdgeConfig::default());
    let state = http_state(&rig);

    let (status, body) = call(&state, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "howdy-edge-01");
    assert_eq!(body["device_type"], DEVICE_TYPE);
    assert_eq!(body["state"], "waiting");
    assert_eq!(body["room"], "living_room");
    assert!(body["server"].is_null());
    assert!(body["capabilities"]
        .as_array()
        .unwrap()
        .contains(&json!("wake_word")));

    let (status, body) = call(&state, Method::GET, "/discover", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["audio_port"], 8000);
    assert_eq!(body["control_port"], 8001);
    assert!(body["http_port"].is_null());
}

#[tokio::test]
async fn test_health_and_stats() {
    let rig = Rig::new(EdgeConfig::default());
    let state = http_state(&rig);

    let (status, body) = call(&state, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["capture"]["frames_captured"], 0);

    let (status, body) = call(&state, Method::GET, "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "howdy-edge-01");
    assert_eq!(body["state"], "waiting");
}

#[tokio::test]
async fn test_discover_post_without_session() {
    let rig = Rig::new(EdgeConfig::default());
    let state = http_state(&rig);

    let (status, body) = call(
        &state,
        Method::POST,
        "/discover",
        Some(json!({"server_ip": "192.168.1.20", "server_port": 8000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}
