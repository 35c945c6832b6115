//! Integration tests against an in-process fake of the Telegram Bot API (axum on a loopback port).

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use forwarder::channels::{InboundMessage, Payload, TelegramChannel};
use forwarder::delivery::{DeliveryOutcome, Outbound, RetryPolicy};
use forwarder::forwarder::{status, Forwarder, ForwarderOptions};
use forwarder::listener::{Upstream, UpstreamError};
use forwarder::routing::{ForwardMode, ForwardTarget, Router as TargetRouter};
use forwarder::store::{DeliveryStatus, Store};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "TEST";

#[derive(Clone, Default)]
struct FakeApi {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    updates: Arc<Mutex<Vec<Value>>>,
    send_responses: Arc<Mutex<VecDeque<(u16, Value)>>>,
}

impl FakeApi {
    fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, b)| b.clone())
            .collect()
    }

    fn respond_next(&self, status: u16, body: Value) {
        self.send_responses.lock().unwrap().push_back((status, body));
    }
}

async fn handle(
    State(api): State<FakeApi>,
    Path(method): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    api.calls.lock().unwrap().push((method.clone(), body.clone()));
    match method.as_str() {
        "getMe" => (
            StatusCode::OK,
            Json(json!({ "ok": true, "result": { "id": 77, "is_bot": true, "username": "fwd_bot" } })),
        ),
        "getUpdates" => {
            let offset = body.get("offset").and_then(|v| v.as_i64()).unwrap_or(i64::MIN);
            let updates: Vec<Value> = api
                .updates
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u["update_id"].as_i64().unwrap_or(0) >= offset)
                .cloned()
                .collect();
            if updates.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            (StatusCode::OK, Json(json!({ "ok": true, "result": updates })))
        }
        "forwardMessage" | "copyMessage" => {
            let next = api.send_responses.lock().unwrap().pop_front();
            match next {
                Some((status, body)) => (
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    Json(body),
                ),
                None => (
                    StatusCode::OK,
                    Json(json!({ "ok": true, "result": { "message_id": 1 } })),
                ),
            }
        }
        "sendMessage" if body["chat_id"] == json!("stalled") => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            (StatusCode::OK, Json(json!({ "ok": true, "result": { "message_id": 2 } })))
        }
        "sendMessage" => (
            StatusCode::OK,
            Json(json!({ "ok": true, "result": { "message_id": 2 } })),
        ),
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error_code": 404, "description": "Not Found" })),
        ),
    }
}

/// Start the fake API; returns its base URL.
async fn start_fake(api: FakeApi) -> String {
    let app = Router::new()
        .route(&format!("/bot{}/:method", TOKEN), post(handle).get(handle))
        .with_state(api);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake api");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn channel(base: &str) -> TelegramChannel {
    TelegramChannel::new(TOKEN)
        .with_api_base(base)
        .with_poll_timeout(0)
}

fn channel_post(update_id: i64, message_id: i64, text: &str) -> Value {
    json!({
        "update_id": update_id,
        "channel_post": {
            "message_id": message_id,
            "chat": { "id": -1001, "username": "news", "type": "channel" },
            "text": text
        }
    })
}

#[tokio::test]
async fn receive_maps_posts_and_reports_last_offset() {
    let api = FakeApi::default();
    api.updates.lock().unwrap().extend([
        channel_post(10, 1, "hello"),
        json!({ "update_id": 11, "my_chat_member": { "chat": { "id": -1001 } } }),
    ]);
    let base = start_fake(api.clone()).await;
    let tg = channel(&base);

    let batch = tg.receive(Some(9)).await.unwrap();
    assert_eq!(batch.last_offset, Some(11));
    assert_eq!(batch.messages.len(), 1);
    let m = &batch.messages[0];
    assert_eq!(m.id, "-1001:1");
    assert_eq!(m.origin_username.as_deref(), Some("news"));
    assert_eq!(m.payload.text.as_deref(), Some("hello"));

    let calls = api.calls_to("getUpdates");
    assert_eq!(calls[0]["offset"], json!(10));
    assert_eq!(calls[0]["allowed_updates"], json!(["message", "channel_post"]));
}

#[tokio::test]
async fn relay_classifies_api_responses() {
    let api = FakeApi::default();
    let base = start_fake(api.clone()).await;
    let tg = channel(&base);
    let m = InboundMessage::new(1, "-1001", 5, Payload::text("x"));
    let target = ForwardTarget::new("mirror", "-2002");

    assert_eq!(tg.send(&m, &target).await, DeliveryOutcome::Delivered);
    let fwd = api.calls_to("forwardMessage");
    assert_eq!(fwd[0]["chat_id"], json!("-2002"));
    assert_eq!(fwd[0]["from_chat_id"], json!("-1001"));
    assert_eq!(fwd[0]["message_id"], json!(5));

    api.respond_next(
        429,
        json!({ "ok": false, "error_code": 429, "description": "Too Many Requests", "parameters": { "retry_after": 3 } }),
    );
    match tg.send(&m, &target).await {
        DeliveryOutcome::TransientFailure { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(3)))
        }
        other => panic!("expected transient, got {:?}", other),
    }

    api.respond_next(502, json!({ "ok": false, "error_code": 502, "description": "Bad Gateway" }));
    assert!(matches!(
        tg.send(&m, &target).await,
        DeliveryOutcome::TransientFailure { .. }
    ));

    api.respond_next(
        400,
        json!({ "ok": false, "error_code": 400, "description": "Bad Request: message to forward not found" }),
    );
    assert!(matches!(
        tg.send(&m, &target).await,
        DeliveryOutcome::PermanentFailure { .. }
    ));

    let mut copy_target = target.clone();
    copy_target.mode = ForwardMode::Copy;
    assert_eq!(tg.send(&m, &copy_target).await, DeliveryOutcome::Delivered);
    assert_eq!(api.calls_to("copyMessage").len(), 1);
}

#[tokio::test]
async fn unreachable_api_is_transient() {
    let tg = channel("http://127.0.0.1:9");
    let m = InboundMessage::new(1, "-1001", 5, Payload::text("x"));
    assert!(matches!(
        tg.send(&m, &ForwardTarget::new("t", "-1")).await,
        DeliveryOutcome::TransientFailure { .. }
    ));
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let api = FakeApi::default();
    let base = start_fake(api).await;
    let good = channel(&base);
    let me = good.get_me().await.unwrap();
    assert_eq!(me.username.as_deref(), Some("fwd_bot"));

    let bad = TelegramChannel::new("WRONG").with_api_base(&base);
    assert!(matches!(bad.get_me().await, Err(UpstreamError::Unauthorized(_))));
}

#[tokio::test]
async fn channel_posts_are_forwarded_end_to_end() {
    let api = FakeApi::default();
    api.updates
        .lock()
        .unwrap()
        .extend([channel_post(20, 3, "first"), channel_post(21, 4, "second")]);
    let base = start_fake(api.clone()).await;
    let tg = Arc::new(channel(&base));
    let store = Arc::new(Store::open_in_memory().await.unwrap());

    let mut options = ForwarderOptions::new(TargetRouter::new(
        vec!["@news".to_string()],
        vec![ForwardTarget::new("mirror", "-2002")],
    ));
    options.retry = RetryPolicy {
        max_attempts: 3,
        base: Duration::from_millis(1),
        max: Duration::from_millis(5),
        jitter: Duration::ZERO,
    };
    options.listener_retry_delay = Duration::from_millis(10);
    let shutdown = CancellationToken::new();
    let forwarder = Forwarder::new(options, Arc::clone(&store), tg.clone(), tg);
    let handle = tokio::spawn(forwarder.run(shutdown.clone()));

    let status_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let status_url = format!("http://{}/stats", status_listener.local_addr().unwrap());
    tokio::spawn(status::serve(
        status_listener,
        Arc::clone(&store),
        shutdown.clone(),
    ));

    let client = reqwest::Client::new();
    let mut stats = Value::Null;
    for _ in 0..250 {
        if let Ok(resp) = client.get(&status_url).send().await {
            if resp.status().is_success() {
                stats = resp.json().await.expect("parse JSON");
                if stats["delivered"] == json!(2) && stats["checkpoint"] == json!(21) {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(stats["delivered"], json!(2), "stats: {}", stats);
    assert_eq!(stats["checkpoint"], json!(21));
    assert_eq!(api.calls_to("forwardMessage").len(), 2);
    let r = store.get_record("-1001:4", "mirror").await.unwrap().unwrap();
    assert_eq!(r.status, DeliveryStatus::Delivered);
    // Later polls confirm everything up to the last update.
    let polls = api.calls_to("getUpdates");
    assert!(polls.iter().any(|b| b["offset"] == json!(22)));
}

#[tokio::test]
async fn poll_posts_are_recorded_and_forwarded() {
    let api = FakeApi::default();
    api.updates.lock().unwrap().push(json!({
        "update_id": 30,
        "channel_post": {
            "message_id": 9,
            "chat": { "id": -1001, "username": "news", "type": "channel" },
            "poll": { "id": "p1", "question": "Lunch?", "options": [{ "text": "yes", "voter_count": 0 }] }
        }
    }));
    let base = start_fake(api.clone()).await;
    let tg = Arc::new(channel(&base));
    let store = Arc::new(Store::open_in_memory().await.unwrap());

    let mut options = ForwarderOptions::new(TargetRouter::new(
        vec!["@news".to_string()],
        vec![ForwardTarget::new("mirror", "-2002")],
    ));
    options.listener_retry_delay = Duration::from_millis(10);
    let shutdown = CancellationToken::new();
    let forwarder = Forwarder::new(options, Arc::clone(&store), tg.clone(), tg);
    let handle = tokio::spawn(forwarder.run(shutdown.clone()));

    let mut delivered = None;
    for _ in 0..250 {
        if let Some(r) = store.get_record("-1001:9", "mirror").await.unwrap() {
            if r.status == DeliveryStatus::Delivered {
                delivered = Some(r);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let r = delivered.expect("poll post delivered");
    assert_eq!(r.attempts, 1);
    let stored = store.get_message("-1001:9").await.unwrap().expect("message recorded");
    assert!(stored.payload.is_empty());
    let fwd = api.calls_to("forwardMessage");
    assert_eq!(fwd.len(), 1);
    assert_eq!(fwd[0]["message_id"], json!(9));
    assert_eq!(store.get_checkpoint().await.unwrap(), Some(30));
}

#[tokio::test]
async fn owner_notice_gives_up_on_a_stalled_api() {
    let api = FakeApi::default();
    let base = start_fake(api.clone()).await;
    let tg = channel(&base).with_request_timeout(Duration::from_millis(200));

    assert!(tg.notify("42", "hello").await.is_ok());
    let stalled = tokio::time::timeout(Duration::from_secs(5), tg.notify("stalled", "hello"))
        .await
        .expect("notice bounded by the request timeout");
    assert!(stalled.is_err());
    assert_eq!(api.calls_to("sendMessage").len(), 2);
}
