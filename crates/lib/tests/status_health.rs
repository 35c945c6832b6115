//! Integration test: start the status server on a free port, GET /, /stats and /failed.
//! Does not require Telegram.

use forwarder::channels::{InboundMessage, Payload};
use forwarder::forwarder::status;
use forwarder::store::{DeliveryRecord, DeliveryStatus, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn seeded_store() -> Arc<Store> {
    let dir = std::env::temp_dir().join(format!("forwarder-status-test-{}", uuid::Uuid::new_v4()));
    let store = Store::open(dir.join("forwarder.db"), 1)
        .await
        .expect("open store");
    let m = InboundMessage::new(5, "-100", 50, Payload::text("hello"));
    store
        .admit_message(&m, &["ok".to_string(), "broken".to_string()])
        .await
        .expect("admit");
    let mut ok = DeliveryRecord::pending(&m, "ok");
    ok.status = DeliveryStatus::Delivered;
    ok.attempts = 1;
    ok.last_attempt_at = Some(chrono::Utc::now());
    store.settle(&ok, None).await.expect("settle ok");
    let mut broken = DeliveryRecord::pending(&m, "broken");
    broken.status = DeliveryStatus::FailedPermanent;
    broken.attempts = 1;
    broken.last_error = Some("403 Forbidden: bot was kicked".to_string());
    store.settle(&broken, Some(5)).await.expect("settle broken");
    Arc::new(store)
}

async fn get_json(client: &reqwest::Client, url: &str) -> serde_json::Value {
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                return resp.json().await.expect("parse JSON");
            }
            Ok(resp) => last_err = Some(format!("status {}", resp.status())),
            Err(e) => last_err = Some(e.to_string()),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("GET {} did not return 200 within 5s; last error: {:?}", url, last_err);
}

#[tokio::test]
async fn status_http_reports_health_stats_and_failures() {
    let port = free_port();
    let store = seeded_store().await;
    let shutdown = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind status port");
    let server = tokio::spawn(status::serve(listener, Arc::clone(&store), shutdown.clone()));

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", port);

    let health = get_json(&client, &format!("{}/", base)).await;
    assert_eq!(health.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(health.get("checkpoint").and_then(|v| v.as_i64()), Some(5));

    let stats = get_json(&client, &format!("{}/stats", base)).await;
    assert_eq!(stats["messages"], 1);
    assert_eq!(stats["delivered"], 1);
    assert_eq!(stats["failedPermanent"], 1);
    assert_eq!(stats["pending"], 0);
    assert!(stats["lastDeliveredAt"].is_string());

    let failed = get_json(&client, &format!("{}/failed", base)).await;
    let records = failed["failed"].as_array().expect("failed array");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["targetId"], "broken");
    assert_eq!(records[0]["status"], "failed-permanent");

    shutdown.cancel();
    server
        .await
        .expect("server task")
        .expect("server exits cleanly");
}
