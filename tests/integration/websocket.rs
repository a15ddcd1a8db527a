//! Integration tests for the `/ws` event feed

use std::time::Duration;

use futures_util::StreamExt as _;
use reading_diary_server::WsMessage;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::common::{TestEnv, wait_for_listening};

async fn next_event<S>(read: &mut S) -> WsMessage
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let next = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg.expect("websocket error") {
                return serde_json::from_str(&text).expect("event JSON");
            }
        }
        panic!("websocket closed");
    });
    next.await.expect("no event within timeout")
}

#[tokio::test]
async fn connection_starts_with_status_then_streams_events() {
    let env = TestEnv::new("");
    let _guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let (ws_stream, _) = connect_async(env.ws_request())
        .await
        .expect("failed to connect websocket");
    let (_write, mut read) = ws_stream.split();

    let initial = next_event(&mut read).await;
    assert_eq!(initial.kind, "external_status", "snapshot first");
    assert_eq!(initial.payload["phase"], "running_local", "server is up locally");

    let resp = env
        .client()
        .post(format!("{}/api/external-config", env.base_url()))
        .json(&serde_json::json!({
            "enabled": true,
            "hostname_label": "myhouse",
            "dns_token": "abc"
        }))
        .send()
        .await
        .expect("request failed");
    assert!(resp.status().is_success(), "save accepted: {}", resp.status());

    let saved = next_event(&mut read).await;
    assert_eq!(saved.kind, "external_config_saved", "save announced");
    assert_eq!(saved.payload["needs_restart"], true, "running config differs");
}

#[tokio::test]
async fn every_client_gets_the_event() {
    let env = TestEnv::new("");
    let _guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let mut readers = Vec::new();
    for _ in 0..3 {
        let (ws_stream, _) = connect_async(env.ws_request())
            .await
            .expect("failed to connect");
        // keep the write half alive so the connection stays open
        let (write, mut read) = ws_stream.split();
        assert_eq!(next_event(&mut read).await.kind, "external_status", "snapshot");
        readers.push((write, read));
    }

    env.client()
        .post(format!("{}/api/external-config", env.base_url()))
        .json(&serde_json::json!({"enabled": false}))
        .send()
        .await
        .expect("request failed");

    for (_, read) in &mut readers {
        assert_eq!(
            next_event(read).await.kind,
            "external_config_saved",
            "fan-out to every subscriber"
        );
    }
}
