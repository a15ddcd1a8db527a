//! Integration tests for login and the protected routes

use reqwest::{StatusCode, header::SET_COOKIE};
use tokio_tungstenite::{connect_async, tungstenite};

use crate::common::{PASSWORD, TestEnv, wait_for_listening};

#[tokio::test]
async fn settings_and_event_feed_need_credentials() {
    let env = TestEnv::new("");
    let _guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/external-config", env.base_url()))
        .json(&serde_json::json!({"enabled": false}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "settings write refused");

    let err = connect_async(format!("ws://127.0.0.1:{}/ws", env.port))
        .await
        .expect_err("handshake must fail");
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401, "upgrade refused");
        }
        other => panic!("expected an HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn login_cookie_grants_access() {
    let env = TestEnv::new("");
    let _guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let client = reqwest::Client::new();
    let login = format!("{}/api/login", env.base_url());

    let wrong = client
        .post(&login)
        .json(&serde_json::json!({"password": "nope"}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED, "wrong password");

    let ok = client
        .post(&login)
        .json(&serde_json::json!({"password": PASSWORD}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(ok.status(), StatusCode::OK, "right password");
    let cookie = ok
        .headers()
        .get(SET_COOKIE)
        .expect("session cookie set")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_owned();

    let status = client
        .get(format!("{}/api/external-status", env.base_url()))
        .header(reqwest::header::COOKIE, cookie)
        .send()
        .await
        .expect("request failed");
    assert_eq!(status.status(), StatusCode::OK, "cookie opens the API");
}
