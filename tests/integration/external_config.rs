//! Integration tests for the external-access settings: CLI, API and a failed
//! external start falling back to local mode.

use crate::common::{TestEnv, wait_for_listening};

#[tokio::test]
async fn cli_set_and_show_mask_the_token() {
    let env = TestEnv::new("");

    let set = env.run_cli(&[
        "external",
        "set",
        "--enable",
        "--hostname",
        "myhouse.duckdns.org",
        "--token",
        "0123456789abcdef",
    ]);
    assert!(set.status.success(), "set failed: {}", String::from_utf8_lossy(&set.stderr));

    let show = env.run_cli(&["external", "show"]);
    assert!(show.status.success(), "show failed");
    let stdout = String::from_utf8_lossy(&show.stdout);
    assert!(stdout.contains("enabled:  true"), "enabled shown: {stdout}");
    assert!(stdout.contains("hostname: myhouse"), "label normalized: {stdout}");
    assert!(!stdout.contains("0123456789abcdef"), "token masked: {stdout}");
}

#[tokio::test]
async fn cli_rejects_enable_without_token() {
    let env = TestEnv::new("");
    let out = env.run_cli(&["external", "set", "--enable", "--hostname", "myhouse"]);
    assert!(!out.status.success(), "missing token must fail");
}

#[tokio::test]
async fn api_never_returns_the_token() {
    let env = TestEnv::new("");
    let _guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let client = env.client();
    let url = format!("{}/api/external-config", env.base_url());

    let bad = client
        .post(&url)
        .json(&serde_json::json!({"enabled": true, "hostname_label": "myhouse"}))
        .send()
        .await
        .expect("request failed");
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST, "token required");

    let ok = client
        .post(&url)
        .json(&serde_json::json!({
            "enabled": true,
            "hostname_label": "myhouse",
            "dns_token": "secret-token"
        }))
        .send()
        .await
        .expect("request failed");
    assert!(ok.status().is_success(), "saved");

    let body = client
        .get(&url)
        .send()
        .await
        .expect("request failed")
        .text()
        .await
        .expect("body");
    assert!(!body.contains("secret-token"), "token leaked: {body}");
    let view: serde_json::Value = serde_json::from_str(&body).expect("JSON");
    assert_eq!(view["has_token"], true, "presence reported");
    assert_eq!(view["configured_hostname"], "myhouse.duckdns.org", "qualified name");
}

/// The gateway search goes to a local port nothing answers on, so the external start
/// fails and the server comes up locally with the failure recorded.
#[tokio::test]
async fn failed_external_start_falls_back_to_local() {
    let env = TestEnv::new(
        r#"
        [external]
        duckdns_url = "http://127.0.0.1:9/update"
        acme_directory = "http://127.0.0.1:9/directory"
        ssdp_target = "127.0.0.1:9"
        ssdp_timeout_secs = 1
        "#,
    );
    let set = env.run_cli(&[
        "external",
        "set",
        "--enable",
        "--hostname",
        "myhouse",
        "--token",
        "abc",
    ]);
    assert!(set.status.success(), "set failed");

    let _guard = env.spawn_server();
    wait_for_listening(env.port, 30).await;

    let status: serde_json::Value = env
        .client()
        .get(format!("{}/api/external-status", env.base_url()))
        .send()
        .await
        .expect("request failed")
        .json()
        .await
        .expect("status JSON");
    assert_eq!(status["phase"], "running_local", "fell back to local: {status}");
    assert_eq!(status["active"], false, "not exposed");
    assert_eq!(status["gateway_mapping_active"], false, "no mapping");
    assert_eq!(status["last_error"]["kind"], "gateway", "failure recorded: {status}");
}
