//! Uses the single integration test approach.
//!
//! This improves parallelism when running the tests, and reduces the number of binaries that have to be built (and linked)

mod auth;
mod common;
mod external_config;
mod websocket;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt as _;

use reading_diary_server::http::api::VersionInfo;

use common::{TestEnv, wait_for_listening};

#[tokio::test]
async fn empty_config_serves_locally() {
    let env = TestEnv::new("");
    let mut guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let version: VersionInfo = reqwest::get(format!("{}/api/version", env.base_url()))
        .await
        .expect("request failed")
        .json()
        .await
        .expect("version JSON");
    assert_eq!(version.version, env!("CARGO_PKG_VERSION"), "same workspace version");

    let status: serde_json::Value = env
        .client()
        .get(format!("{}/api/external-status", env.base_url()))
        .send()
        .await
        .expect("request failed")
        .json()
        .await
        .expect("status JSON");
    assert_eq!(status["phase"], "running_local", "local mode");
    assert_eq!(status["active"], false, "not exposed");

    assert!(env.dir.path().join("diary.db").exists(), "database created next to the config");

    drop(guard.0.kill());
    let status = guard.0.wait().expect("failed to wait on child");
    #[cfg(unix)]
    assert!(
        status.success() || status.signal() == Some(9),
        "Process did not start or exit as expected"
    );
    #[cfg(not(unix))]
    assert!(status.success() || status.code().is_some(), "Process did not exit as expected");
}

#[cfg(unix)]
#[tokio::test]
async fn sigterm_stops_gracefully() {
    let env = TestEnv::new("");
    let mut guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let pid = nix::unistd::Pid::from_raw(i32::try_from(guard.0.id()).unwrap());
    nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    let status = loop {
        if let Some(status) = guard.0.try_wait().unwrap() {
            break status;
        }
        assert!(std::time::Instant::now() < deadline, "server did not exit after SIGTERM");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    };
    assert!(status.success(), "clean exit after SIGTERM: {status:?}");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let env = TestEnv::new("");
    let _guard = env.spawn_server();
    wait_for_listening(env.port, 10).await;

    let resp = reqwest::get(format!("{}/does-not-exist", env.base_url()))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "fallback");
    assert!(resp.headers().contains_key("x-request-id"), "request id set");
}
