//! Common utilities for integration tests.
//!
//! Spawns the built `reading_diary` binary against a throwaway config directory and
//! waits for it to accept connections.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest as _, handshake::client::Request};

/// Login password written into every test config.
pub const PASSWORD: &str = "test-password";

pub fn get_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind to address")
        .local_addr()
        .unwrap()
        .port()
}

/// Guard that kills and waits on a child process when dropped.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        drop(self.0.kill());
        drop(self.0.wait());
    }
}

fn get_server_bin() -> &'static str {
    env!("CARGO_BIN_EXE_reading_diary")
}

/// A config file plus database in their own temporary directory.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub port: u16,
}

impl TestEnv {
    /// Writes a config listening on a free local port; `extra` is appended verbatim.
    pub fn new(extra: &str) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let port = get_free_port();
        let config = format!(
            r#"
            [server]
            port = {port}
            bind = "127.0.0.1"

            [db]
            path = "diary.db"

            [auth]
            password = "{PASSWORD}"

            {extra}
            "#
        );
        std::fs::write(dir.path().join("diary.toml"), config).expect("failed to write config");
        Self { dir, port }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("diary.toml")
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// HTTP client sending the bearer password with every request.
    pub fn client(&self) -> reqwest::Client {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {PASSWORD}")).unwrap(),
        );
        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build client")
    }

    /// Authorized `/ws` handshake request.
    pub fn ws_request(&self) -> Request {
        let mut request = format!("ws://127.0.0.1:{}/ws", self.port)
            .into_client_request()
            .expect("valid websocket URL");
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {PASSWORD}").parse().unwrap(),
        );
        request
    }

    /// Runs a one-shot CLI command against this environment's config.
    pub fn run_cli(&self, args: &[&str]) -> Output {
        command(&self.config_path(), args)
            .output()
            .expect("failed to run reading_diary")
    }

    pub fn spawn_server(&self) -> KillOnDrop {
        let child = command(&self.config_path(), &["serve"])
            .stdout(Stdio::null())
            .spawn()
            .expect("failed to start reading_diary");
        KillOnDrop(child)
    }
}

/// `args` names the leaf subcommand; `--config` is appended after it.
fn command(config_path: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(get_server_bin());
    cmd.args(args)
        .args(["--config", config_path.to_str().unwrap()])
        .env("READING_DIARY_INTEGRATION_TEST", "1");
    cmd
}

/// Block until a TCP listener is accepting on `127.0.0.1:port` or timeout.
pub async fn wait_for_listening(port: u16, timeout_secs: u64) {
    let start = Instant::now();
    while std::net::TcpStream::connect(("127.0.0.1", port)).is_err() {
        if start.elapsed() > Duration::from_secs(timeout_secs) {
            panic!("server did not start within timeout");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
