use alloc::sync::Arc;
use core::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{
    app::orchestrator::OrchestratorHandle, auth::AuthRuntime, config::ExternalSettings,
    db::DbPool, external::ExternalAccessConfig, websocket::Hub,
};

/// Lifecycle of the served listener and the external-access machinery around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    StartingLocal,
    StartingExternal,
    RunningLocal,
    RunningExternal,
    Stopping,
}

impl Phase {
    pub const fn is_running(self) -> bool {
        matches!(self, Self::RunningLocal | Self::RunningExternal)
    }
}

/// Coarse category of a failed start, for the UI to pick wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Gateway,
    DnsTimeout,
    DnsAuth,
    Certificate,
    Bind,
}

/// User-facing projection of a failed start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFailure {
    pub kind: FailureKind,
    pub message: String,
    pub hints: Vec<String>,
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalStatus {
    pub phase: Phase,
    /// True only while serving TLS on the external hostname.
    pub active: bool,
    pub gateway_mapping_active: bool,
    pub external_address: Option<String>,
    pub listen_addr: Option<SocketAddr>,
    /// Plain-HTTP listener redirecting to the TLS origin, while external.
    pub redirect_addr: Option<SocketAddr>,
    pub configured_hostname: Option<String>,
    pub last_error: Option<StartFailure>,
    /// Config the current run was started with.
    #[serde(skip)]
    pub running_config: Option<ExternalAccessConfig>,
}

impl Default for ExternalStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Stopped,
            active: false,
            gateway_mapping_active: false,
            external_address: None,
            listen_addr: None,
            redirect_addr: None,
            configured_hostname: None,
            last_error: None,
            running_config: None,
        }
    }
}

/// Application state shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub hub: Hub,
    pub orchestrator: OrchestratorHandle,
    pub settings: Arc<ExternalSettings>,
    pub auth: Arc<AuthRuntime>,
}
