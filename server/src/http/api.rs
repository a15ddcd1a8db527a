//! JSON endpoints for the external-access settings and the server status.

use core::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use secrecy::ExposeSecret as _;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    app::{AppState, ExternalStatus, Phase, StartFailure},
    db::{self, SettingsError},
    external::{ExternalAccessConfig, qualified_hostname},
    websocket::EXTERNAL_CONFIG_SAVED,
};

/// Routes reachable without a session.
pub(crate) fn public_routes() -> Router<AppState> {
    Router::new().route("/version", get(version))
}

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/external-config",
            get(get_external_config).post(save_external_config),
        )
        .route("/external-status", get(external_status))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
}

/// Persisted settings merged with the live status. The token itself is never returned.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalConfigView {
    pub enabled: bool,
    pub hostname_label: String,
    pub configured_hostname: Option<String>,
    pub has_token: bool,
    pub active: bool,
    pub gateway_mapping_active: bool,
    pub phase: Phase,
    pub listen_addr: Option<SocketAddr>,
    pub last_error: Option<StartFailure>,
}

impl ExternalConfigView {
    fn new(config: &ExternalAccessConfig, status: ExternalStatus, suffix: &str) -> Self {
        Self {
            enabled: config.enabled,
            configured_hostname: (!config.hostname_label.is_empty())
                .then(|| qualified_hostname(&config.hostname_label, suffix)),
            hostname_label: config.hostname_label.clone(),
            has_token: !config.dns_token.expose_secret().is_empty(),
            active: status.active,
            gateway_mapping_active: status.gateway_mapping_active,
            phase: status.phase,
            listen_addr: status.listen_addr,
            last_error: status.last_error,
        }
    }
}

/// Body of `POST /api/external-config`. A blank token keeps the stored one.
#[derive(Debug, Deserialize)]
pub struct SaveExternalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "duckdns_domain")]
    pub hostname_label: String,
    #[serde(default, alias = "duckdns_token")]
    pub dns_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveResponse {
    pub success: bool,
    pub needs_restart: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        name: env!("CARGO_PKG_NAME").to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    })
}

#[axum::debug_handler]
async fn get_external_config(State(state): State<AppState>) -> Response {
    match db::load_external_config(&state.db).await {
        Ok(config) => Json(ExternalConfigView::new(
            &config,
            state.orchestrator.status(),
            &state.settings.hostname_suffix,
        ))
        .into_response(),
        Err(e) => {
            error!("Failed to load external access config: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to load settings")
        }
    }
}

#[axum::debug_handler]
async fn save_external_config(
    State(state): State<AppState>,
    payload: Result<Json<SaveExternalConfig>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return api_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let mut config = ExternalAccessConfig::from_input(
        request.enabled,
        &request.hostname_label,
        request.dns_token.as_deref().unwrap_or_default(),
        &state.settings.hostname_suffix,
    );
    if config.dns_token.expose_secret().is_empty() {
        match db::load_external_config(&state.db).await {
            Ok(stored) => config.dns_token = stored.dns_token,
            Err(e) => {
                error!("Failed to read stored token: {e}");
                return api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to load settings");
            }
        }
    }

    match db::save_external_config(&state.db, &config).await {
        Ok(()) => {}
        Err(SettingsError::Invalid(e)) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
        Err(SettingsError::Database(e)) => {
            error!("Failed to save external access config: {e}");
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to save settings: {e}"),
            );
        }
    }

    let status = state.orchestrator.status();
    let needs_restart =
        status.phase != Phase::Stopped && status.running_config.as_ref() != Some(&config);
    info!(
        enabled = config.enabled,
        hostname = %config.hostname_label,
        needs_restart,
        "External access config saved"
    );
    state.hub.publish(
        EXTERNAL_CONFIG_SAVED,
        serde_json::json!({
            "enabled": config.enabled,
            "hostname_label": config.hostname_label,
            "needs_restart": needs_restart,
        }),
    );

    let message = if needs_restart {
        "Configuration saved. Restart the server to apply it."
    } else {
        "Configuration saved."
    };
    Json(SaveResponse {
        success: true,
        needs_restart,
        message: message.to_owned(),
    })
    .into_response()
}

async fn external_status(State(state): State<AppState>) -> Json<ExternalStatus> {
    Json(state.orchestrator.status())
}
