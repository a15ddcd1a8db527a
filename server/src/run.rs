//! Wiring for the `serve` and `external` commands.

use alloc::sync::Arc;
use core::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use std::path::Path;

use eyre::WrapErr as _;
use secrecy::ExposeSecret as _;
use tokio::signal;
use tracing::{Instrument as _, error, info, warn};

use crate::{
    app::{AppState, Orchestrator, OrchestratorDeps, OrchestratorHandle, Phase},
    auth::AuthRuntime,
    cli::SetArgs,
    config::{self, DiaryConfig, resolve_config_relative_paths},
    db::{self, DbPool},
    external::{
        ExternalAccessConfig,
        certs::{AcmeIssuer, CertificateProvisioner, CertificateStore, PropagationChecker},
        ddns::{DEFAULT_REQUEST_TIMEOUT, DuckDns},
        gateway::{PortMapper, UpnpDiscovery, resolve_local_address},
    },
    http,
    websocket::Hub,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const EXTERNAL_START_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Resolves when Ctrl-C or (on unix) SIGTERM arrives.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            core::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => drop(sigterm.recv().await),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                core::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn open_db(config: &DiaryConfig, config_path: &Path) -> eyre::Result<DbPool> {
    let db_path = resolve_config_relative_paths(config_path, &config.db.path);
    db::init(&db_path)
        .await
        .wrap_err(format!("Failed to open database at: {}", db_path.display()))
}

fn build_deps(
    config: &DiaryConfig,
    config_path: &Path,
    hub: Hub,
    listen: SocketAddr,
) -> eyre::Result<OrchestratorDeps> {
    let external = &config.external;
    let dns = Arc::new(
        DuckDns::new(
            external.duckdns_url.as_str(),
            external.hostname_suffix.as_str(),
            DEFAULT_REQUEST_TIMEOUT,
        )
        .wrap_err("Failed to build DuckDNS client")?,
    );
    let discovery = Arc::new(
        UpnpDiscovery::new(
            external.ssdp_target,
            Duration::from_secs(external.ssdp_timeout_secs),
        )
        .wrap_err("Failed to build UPnP client")?,
    );
    let propagation = PropagationChecker::new(
        external.propagation_resolvers.clone(),
        Duration::from_secs(external.propagation_timeout_secs),
    );
    let issuer = AcmeIssuer::new(external.acme_directory.as_str(), dns.clone(), propagation);
    let certs_dir = resolve_config_relative_paths(config_path, &external.certs_dir);
    let provisioner = CertificateProvisioner::new(
        CertificateStore::new(certs_dir),
        Arc::new(issuer),
        external.hostname_suffix.as_str(),
    );

    Ok(OrchestratorDeps {
        hub,
        dns,
        discovery,
        // the gateway forwards the public port to wherever the server actually listens
        port_mapper: PortMapper::new(
            external.external_port,
            listen.port(),
            external.mapping_description.as_str(),
        ),
        provisioner,
        local_address: resolve_local_address,
        listen,
        redirect_listen: external
            .http_redirect_port
            .map(|port| SocketAddr::new(listen.ip(), port)),
        hostname_suffix: external.hostname_suffix.clone(),
        update_interval: Duration::from_secs(external.update_interval_secs),
        shutdown_grace: SHUTDOWN_GRACE,
    })
}

/// Runs the server until a shutdown signal, then stops it in order.
///
/// # Errors
///
/// Returns an error if the configuration or database cannot be loaded, or if the
/// server cannot start even in local mode.
pub async fn serve(
    config_path: &Path,
    port_override: Option<u16>,
    bind_override: Option<&str>,
) -> eyre::Result<()> {
    let config = config::load(config_path).await?;

    let listen_port = port_override.unwrap_or(config.server.port);
    let bind = bind_override.unwrap_or(&config.server.bind);
    let listen_ip: IpAddr = bind
        .parse()
        .wrap_err(format!("Invalid bind address: {bind}"))?;
    let listen = SocketAddr::from((listen_ip, listen_port));

    let db = open_db(&config, config_path).await?;
    let hub = Hub::spawn();
    let deps = build_deps(&config, config_path, hub.clone(), listen)?;
    let (orchestrator, handle) = Orchestrator::new(deps);

    let auth = AuthRuntime::from_config(&config.auth, &db)
        .await
        .wrap_err("Failed to set up login")?;
    let app_state = AppState {
        db: db.clone(),
        hub,
        orchestrator: handle.clone(),
        settings: Arc::new(config.external.clone()),
        auth: Arc::new(auth),
    };
    let task = orchestrator.spawn(http::create_app(app_state, &config.server.cors_origins));

    let external = db::load_external_config(&db)
        .await
        .wrap_err("Failed to load external access settings")?;
    let interrupted = tokio::select! {
        started = start_with_fallback(&handle, external).in_current_span() => {
            started?;
            false
        }
        () = shutdown_signal() => true,
    };
    if !interrupted {
        shutdown_signal().await;
    }
    info!("Received shutdown, stopping");
    handle.stop().await;
    // the served router holds a handle too, so the actor never sees its channel close
    task.abort();
    db.close().await;
    Ok(())
}

/// Starts as configured; when going external fails, serves locally instead so the
/// diary stays usable on the LAN.
async fn start_with_fallback(
    handle: &OrchestratorHandle,
    config: ExternalAccessConfig,
) -> eyre::Result<()> {
    let wants_external = config.wants_external();
    if config.enabled && !wants_external {
        warn!("External access is enabled but incomplete, starting locally");
    }

    let external_failed = match handle.start(config).await {
        Ok(Phase::StartingExternal) => {
            let running = handle
                .wait_for_phase(
                    |p| matches!(p, Phase::RunningExternal | Phase::Stopped),
                    EXTERNAL_START_TIMEOUT,
                )
                .await;
            match running {
                Some(status) if status.phase == Phase::RunningExternal => {
                    info!(hostname = ?status.configured_hostname, "External access is up");
                    false
                }
                Some(status) => {
                    if let Some(failure) = status.last_error {
                        error!(kind = ?failure.kind, "External start failed: {}", failure.message);
                        for hint in failure.hints {
                            info!("Hint: {hint}");
                        }
                    }
                    true
                }
                None => {
                    warn!("External start is still in progress, leaving it running");
                    false
                }
            }
        }
        Ok(phase) => {
            info!(?phase, "Server started");
            false
        }
        Err(e) if wants_external => {
            error!("External start failed: {e}");
            true
        }
        Err(e) => return Err(e).wrap_err("Failed to start server"),
    };

    if external_failed {
        warn!("Falling back to local mode");
        handle
            .start(ExternalAccessConfig::default())
            .await
            .wrap_err("Failed to start server in local mode")?;
    }
    Ok(())
}

/// Prints the stored external-access settings with the token masked.
///
/// # Errors
///
/// Returns an error if the configuration or database cannot be read.
pub async fn show_external(config_path: &Path) -> eyre::Result<()> {
    let config = config::load(config_path).await?;
    let db = open_db(&config, config_path).await?;
    let external = db::load_external_config(&db).await?;
    db.close().await;

    println!("enabled:  {}", external.enabled);
    println!("hostname: {}", external.hostname_label);
    println!("token:    {}", mask(external.dns_token.expose_secret()));
    Ok(())
}

/// Validates and stores new external-access settings.
///
/// # Errors
///
/// Returns an error if the settings are invalid or cannot be written.
pub async fn set_external(config_path: &Path, args: &SetArgs) -> eyre::Result<()> {
    let config = config::load(config_path).await?;
    let db = open_db(&config, config_path).await?;

    let external = if args.enable {
        ExternalAccessConfig::from_input(
            true,
            args.hostname.as_deref().unwrap_or_default(),
            args.token.as_deref().unwrap_or_default(),
            &config.external.hostname_suffix,
        )
    } else {
        // keep the credentials so enabling again only needs --enable
        ExternalAccessConfig {
            enabled: false,
            ..db::load_external_config(&db).await?
        }
    };
    db::save_external_config(&db, &external)
        .await
        .wrap_err("Failed to store external access settings")?;
    db.close().await;

    info!(enabled = external.enabled, hostname = %external.hostname_label, "External access settings stored");
    Ok(())
}

fn mask(token: &str) -> String {
    match token.chars().count() {
        0 => "(none)".to_owned(),
        n if n <= 8 => "*".repeat(n),
        _ => format!("{}…", token.chars().take(4).collect::<String>()),
    }
}
