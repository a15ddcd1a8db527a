//! Reading diary server: the local API with its WebSocket feed, and the machinery
//! that exposes it to the internet through DuckDNS, UPnP and Let's Encrypt.
//!
//! Exposes `inner_main` so a workspace-level shim binary can call into it.
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "This is not problematic in tests",)
)]

extern crate alloc;
extern crate core;

pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod db;
pub mod external;
pub mod http;
pub mod library;
pub mod run;
pub mod websocket;

#[cfg(unix)]
use nix::sys::stat;
use tracing::Instrument as _;
// for use in integration tests
pub use websocket::WsMessage;

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Once;

use eyre::{Result, WrapErr as _};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt::time::ChronoLocal};

use cli::{Cli, Command, ExternalCommand, LogFormat};

static INIT_TRACING: Once = Once::new();
static INIT_RUSTLS: Once = Once::new();

fn init_tracing(log_format: LogFormat) {
    INIT_TRACING.call_once(move || {
        let default_level = if env::var("READING_DIARY_INTEGRATION_TEST").is_ok() {
            "error"
        } else {
            "info"
        };

        let builder = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with_timer(ChronoLocal::rfc_3339());

        match log_format {
            LogFormat::Compact => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
            LogFormat::Pretty => builder.pretty().init(),
        }
    });
}

fn canonical_config_path(config: &str) -> Result<PathBuf> {
    fs::canonicalize(config).wrap_err(format!("Config file not found at: {config}"))
}

/// The server's main function; can be called from a shim binary.
///
/// # Errors
///
/// Returns an error if the configuration or database cannot be loaded, or if the
/// server cannot start.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        Command::Serve(args) => {
            // database and certificate files are created owner-only
            #[cfg(unix)]
            stat::umask(stat::Mode::S_IRWXG | stat::Mode::S_IRWXO);

            let config_path = canonical_config_path(&args.config.config)?;
            init_tracing(args.log_format);

            let startup_span = tracing::info_span!("app.startup", ?config_path, pid = ?std::process::id(), version = env!("CARGO_PKG_VERSION"));

            INIT_RUSTLS.call_once(|| {
                if rustls::crypto::ring::default_provider()
                    .install_default()
                    .is_err()
                {
                    debug!("A rustls crypto provider was already installed");
                }
            });

            async {
                info!("Starting reading diary server");
                run::serve(&config_path, args.port, args.bind.as_deref()).await
            }
            .instrument(startup_span)
            .await
        }
        Command::External(ExternalCommand::Show(args)) => {
            init_tracing(LogFormat::Compact);
            run::show_external(&canonical_config_path(&args.config)?).await
        }
        Command::External(ExternalCommand::Set(args)) => {
            init_tracing(LogFormat::Compact);
            run::set_external(&canonical_config_path(&args.config.config)?, &args).await
        }
    }
}
