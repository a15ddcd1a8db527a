//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = "reading_diary")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server until Ctrl-C or SIGTERM. Goes external when the stored settings say so.
    Serve(ServeArgs),

    /// Inspect or change the stored external-access settings.
    #[command(subcommand)]
    External(ExternalCommand),
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Args)]
pub struct ConfigArg {
    /// Path to the configuration file
    #[arg(short, long, env = "READING_DIARY_CONFIG", default_value = "reading_diary.toml")]
    pub config: String,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub config: ConfigArg,

    /// Optional override for the listen port (overrides port in config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Optional override for the bind address (overrides bind in config)
    #[arg(long)]
    pub bind: Option<String>,

    #[arg(long, value_enum, default_value_t)]
    pub log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
pub enum ExternalCommand {
    /// Print the stored settings, token masked.
    Show(ConfigArg),

    /// Validate and store new settings. Applied on the next start.
    Set(SetArgs),
}

#[derive(Debug, Args)]
pub struct SetArgs {
    #[command(flatten)]
    pub config: ConfigArg,

    #[arg(long, conflicts_with = "disable", requires_all = ["hostname", "token"])]
    pub enable: bool,

    #[arg(long, required_unless_present = "enable")]
    pub disable: bool,

    /// DuckDNS subdomain, with or without the `.duckdns.org` suffix
    #[arg(long)]
    pub hostname: Option<String>,

    /// DuckDNS account token
    #[arg(long, env = "READING_DIARY_DUCKDNS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}
