//! Configuration data types for the reading diary server.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration that serves plain HTTP on port 7443.

use core::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::external::gateway::SSDP_MULTICAST;

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// HTTP server binding configuration section.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// TCP port for the web service, plain or TLS.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address for the listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Origins allowed to call the API cross-site with credentials. Empty means
    /// same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            cors_origins: Vec::new(),
        }
    }
}

/// Login settings.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Login password. When absent one is generated and kept in the database.
    #[serde(default)]
    pub password: Option<String>,
    /// Base64 encoded key (at least 64 bytes) signing session cookies. Generated and
    /// kept in the database when absent.
    #[serde(default)]
    pub cookie_secret: Option<String>,
    /// Lifetime of a login session.
    #[serde(default = "default_session_hours")]
    pub session_hours: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password: None,
            cookie_secret: None,
            session_hours: default_session_hours(),
        }
    }
}

/// Configuration for the local `SQLite` database holding the settings table.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Path to the `SQLite` database file. Relative paths are resolved relative to the config file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tunables for the external-access machinery (DuckDNS, UPnP, ACME).
///
/// Whether external access is enabled, and for which hostname, is *not* part of this
/// file; that lives in the settings table so the API can change it.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExternalSettings {
    /// Directory holding `<hostname>.crt` / `<hostname>.key`. Relative to the config file.
    #[serde(default = "default_certs_dir")]
    pub certs_dir: String,
    /// ACME directory URL.
    #[serde(default = "default_acme_directory")]
    pub acme_directory: String,
    /// DuckDNS update endpoint.
    #[serde(default = "default_duckdns_url")]
    pub duckdns_url: String,
    /// Domain suffix appended to bare hostname labels.
    #[serde(default = "default_hostname_suffix")]
    pub hostname_suffix: String,
    /// Seconds between two periodic DNS updates.
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    /// How long to wait for the DNS-01 TXT record to become visible.
    #[serde(default = "default_propagation_timeout_secs")]
    pub propagation_timeout_secs: u64,
    /// Recursive resolvers queried for propagation. One positive answer is enough.
    #[serde(default = "default_propagation_resolvers")]
    pub propagation_resolvers: Vec<SocketAddr>,
    /// Port opened on the router.
    #[serde(default = "default_port")]
    pub external_port: u16,
    /// Label stored with the router port mapping.
    #[serde(default = "default_mapping_description")]
    pub mapping_description: String,
    /// Destination of SSDP gateway searches.
    #[serde(default = "default_ssdp_target")]
    pub ssdp_target: SocketAddr,
    /// How long each SSDP search waits for an answer.
    #[serde(default = "default_ssdp_timeout_secs")]
    pub ssdp_timeout_secs: u64,
    /// Plain-HTTP port redirecting to HTTPS while external access is up. Off when unset.
    #[serde(default)]
    pub http_redirect_port: Option<u16>,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            certs_dir: default_certs_dir(),
            acme_directory: default_acme_directory(),
            duckdns_url: default_duckdns_url(),
            hostname_suffix: default_hostname_suffix(),
            update_interval_secs: default_update_interval_secs(),
            propagation_timeout_secs: default_propagation_timeout_secs(),
            propagation_resolvers: default_propagation_resolvers(),
            external_port: default_port(),
            mapping_description: default_mapping_description(),
            ssdp_target: default_ssdp_target(),
            ssdp_timeout_secs: default_ssdp_timeout_secs(),
            http_redirect_port: None,
        }
    }
}

/// Root config structure.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct DiaryConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub external: ExternalSettings,
}

const fn default_port() -> u16 {
    7443
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_db_path() -> String {
    "./reading_diary.db".to_string()
}

fn default_certs_dir() -> String {
    "./certs".to_string()
}

fn default_acme_directory() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_duckdns_url() -> String {
    "https://www.duckdns.org/update".to_string()
}

fn default_hostname_suffix() -> String {
    "duckdns.org".to_string()
}

const fn default_session_hours() -> u64 {
    8
}

const fn default_update_interval_secs() -> u64 {
    5 * 60
}

const fn default_propagation_timeout_secs() -> u64 {
    5 * 60
}

fn default_propagation_resolvers() -> Vec<SocketAddr> {
    [
        "8.8.8.8:53",
        "8.8.4.4:53",
        "1.1.1.1:53",
        "1.0.0.1:53",
        "9.9.9.9:53",
    ]
    .iter()
    .filter_map(|s| s.parse().ok())
    .collect()
}

fn default_mapping_description() -> String {
    "Reading Diary HTTPS".to_string()
}

const fn default_ssdp_target() -> SocketAddr {
    SSDP_MULTICAST
}

const fn default_ssdp_timeout_secs() -> u64 {
    3
}

/// Resolves a path to an absolute one.
///
/// If the path is absolute, returns it as-is. If relative, joins it with the
/// config file's parent directory and normalizes the result to remove redundant
/// components like `./`.
pub fn resolve_config_relative_paths(config_path: &Path, relative_path: &str) -> PathBuf {
    let path = Path::new(relative_path);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else if relative_path == ":memory:" {
        // Special case: SQLite in-memory database path
        path.to_path_buf()
    } else {
        config_path
            .parent()
            .map_or_else(|| path.to_path_buf(), |d| d.join(path))
    };

    // We can't use canonicalize() because the file might not exist yet
    normalize_path(&resolved)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        use Component as C;
        match component {
            C::Normal(c) => {
                result.push(c);
            }
            C::ParentDir => {
                result.pop();
            }
            C::CurDir => {}
            C::RootDir | C::Prefix(_) => {
                result.push(component);
            }
        }
    }
    result
}
