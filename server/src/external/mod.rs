//! Everything needed to expose the server to the internet: dynamic DNS, router port
//! forwarding and a publicly trusted certificate.
//!
//! The pieces are deliberately independent of each other and of the HTTP layer;
//! [`crate::app::orchestrator`] sequences them.

pub mod certs;
pub mod ddns;
pub mod gateway;
#[cfg(test)]
pub(crate) mod testing;

use secrecy::{ExposeSecret as _, SecretString};
use thiserror::Error as ThisError;

/// Settings table keys.
pub(crate) const KEY_ENABLED: &str = "external_enabled";
pub(crate) const KEY_DOMAIN: &str = "external_duckdns_domain";
pub(crate) const KEY_TOKEN: &str = "external_duckdns_token";

/// Persisted switch for external access plus the DuckDNS credentials it needs.
#[derive(Debug, Clone)]
pub struct ExternalAccessConfig {
    pub enabled: bool,
    /// DuckDNS subdomain, without the `.duckdns.org` suffix.
    pub hostname_label: String,
    pub dns_token: SecretString,
}

impl Default for ExternalAccessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hostname_label: String::new(),
            dns_token: SecretString::from(String::new()),
        }
    }
}

impl PartialEq for ExternalAccessConfig {
    fn eq(&self, other: &Self) -> bool {
        self.enabled == other.enabled
            && self.hostname_label == other.hostname_label
            && self.dns_token.expose_secret() == other.dns_token.expose_secret()
    }
}

/// A configuration that claims to be enabled but lacks what enabling needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum ConfigInvalid {
    #[error("a DuckDNS hostname is required when external access is enabled")]
    MissingHostname,
    #[error("a DuckDNS token is required when external access is enabled")]
    MissingToken,
}

impl ExternalAccessConfig {
    /// Builds a config from user input: trims whitespace and strips a trailing
    /// `.<suffix>` from the label.
    pub fn from_input(enabled: bool, hostname: &str, token: &str, suffix: &str) -> Self {
        Self {
            enabled,
            hostname_label: bare_label(hostname.trim(), suffix).to_owned(),
            dns_token: SecretString::from(token.trim().to_owned()),
        }
    }

    /// Checks that an enabled config carries both hostname and token.
    ///
    /// # Errors
    ///
    /// Returns the first missing field.
    pub fn validate(&self) -> Result<(), ConfigInvalid> {
        if !self.enabled {
            return Ok(());
        }
        if self.hostname_label.is_empty() {
            return Err(ConfigInvalid::MissingHostname);
        }
        if self.dns_token.expose_secret().is_empty() {
            return Err(ConfigInvalid::MissingToken);
        }
        Ok(())
    }

    /// True when the server should go external on start.
    pub fn wants_external(&self) -> bool {
        self.validate().is_ok() && self.enabled
    }
}

/// Strips a trailing `.<suffix>` if present.
pub fn bare_label<'hostname>(hostname: &'hostname str, suffix: &str) -> &'hostname str {
    hostname
        .strip_suffix(suffix)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(hostname)
}

/// Appends `.<suffix>` to a bare label; fully qualified names are returned unchanged.
pub fn qualified_hostname(hostname: &str, suffix: &str) -> String {
    if hostname.contains('.') {
        hostname.to_owned()
    } else {
        format!("{hostname}.{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_input_normalizes_label() {
        let cfg = ExternalAccessConfig::from_input(true, " myhouse.duckdns.org ", " abc ", "duckdns.org");
        assert_eq!(cfg.hostname_label, "myhouse", "suffix should be stripped");
        assert_eq!(cfg.dns_token.expose_secret(), "abc", "token should be trimmed");
    }

    #[test]
    fn enabled_config_requires_hostname_and_token() {
        let missing_host = ExternalAccessConfig::from_input(true, "", "abc", "duckdns.org");
        assert_eq!(missing_host.validate(), Err(ConfigInvalid::MissingHostname), "no host");

        let missing_token = ExternalAccessConfig::from_input(true, "myhouse", "", "duckdns.org");
        assert_eq!(missing_token.validate(), Err(ConfigInvalid::MissingToken), "no token");

        let disabled = ExternalAccessConfig::from_input(false, "", "", "duckdns.org");
        assert_eq!(disabled.validate(), Ok(()), "disabled needs nothing");
        assert!(!disabled.wants_external(), "disabled never goes external");

        let complete = ExternalAccessConfig::from_input(true, "myhouse", "abc", "duckdns.org");
        assert!(complete.wants_external(), "complete config goes external");
    }

    #[test]
    fn hostname_qualification() {
        assert_eq!(qualified_hostname("foo", "duckdns.org"), "foo.duckdns.org", "bare");
        assert_eq!(
            qualified_hostname("foo.example.com", "duckdns.org"),
            "foo.example.com",
            "already qualified"
        );
        assert_eq!(bare_label("foo.duckdns.org", "duckdns.org"), "foo", "strip");
        assert_eq!(bare_label("fooduckdns.org", "duckdns.org"), "fooduckdns.org", "no dot");
        assert_eq!(bare_label("foo", "duckdns.org"), "foo", "nothing to strip");
    }
}
