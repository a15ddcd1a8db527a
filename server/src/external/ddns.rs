//! Dynamic DNS against the DuckDNS update endpoint.
//!
//! One HTTP GET updates the A record (`ip=`), sets a TXT record (`txt=`) or clears it
//! (`clear=true`). The body is `OK` on success and `KO` when the token or domain is wrong.

use alloc::sync::Arc;
use core::{fmt, net::IpAddr, time::Duration};

use async_trait::async_trait;
use secrecy::{ExposeSecret as _, SecretString};
use thiserror::Error as ThisError;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{Instrument as _, debug, info, warn};

use crate::external::gateway::Gateway;

/// Default request timeout for a single update.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Address to publish for the hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalAddress {
    Known(IpAddr),
    /// The gateway could not tell us; the provider uses the request's source address.
    ProviderInferred,
}

impl ExternalAddress {
    fn as_query_value(self) -> String {
        match self {
            Self::Known(ip) => ip.to_string(),
            Self::ProviderInferred => String::new(),
        }
    }
}

impl fmt::Display for ExternalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(ip) => write!(f, "{ip}"),
            Self::ProviderInferred => f.write_str("<provider-inferred>"),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum DnsUpdateError {
    #[error("DNS provider rejected the token or domain (KO)")]
    AuthFailed,
    #[error("DNS provider request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("DNS provider returned an unexpected response: {0:?}")]
    UnknownResponse(String),
}

/// Record-update capability of a dynamic DNS provider.
#[async_trait]
pub trait DynamicDns: Send + Sync + fmt::Debug {
    /// Points `label` at `address`.
    async fn update_address(
        &self,
        label: &str,
        token: &SecretString,
        address: ExternalAddress,
    ) -> Result<(), DnsUpdateError>;

    /// Publishes a TXT record on `label`. Used for DNS-01 challenges.
    async fn set_txt(
        &self,
        label: &str,
        token: &SecretString,
        value: &str,
    ) -> Result<(), DnsUpdateError>;

    /// Removes the TXT record on `label`.
    async fn clear_txt(&self, label: &str, token: &SecretString) -> Result<(), DnsUpdateError>;
}

/// DuckDNS client.
#[derive(Debug, Clone)]
pub struct DuckDns {
    client: reqwest::Client,
    base_url: String,
    suffix: String,
}

impl DuckDns {
    /// Creates a client for `base_url` (normally `https://www.duckdns.org/update`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        suffix: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            suffix: suffix.into(),
        })
    }

    async fn call(
        &self,
        label: &str,
        token: &SecretString,
        extra: &[(&str, &str)],
    ) -> Result<(), DnsUpdateError> {
        let domain = super::bare_label(label, &self.suffix);
        let mut query = vec![("domains", domain), ("token", token.expose_secret())];
        query.extend_from_slice(extra);

        let body = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(transport)?
            .text()
            .await
            .map_err(transport)?;

        interpret_response(&body)
    }
}

/// The request URL carries the token, so it is stripped from the error.
fn transport(err: reqwest::Error) -> DnsUpdateError {
    DnsUpdateError::Transport(err.without_url())
}

/// Requests are never verbose, so the whole body is the status.
fn interpret_response(body: &str) -> Result<(), DnsUpdateError> {
    match body.trim() {
        "OK" => Ok(()),
        "KO" => Err(DnsUpdateError::AuthFailed),
        other => Err(DnsUpdateError::UnknownResponse(other.to_owned())),
    }
}

#[async_trait]
impl DynamicDns for DuckDns {
    #[tracing::instrument(skip(self, token), fields(%address))]
    async fn update_address(
        &self,
        label: &str,
        token: &SecretString,
        address: ExternalAddress,
    ) -> Result<(), DnsUpdateError> {
        let ip = address.as_query_value();
        self.call(label, token, &[("ip", ip.as_str())]).await?;
        debug!("DNS record updated");
        Ok(())
    }

    #[tracing::instrument(skip(self, token, value))]
    async fn set_txt(
        &self,
        label: &str,
        token: &SecretString,
        value: &str,
    ) -> Result<(), DnsUpdateError> {
        self.call(label, token, &[("txt", value)]).await
    }

    #[tracing::instrument(skip(self, token))]
    async fn clear_txt(&self, label: &str, token: &SecretString) -> Result<(), DnsUpdateError> {
        self.call(label, token, &[("txt", ""), ("clear", "true")])
            .await
    }
}

/// Running periodic updater. Dropping the handle without [`stop`](Self::stop) aborts the task.
#[derive(Debug)]
pub struct DnsUpdaterHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DnsUpdaterHandle {
    /// Stops the loop and waits for it to exit. No update starts after this returns.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            drop(tx.send(()));
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("DNS updater task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for DnsUpdaterHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Runs one update immediately and then one every `every`, until stopped.
///
/// Each cycle asks `gateway` (when a mapping is active) for the current public address
/// and falls back to the last known one.
pub fn start_periodic_updates(
    provider: Arc<dyn DynamicDns>,
    label: String,
    token: SecretString,
    initial: ExternalAddress,
    gateway: Option<Arc<dyn Gateway>>,
    every: Duration,
) -> DnsUpdaterHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let span = tracing::info_span!("ddns.updater", hostname = %label);

    let task = tokio::spawn(
        async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut address = initial;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                if let Some(gw) = &gateway {
                    match gw.external_ip_address().await {
                        Ok(ip) => address = ExternalAddress::Known(ip),
                        Err(e) => debug!("Gateway did not report an address, keeping {address}: {e}"),
                    }
                }

                match provider.update_address(&label, &token, address).await {
                    Ok(()) => info!(%address, "Dynamic DNS updated"),
                    Err(e) => warn!(%address, "Dynamic DNS update failed, retrying next cycle: {e}"),
                }
            }
            debug!("DNS updater stopped");
        }
        .instrument(span),
    );

    DnsUpdaterHandle {
        stop_tx: Some(stop_tx),
        task: Some(task),
    }
}
