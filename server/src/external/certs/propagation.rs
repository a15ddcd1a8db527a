//! Waits until a DNS-01 TXT record is visible on public resolvers.

use core::{net::SocketAddr, time::Duration};

use futures::future;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

use super::CertError;

#[derive(Debug, Clone)]
pub struct PropagationChecker {
    resolvers: Vec<SocketAddr>,
    timeout: Duration,
    poll_interval: Duration,
}

impl PropagationChecker {
    pub const fn new(resolvers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            resolvers,
            timeout,
            poll_interval: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn resolver_for(addr: SocketAddr) -> TokioAsyncResolver {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        let mut opts = ResolverOpts::default();
        // every poll must hit the network, not a cached negative answer
        opts.cache_size = 0;
        opts.attempts = 1;
        opts.timeout = Duration::from_secs(5);
        TokioAsyncResolver::tokio(config, opts)
    }

    async fn resolver_sees(resolver: &TokioAsyncResolver, name: &str, expected: &str) -> bool {
        match resolver.txt_lookup(name).await {
            Ok(lookup) => lookup.iter().any(|txt| {
                txt.txt_data()
                    .iter()
                    .any(|data| String::from_utf8_lossy(data) == expected)
            }),
            Err(e) => {
                debug!(name, "TXT lookup failed: {e}");
                false
            }
        }
    }

    /// Polls until the `_acme-challenge` TXT record of `domain` carries `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::ChallengeTimeout`] once the timeout has elapsed.
    #[tracing::instrument(skip(self, expected), fields(resolvers = self.resolvers.len()))]
    pub async fn wait_for_txt(&self, domain: &str, expected: &str) -> Result<(), CertError> {
        let record = format!("_acme-challenge.{domain}.");
        let name = record.as_str();
        let resolvers: Vec<_> = self
            .resolvers
            .iter()
            .map(|addr| (*addr, Self::resolver_for(*addr)))
            .collect();
        let deadline = Instant::now() + self.timeout;

        loop {
            let round = future::join_all(resolvers.iter().map(|(addr, resolver)| async move {
                let seen = Self::resolver_sees(resolver, name, expected).await;
                debug!(%addr, seen, "Propagation check");
                seen
            }));
            let remaining = deadline.saturating_duration_since(Instant::now());
            // one resolver seeing the record is enough
            if let Ok(results) = timeout(remaining, round).await
                && results.iter().any(|seen| *seen)
            {
                info!(domain, "Challenge record is visible");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CertError::ChallengeTimeout {
                    domain: domain.to_owned(),
                    waited: self.timeout,
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
