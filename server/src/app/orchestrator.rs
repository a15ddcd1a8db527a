//! External-access state machine.
//!
//! One actor task owns every piece of runtime state: the listener, the DNS updater,
//! the gateway mapping and the certificate attempt in flight. Callers talk to it
//! through [`OrchestratorHandle`] and observe it through a `watch` channel; each
//! transition is also published on the hub as `external_status`.
//!
//! ```text
//! Stopped -> StartingLocal    -> RunningLocal    -> Stopping -> Stopped
//! Stopped -> StartingExternal -> RunningExternal -> Stopping -> Stopped
//!                       \-> Stopped (gateway or certificate failure)
//! ```
//!
//! While external, an optional plain-HTTP listener answers every request with a
//! redirect to the TLS origin.

use alloc::sync::Arc;
use core::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use axum::Router;
use axum_server::{Handle, tls_rustls::RustlsConfig};
use secrecy::SecretString;
use thiserror::Error as ThisError;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{Instrument as _, debug, error, info, warn};

use crate::{
    app::state::{ExternalStatus, FailureKind, Phase, StartFailure},
    external::{
        ConfigInvalid, ExternalAccessConfig,
        certs::{CertError, CertificateProvisioner, TlsCredential},
        ddns::{DnsUpdaterHandle, DynamicDns, ExternalAddress, start_periodic_updates},
        gateway::{Gateway, GatewayDiscovery, GatewayError, PortMapper},
        qualified_hostname,
    },
    http::https_redirect_router,
    websocket::{EXTERNAL_STATUS, Hub},
};

#[derive(Debug, ThisError)]
pub enum StartError {
    #[error(transparent)]
    ConfigInvalid(#[from] ConfigInvalid),
    #[error("server is already {0:?}")]
    AlreadyRunning(Phase),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Certificate(#[from] CertError),
    #[error("could not listen: {0}")]
    Bind(String),
    #[error("orchestrator task is not running")]
    OrchestratorGone,
}

impl From<&StartError> for StartFailure {
    fn from(err: &StartError) -> Self {
        let (kind, hints): (FailureKind, Vec<&str>) = match *err {
            StartError::ConfigInvalid(_)
            | StartError::AlreadyRunning(_)
            | StartError::OrchestratorGone => (FailureKind::Config, Vec::new()),
            StartError::Gateway(_) => (
                FailureKind::Gateway,
                vec![
                    "Make sure UPnP/IGD is enabled on the router.",
                    "Make sure this machine is connected to the router's LAN, not a guest network.",
                ],
            ),
            StartError::Certificate(ref cert) => {
                let kind = match *cert {
                    CertError::ChallengeTimeout { .. } => FailureKind::DnsTimeout,
                    CertError::AuthRejected => FailureKind::DnsAuth,
                    _ => FailureKind::Certificate,
                };
                (kind, cert.hints())
            }
            StartError::Bind(_) => (
                FailureKind::Bind,
                vec!["Another process may already be using the port."],
            ),
        };
        Self {
            kind,
            message: err.to_string(),
            hints: hints.into_iter().map(str::to_owned).collect(),
        }
    }
}

/// Everything the orchestrator drives.
#[derive(Debug, Clone)]
pub struct OrchestratorDeps {
    pub hub: Hub,
    pub dns: Arc<dyn DynamicDns>,
    pub discovery: Arc<dyn GatewayDiscovery>,
    pub port_mapper: PortMapper,
    pub provisioner: CertificateProvisioner,
    pub local_address: fn() -> Result<Ipv4Addr, GatewayError>,
    pub listen: SocketAddr,
    /// Plain-HTTP redirect listener, only bound while external.
    pub redirect_listen: Option<SocketAddr>,
    pub hostname_suffix: String,
    pub update_interval: Duration,
    pub shutdown_grace: Duration,
}

enum Command {
    Start {
        config: ExternalAccessConfig,
        reply: oneshot::Sender<Result<Phase, StartError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

struct CertificateReady {
    generation: u64,
    result: Result<TlsCredential, CertError>,
}

struct RunningServer {
    handle: Handle<SocketAddr>,
    task: JoinHandle<std::io::Result<()>>,
    addr: SocketAddr,
}

/// Cheap to clone; the only way to drive the state machine.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ExternalStatus>,
}

impl OrchestratorHandle {
    /// Starts serving: TLS on the external hostname when `config` asks for it, plain
    /// HTTP otherwise. External starts return `StartingExternal` while the certificate
    /// is still being obtained.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is not stopped, the config is invalid, the
    /// gateway cannot be programmed or the listener cannot bind.
    pub async fn start(&self, config: ExternalAccessConfig) -> Result<Phase, StartError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { config, reply })
            .await
            .map_err(|_| StartError::OrchestratorGone)?;
        rx.await.map_err(|_| StartError::OrchestratorGone)?
    }

    /// Stops everything in order: DNS updates, listener, port mapping. Returns once done.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            drop(rx.await);
        }
    }

    pub fn status(&self) -> ExternalStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExternalStatus> {
        self.status.clone()
    }

    /// Waits until the phase satisfies `pred`, or `None` on timeout.
    pub async fn wait_for_phase(
        &self,
        pred: impl Fn(Phase) -> bool,
        timeout: Duration,
    ) -> Option<ExternalStatus> {
        let mut rx = self.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| pred(s.phase))).await {
            Ok(Ok(status)) => Some(status.clone()),
            _ => None,
        }
    }
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<ExternalStatus>,
    certs_tx: mpsc::Sender<CertificateReady>,
    certs_rx: mpsc::Receiver<CertificateReady>,
    generation: u64,
    server: Option<RunningServer>,
    redirect: Option<RunningServer>,
    dns_updater: Option<DnsUpdaterHandle>,
    gateway: Option<Arc<dyn Gateway>>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> (Self, OrchestratorHandle) {
        let (commands_tx, commands) = mpsc::channel(16);
        let (status, status_rx) = watch::channel(ExternalStatus::default());
        let (certs_tx, certs_rx) = mpsc::channel(4);
        let orchestrator = Self {
            deps,
            commands,
            status,
            certs_tx,
            certs_rx,
            generation: 0,
            server: None,
            redirect: None,
            dns_updater: None,
            gateway: None,
        };
        let handle = OrchestratorHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (orchestrator, handle)
    }

    /// Runs the actor with `router` as the served application. Ends, after a final
    /// stop, once every handle is dropped.
    pub fn spawn(self, router: Router) -> JoinHandle<()> {
        tokio::spawn(
            self.run(router)
                .instrument(tracing::info_span!("orchestrator")),
        )
    }

    async fn run(mut self, router: Router) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start { config, reply }) => {
                        let result = self.start(config, &router).await;
                        drop(reply.send(result));
                    }
                    Some(Command::Stop { reply }) => {
                        self.stop().await;
                        drop(reply.send(()));
                    }
                    None => break,
                },
                Some(ready) = self.certs_rx.recv() => {
                    self.on_certificate(ready, &router).await;
                }
            }
        }
        self.stop().await;
        debug!("Orchestrator stopped");
    }

    fn update(&self, change: impl FnOnce(&mut ExternalStatus)) {
        self.status.send_modify(change);
        let snapshot = self.status.borrow().clone();
        info!(phase = ?snapshot.phase, active = snapshot.active, mapping = snapshot.gateway_mapping_active, "External status changed");
        self.deps.hub.publish(EXTERNAL_STATUS, &snapshot);
    }

    fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    async fn start(
        &mut self,
        config: ExternalAccessConfig,
        router: &Router,
    ) -> Result<Phase, StartError> {
        let phase = self.phase();
        if phase != Phase::Stopped {
            return Err(StartError::AlreadyRunning(phase));
        }
        if let Err(e) = config.validate() {
            let err = StartError::from(e);
            self.update(|s| s.last_error = Some(StartFailure::from(&err)));
            return Err(err);
        }

        if config.wants_external() {
            self.start_external(config).await
        } else {
            self.start_local(config, router).await
        }
    }

    async fn start_local(
        &mut self,
        config: ExternalAccessConfig,
        router: &Router,
    ) -> Result<Phase, StartError> {
        self.update(|s| {
            s.phase = Phase::StartingLocal;
            s.configured_hostname = None;
            s.running_config = Some(config);
        });
        match self.launch(self.deps.listen, router, None).await {
            Ok(server) => {
                let addr = server.addr;
                self.server = Some(server);
                self.update(|s| {
                    s.phase = Phase::RunningLocal;
                    s.listen_addr = Some(addr);
                });
                info!(%addr, "Serving locally over plain HTTP");
                Ok(Phase::RunningLocal)
            }
            Err(err) => {
                self.update(|s| {
                    s.phase = Phase::Stopped;
                    s.running_config = None;
                    s.last_error = Some(StartFailure::from(&err));
                });
                Err(err)
            }
        }
    }

    async fn start_external(&mut self, config: ExternalAccessConfig) -> Result<Phase, StartError> {
        let hostname = qualified_hostname(&config.hostname_label, &self.deps.hostname_suffix);
        let label = config.hostname_label.clone();
        let token = config.dns_token.clone();
        self.update(|s| {
            s.phase = Phase::StartingExternal;
            s.last_error = None;
            s.configured_hostname = Some(hostname);
            s.running_config = Some(config);
        });

        if let Err(e) = self
            .deps
            .dns
            .update_address(&label, &token, ExternalAddress::ProviderInferred)
            .await
        {
            warn!("Initial DNS update failed, continuing: {e}");
        }

        let (gateway, address) = match self.open_port().await {
            Ok(found) => found,
            Err(e) => {
                let err = StartError::Gateway(e);
                error!("Cannot go external: {err}");
                self.update(|s| {
                    s.phase = Phase::Stopped;
                    s.running_config = None;
                    s.last_error = Some(StartFailure::from(&err));
                });
                return Err(err);
            }
        };
        self.gateway = Some(gateway.clone());
        self.update(|s| {
            s.gateway_mapping_active = true;
            s.external_address = match address {
                ExternalAddress::Known(ip) => Some(ip.to_string()),
                ExternalAddress::ProviderInferred => None,
            };
        });

        self.dns_updater = Some(start_periodic_updates(
            self.deps.dns.clone(),
            label.clone(),
            token.clone(),
            address,
            Some(gateway),
            self.deps.update_interval,
        ));

        self.generation += 1;
        self.spawn_certificate_task(label, token);
        Ok(Phase::StartingExternal)
    }

    async fn open_port(&self) -> Result<(Arc<dyn Gateway>, ExternalAddress), GatewayError> {
        let gateway = self.deps.discovery.discover().await?;
        let local = (self.deps.local_address)()?;
        self.deps
            .port_mapper
            .install_mapping(gateway.as_ref(), local)
            .await?;
        let address = self.deps.port_mapper.external_address(gateway.as_ref()).await;
        Ok((gateway, address))
    }

    /// Certificate acquisition is not cancelled by a stop; a late result is discarded
    /// by generation.
    fn spawn_certificate_task(&self, label: String, token: SecretString) {
        let provisioner = self.deps.provisioner.clone();
        let tx = self.certs_tx.clone();
        let generation = self.generation;
        tokio::spawn(
            async move {
                let result = provisioner.load_or_obtain(&label, &token).await;
                if tx.send(CertificateReady { generation, result }).await.is_err() {
                    debug!("Orchestrator gone, dropping certificate result");
                }
            }
            .in_current_span(),
        );
    }

    async fn on_certificate(&mut self, ready: CertificateReady, router: &Router) {
        if ready.generation != self.generation || self.phase() != Phase::StartingExternal {
            debug!(generation = ready.generation, "Ignoring stale certificate result");
            return;
        }

        let tls = match ready.result {
            Ok(credential) => credential.server_config().map_err(StartError::Certificate),
            Err(e) => Err(StartError::Certificate(e)),
        };
        let server = match tls {
            Ok(tls) => {
                let tls = RustlsConfig::from_config(Arc::new(tls));
                self.launch(self.deps.listen, router, Some(tls)).await
            }
            Err(e) => Err(e),
        };

        match server {
            Ok(server) => {
                let addr = server.addr;
                self.server = Some(server);
                // bound first so the RunningExternal snapshot already carries its address
                self.start_redirect().await;
                self.update(|s| {
                    s.phase = Phase::RunningExternal;
                    s.active = true;
                    s.listen_addr = Some(addr);
                });
                info!(%addr, "Serving externally over TLS");
            }
            Err(err) => {
                error!("External start failed, rolling back: {err}");
                self.teardown_external().await;
                self.update(|s| {
                    s.phase = Phase::Stopped;
                    s.running_config = None;
                    s.last_error = Some(StartFailure::from(&err));
                });
            }
        }
    }

    /// Binds the redirect listener if one is configured. Failing to bind is logged and
    /// leaves external access running.
    async fn start_redirect(&mut self) {
        let Some(listen) = self.deps.redirect_listen else {
            return;
        };
        let Some(hostname) = self.status.borrow().configured_hostname.clone() else {
            return;
        };
        let router = https_redirect_router(&hostname, self.deps.port_mapper.external_port);
        match self.launch(listen, &router, None).await {
            Ok(server) => {
                let addr = server.addr;
                self.redirect = Some(server);
                self.update(|s| s.redirect_addr = Some(addr));
                info!(%addr, "Redirecting plain HTTP to https://{hostname}");
            }
            Err(e) => warn!("HTTP redirect listener not started: {e}"),
        }
    }

    async fn launch(
        &self,
        listen: SocketAddr,
        router: &Router,
        tls: Option<RustlsConfig>,
    ) -> Result<RunningServer, StartError> {
        let handle: Handle<SocketAddr> = Handle::new();
        let app = router.clone().into_make_service();
        let task = match tls {
            Some(tls) => tokio::spawn(
                axum_server::bind_rustls(listen, tls)
                    .handle(handle.clone())
                    .serve(app),
            ),
            None => tokio::spawn(axum_server::bind(listen).handle(handle.clone()).serve(app)),
        };

        if let Some(addr) = handle.listening().await {
            return Ok(RunningServer { handle, task, addr });
        }
        let reason = match task.await {
            Ok(Err(e)) => e.to_string(),
            Ok(Ok(())) => "server exited before listening".to_owned(),
            Err(e) => e.to_string(),
        };
        Err(StartError::Bind(format!("{listen}: {reason}")))
    }

    /// Stops DNS updates, then removes the mapping.
    async fn teardown_external(&mut self) {
        if let Some(updater) = self.dns_updater.take() {
            updater.stop().await;
        }
        if let Some(gateway) = self.gateway.take() {
            self.deps.port_mapper.remove_mapping(gateway.as_ref()).await;
        }
        self.update(|s| {
            s.gateway_mapping_active = false;
            s.external_address = None;
        });
    }

    async fn shut_down(&self, server: RunningServer) {
        server
            .handle
            .graceful_shutdown(Some(self.deps.shutdown_grace));
        let deadline = self.deps.shutdown_grace + Duration::from_secs(1);
        match tokio::time::timeout(deadline, server.task).await {
            Ok(Ok(Ok(()))) => debug!(addr = %server.addr, "Listener shut down"),
            Ok(Ok(Err(e))) => warn!(addr = %server.addr, "Listener ended with error: {e}"),
            Ok(Err(e)) => warn!(addr = %server.addr, "Listener task failed: {e}"),
            Err(_elapsed) => warn!(addr = %server.addr, "Listener did not shut down in time"),
        }
    }

    async fn stop(&mut self) {
        if self.phase() == Phase::Stopped {
            return;
        }
        self.update(|s| s.phase = Phase::Stopping);
        // invalidates a certificate attempt still in flight
        self.generation += 1;

        if let Some(updater) = self.dns_updater.take() {
            updater.stop().await;
        }
        if let Some(redirect) = self.redirect.take() {
            self.shut_down(redirect).await;
        }
        if let Some(server) = self.server.take() {
            self.shut_down(server).await;
        }
        self.teardown_external().await;

        self.update(|s| {
            *s = ExternalStatus {
                last_error: s.last_error.take(),
                configured_hostname: s.configured_hostname.take(),
                ..ExternalStatus::default()
            };
        });
        info!("Server stopped");
    }
}
