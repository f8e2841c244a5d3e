//! Periodic state push to the control plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use crate::hypervisor::Hypervisor;
use crate::proto::agent::control_plane_service_client::ControlPlaneServiceClient;
use crate::service::state_report;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Control plane report endpoint, e.g. `https://control-plane:50052`.
    pub endpoint: String,
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    /// Overrides the TLS server name when non-empty.
    pub domain_name: String,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Pushes `StateReport`s on a fixed interval.
pub struct Reporter {
    hypervisor: Arc<dyn Hypervisor>,
    node_id: String,
    endpoint: Endpoint,
    interval: Duration,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("node_id", &self.node_id)
            .field("endpoint", &self.endpoint.uri())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// # Errors
    ///
    /// Fails if the TLS material cannot be read or the endpoint is invalid.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        node_id: impl Into<String>,
        config: &ReporterConfig,
    ) -> anyhow::Result<Self> {
        let ca = std::fs::read(&config.ca_cert)
            .with_context(|| format!("reading CA certificate {}", config.ca_cert.display()))?;
        let cert = std::fs::read(&config.client_cert).with_context(|| {
            format!("reading client certificate {}", config.client_cert.display())
        })?;
        let key = std::fs::read(&config.client_key)
            .with_context(|| format!("reading client key {}", config.client_key.display()))?;

        let mut tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));
        if !config.domain_name.is_empty() {
            tls = tls.domain_name(config.domain_name.clone());
        }

        let endpoint = Endpoint::from_shared(config.endpoint.clone())
            .with_context(|| format!("invalid report endpoint '{}'", config.endpoint))?
            .tls_config(tls)
            .context("invalid report TLS configuration")?
            .connect_timeout(config.timeout)
            .timeout(config.timeout);

        Ok(Self {
            hypervisor,
            node_id: node_id.into(),
            endpoint,
            interval: config.interval,
        })
    }

    /// Report until `cancel` fires. Failures are logged and retried on the
    /// next interval with a fresh connection.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut client: Option<ControlPlaneServiceClient<Channel>> = None;

        tracing::info!(
            endpoint = %self.endpoint.uri(),
            interval_secs = self.interval.as_secs(),
            "State reporter started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.push(&mut client) => result,
            };
            if let Err(e) = result {
                tracing::warn!(error = %format!("{e:#}"), "State report failed");
                client = None;
            }
        }

        tracing::info!("State reporter stopped");
    }

    async fn push(
        &self,
        client: &mut Option<ControlPlaneServiceClient<Channel>>,
    ) -> anyhow::Result<()> {
        let report = state_report(self.hypervisor.as_ref(), &self.node_id)
            .await
            .context("listing domains")?;
        let count = report.vms.len();

        let mut connected = match client.take() {
            Some(connected) => connected,
            None => {
                let channel = self
                    .endpoint
                    .connect()
                    .await
                    .context("connecting to control plane")?;
                ControlPlaneServiceClient::new(channel)
            }
        };

        let response = connected.report_state(report).await;
        *client = Some(connected);
        let response = response?.into_inner();
        if !response.success {
            anyhow::bail!("control plane rejected report: {}", response.message);
        }
        tracing::debug!(vms = count, result = %response.message, "State reported");
        Ok(())
    }
}
