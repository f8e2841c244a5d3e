//! tonic client for the hypervisor agent's `VmService`.
//!
//! The channel is mutually authenticated: the agent's certificate is checked
//! against the configured CA and the control plane presents its own client
//! identity. Connection is lazy; the first call connects and the channel is
//! cached for every later call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use super::{Ack, AgentClient, CallContext};
use crate::error::{AgentError, AgentResult};
use crate::proto::agent::vm_service_client::VmServiceClient;
use crate::proto::agent::{
    CreateVmRequest, DestroyVmRequest, FetchStateRequest, StopVmRequest, VmResponse,
};
use crate::vm::{RemoteVmStatus, VmSpec};

/// Where the agent lives and how to authenticate to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    /// gRPC endpoint address (e.g., "https://localhost:50051").
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// CA certificate (PEM) used as the trust anchor for the agent.
    #[serde(default = "default_ca_cert")]
    pub ca_cert: PathBuf,
    /// Client certificate (PEM) presented to the agent.
    #[serde(default = "default_client_cert")]
    pub client_cert: PathBuf,
    /// Client private key (PEM).
    #[serde(default = "default_client_key")]
    pub client_key: PathBuf,
    /// Name expected in the agent's certificate.
    #[serde(default = "default_domain_name")]
    pub domain_name: String,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://localhost:50051".to_string()
}

fn default_ca_cert() -> PathBuf {
    PathBuf::from("certs/ca.crt")
}

fn default_client_cert() -> PathBuf {
    PathBuf::from("certs/control-plane.crt")
}

fn default_client_key() -> PathBuf {
    PathBuf::from("certs/control-plane.key")
}

fn default_domain_name() -> String {
    "localhost".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for AgentEndpointConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            ca_cert: default_ca_cert(),
            client_cert: default_client_cert(),
            client_key: default_client_key(),
            domain_name: default_domain_name(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Agent client over mTLS gRPC.
pub struct GrpcAgentClient {
    endpoint: Endpoint,
    address: String,
    client: Mutex<Option<VmServiceClient<Channel>>>,
}

impl GrpcAgentClient {
    /// Load the TLS material and prepare the endpoint. Nothing is dialled
    /// until the first call.
    ///
    /// # Errors
    ///
    /// `AuthError` when a certificate or key cannot be read or the TLS
    /// configuration is rejected, `Unavailable` for a malformed endpoint.
    pub fn new(config: &AgentEndpointConfig) -> AgentResult<Self> {
        let ca = read_pem(&config.ca_cert, "CA certificate")?;
        let cert = read_pem(&config.client_cert, "client certificate")?;
        let key = read_pem(&config.client_key, "client key")?;

        let mut tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));
        if !config.domain_name.is_empty() {
            tls = tls.domain_name(config.domain_name.clone());
        }

        let endpoint = Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| {
                AgentError::Unavailable(format!("invalid endpoint '{}': {e}", config.endpoint))
            })?
            .tls_config(tls)
            .map_err(|e| AgentError::AuthError(format!("invalid TLS configuration: {e}")))?
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        Ok(Self {
            endpoint,
            address: config.endpoint.clone(),
            client: Mutex::new(None),
        })
    }

    /// Get or create the gRPC client with lazy connection.
    ///
    /// A failed connect is reported to the caller and not retried here; the
    /// next call dials again.
    async fn client(&self) -> AgentResult<VmServiceClient<Channel>> {
        let mut cached = self.client.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }

        let channel = self.endpoint.connect().await.map_err(|e| {
            let err = AgentError::from(e);
            tracing::warn!(endpoint = %self.address, error = %err, "Failed to connect to agent");
            err
        })?;
        tracing::info!(endpoint = %self.address, "Connected to agent");

        let client = VmServiceClient::new(channel);
        *cached = Some(client.clone());
        Ok(client)
    }
}

impl std::fmt::Debug for GrpcAgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcAgentClient")
            .field("endpoint", &self.address)
            .finish_non_exhaustive()
    }
}

fn read_pem(path: &Path, what: &str) -> AgentResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| AgentError::AuthError(format!("cannot read {what} {}: {e}", path.display())))
}

fn into_ack(response: VmResponse) -> AgentResult<Ack> {
    if response.success {
        Ok(Ack {
            message: response.message,
        })
    } else {
        Err(AgentError::RemoteError(response.message))
    }
}

#[async_trait]
impl AgentClient for GrpcAgentClient {
    async fn create_vm(&self, spec: &VmSpec, ctx: &CallContext) -> AgentResult<Ack> {
        ctx.run(async {
            let mut client = self.client().await?;
            let response = client
                .create_vm(CreateVmRequest {
                    name: spec.name.clone(),
                    cpu: spec.cpu,
                    ram: spec.ram,
                    image: spec.image.clone(),
                })
                .await?;
            into_ack(response.into_inner())
        })
        .await
    }

    async fn stop_vm(&self, name: &str, ctx: &CallContext) -> AgentResult<Ack> {
        ctx.run(async {
            let mut client = self.client().await?;
            let response = client
                .stop_vm(StopVmRequest {
                    name: name.to_string(),
                })
                .await?;
            into_ack(response.into_inner())
        })
        .await
    }

    async fn destroy_vm(&self, name: &str, ctx: &CallContext) -> AgentResult<Ack> {
        ctx.run(async {
            let mut client = self.client().await?;
            let response = client
                .destroy_vm(DestroyVmRequest {
                    name: name.to_string(),
                })
                .await?;
            into_ack(response.into_inner())
        })
        .await
    }

    async fn fetch_state(&self, ctx: &CallContext) -> AgentResult<Vec<RemoteVmStatus>> {
        ctx.run(async {
            let mut client = self.client().await?;
            let report = client.fetch_state(FetchStateRequest {}).await?.into_inner();
            Ok(report
                .vms
                .into_iter()
                .map(|vm| RemoteVmStatus {
                    name: vm.name,
                    state: vm.state,
                    cpu: vm.cpu,
                    ram: vm.ram,
                })
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = AgentEndpointConfig::default();
        assert_eq!(config.endpoint, "https://localhost:50051");
        assert_eq!(config.ca_cert, PathBuf::from("certs/ca.crt"));
        assert_eq!(config.connect_timeout_secs, 5);
    }

    #[test]
    fn test_missing_certificate_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentEndpointConfig {
            ca_cert: dir.path().join("missing-ca.crt"),
            ..AgentEndpointConfig::default()
        };

        let err = GrpcAgentClient::new(&config).unwrap_err();
        assert!(matches!(err, AgentError::AuthError(ref m) if m.contains("CA certificate")));
    }

    #[test]
    fn test_unsuccessful_response_is_remote_error() {
        let err = into_ack(VmResponse {
            success: false,
            message: "zfs clone failed".into(),
        })
        .unwrap_err();
        assert_eq!(err, AgentError::RemoteError("zfs clone failed".into()));

        let ack = into_ack(VmResponse {
            success: true,
            message: "VM web1 created".into(),
        })
        .unwrap();
        assert_eq!(ack.message, "VM web1 created");
    }
}
