//! Push path: agents report what they observe and the control plane merges
//! it into the observed set.
//!
//! The same merge backs the reconciler's optional pull refresh, so both
//! paths and the reconciler's own write-back resolve conflicts the same way:
//! last writer wins by `updated_at`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::error::{StoreError, StoreResult};
use crate::proto::agent::control_plane_service_server::{
    ControlPlaneService, ControlPlaneServiceServer,
};
use crate::proto::agent::{StateReport, VmResponse};
use crate::store::StateStore;
use crate::vm::{RecordSet, RemoteVmStatus, VmRecord, VmState};

/// Image recorded for VMs the control plane has never seen declared.
///
/// A report taken before `hyperlane prune` but received after it lands here
/// too: the pruned name comes back as an orphan observed record with this
/// image. The reconciler never acts on orphans; prune it again once the
/// agent stops reporting the VM.
const UNKNOWN_IMAGE: &str = "unknown";

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    /// Observations written to the store.
    pub merged: usize,
    /// Observations older than what was already stored.
    pub stale: usize,
    /// Observations with an unknown state or unusable fields.
    pub skipped: usize,
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merged {}, stale {}, skipped {}",
            self.merged, self.stale, self.skipped
        )
    }
}

/// Merge agent observations into the observed set.
///
/// Every observation is stamped with `received_at` and written with
/// `put_if_newer`. Names without a desired record are stored too; an
/// observation is not intent. An observed `Destroyed` record is terminal:
/// observations of that name are counted as stale and never written.
///
/// # Errors
///
/// Stops at the first store failure.
pub async fn merge_observations(
    store: &dyn StateStore,
    observations: &[RemoteVmStatus],
    received_at: DateTime<Utc>,
    cancel: &CancellationToken,
) -> StoreResult<MergeSummary> {
    let mut summary = MergeSummary::default();

    for observation in observations {
        let Some(state) = VmState::from_agent(&observation.state) else {
            tracing::debug!(
                vm = %observation.name,
                state = %observation.state,
                "Ignoring observation with unknown state"
            );
            summary.skipped += 1;
            continue;
        };

        let mut record = match base_record(store, &observation.name, cancel).await? {
            Some((RecordSet::Observed, existing)) if existing.state == VmState::Destroyed => {
                tracing::debug!(
                    vm = %observation.name,
                    state = %state,
                    "Ignoring observation of a destroyed VM"
                );
                summary.stale += 1;
                continue;
            }
            Some((_, existing)) => existing,
            None => {
                tracing::debug!(
                    vm = %observation.name,
                    state = %state,
                    "Recording observation without intent"
                );
                VmRecord::new(
                    observation.name.clone(),
                    observation.cpu,
                    observation.ram,
                    UNKNOWN_IMAGE,
                    state,
                )
            }
        };
        if state != VmState::Failed {
            record.last_error = None;
        }
        record.state = state;
        record.cpu = observation.cpu;
        record.ram = observation.ram;
        record.updated_at = received_at;

        if let Err(e) = record.validate() {
            tracing::warn!(vm = %observation.name, error = %e, "Ignoring malformed observation");
            summary.skipped += 1;
            continue;
        }

        if store.put_if_newer(RecordSet::Observed, record).await? {
            summary.merged += 1;
        } else {
            summary.stale += 1;
        }
    }

    Ok(summary)
}

/// The record an observation is layered onto, with the set it came from:
/// the stored observation, or failing that the desired record so the image
/// is carried over.
async fn base_record(
    store: &dyn StateStore,
    name: &str,
    cancel: &CancellationToken,
) -> StoreResult<Option<(RecordSet, VmRecord)>> {
    for set in [RecordSet::Observed, RecordSet::Desired] {
        match store.get(set, name, cancel).await {
            Ok(record) => return Ok(Some((set, record))),
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Listener settings for the report endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Whether `serve` starts the endpoint.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Server certificate (PEM) presented to agents.
    #[serde(default = "default_server_cert")]
    pub server_cert: PathBuf,
    #[serde(default = "default_server_key")]
    pub server_key: PathBuf,
    /// CA (PEM) that agent client certificates must chain to.
    #[serde(default = "default_client_ca")]
    pub client_ca: PathBuf,
}

fn default_enabled() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:50052".to_string()
}

fn default_server_cert() -> PathBuf {
    PathBuf::from("certs/control-plane.crt")
}

fn default_server_key() -> PathBuf {
    PathBuf::from("certs/control-plane.key")
}

fn default_client_ca() -> PathBuf {
    PathBuf::from("certs/ca.crt")
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen_addr: default_listen_addr(),
            server_cert: default_server_cert(),
            server_key: default_server_key(),
            client_ca: default_client_ca(),
        }
    }
}

/// `ControlPlaneService` implementation backed by the state store.
pub struct ReportService {
    store: Arc<dyn StateStore>,
}

impl ReportService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl ControlPlaneService for ReportService {
    async fn report_state(
        &self,
        request: Request<StateReport>,
    ) -> Result<Response<VmResponse>, Status> {
        let report = request.into_inner();
        let observations: Vec<RemoteVmStatus> = report
            .vms
            .into_iter()
            .map(|vm| RemoteVmStatus {
                name: vm.name,
                state: vm.state,
                cpu: vm.cpu,
                ram: vm.ram,
            })
            .collect();

        // A report is short; a stop signal should not leave it half merged
        let summary = merge_observations(
            self.store.as_ref(),
            &observations,
            Utc::now(),
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| {
            tracing::error!(node = %report.node_id, error = %e, "Failed to merge state report");
            Status::unavailable(e.to_string())
        })?;

        tracing::debug!(
            node = %report.node_id,
            merged = summary.merged,
            stale = summary.stale,
            skipped = summary.skipped,
            "State report merged"
        );

        Ok(Response::new(VmResponse {
            success: true,
            message: summary.to_string(),
        }))
    }
}

/// Serve the report endpoint over mTLS until `cancel` fires.
///
/// # Errors
///
/// Fails if the TLS material cannot be read, the address does not parse or
/// the listener cannot be bound.
pub async fn serve(
    store: Arc<dyn StateStore>,
    config: &ReportConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid report listen address '{}'", config.listen_addr))?;

    let cert = std::fs::read(&config.server_cert)
        .with_context(|| format!("reading {}", config.server_cert.display()))?;
    let key = std::fs::read(&config.server_key)
        .with_context(|| format!("reading {}", config.server_key.display()))?;
    let client_ca = std::fs::read(&config.client_ca)
        .with_context(|| format!("reading {}", config.client_ca.display()))?;

    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(client_ca));

    tracing::info!(addr = %addr, "Report endpoint listening");

    Server::builder()
        .tls_config(tls)
        .context("invalid report endpoint TLS configuration")?
        .add_service(ControlPlaneServiceServer::new(ReportService::new(store)))
        .serve_with_shutdown(addr, async move { cancel.cancelled().await })
        .await
        .context("report endpoint failed")?;

    tracing::info!("Report endpoint stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;

    fn status(name: &str, state: &str) -> RemoteVmStatus {
        RemoteVmStatus {
            name: name.into(),
            state: state.into(),
            cpu: 2,
            ram: 2048,
        }
    }

    #[tokio::test]
    async fn test_merge_carries_image_from_desired() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        store
            .put(
                RecordSet::Desired,
                VmRecord::new("web1", 2, 2048, "ubuntu-22.04", VmState::Running),
            )
            .await
            .unwrap();

        let summary = merge_observations(
            &store,
            &[status("web1", "running"), status("stray", "shut off")],
            Utc::now(),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(summary.merged, 2);

        let web1 = store.get(RecordSet::Observed, "web1", &cancel).await.unwrap();
        assert_eq!(web1.image, "ubuntu-22.04");
        assert_eq!(web1.state, VmState::Running);

        let stray = store.get(RecordSet::Observed, "stray", &cancel).await.unwrap();
        assert_eq!(stray.image, UNKNOWN_IMAGE);
        assert_eq!(stray.state, VmState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_state_and_zero_cpu_are_skipped() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        let mut zero_cpu = status("db1", "running");
        zero_cpu.cpu = 0;

        let summary = merge_observations(
            &store,
            &[status("web1", "paused"), zero_cpu],
            Utc::now(),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(summary, MergeSummary { merged: 0, stale: 0, skipped: 2 });
        assert!(store.list(RecordSet::Observed, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_running_report_clears_last_error() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        let mut failed = VmRecord::new("web1", 2, 2048, "ubuntu-22.04", VmState::Failed);
        failed.last_error = Some("Agent call timed out after 5000ms".into());
        store.put(RecordSet::Observed, failed).await.unwrap();

        merge_observations(&store, &[status("web1", "running")], Utc::now(), &cancel)
            .await
            .unwrap();

        let web1 = store.get(RecordSet::Observed, "web1", &cancel).await.unwrap();
        assert_eq!(web1.state, VmState::Running);
        assert_eq!(web1.last_error, None);
    }

    #[tokio::test]
    async fn test_destroyed_record_is_never_revived() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        store
            .put(
                RecordSet::Observed,
                VmRecord::new("web1", 2, 2048, "ubuntu-22.04", VmState::Destroyed),
            )
            .await
            .unwrap();

        let summary = merge_observations(
            &store,
            &[status("web1", "running"), status("web1", "crashed")],
            Utc::now() + chrono::Duration::seconds(60),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(summary, MergeSummary { merged: 0, stale: 2, skipped: 0 });

        let web1 = store.get(RecordSet::Observed, "web1", &cancel).await.unwrap();
        assert_eq!(web1.state, VmState::Destroyed);
    }

    #[tokio::test]
    async fn test_desired_destroyed_does_not_block_observation() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        store
            .put(
                RecordSet::Desired,
                VmRecord::new("web1", 2, 2048, "ubuntu-22.04", VmState::Destroyed),
            )
            .await
            .unwrap();

        let summary = merge_observations(&store, &[status("web1", "running")], Utc::now(), &cancel)
            .await
            .unwrap();
        assert_eq!(summary.merged, 1);

        let web1 = store.get(RecordSet::Observed, "web1", &cancel).await.unwrap();
        assert_eq!(web1.state, VmState::Running);
        assert_eq!(web1.image, "ubuntu-22.04");
    }

    #[tokio::test]
    async fn test_report_state_rpc() {
        let store = Arc::new(InMemoryStateStore::new());
        let service = ReportService::new(Arc::clone(&store) as Arc<dyn StateStore>);

        let response = service
            .report_state(Request::new(StateReport {
                node_id: "node-a".into(),
                vms: vec![crate::proto::agent::VmInfo {
                    name: "web1".into(),
                    state: "running".into(),
                    cpu: 2,
                    ram: 2048,
                }],
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.success);
        assert_eq!(response.message, "merged 1, stale 0, skipped 0");
    }

    #[tokio::test]
    async fn test_report_state_store_down_is_unavailable() {
        let store = Arc::new(InMemoryStateStore::new());
        store.set_unavailable(true);
        let service = ReportService::new(store);

        let status = service
            .report_state(Request::new(StateReport {
                node_id: "node-a".into(),
                vms: vec![crate::proto::agent::VmInfo {
                    name: "web1".into(),
                    state: "running".into(),
                    cpu: 2,
                    ram: 2048,
                }],
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
