use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::error::{HypervisorError, HypervisorResult};
use crate::hypervisor::{validate_identifier, DomainSpec, DomainStatus, Hypervisor};
use crate::proto::agent::vm_service_server::{VmService, VmServiceServer};
use crate::proto::agent::{
    CreateVmRequest, DestroyVmRequest, FetchStateRequest, StateReport, StopVmRequest, VmInfo,
    VmResponse,
};

/// `VmService` implementation over a [`Hypervisor`].
///
/// Commands for the same VM name run one at a time; different names proceed
/// in parallel.
pub struct VmServiceImpl {
    hypervisor: Arc<dyn Hypervisor>,
    node_id: String,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VmServiceImpl {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, node_id: impl Into<String>) -> Self {
        Self {
            hypervisor,
            node_id: node_id.into(),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn into_service(self) -> VmServiceServer<Self> {
        VmServiceServer::new(self)
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        // Drop locks nobody holds or waits on
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    async fn exclusive<F>(&self, name: &str, op: F) -> HypervisorResult<String>
    where
        F: std::future::Future<Output = HypervisorResult<String>>,
    {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        op.await
    }
}

impl std::fmt::Debug for VmServiceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmServiceImpl")
            .field("node_id", &self.node_id)
            .field("active_locks", &self.locks.lock().len())
            .finish_non_exhaustive()
    }
}

/// Snapshot of the node's domains in wire form.
pub async fn state_report(
    hypervisor: &dyn Hypervisor,
    node_id: &str,
) -> HypervisorResult<StateReport> {
    let vms = hypervisor
        .list()
        .await?
        .into_iter()
        .map(vm_info)
        .collect();
    Ok(StateReport {
        vms,
        node_id: node_id.to_string(),
    })
}

fn vm_info(status: DomainStatus) -> VmInfo {
    VmInfo {
        state: status.state.as_str().to_string(),
        name: status.name,
        cpu: status.cpu,
        ram: status.ram,
    }
}

/// Invalid input is a caller bug and surfaces as a gRPC status; anything the
/// hypervisor refused is reported in the response body.
fn respond(
    command: &str,
    name: &str,
    result: HypervisorResult<String>,
) -> Result<Response<VmResponse>, Status> {
    match result {
        Ok(message) => {
            info!(command, vm = %name, message = %message, "Command completed");
            Ok(Response::new(VmResponse {
                success: true,
                message,
            }))
        }
        Err(HypervisorError::InvalidRequest(message)) => Err(Status::invalid_argument(message)),
        Err(e) => {
            warn!(command, vm = %name, error = %e, "Command failed");
            Ok(Response::new(VmResponse {
                success: false,
                message: e.to_string(),
            }))
        }
    }
}

#[tonic::async_trait]
impl VmService for VmServiceImpl {
    async fn create_vm(
        &self,
        request: Request<CreateVmRequest>,
    ) -> Result<Response<VmResponse>, Status> {
        let req = request.into_inner();
        let spec = DomainSpec {
            name: req.name,
            cpu: req.cpu,
            ram: req.ram,
            image: req.image,
        };
        if let Err(e) = spec.validate() {
            return respond("create", &spec.name, Err(e));
        }

        info!(vm = %spec.name, image = %spec.image, cpu = spec.cpu, ram = spec.ram, "CreateVm");
        let result = self
            .exclusive(&spec.name, self.hypervisor.create(&spec))
            .await;
        respond("create", &spec.name, result)
    }

    async fn stop_vm(
        &self,
        request: Request<StopVmRequest>,
    ) -> Result<Response<VmResponse>, Status> {
        let name = request.into_inner().name;
        if let Err(e) = validate_identifier("name", &name) {
            return respond("stop", &name, Err(e));
        }

        info!(vm = %name, "StopVm");
        let result = self.exclusive(&name, self.hypervisor.stop(&name)).await;
        respond("stop", &name, result)
    }

    async fn destroy_vm(
        &self,
        request: Request<DestroyVmRequest>,
    ) -> Result<Response<VmResponse>, Status> {
        let name = request.into_inner().name;
        if let Err(e) = validate_identifier("name", &name) {
            return respond("destroy", &name, Err(e));
        }

        info!(vm = %name, "DestroyVm");
        let result = self.exclusive(&name, self.hypervisor.destroy(&name)).await;
        respond("destroy", &name, result)
    }

    async fn fetch_state(
        &self,
        _request: Request<FetchStateRequest>,
    ) -> Result<Response<StateReport>, Status> {
        match state_report(self.hypervisor.as_ref(), &self.node_id).await {
            Ok(report) => Ok(Response::new(report)),
            Err(e) => {
                warn!(error = %e, "Failed to list domains");
                Err(Status::internal(e.to_string()))
            }
        }
    }
}
