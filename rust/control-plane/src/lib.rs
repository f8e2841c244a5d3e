//! Hyperlane control plane.
//!
//! Keeps a fleet of VMs converged with operator intent. The operator writes
//! desired records to the [`store`]; the [`reconciler`] compares them with
//! the observed records on every tick and drives the hypervisor agent
//! through the [`agent`] client. Agents may also push what they see through
//! the [`report`] endpoint.

pub mod agent;
pub mod config;
pub mod error;
pub mod logging;
pub mod proto;
pub mod reconciler;
pub mod report;
pub mod store;
pub mod vm;

pub use agent::{Ack, AgentClient, CallContext, GrpcAgentClient};
pub use config::AppConfig;
pub use error::{AgentError, AgentResult, ReconcileError, StoreError, StoreResult};
pub use reconciler::{Reconciler, ReconcilerConfig, TickReport};
pub use store::{InMemoryStateStore, SqliteStateStore, StateStore};
pub use vm::{RecordSet, RemoteVmStatus, VmRecord, VmSpec, VmState};
