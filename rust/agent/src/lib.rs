//! Hyperlane hypervisor agent.
//!
//! Serves the `VmService` lifecycle contract on one node and, optionally,
//! pushes the node's domain list back to the control plane.

pub mod error;
pub mod hypervisor;
pub mod libvirt;
pub mod logging;
pub mod proto;
pub mod reporter;
pub mod runner;
pub mod service;

pub use error::{HypervisorError, HypervisorResult};
pub use hypervisor::{DomainSpec, DomainState, DomainStatus, Hypervisor};
pub use libvirt::{LibvirtConfig, LibvirtHypervisor};
pub use reporter::{Reporter, ReporterConfig};
pub use runner::{CommandRunner, SystemRunner};
pub use service::VmServiceImpl;
