//! Generated protocol types shared with the hypervisor agent.

#[allow(clippy::pedantic, reason = "generated code")]
#[allow(missing_debug_implementations, reason = "generated code")]
pub mod agent {
    tonic::include_proto!("hyperlane.agent");
}
