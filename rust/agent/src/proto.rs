//! Generated agent protocol types.

#[allow(clippy::pedantic, reason = "generated code")]
#[allow(missing_debug_implementations, reason = "generated code")]
pub mod agent {
    tonic::include_proto!("hyperlane.agent");
}
