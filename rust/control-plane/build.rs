//! Build script for hyperlane-control.
//!
//! Generates the `VmService` client and the `ControlPlaneService` server
//! from the shared agent protocol.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Ensure a usable `protoc` is available (vendored fallback)
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(pb) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", pb);
        }
    }

    let proto_root = "../../protos";
    let agent_proto = format!("{proto_root}/agent/agent.proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[agent_proto.as_str()], &[proto_root])?;

    println!("cargo:rerun-if-changed={agent_proto}");
    Ok(())
}
