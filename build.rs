use std::env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 🛡️ SLA: Protocol Buffer Compilation
    // Re-run only when the operator contract changes.
    println!("cargo:rerun-if-changed=proto/devcenter/agent/v1/agent.proto");

    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // tonic-build reads PROTOC from the environment of this build script.
    unsafe {
        env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        // 🛡️ Zero-Trust: The agent is strictly a SERVER. No client stubs are generated.
        .build_client(false)
        .build_server(true)
        .compile(&["proto/devcenter/agent/v1/agent.proto"], &["proto"])?;

    Ok(())
}
