use std::io::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=protos");

    let descriptors = protox::compile(["rexec/worker/v1/worker.proto"], ["protos"])
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    // only messages, the worker protocol isn't gRPC
    tonic_build::configure()
        .build_server(false)
        .build_client(false)
        .emit_rerun_if_changed(false)
        .bytes(["."])
        .compile_fds(descriptors)
}
