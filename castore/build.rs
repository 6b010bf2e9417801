use std::io::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=protos");

    // protox parses the .proto files in-process, so no protoc is needed.
    let descriptors = protox::compile(
        [
            "build/bazel/remote/execution/v2/remote_execution.proto",
            "google/bytestream/bytestream.proto",
            "google/longrunning/operations.proto",
            "google/rpc/status.proto",
            "rexec/metadata/v1/metadata.proto",
        ],
        ["protos"],
    )
    .map_err(|e| std::io::Error::other(e.to_string()))?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .emit_rerun_if_changed(false)
        .bytes(["."])
        .compile_fds(descriptors)
}
