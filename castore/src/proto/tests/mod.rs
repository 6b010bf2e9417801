use std::time::Duration;

use prost::Message;

use super::{
    execute_operation_metadata::Stage, make_request, make_untimed_request, request_metadata, Any,
    AnyExt, BuildInfo, ExecuteOperationMetadata, ExecuteResponse, RemoteExecutionMetadata,
    RpcStatus, METADATA_HEADER,
};

#[test]
fn any_roundtrip_by_type() {
    let metadata = ExecuteOperationMetadata {
        stage: Stage::Executing as i32,
        action_digest: None,
    };

    let any = Any::pack(&metadata);
    assert_eq!(
        "type.googleapis.com/build.bazel.remote.execution.v2.ExecuteOperationMetadata",
        any.type_url
    );

    let unpacked: ExecuteOperationMetadata = any
        .unpack()
        .expect("must decode")
        .expect("must be of that type");
    assert_eq!(Stage::Executing, unpacked.stage());
}

/// Unpacking as a different type yields None, not garbage.
#[test]
fn any_unpack_wrong_type() {
    let any = Any::pack(&ExecuteResponse::default());

    assert_eq!(
        None,
        any.unpack::<ExecuteOperationMetadata>()
            .expect("must not fail")
    );
}

#[test]
fn rpc_status_into_tonic() {
    let status: tonic::Status = RpcStatus {
        code: tonic::Code::NotFound as i32,
        message: "missing input".into(),
        details: vec![],
    }
    .into();

    assert_eq!(tonic::Code::NotFound, status.code());
    assert_eq!("missing input", status.message());
}

/// Requests carry the metadata envelope as a binary header, and a timeout.
#[test]
fn request_carries_metadata() {
    let metadata = RemoteExecutionMetadata {
        build_info: Some(BuildInfo {
            build_id: "build-1".into(),
            rule_name: "//foo:bar".into(),
        }),
        ..Default::default()
    };

    let request = make_request((), &metadata, Duration::from_secs(5));

    let header = request
        .metadata()
        .get_bin(METADATA_HEADER)
        .expect("header must be set")
        .to_bytes()
        .expect("must decode base64");

    assert_eq!(
        metadata,
        RemoteExecutionMetadata::decode(header).expect("must decode")
    );
    assert!(request.metadata().get("grpc-timeout").is_some());
    assert_eq!(Some(metadata), request_metadata(&request));
}

#[test]
fn untimed_request_has_no_timeout() {
    let request = make_untimed_request((), &RemoteExecutionMetadata::default());

    assert!(request.metadata().get_bin(METADATA_HEADER).is_some());
    assert!(request.metadata().get("grpc-timeout").is_none());
}

#[test]
fn request_without_metadata() {
    assert_eq!(None, request_metadata(&tonic::Request::new(())));
}
