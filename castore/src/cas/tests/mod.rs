use std::sync::Arc;

use bytes::Bytes;
use rstest::{fixture, rstest};

use super::{materialize_outputs, ContentAddressedStorage, MemoryCas};
use crate::fixtures::{self, FakeProtocol};
use crate::{Digest, Error, Protocol, Sha256Protocol};

mod utils;

#[fixture]
fn cas() -> MemoryCas {
    MemoryCas::new(Arc::new(Sha256Protocol::default()))
}

/// Writing a blob, then reading it back, yields the exact same bytes.
#[rstest]
#[case::empty(Bytes::from_static(fixtures::EMPTY_BLOB_CONTENTS))]
#[case::small(fixtures::BLOB_A.clone())]
#[case::chunked(fixtures::BLOB_B.clone())]
#[tokio::test]
async fn write_then_read(cas: MemoryCas, #[case] data: Bytes) {
    let digest = Sha256Protocol::default().compute_digest(&data);

    cas.write(&digest, data.clone()).await.expect("must succeed");

    let mut sink = Vec::new();
    cas.read(&digest, &mut sink).await.expect("must succeed");
    assert_eq!(data.to_vec(), sink);
}

#[rstest]
#[tokio::test]
async fn read_missing_blob(cas: MemoryCas) {
    let mut sink = Vec::new();

    let err = cas
        .read(&fixtures::HELLO_WORLD_SHA256_DIGEST, &mut sink)
        .await
        .expect_err("must fail");

    assert!(matches!(err, Error::Transport(status) if status.code() == tonic::Code::NotFound));
}

/// Data not matching its digest is refused on the way in.
#[rstest]
#[tokio::test]
async fn upload_rejects_mismatch(cas: MemoryCas) {
    let err = cas
        .upload(vec![(
            fixtures::HELLO_WORLD_SHA256_DIGEST.clone(),
            Bytes::from_static(b"hello worlx"),
        )])
        .await
        .expect_err("must fail");

    assert!(matches!(err, Error::Upload { .. }));
    assert!(!cas.contains(&fixtures::HELLO_WORLD_SHA256_DIGEST));
}

/// Only blobs the store lacks get uploaded, small ones batched, big ones
/// streamed on their own.
#[rstest]
#[tokio::test]
async fn add_missing(cas: MemoryCas) {
    cas.write(&fixtures::BLOB_A_SHA256_DIGEST, fixtures::BLOB_A.clone())
        .await
        .expect("must succeed");

    let uploaded = cas
        .add_missing(vec![
            (fixtures::BLOB_A_SHA256_DIGEST.clone(), fixtures::BLOB_A.clone()),
            (fixtures::BLOB_B_SHA256_DIGEST.clone(), fixtures::BLOB_B.clone()),
            (fixtures::BLOB_C_SHA256_DIGEST.clone(), fixtures::BLOB_C.clone()),
            (
                fixtures::HELLO_WORLD_SHA256_DIGEST.clone(),
                Bytes::from_static(fixtures::HELLO_WORLD),
            ),
        ])
        .await
        .expect("must succeed");

    assert_eq!(
        vec![
            fixtures::BLOB_B_SHA256_DIGEST.clone(),
            fixtures::BLOB_C_SHA256_DIGEST.clone(),
            fixtures::HELLO_WORLD_SHA256_DIGEST.clone(),
        ],
        uploaded
    );

    // BLOB_B and HELLO_WORLD fit into one batch, BLOB_C is too big for one.
    assert_eq!(1, cas.batch_uploads());
    assert_eq!(2, cas.stream_writes());

    assert!(cas
        .find_missing(&uploaded)
        .await
        .expect("must succeed")
        .is_empty());
}

#[rstest]
#[tokio::test]
async fn add_missing_nothing_missing(cas: MemoryCas) {
    let blobs = vec![(fixtures::BLOB_A_SHA256_DIGEST.clone(), fixtures::BLOB_A.clone())];
    cas.add_missing(blobs.clone()).await.expect("must succeed");

    assert!(cas
        .add_missing(blobs)
        .await
        .expect("must succeed")
        .is_empty());
    assert_eq!(1, cas.batch_uploads());
}

#[rstest]
#[tokio::test]
async fn fetch(cas: MemoryCas) {
    cas.write(&fixtures::BLOB_B_SHA256_DIGEST, fixtures::BLOB_B.clone())
        .await
        .expect("must succeed");

    assert_eq!(
        *fixtures::BLOB_B,
        cas.fetch(&fixtures::BLOB_B_SHA256_DIGEST)
            .await
            .expect("must succeed")
    );
}

/// The store handing back "hello world" for abc123/11 passes verification.
#[tokio::test]
async fn scenario_matching_blob() {
    let cas = MemoryCas::new(Arc::new(FakeProtocol));
    let digest = Digest::new("abc123", 11);
    cas.write(&digest, Bytes::from_static(b"hello world"))
        .await
        .expect("must succeed");

    let mut sink = Vec::new();
    cas.read(&digest, &mut sink).await.expect("must succeed");

    assert_eq!(b"hello world".to_vec(), sink);
}

/// The store handing back "hello worlx" for abc123/11 must not be accepted.
#[tokio::test]
async fn scenario_corrupted_blob() {
    let cas = MemoryCas::new(Arc::new(FakeProtocol));
    let digest = Digest::new("abc123", 11);
    cas.insert_unchecked(digest.clone(), Bytes::from_static(b"hello worlx"));

    let err = cas.fetch(&digest).await.expect_err("must fail");

    match err {
        Error::Integrity {
            expected,
            observed_hash,
            observed_size,
        } => {
            assert_eq!(digest, expected);
            assert_eq!(FakeProtocol.compute_digest(b"hello worlx").hash(), observed_hash);
            assert_eq!(11, observed_size);
        }
        e => panic!("unexpected error: {}", e),
    }
}

#[rstest]
#[tokio::test]
async fn materialize(cas: MemoryCas) {
    let tmpdir = tempfile::TempDir::new().unwrap();

    cas.add_missing(vec![
        (fixtures::BLOB_A_SHA256_DIGEST.clone(), fixtures::BLOB_A.clone()),
        (fixtures::BLOB_B_SHA256_DIGEST.clone(), fixtures::BLOB_B.clone()),
    ])
    .await
    .expect("must succeed");

    let path_a = tmpdir.path().join("out/a.bin");
    let path_b = tmpdir.path().join("out/nested/b.bin");

    materialize_outputs(
        &cas,
        vec![
            (fixtures::BLOB_A_SHA256_DIGEST.clone(), path_a.clone()),
            (fixtures::BLOB_B_SHA256_DIGEST.clone(), path_b.clone()),
        ],
        2,
    )
    .await
    .expect("must succeed");

    assert_eq!(fixtures::BLOB_A.to_vec(), std::fs::read(&path_a).unwrap());
    assert_eq!(fixtures::BLOB_B.to_vec(), std::fs::read(&path_b).unwrap());
    assert!(!tmpdir.path().join("out/a.bin.partial").exists());
}

/// A blob failing verification leaves neither the output nor the partial
/// file behind.
#[rstest]
#[tokio::test]
async fn materialize_corrupted(cas: MemoryCas) {
    let tmpdir = tempfile::TempDir::new().unwrap();
    cas.insert_unchecked(
        fixtures::HELLO_WORLD_SHA256_DIGEST.clone(),
        Bytes::from_static(b"hello worlx"),
    );

    let path = tmpdir.path().join("hello.txt");

    let err = materialize_outputs(
        &cas,
        vec![(fixtures::HELLO_WORLD_SHA256_DIGEST.clone(), path.clone())],
        4,
    )
    .await
    .expect_err("must fail");

    assert!(matches!(err, Error::Integrity { .. }));
    assert!(!path.exists());
    assert!(!tmpdir.path().join("hello.txt.partial").exists());
}
