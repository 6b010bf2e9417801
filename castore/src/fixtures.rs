use data_encoding::HEXLOWER;
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use tonic::transport::{server::Router, Endpoint, Uri};

use crate::tonic::GrpcChannel;
use crate::{BlobHasher, Digest, Protocol, Sha256Protocol};

pub const HELLO_WORLD: &[u8] = b"hello world";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref HELLO_WORLD_SHA256_DIGEST: Digest = Digest::new(
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        11
    );
    pub static ref EMPTY_BLOB_SHA256_DIGEST: Digest =
        Sha256Protocol::default().compute_digest(EMPTY_BLOB_CONTENTS);

    // 2 bytes
    pub static ref BLOB_A: bytes::Bytes = vec![0x00, 0x01].into();
    pub static ref BLOB_A_SHA256_DIGEST: Digest = Sha256Protocol::default().compute_digest(&BLOB_A);

    // 1MB
    pub static ref BLOB_B: bytes::Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_SHA256_DIGEST: Digest = Sha256Protocol::default().compute_digest(&BLOB_B);

    // 5MB, above the batch upload limit
    pub static ref BLOB_C: bytes::Bytes = (0..255).rev().collect::<Vec<u8>>().repeat(20 * 1024).into();
    pub static ref BLOB_C_SHA256_DIGEST: Digest = Sha256Protocol::default().compute_digest(&BLOB_C);
}

/// A [Protocol] with predictable hashes: "hello world" hashes to `abc123`,
/// everything else to the hex encoding of its bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeProtocol;

impl FakeProtocol {
    fn hash(data: &[u8]) -> String {
        if data == HELLO_WORLD {
            "abc123".to_string()
        } else {
            format!("fake-{}", HEXLOWER.encode(data))
        }
    }
}

struct FakeHasher(Vec<u8>);

impl BlobHasher for FakeHasher {
    fn update(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        FakeProtocol::hash(&self.0)
    }
}

impl Protocol for FakeProtocol {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn compute_digest(&self, data: &[u8]) -> Digest {
        Digest::new(Self::hash(data), data.len() as u64)
    }

    fn new_hasher(&self) -> Box<dyn BlobHasher> {
        Box::new(FakeHasher(Vec::new()))
    }
}

/// Spawns `router` on a server accepting a single in-memory connection, and
/// returns a [GrpcChannel] connected to it. Must be called from within a
/// tokio runtime.
pub fn in_process_channel(router: Router) -> GrpcChannel {
    let (left, right) = tokio::io::duplex(64 * 1024);

    // spin up a server, which will only connect once, to the left side.
    tokio::spawn(router.serve_with_incoming(futures::stream::once(async {
        Ok::<_, std::io::Error>(left)
    })));

    // Create a client, connecting to the right side. The URI is unused.
    let mut maybe_right = Some(right);
    let channel = Endpoint::from_static("http://[::]:50051").connect_with_connector_lazy(
        tower::service_fn(move |_: Uri| {
            let right = maybe_right.take();
            async move {
                right
                    .map(TokioIo::new)
                    .ok_or_else(|| std::io::Error::other("in-process server accepts one connection"))
            }
        }),
    );

    GrpcChannel::new(channel, "in-process")
}
