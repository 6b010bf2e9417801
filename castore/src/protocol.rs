use std::marker::PhantomData;

use data_encoding::HEXLOWER;

use crate::Digest;

/// An incremental hasher, handed out by [Protocol::new_hasher] for streaming use.
pub trait BlobHasher: Send {
    fn update(&mut self, data: &[u8]);

    /// Consume the hasher and return the hash of everything fed into it,
    /// in the encoding the [Protocol] uses for [Digest] hashes.
    fn finalize_hex(self: Box<Self>) -> String;
}

/// Everything the dispatch logic needs to know about the wire schema and the
/// hash function, without depending on either.
///
/// A Protocol is constructed once and passed into the clients, which hold it
/// for their whole lifetime.
pub trait Protocol: Send + Sync {
    /// The name of the hash function, as accepted by [protocol_from_name].
    fn name(&self) -> &'static str;

    fn compute_digest(&self, data: &[u8]) -> Digest;

    fn new_hasher(&self) -> Box<dyn BlobHasher>;

    /// The ByteStream resource name used to read the blob identified by the
    /// passed [Digest].
    fn read_resource_name(&self, instance_name: &str, digest: &Digest) -> String {
        format!(
            "{}blobs/{}/{}",
            instance_prefix(instance_name),
            digest.hash(),
            digest.size_bytes()
        )
    }

    /// The ByteStream resource name used to upload the blob identified by the
    /// passed [Digest]. `upload_id` must be unique per upload.
    fn write_resource_name(&self, instance_name: &str, upload_id: &str, digest: &Digest) -> String {
        format!(
            "{}uploads/{}/blobs/{}/{}",
            instance_prefix(instance_name),
            upload_id,
            digest.hash(),
            digest.size_bytes()
        )
    }
}

// An empty instance name doesn't produce an empty leading path segment.
fn instance_prefix(instance_name: &str) -> String {
    if instance_name.is_empty() {
        String::new()
    } else {
        format!("{}/", instance_name)
    }
}

/// A [Protocol] using any [digest::Digest] implementation, with lowercase hex
/// encoded hashes.
pub struct DigestProtocol<H> {
    name: &'static str,
    _hasher: PhantomData<fn() -> H>,
}

impl<H> DigestProtocol<H> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _hasher: PhantomData,
        }
    }
}

pub type Sha256Protocol = DigestProtocol<sha2::Sha256>;
pub type Sha1Protocol = DigestProtocol<sha1::Sha1>;
pub type Blake3Protocol = DigestProtocol<blake3::Hasher>;

impl Default for Sha256Protocol {
    fn default() -> Self {
        Self::new("sha256")
    }
}

impl Default for Sha1Protocol {
    fn default() -> Self {
        Self::new("sha1")
    }
}

impl Default for Blake3Protocol {
    fn default() -> Self {
        Self::new("blake3")
    }
}

struct DigestHasher<H>(H);

impl<H> BlobHasher for DigestHasher<H>
where
    H: digest::Digest + Send,
{
    fn update(&mut self, data: &[u8]) {
        digest::Digest::update(&mut self.0, data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        HEXLOWER.encode(&self.0.finalize())
    }
}

impl<H> Protocol for DigestProtocol<H>
where
    H: digest::Digest + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn compute_digest(&self, data: &[u8]) -> Digest {
        Digest::new(HEXLOWER.encode(&H::digest(data)), data.len() as u64)
    }

    fn new_hasher(&self) -> Box<dyn BlobHasher> {
        Box::new(DigestHasher(H::new()))
    }
}

/// Returns the [Protocol] for the passed hash function name.
pub fn protocol_from_name(name: &str) -> Option<Box<dyn Protocol>> {
    match name {
        "sha256" => Some(Box::<Sha256Protocol>::default()),
        "sha1" => Some(Box::<Sha1Protocol>::default()),
        "blake3" => Some(Box::<Blake3Protocol>::default()),
        _ => None,
    }
}
