mod digests;
mod errors;
mod protocol;

pub mod cas;
pub mod fixtures;
pub mod proto;
pub mod tonic;

pub use digests::{Digest, Error as DigestError};
pub use errors::Error;
pub use protocol::{
    protocol_from_name, Blake3Protocol, BlobHasher, DigestProtocol, Protocol, Sha1Protocol,
    Sha256Protocol,
};
