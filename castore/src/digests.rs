use std::str::FromStr;

use thiserror::Error;

use crate::proto;

/// A content fingerprint: the hash of a blob, as produced by the configured
/// [crate::Protocol], plus its exact size in bytes.
///
/// Digests are plain values. Two of them are equal iff both fields match.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hash: String,
    size_bytes: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("negative digest size: {0}")]
    NegativeSize(i64),

    #[error("digest size {0} exceeds the largest size the wire can carry")]
    SizeTooLarge(u64),

    #[error("digest hash may not be empty")]
    EmptyHash,

    #[error("unable to parse digest from {0:?}, expected <hash>/<size>")]
    Unparseable(String),
}

/// Sizes are carried as int64 on the wire.
pub const MAX_SIZE_BYTES: u64 = i64::MAX as u64;

impl Digest {
    /// # Panics
    ///
    /// If `size_bytes` exceeds [MAX_SIZE_BYTES]. No blob held in memory or
    /// on disk gets there. Sizes from untrusted input are checked when
    /// parsing or decoding.
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        assert!(
            size_bytes <= MAX_SIZE_BYTES,
            "digest size {} out of range",
            size_bytes
        );
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// Parses the `hash/size` form also produced by [Display](std::fmt::Display).
impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| Error::Unparseable(s.to_string()))?;

        if hash.is_empty() {
            return Err(Error::EmptyHash);
        }

        let size_bytes = size
            .parse::<u64>()
            .map_err(|_| Error::Unparseable(s.to_string()))?;

        if size_bytes > MAX_SIZE_BYTES {
            return Err(Error::SizeTooLarge(size_bytes));
        }

        Ok(Self::new(hash, size_bytes))
    }
}

impl TryFrom<proto::Digest> for Digest {
    type Error = Error;

    // the wire carries the size as int64, reject anything negative.
    fn try_from(value: proto::Digest) -> Result<Self, Self::Error> {
        let size_bytes =
            u64::try_from(value.size_bytes).map_err(|_| Error::NegativeSize(value.size_bytes))?;

        Ok(Self {
            hash: value.hash,
            size_bytes,
        })
    }
}

impl From<Digest> for proto::Digest {
    fn from(value: Digest) -> Self {
        Self {
            hash: value.hash,
            // in range, see MAX_SIZE_BYTES
            size_bytes: value.size_bytes as i64,
        }
    }
}

impl From<&Digest> for proto::Digest {
    fn from(value: &Digest) -> Self {
        value.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{Digest, Error};
    use crate::proto;

    #[rstest]
    #[case::simple("abc123/11", Ok(Digest::new("abc123", 11)))]
    #[case::empty_blob("e3b0c44298fc1c14/0", Ok(Digest::new("e3b0c44298fc1c14", 0)))]
    #[case::missing_size("abc123", Err(Error::Unparseable("abc123".into())))]
    #[case::negative_size("abc123/-1", Err(Error::Unparseable("abc123/-1".into())))]
    #[case::empty_hash("/11", Err(Error::EmptyHash))]
    #[case::max_size("abc123/9223372036854775807", Ok(Digest::new("abc123", i64::MAX as u64)))]
    #[case::too_large("abc123/9223372036854775808", Err(Error::SizeTooLarge(1 << 63)))]
    fn parse(#[case] s: &str, #[case] expected: Result<Digest, Error>) {
        assert_eq!(expected, s.parse::<Digest>());
    }

    #[test]
    fn display_roundtrips() {
        let digest = Digest::new("abc123", 11);
        assert_eq!("abc123/11", digest.to_string());
        assert_eq!(digest, digest.to_string().parse().unwrap());
    }

    #[test]
    fn equality_needs_both_fields() {
        assert_ne!(Digest::new("abc123", 11), Digest::new("abc123", 12));
        assert_ne!(Digest::new("abc123", 11), Digest::new("abc124", 11));
    }

    #[test]
    fn from_wire_rejects_negative_size() {
        let wire = proto::Digest {
            hash: "abc123".into(),
            size_bytes: -5,
        };

        assert_eq!(Err(Error::NegativeSize(-5)), Digest::try_from(wire));
    }

    #[test]
    fn to_wire_keeps_max_size() {
        let wire = proto::Digest::from(Digest::new("abc123", i64::MAX as u64));
        assert_eq!(i64::MAX, wire.size_bytes);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn new_rejects_size_beyond_wire() {
        Digest::new("abc123", u64::MAX);
    }
}
