//! Content digests: blake3, 32 bytes, lowercase hex on the wire.

use std::fmt;
use std::str::FromStr;

use crate::id::{parse_hex32, to_hex32, IdError};

pub const DIGEST_LEN: usize = 32;

/// Digest over file content, manifest bytes, or anything else that needs a
/// stable identity within a cluster.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex32(&self.0)
    }
}

impl FromStr for Digest {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, IdError> {
        Ok(Self(parse_hex32(s)?))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}..)", &self.to_hex()[..8])
    }
}

/// blake3(data) -> 32-byte digest
pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest(*blake3::hash(data).as_bytes())
}
