//! The `.crinfo` descriptor: size, timestamp, and content digest of a shared
//! file. Two ASCII-prefixed lines on disk:
//!
//! ```text
//! CRINFO {size} {unix_ts}\r\n
//! {hex_hash}
//! ```

use crate::digest::{digest_bytes, Digest};

/// Cluster-wide block size. Every peer must agree on this; it is sized so a
/// full block plus the BLOCK_RESPONSE payload framing fits in one datagram.
pub const BLOCK_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InfoError {
    #[error("malformed crinfo: {0}")]
    Malformed(&'static str),
}

/// Descriptor for a single shared file. A file's `content_hash` uniquely
/// identifies it within a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub file_size: u64,
    pub created_at: u64,
    pub content_hash: Digest,
}

impl FileInfo {
    /// Build a descriptor for `data` as it would be shared under `filename`.
    pub fn from_bytes(filename: &str, data: &[u8], created_at: u64) -> Self {
        Self {
            filename: filename.to_string(),
            file_size: data.len() as u64,
            created_at,
            content_hash: digest_bytes(data),
        }
    }

    pub fn block_count(&self) -> u32 {
        block_count_for(self.file_size)
    }

    /// Length of block `block_id`: `BLOCK_SIZE` except for a short final block.
    pub fn block_len(&self, block_id: u32) -> Option<usize> {
        if block_id >= self.block_count() {
            return None;
        }
        let start = block_id as u64 * BLOCK_SIZE as u64;
        Some(((self.file_size - start).min(BLOCK_SIZE as u64)) as usize)
    }

    /// Entries sharing a `content_hash` are the same file.
    pub fn same_content(&self, other: &FileInfo) -> bool {
        self.content_hash == other.content_hash
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "CRINFO {} {}\r\n{}",
            self.file_size,
            self.created_at,
            self.content_hash.to_hex()
        )
        .into_bytes()
    }

    /// Parse `.crinfo` bytes. The filename is not part of the on-disk format;
    /// it comes from the file's path or the enclosing message.
    pub fn decode(filename: &str, bytes: &[u8]) -> Result<Self, InfoError> {
        let text = std::str::from_utf8(bytes).map_err(|_| InfoError::Malformed("not ascii"))?;
        let (header, hash_line) = text
            .split_once("\r\n")
            .ok_or(InfoError::Malformed("missing header line"))?;
        let mut fields = header.split(' ');
        if fields.next() != Some("CRINFO") {
            return Err(InfoError::Malformed("bad magic"));
        }
        let file_size = fields
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(InfoError::Malformed("bad size"))?;
        let created_at = fields
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(InfoError::Malformed("bad timestamp"))?;
        if fields.next().is_some() {
            return Err(InfoError::Malformed("trailing header fields"));
        }
        let content_hash = hash_line
            .trim_end_matches(['\r', '\n'])
            .parse::<Digest>()
            .map_err(|_| InfoError::Malformed("bad hash"))?;
        Ok(Self {
            filename: filename.to_string(),
            file_size,
            created_at,
            content_hash,
        })
    }
}

pub fn block_count_for(file_size: u64) -> u32 {
    file_size.div_ceil(BLOCK_SIZE as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let info = FileInfo::from_bytes("hello.txt", &[7u8; 3000], 1_700_000_000);
        let decoded = FileInfo::decode("hello.txt", &info.encode()).unwrap();
        assert_eq!(info, decoded);
    }

    #[test]
    fn block_math() {
        let info = FileInfo::from_bytes("hello.txt", &[0u8; 3000], 0);
        assert_eq!(info.block_count(), 3);
        assert_eq!(info.block_len(0), Some(1024));
        assert_eq!(info.block_len(1), Some(1024));
        assert_eq!(info.block_len(2), Some(952));
        assert_eq!(info.block_len(3), None);

        let exact = FileInfo::from_bytes("x", &[0u8; 2048], 0);
        assert_eq!(exact.block_count(), 2);
        assert_eq!(exact.block_len(1), Some(1024));

        let empty = FileInfo::from_bytes("x", &[], 0);
        assert_eq!(empty.block_count(), 0);
    }

    #[test]
    fn same_content_ignores_name() {
        let a = FileInfo::from_bytes("a.txt", b"data", 1);
        let b = FileInfo::from_bytes("b.txt", b"data", 2);
        assert!(a.same_content(&b));
    }

    #[test]
    fn rejects_malformed() {
        assert!(FileInfo::decode("f", b"").is_err());
        assert!(FileInfo::decode("f", b"CRINFO 10\r\nabcd").is_err());
        assert!(FileInfo::decode("f", b"NOTCR 10 5\r\nabcd").is_err());
        assert!(FileInfo::decode("f", b"CRINFO 10 5\r\nnothex").is_err());
        assert!(FileInfo::decode("f", b"CRINFO 10 5 9\r\nabcd").is_err());
    }
}
