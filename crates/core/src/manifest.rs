//! The cluster-wide file manifest: an ordered, append-only list of filenames.
//! Serialized as ASCII names separated by `\r\n`. Entries are never removed.

use crate::digest::{digest_bytes, Digest};

/// The manifest is itself transferred as a pseudo-file under this name.
pub const MANIFEST_FILENAME: &str = ".crmanifest";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest entry is not ascii")]
    NotAscii,
    #[error("empty manifest entry")]
    EmptyEntry,
    #[error("duplicate manifest entry: {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    names: Vec<String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut m = Self::new();
        for n in names {
            m.push(n.into())?;
        }
        Ok(m)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Append a single entry. Duplicates are rejected.
    pub fn push(&mut self, name: String) -> Result<(), ManifestError> {
        if name.is_empty() {
            return Err(ManifestError::EmptyEntry);
        }
        if !name.is_ascii() {
            return Err(ManifestError::NotAscii);
        }
        if self.contains(&name) {
            return Err(ManifestError::Duplicate(name));
        }
        self.names.push(name);
        Ok(())
    }

    /// Append every entry of `other` not yet present, preserving `other`'s
    /// order. Returns the newly added names. Idempotent.
    pub fn merge(&mut self, other: &Manifest) -> Vec<String> {
        let mut added = Vec::new();
        for name in &other.names {
            if !self.contains(name) {
                self.names.push(name.clone());
                added.push(name.clone());
            }
        }
        added
    }

    pub fn encode(&self) -> Vec<u8> {
        self.names.join("\r\n").into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ManifestError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ManifestError::NotAscii)?;
        if text.is_empty() {
            return Ok(Self::new());
        }
        Self::from_names(text.split("\r\n"))
    }

    /// Digest of the serialized manifest bytes. Matches the control server's
    /// manifest hash when local and remote manifests agree.
    pub fn digest(&self) -> Digest {
        digest_bytes(&self.encode())
    }
}
