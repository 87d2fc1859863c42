//! Persistence for the cluster manifest and its descriptor.
//!
//! The manifest is deliberately a pseudo-file: after every merge its
//! `.crinfo` is regenerated so the manifest itself can be served through the
//! same block-request machinery as regular files.

use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::debug;

use ctp_core::digest::Digest;
use ctp_core::info::FileInfo;
use ctp_core::manifest::{Manifest, MANIFEST_FILENAME};

use crate::{write_atomic, StoreError};

pub struct ManifestStore {
    dir: PathBuf,
    // single writer for merge; readers see pre- or post-merge state atomically
    lock: RwLock<()>,
}

impl ManifestStore {
    /// Open the manifest store under `shared_dir/manifest`.
    pub fn open(shared_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let shared: PathBuf = shared_dir.into();
        let dir = shared.join("manifest");
        fs::create_dir_all(dir.join("crinfo"))?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILENAME)
    }

    fn info_path(&self) -> PathBuf {
        self.dir
            .join("crinfo")
            .join(format!("{MANIFEST_FILENAME}.crinfo"))
    }

    pub fn load(&self) -> Result<Manifest, StoreError> {
        let _g = self.lock.read().unwrap();
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> Result<Manifest, StoreError> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(Manifest::new());
        }
        Manifest::decode(&fs::read(path)?)
            .map_err(|_| StoreError::MalformedManifest("undecodable entries"))
    }

    /// Append entries of `incoming` that are not present locally; returns the
    /// newly added filenames. After a merge the manifest's own descriptor is
    /// regenerated from the new bytes with `now_ts` as its timestamp.
    pub fn merge(&self, incoming: &Manifest, now_ts: u64) -> Result<Vec<String>, StoreError> {
        let _g = self.lock.write().unwrap();
        let mut local = self.load_unlocked()?;
        let added = local.merge(incoming);
        if !added.is_empty() {
            let bytes = local.encode();
            write_atomic(&self.manifest_path(), &bytes)?;
            let info = FileInfo::from_bytes(MANIFEST_FILENAME, &bytes, now_ts);
            write_atomic(&self.info_path(), &info.encode())?;
            debug!(added = added.len(), total = local.len(), "manifest merged");
        }
        Ok(added)
    }

    /// Digest of the local manifest bytes; `None` before the first merge.
    pub fn current_digest(&self) -> Result<Option<Digest>, StoreError> {
        let _g = self.lock.read().unwrap();
        if !self.manifest_path().exists() {
            return Ok(None);
        }
        Ok(Some(self.load_unlocked()?.digest()))
    }

    /// The manifest's own `.crinfo`, for serving MANIFEST_REQUESTs.
    pub fn manifest_info(&self) -> Result<FileInfo, StoreError> {
        let _g = self.lock.read().unwrap();
        let path = self.info_path();
        if !path.exists() {
            return Err(StoreError::NotFound(MANIFEST_FILENAME.to_string()));
        }
        Ok(FileInfo::decode(MANIFEST_FILENAME, &fs::read(path)?)?)
    }

    /// Raw serialized manifest, for serving its blocks.
    pub fn manifest_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let _g = self.lock.read().unwrap();
        let path = self.manifest_path();
        if !path.exists() {
            return Err(StoreError::NotFound(MANIFEST_FILENAME.to_string()));
        }
        Ok(fs::read(path)?)
    }
}
