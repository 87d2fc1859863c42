//! Persistent, resumable per-file block storage.
//!
//! The store owns the peer's shared directory tree:
//!
//! ```text
//! /                       finalized shared files
//! /crinfo/{name}.crinfo   descriptor per shared file
//! /crtemp/{name}.crtemp   in-progress downloads
//! /manifest/.crmanifest   serialized manifest
//! /manifest/crinfo/.crmanifest.crinfo
//! ```
//!
//! Mutating operations hold a per-file exclusive lock; reads take a shared
//! lock. A file is never read while being finalized. All writes that replace
//! a file go through write-temp-then-rename.

pub mod manifest_store;
pub mod temp;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use ctp_core::digest::{digest_bytes, Digest};
use ctp_core::info::{block_count_for, FileInfo, InfoError, BLOCK_SIZE};

pub use manifest_store::ManifestStore;
pub use temp::TempFile;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists with a different hash: {0}")]
    AlreadyExists(String),
    #[error("block {block_id} already written with different bytes")]
    DuplicateBlock { block_id: u32 },
    #[error("block {block_id} has wrong length {got}, expected {expected}")]
    SizeMismatch {
        block_id: u32,
        expected: usize,
        got: usize,
    },
    #[error("block index {block_id} out of range for {filename}")]
    BadBlockIndex { filename: String, block_id: u32 },
    #[error("assembled file digest does not match its descriptor")]
    HashMismatch,
    #[error("temp file is incomplete: {missing} blocks still absent")]
    Incomplete { missing: usize },
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("malformed crtemp: {0}")]
    MalformedTemp(&'static str),
    #[error("malformed manifest: {0}")]
    MalformedManifest(&'static str),
    #[error(transparent)]
    MalformedInfo(#[from] InfoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to an open `.crtemp`. Carries the descriptor so block lengths and
/// the finalize digest check need no extra lookups.
#[derive(Debug, Clone)]
pub struct TempHandle {
    pub info: FileInfo,
}

pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl FileStore {
    /// Open the store rooted at `shared_dir`, scaffolding the directory tree.
    pub fn open(shared_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root: PathBuf = shared_dir.into();
        fs::create_dir_all(root.join("crinfo"))?;
        fs::create_dir_all(root.join("crtemp"))?;
        fs::create_dir_all(root.join("manifest").join("crinfo"))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_lock(&self, filename: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn final_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    fn info_path(&self, filename: &str) -> PathBuf {
        self.root.join("crinfo").join(format!("{filename}.crinfo"))
    }

    fn temp_path(&self, filename: &str) -> PathBuf {
        self.root.join("crtemp").join(format!("{filename}.crtemp"))
    }

    /// Write a `.crinfo` atomically. Re-putting an identical descriptor is a
    /// no-op; a different descriptor under the same name is rejected.
    pub fn put_info(&self, info: &FileInfo) -> Result<(), StoreError> {
        validate_filename(&info.filename)?;
        let lock = self.file_lock(&info.filename);
        let _g = lock.write().unwrap();
        let path = self.info_path(&info.filename);
        if path.exists() {
            let existing = FileInfo::decode(&info.filename, &fs::read(&path)?)?;
            if existing.same_content(info) {
                return Ok(());
            }
            return Err(StoreError::AlreadyExists(info.filename.clone()));
        }
        write_atomic(&path, &info.encode())?;
        debug!(file = %info.filename, hash = %info.content_hash, "wrote crinfo");
        Ok(())
    }

    pub fn get_info(&self, filename: &str) -> Result<FileInfo, StoreError> {
        validate_filename(filename)?;
        let lock = self.file_lock(filename);
        let _g = lock.read().unwrap();
        let path = self.info_path(filename);
        if !path.exists() {
            return Err(StoreError::NotFound(filename.to_string()));
        }
        Ok(FileInfo::decode(filename, &fs::read(path)?)?)
    }

    /// Scan descriptors for the file with the given content hash.
    pub fn find_by_hash(&self, hash: &Digest) -> Option<FileInfo> {
        let dir = self.root.join("crinfo");
        let entries = fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(filename) = name.to_str().and_then(|n| n.strip_suffix(".crinfo")) else {
                continue;
            };
            let Ok(bytes) = fs::read(entry.path()) else {
                continue;
            };
            match FileInfo::decode(filename, &bytes) {
                Ok(info) if info.content_hash == *hash => return Some(info),
                Ok(_) => {}
                Err(e) => warn!(file = filename, error = %e, "skipping unreadable crinfo"),
            }
        }
        None
    }

    pub fn has_final(&self, filename: &str) -> bool {
        validate_filename(filename).is_ok() && self.final_path(filename).exists()
    }

    /// Create or open the `.crtemp` for `info`. Idempotent; an existing
    /// container is salvaged so interrupted downloads resume.
    pub fn open_temp(&self, info: &FileInfo) -> Result<TempHandle, StoreError> {
        validate_filename(&info.filename)?;
        let lock = self.file_lock(&info.filename);
        let _g = lock.write().unwrap();
        let path = self.temp_path(&info.filename);
        if path.exists() {
            let existing = TempFile::decode(&fs::read(&path)?)?;
            if existing.block_count() != info.block_count() {
                // descriptor changed under us; start over
                warn!(file = %info.filename, "crtemp block count mismatch, recreating");
                let fresh = TempFile::new(info.block_count());
                write_atomic(&path, &fresh.encode())?;
            }
        } else {
            let fresh = TempFile::new(info.block_count());
            write_atomic(&path, &fresh.encode())?;
        }
        Ok(TempHandle { info: info.clone() })
    }

    fn load_temp(&self, handle: &TempHandle) -> Result<TempFile, StoreError> {
        let path = self.temp_path(&handle.info.filename);
        if !path.exists() {
            return Err(StoreError::NotFound(handle.info.filename.clone()));
        }
        TempFile::decode(&fs::read(path)?)
    }

    /// Record block bytes in the temp container. A rewrite with identical
    /// bytes is a no-op; with different bytes it is a `DuplicateBlock` error.
    pub fn write_block(
        &self,
        handle: &TempHandle,
        block_id: u32,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let expected = handle.info.block_len(block_id).ok_or_else(|| {
            StoreError::BadBlockIndex {
                filename: handle.info.filename.clone(),
                block_id,
            }
        })?;
        if bytes.len() != expected {
            return Err(StoreError::SizeMismatch {
                block_id,
                expected,
                got: bytes.len(),
            });
        }
        let lock = self.file_lock(&handle.info.filename);
        let _g = lock.write().unwrap();
        let mut temp = self.load_temp(handle)?;
        if temp.has_block(block_id) {
            let existing = temp
                .block(block_id, expected)
                .ok_or(StoreError::MalformedTemp("pointer out of range"))?;
            if existing == bytes {
                return Ok(());
            }
            return Err(StoreError::DuplicateBlock { block_id });
        }
        temp.set_block(block_id, bytes);
        write_atomic(&self.temp_path(&handle.info.filename), &temp.encode())?;
        Ok(())
    }

    pub fn has_block(&self, handle: &TempHandle, block_id: u32) -> Result<bool, StoreError> {
        let lock = self.file_lock(&handle.info.filename);
        let _g = lock.read().unwrap();
        Ok(self.load_temp(handle)?.has_block(block_id))
    }

    pub fn missing_blocks(&self, handle: &TempHandle) -> Result<Vec<u32>, StoreError> {
        let lock = self.file_lock(&handle.info.filename);
        let _g = lock.read().unwrap();
        Ok(self.load_temp(handle)?.missing_blocks())
    }

    /// Reassemble blocks in order, verify the digest, promote to the final
    /// path, and delete the `.crtemp`. On `HashMismatch` the temp file is
    /// kept with every pointer cleared so the next cycle re-downloads.
    pub fn finalize(&self, handle: &TempHandle) -> Result<(), StoreError> {
        let info = &handle.info;
        let lock = self.file_lock(&info.filename);
        let _g = lock.write().unwrap();
        let mut temp = self.load_temp(handle)?;
        let missing = temp.missing_blocks().len();
        if missing > 0 {
            return Err(StoreError::Incomplete { missing });
        }
        let mut assembled = Vec::with_capacity(info.file_size as usize);
        for block_id in 0..info.block_count() {
            let len = info.block_len(block_id).expect("block id in range");
            let bytes = temp
                .block(block_id, len)
                .ok_or(StoreError::MalformedTemp("pointer out of range"))?;
            assembled.extend_from_slice(bytes);
        }
        if digest_bytes(&assembled) != info.content_hash {
            temp.clear();
            write_atomic(&self.temp_path(&info.filename), &temp.encode())?;
            warn!(file = %info.filename, "finalize digest mismatch, cleared pointers");
            return Err(StoreError::HashMismatch);
        }
        write_atomic(&self.final_path(&info.filename), &assembled)?;
        fs::remove_file(self.temp_path(&info.filename))?;
        debug!(file = %info.filename, size = info.file_size, "finalized");
        Ok(())
    }

    /// Serve a block from either the finalized file or an in-progress temp.
    pub fn read_block(&self, filename: &str, block_id: u32) -> Result<Vec<u8>, StoreError> {
        validate_filename(filename)?;
        let lock = self.file_lock(filename);
        let _g = lock.read().unwrap();

        let final_path = self.final_path(filename);
        if final_path.exists() {
            let mut f = fs::File::open(&final_path)?;
            let size = f.metadata()?.len();
            if block_id >= block_count_for(size) {
                return Err(StoreError::BadBlockIndex {
                    filename: filename.to_string(),
                    block_id,
                });
            }
            let offset = block_id as u64 * BLOCK_SIZE as u64;
            let len = ((size - offset).min(BLOCK_SIZE as u64)) as usize;
            let mut buf = vec![0u8; len];
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(&mut buf)?;
            return Ok(buf);
        }

        let temp_path = self.temp_path(filename);
        if temp_path.exists() {
            let info = {
                let info_path = self.info_path(filename);
                if !info_path.exists() {
                    return Err(StoreError::NotFound(filename.to_string()));
                }
                FileInfo::decode(filename, &fs::read(info_path)?)?
            };
            let Some(len) = info.block_len(block_id) else {
                return Err(StoreError::BadBlockIndex {
                    filename: filename.to_string(),
                    block_id,
                });
            };
            let temp = TempFile::decode(&fs::read(temp_path)?)?;
            if let Some(bytes) = temp.block(block_id, len) {
                return Ok(bytes.to_vec());
            }
        }
        Err(StoreError::NotFound(filename.to_string()))
    }

    /// Bring a local file into the store the way `share` needs it: write the
    /// descriptor, split into a fully-populated temp, and promote. Returns the
    /// descriptor of the imported file.
    pub fn import_file(
        &self,
        filename: &str,
        data: &[u8],
        created_at: u64,
    ) -> Result<FileInfo, StoreError> {
        let info = FileInfo::from_bytes(filename, data, created_at);
        self.put_info(&info)?;
        let handle = self.open_temp(&info)?;
        for block_id in 0..info.block_count() {
            let start = block_id as usize * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(data.len());
            self.write_block(&handle, block_id, &data[start..end])?;
        }
        self.finalize(&handle)?;
        Ok(info)
    }

    /// `.crtemp` files found on startup; each one is a resumable download.
    pub fn salvageable_temps(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join("crtemp"))?.flatten() {
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".crtemp"))
            {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }
}

fn validate_filename(filename: &str) -> Result<(), StoreError> {
    // the subdirectory names are reserved: a shared file may not shadow them
    let bad = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename == "crinfo"
        || filename == "crtemp"
        || filename == "manifest"
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0');
    if bad {
        return Err(StoreError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// Write-temp-then-rename; `rename` within one directory is atomic.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidFilename(path.display().to_string()))?;
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
