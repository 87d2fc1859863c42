//! The cluster synchronization engine.
//!
//! Convergence is driven by three triggers: a local `share`, a
//! manifest-updated notification from a peer, and the periodic manifest-hash
//! poll of the control server. An update cycle merges the server manifest,
//! then pulls every file that is not finalized locally: descriptor first,
//! then each missing block from whichever peer will serve it, with
//! creator-of-file fallback through the control server. Partial files stay on
//! disk as `.crtemp` and resume on the next cycle.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use ctp_core::digest::Digest;
use ctp_core::frame::MsgType;
use ctp_core::id::PeerId;
use ctp_core::info::FileInfo;
use ctp_core::manifest::Manifest;
use ctp_core::wire::{self, BlockStatus, MANIFEST_UPDATED};
use ctp_store::{FileStore, ManifestStore, StoreError, TempHandle};

use crate::control::{ControlApi, ControlError};
use crate::peers::{PeerRecord, PeerState, PeerTable};
use crate::runtime::{CtpPeer, NetError, DEFAULT_TIMEOUT};

/// Bound on concurrently syncing files within one update cycle.
pub const DEFAULT_FILE_CONCURRENCY: usize = 8;

/// Retransmissions per block or crinfo request.
pub const DEFAULT_REQUEST_RETRIES: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{file}: not currently obtainable from any peer")]
    TemporarilyUnavailable { file: String },
    #[error("already shared: {0}")]
    AlreadyShared(String),
    #[error("path has no usable filename")]
    BadPath,
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct SyncEngine {
    peer: CtpPeer,
    store: Arc<FileStore>,
    manifest: Arc<ManifestStore>,
    peers: Arc<PeerTable>,
    control: Arc<dyn ControlApi>,
    concurrency: usize,
    request_timeout: Duration,
    request_retries: u32,
    /// Peers already reported through a wellness check this session.
    reported: Mutex<HashSet<PeerId>>,
}

impl SyncEngine {
    pub fn new(
        peer: CtpPeer,
        store: Arc<FileStore>,
        manifest: Arc<ManifestStore>,
        peers: Arc<PeerTable>,
        control: Arc<dyn ControlApi>,
    ) -> Self {
        Self {
            peer,
            store,
            manifest,
            peers,
            control,
            concurrency: DEFAULT_FILE_CONCURRENCY,
            request_timeout: DEFAULT_TIMEOUT,
            request_retries: DEFAULT_REQUEST_RETRIES,
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Override the per-request timeout and retry count.
    pub fn with_request_timing(mut self, timeout: Duration, retries: u32) -> Self {
        self.request_timeout = timeout;
        self.request_retries = retries;
        self
    }

    /// Share a local file with the cluster: import it into the store, tell
    /// the control server, and nudge every known peer to re-sync.
    pub async fn share(&self, path: &Path) -> Result<FileInfo, SyncError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(SyncError::BadPath)?;
        let data = std::fs::read(path)?;
        let info = self.store.import_file(filename, &data, now_ts())?;

        match self.control.push_manifest(&info).await {
            Ok(digest) => debug!(file = filename, %digest, "manifest push accepted"),
            Err(ControlError::Exists) => {
                return Err(SyncError::AlreadyShared(filename.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let mut addition = Manifest::new();
        if addition.push(filename.to_string()).is_ok() {
            self.manifest.merge(&addition, now_ts())?;
        }

        // fire-and-forget: a peer that misses this learns from the next poll
        let snapshot = self.peers.snapshot();
        let notifies = snapshot.iter().filter(|r| r.peer_id != self.peer.peer_id());
        futures::future::join_all(notifies.map(|r| {
            self.peer.send_request(
                MsgType::Notification,
                MANIFEST_UPDATED,
                r.addr,
                self.request_timeout,
                0,
            )
        }))
        .await;

        info!(file = filename, hash = %info.content_hash, "shared");
        Ok(info)
    }

    /// One update cycle: merge the server manifest, then bring every
    /// non-finalized file down. A file that cannot complete stays partial and
    /// is retried next cycle; only a control-server failure aborts the cycle.
    pub async fn update(&self) -> Result<(), SyncError> {
        let remote = self.control.manifest().await?;
        let added = self.manifest.merge(&remote, now_ts())?;
        if !added.is_empty() {
            info!(added = added.len(), "manifest gained entries");
        }

        let candidates: Vec<String> = self
            .manifest
            .load()?
            .names()
            .iter()
            .filter(|n| !self.store.has_final(n))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        debug!(files = candidates.len(), "files to acquire");

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let outcomes = futures::future::join_all(candidates.iter().map(|name| {
            let sem = sem.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                (name, self.sync_file(name).await)
            }
        }))
        .await;

        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => {}
                Err(SyncError::TemporarilyUnavailable { .. }) => {
                    debug!(file = %name, "left partial, will resume next cycle")
                }
                Err(e) => warn!(file = %name, error = %e, "file sync failed"),
            }
        }
        Ok(())
    }

    /// Descriptor, then blocks in id order, then finalize.
    async fn sync_file(&self, name: &str) -> Result<(), SyncError> {
        let info = match self.store.get_info(name) {
            Ok(info) => info,
            Err(StoreError::NotFound(_)) => {
                let info = self.fetch_crinfo(name).await?;
                self.store.put_info(&info)?;
                info
            }
            Err(e) => return Err(e.into()),
        };

        let handle = self.store.open_temp(&info)?;
        let mut unobtainable = 0usize;
        for block_id in self.store.missing_blocks(&handle)? {
            match self.acquire_block(&handle, block_id).await {
                Ok(()) => {}
                // one stuck block must not stop the rest of the file
                Err(SyncError::TemporarilyUnavailable { .. }) => unobtainable += 1,
                Err(e) => return Err(e),
            }
        }
        if unobtainable > 0 {
            return Err(SyncError::TemporarilyUnavailable {
                file: name.to_string(),
            });
        }

        // on HashMismatch the store has already cleared every pointer, so the
        // next cycle re-acquires the file from scratch
        self.store.finalize(&handle)?;
        info!(file = name, "finalized");
        Ok(())
    }

    /// Ask peers for the authoritative `.crinfo` of `name`.
    async fn fetch_crinfo(&self, name: &str) -> Result<FileInfo, SyncError> {
        for record in self.shuffled_candidates() {
            let result = self
                .peer
                .send_request(
                    MsgType::CrinfoRequest,
                    &wire::encode_crinfo_request(name),
                    record.addr,
                    self.request_timeout,
                    self.request_retries,
                )
                .await;
            match result {
                Ok(resp) if resp.msg_type == MsgType::CrinfoResponse => {
                    self.peers.mark_success(&record.peer_id);
                    match FileInfo::decode(name, &resp.payload) {
                        Ok(info) => return Ok(info),
                        Err(e) => {
                            warn!(file = name, peer = ?record.peer_id, error = %e,
                                "peer served malformed crinfo");
                        }
                    }
                }
                Ok(_) => self.peers.mark_success(&record.peer_id),
                Err(NetError::ConnectionError { .. }) => self.note_failure(&record.peer_id).await,
                Err(e) => warn!(peer = ?record.peer_id, error = %e, "crinfo request failed"),
            }
        }
        Err(SyncError::TemporarilyUnavailable {
            file: name.to_string(),
        })
    }

    /// Try every live peer in randomized order, then fall back to the file's
    /// creator via the control server.
    async fn acquire_block(&self, handle: &TempHandle, block_id: u32) -> Result<(), SyncError> {
        let hash = handle.info.content_hash;
        for record in self.shuffled_candidates() {
            match self.request_block(record.addr, &hash, block_id).await {
                Ok((sender, Some(bytes))) => {
                    self.peers.mark_success(&sender);
                    if self.store_block(handle, block_id, &bytes)? {
                        return Ok(());
                    }
                }
                Ok((sender, None)) => {
                    // the peer answered; it just cannot serve this block
                    self.peers.mark_success(&sender);
                }
                Err(NetError::ConnectionError { .. }) => self.note_failure(&record.peer_id).await,
                Err(e) => warn!(peer = ?record.peer_id, error = %e, "block request failed"),
            }
        }

        // nobody in the table has it; ask the server who created the file
        if let Some(addr) = self.control.file_creator(&hash).await? {
            debug!(%addr, block_id, "trying file creator");
            if let Ok((sender, Some(bytes))) = self.request_block(addr, &hash, block_id).await {
                self.peers.upsert(sender, addr);
                self.peers.mark_success(&sender);
                if self.store_block(handle, block_id, &bytes)? {
                    return Ok(());
                }
            }
        }
        Err(SyncError::TemporarilyUnavailable {
            file: handle.info.filename.clone(),
        })
    }

    /// Returns true when the block is now present. A peer that sends bytes of
    /// the wrong size is treated as not serving the block.
    fn store_block(
        &self,
        handle: &TempHandle,
        block_id: u32,
        bytes: &[u8],
    ) -> Result<bool, SyncError> {
        match self.store.write_block(handle, block_id, bytes) {
            Ok(()) => Ok(true),
            Err(StoreError::SizeMismatch { .. }) | Err(StoreError::DuplicateBlock { .. }) => {
                warn!(file = %handle.info.filename, block_id, "discarding unusable block bytes");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn request_block(
        &self,
        addr: std::net::SocketAddr,
        hash: &Digest,
        block_id: u32,
    ) -> Result<(PeerId, Option<Vec<u8>>), NetError> {
        let resp = self
            .peer
            .send_request(
                MsgType::BlockRequest,
                &wire::encode_block_request(hash, block_id),
                addr,
                self.request_timeout,
                self.request_retries,
            )
            .await?;
        if resp.msg_type != MsgType::BlockResponse {
            return Ok((resp.sender, None));
        }
        let (resp_hash, resp_id, status, bytes) = wire::parse_block_response(&resp.payload)?;
        if resp_hash != *hash || resp_id != block_id {
            return Ok((resp.sender, None));
        }
        match status {
            BlockStatus::Have => Ok((resp.sender, Some(bytes.to_vec()))),
            BlockStatus::NotHave | BlockStatus::BadIndex => Ok((resp.sender, None)),
        }
    }

    /// Live peers, shuffled per acquisition to spread load. Self never serves
    /// itself.
    fn shuffled_candidates(&self) -> Vec<PeerRecord> {
        let mut candidates: Vec<PeerRecord> = self
            .peers
            .snapshot()
            .into_iter()
            .filter(|r| r.peer_id != self.peer.peer_id() && r.state != PeerState::Gone)
            .collect();
        candidates.shuffle(&mut thread_rng());
        candidates
    }

    /// Count the timeout; once a peer crosses into SUSPECT, report it to the
    /// control server exactly once and drop it from the table.
    async fn note_failure(&self, peer_id: &PeerId) {
        if self.peers.mark_failure(peer_id) != Some(PeerState::Suspect) {
            return;
        }
        let first_report = self.reported.lock().unwrap().insert(*peer_id);
        if !first_report {
            return;
        }
        match self.control.wellness_check(*peer_id).await {
            Ok(()) => {
                info!(peer = ?peer_id, "reported unresponsive peer");
                self.peers.mark_gone(peer_id);
                self.peers.remove(peer_id);
            }
            Err(e) => {
                warn!(peer = ?peer_id, error = %e, "wellness report failed");
                // let a later failure retry the report
                self.reported.lock().unwrap().remove(peer_id);
            }
        }
    }

    /// Poll loop: wake on the interval or on a manifest notification, compare
    /// digests, and run an update when they diverge.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut wake: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                received = wake.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            let remote = match self.control.manifest_hash().await {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "manifest hash poll failed");
                    continue;
                }
            };
            let local = self.manifest.current_digest().ok().flatten();
            if local != Some(remote) {
                debug!("manifest digest diverged, updating");
                if let Err(e) = self.update().await {
                    warn!(error = %e, "update cycle failed");
                }
            }
        }
    }
}

fn now_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
