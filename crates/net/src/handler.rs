//! The peer's request handler: serves blocks, descriptors, the manifest, and
//! membership traffic out of the local stores.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ctp_core::frame::MsgType;
use ctp_core::info::{FileInfo, BLOCK_SIZE};
use ctp_core::manifest::Manifest;
use ctp_core::wire::{
    self, BlockStatus, MANIFEST_UPDATED,
};
use ctp_store::{FileStore, ManifestStore, StoreError};

use crate::peers::PeerTable;
use crate::runtime::{Inbound, RequestHandler, Responder};

pub struct ClusterHandler {
    store: Arc<FileStore>,
    manifest: Arc<ManifestStore>,
    peers: Arc<PeerTable>,
    /// Wakes the sync engine when a manifest-updated notification arrives.
    wake: Option<mpsc::Sender<()>>,
}

impl ClusterHandler {
    pub fn new(
        store: Arc<FileStore>,
        manifest: Arc<ManifestStore>,
        peers: Arc<PeerTable>,
        wake: Option<mpsc::Sender<()>>,
    ) -> Self {
        Self {
            store,
            manifest,
            peers,
            wake,
        }
    }

    fn now_ts() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Locate the block: the manifest pseudo-file is checked first, then the
    /// regular file store by content hash.
    fn lookup_block(
        &self,
        hash: &ctp_core::digest::Digest,
        block_id: u32,
    ) -> Result<(BlockStatus, Vec<u8>), StoreError> {
        if let Ok(info) = self.manifest.manifest_info() {
            if info.content_hash == *hash {
                let bytes = self.manifest.manifest_bytes()?;
                if block_id >= info.block_count() {
                    return Ok((BlockStatus::BadIndex, Vec::new()));
                }
                let start = block_id as usize * BLOCK_SIZE;
                let end = (start + BLOCK_SIZE).min(bytes.len());
                return Ok((BlockStatus::Have, bytes[start..end].to_vec()));
            }
        }
        let Some(info) = self.store.find_by_hash(hash) else {
            return Ok((BlockStatus::NotHave, Vec::new()));
        };
        match self.store.read_block(&info.filename, block_id) {
            Ok(bytes) => Ok((BlockStatus::Have, bytes)),
            Err(StoreError::BadBlockIndex { .. }) => Ok((BlockStatus::BadIndex, Vec::new())),
            Err(StoreError::NotFound(_)) => Ok((BlockStatus::NotHave, Vec::new())),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RequestHandler for ClusterHandler {
    async fn handle_status_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.peers.upsert(req.frame.sender, req.from);
        rsp.send(MsgType::StatusResponse, b"1").await?;
        Ok(())
    }

    async fn handle_notification(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        if req.frame.payload == MANIFEST_UPDATED {
            debug!(from = %req.from, "manifest update notification");
            if let Some(wake) = &self.wake {
                // a full wake queue already guarantees a pending update
                let _ = wake.try_send(());
            }
        }
        rsp.send(MsgType::NotificationAck, &req.frame.payload).await?;
        Ok(())
    }

    async fn handle_block_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        let (hash, block_id) = match wire::parse_block_request(&req.frame.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                rsp.send(MsgType::InvalidRequest, e.to_string().as_bytes())
                    .await?;
                return Ok(());
            }
        };
        let (status, bytes) = self.lookup_block(&hash, block_id)?;
        rsp.send(
            MsgType::BlockResponse,
            &wire::encode_block_response(&hash, block_id, status, &bytes),
        )
        .await?;
        Ok(())
    }

    async fn handle_crinfo_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        let name = match wire::parse_crinfo_request(&req.frame.payload) {
            Ok(name) => name,
            Err(e) => {
                rsp.send(MsgType::InvalidRequest, e.to_string().as_bytes())
                    .await?;
                return Ok(());
            }
        };
        let info = if name == ctp_core::manifest::MANIFEST_FILENAME {
            self.manifest.manifest_info()
        } else {
            self.store.get_info(name)
        };
        match info {
            Ok(info) => rsp.send(MsgType::CrinfoResponse, &info.encode()).await?,
            Err(StoreError::NotFound(_)) => {
                rsp.send(MsgType::InvalidRequest, b"unknown file").await?
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn handle_manifest_request(&self, _req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        match self.manifest.manifest_info() {
            Ok(info) => rsp.send(MsgType::ManifestResponse, &info.encode()).await?,
            Err(StoreError::NotFound(_)) => {
                rsp.send(MsgType::InvalidRequest, b"no manifest yet").await?
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn handle_new_crinfo(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        let (name, crinfo) = match wire::parse_new_crinfo(&req.frame.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                rsp.send(MsgType::InvalidRequest, e.to_string().as_bytes())
                    .await?;
                return Ok(());
            }
        };
        let info = match FileInfo::decode(name, crinfo) {
            Ok(info) => info,
            Err(e) => {
                rsp.send(MsgType::InvalidRequest, e.to_string().as_bytes())
                    .await?;
                return Ok(());
            }
        };
        // dedupe by filename+hash so a retransmitted notif stays idempotent
        match self.store.get_info(name) {
            Ok(existing) if existing.same_content(&info) => {
                rsp.send(MsgType::NewCrinfoAck, b"success").await?;
                return Ok(());
            }
            Ok(_) => {
                rsp.send(MsgType::NewCrinfoAck, b"error: exists").await?;
                return Ok(());
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.put_info(&info)?;
        let mut addition = Manifest::new();
        if addition.push(name.to_string()).is_err() {
            rsp.send(MsgType::InvalidRequest, b"bad filename").await?;
            return Ok(());
        }
        self.manifest.merge(&addition, Self::now_ts())?;
        info!(file = name, from = %req.from, "accepted new crinfo");
        rsp.send(MsgType::NewCrinfoAck, b"success").await?;
        Ok(())
    }

    async fn handle_peerlist_push(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        match wire::parse_peer_list(&req.frame.payload) {
            Ok(list) => {
                debug!(peers = list.len(), "peer list push");
                self.peers.replace(&list);
                rsp.send(MsgType::NotificationAck, b"ok").await?;
            }
            Err(e) => {
                warn!(from = %req.from, error = %e, "bad peer list push");
                rsp.send(MsgType::InvalidRequest, e.to_string().as_bytes())
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_cluster_join(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        // the joiner becomes a known peer and gets our current view back
        self.peers.upsert(req.frame.sender, req.from);
        let list: Vec<_> = self
            .peers
            .snapshot()
            .into_iter()
            .map(|r| (r.peer_id, r.addr))
            .collect();
        rsp.send(MsgType::ClusterJoinAck, &wire::encode_peer_list(&list))
            .await?;
        Ok(())
    }

    async fn handle_unknown_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        warn!(ty = ?req.frame.msg_type, from = %req.from, "unknown request type");
        rsp.send(MsgType::UnexpectedReq, b"unknown request type")
            .await?;
        Ok(())
    }
}
