//! Shared fixtures for the net integration tests: an in-memory control
//! server and a fully wired loopback peer.

// each test binary compiles its own copy; not every helper is used in every one
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use ctp_core::digest::Digest;
use ctp_core::id::{ClusterId, PeerId};
use ctp_core::info::FileInfo;
use ctp_core::manifest::Manifest;
use ctp_net::{
    ClusterHandler, ControlApi, ControlError, CtpPeer, ListenerHandle, PeerTable, SyncEngine,
};
use ctp_store::{FileStore, ManifestStore};

pub const CLUSTER: ClusterId = ClusterId([0x41; 32]);

pub fn pid(n: u8) -> PeerId {
    PeerId([n; 32])
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ctp_net=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 249) as u8).collect()
}

#[derive(Default)]
struct MockState {
    manifest: Manifest,
    peers: Vec<(PeerId, SocketAddr)>,
    creators: HashMap<Digest, SocketAddr>,
    wellness: Vec<PeerId>,
}

/// In-memory stand-in for the control server.
#[derive(Default)]
pub struct MockControl {
    state: Mutex<MockState>,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_creator(&self, hash: Digest, addr: SocketAddr) {
        self.state.lock().unwrap().creators.insert(hash, addr);
    }

    pub fn wellness_log(&self) -> Vec<PeerId> {
        self.state.lock().unwrap().wellness.clone()
    }

    pub fn manifest_names(&self) -> Vec<String> {
        self.state.lock().unwrap().manifest.names().to_vec()
    }
}

#[async_trait]
impl ControlApi for MockControl {
    async fn peer_list(&self) -> Result<Vec<(PeerId, SocketAddr)>, ControlError> {
        Ok(self.state.lock().unwrap().peers.clone())
    }

    async fn join(&self, peer_id: PeerId, addr: SocketAddr) -> Result<(), ControlError> {
        let mut state = self.state.lock().unwrap();
        state.peers.retain(|(id, _)| *id != peer_id);
        state.peers.push((peer_id, addr));
        Ok(())
    }

    async fn wellness_check(&self, peer_id: PeerId) -> Result<(), ControlError> {
        self.state.lock().unwrap().wellness.push(peer_id);
        Ok(())
    }

    async fn manifest_hash(&self) -> Result<Digest, ControlError> {
        Ok(self.state.lock().unwrap().manifest.digest())
    }

    async fn manifest(&self) -> Result<Manifest, ControlError> {
        Ok(self.state.lock().unwrap().manifest.clone())
    }

    async fn push_manifest(&self, info: &FileInfo) -> Result<Digest, ControlError> {
        let mut state = self.state.lock().unwrap();
        if state.manifest.contains(&info.filename) {
            return Err(ControlError::Exists);
        }
        state
            .manifest
            .push(info.filename.clone())
            .map_err(|e| ControlError::Malformed(e.to_string()))?;
        Ok(state.manifest.digest())
    }

    async fn file_creator(&self, file_id: &Digest) -> Result<Option<SocketAddr>, ControlError> {
        Ok(self.state.lock().unwrap().creators.get(file_id).copied())
    }
}

/// A complete peer wired onto a loopback socket and a temp shared dir.
pub struct TestPeer {
    pub peer: CtpPeer,
    pub addr: SocketAddr,
    pub store: Arc<FileStore>,
    pub manifest: Arc<ManifestStore>,
    pub peers: Arc<PeerTable>,
    pub engine: Arc<SyncEngine>,
    pub listener: Option<ListenerHandle>,
    // owns the shared dir for the test's lifetime
    pub dir: TempDir,
}

impl TestPeer {
    pub async fn spawn(n: u8, control: Arc<dyn ControlApi>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(FileStore::open(dir.path()).expect("file store"));
        let manifest = Arc::new(ManifestStore::open(dir.path()).expect("manifest store"));
        let peers = Arc::new(PeerTable::new());
        let peer = CtpPeer::bind("127.0.0.1:0".parse().unwrap(), CLUSTER, pid(n))
            .await
            .expect("bind");
        let addr = peer.local_addr().expect("local addr");
        let handler = Arc::new(ClusterHandler::new(
            store.clone(),
            manifest.clone(),
            peers.clone(),
            None,
        ));
        let listener = peer.listen(handler);
        let engine = Arc::new(
            SyncEngine::new(
                peer.clone(),
                store.clone(),
                manifest.clone(),
                peers.clone(),
                control,
            )
            .with_request_timing(Duration::from_millis(300), 0),
        );
        Self {
            peer,
            addr,
            store,
            manifest,
            peers,
            engine,
            listener: Some(listener),
            dir,
        }
    }

    pub fn cluster_handler(&self) -> ClusterHandler {
        ClusterHandler::new(
            self.store.clone(),
            self.manifest.clone(),
            self.peers.clone(),
            None,
        )
    }

    pub async fn shutdown(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
    }
}
