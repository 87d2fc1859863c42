//! Thin HTTP client for the control server.
//!
//! The sync engine talks to this through the [`ControlApi`] trait so tests
//! can stand in an in-memory server. Every call has a fixed timeout and one
//! retry on transport errors; there is no caching beyond the current value.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ctp_core::digest::Digest;
use ctp_core::id::{ClusterId, PeerId};
use ctp_core::info::FileInfo;
use ctp_core::manifest::Manifest;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("control server error: status {0}")]
    Server(u16),
    #[error("file already in manifest")]
    Exists,
    #[error("malformed control response: {0}")]
    Malformed(String),
}

/// The control-server surface the core consumes. One method per endpoint.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// `GET /cluster/{id}` — current peer list.
    async fn peer_list(&self) -> Result<Vec<(PeerId, SocketAddr)>, ControlError>;

    /// `PUT /cluster/{id}/` — join the cluster.
    async fn join(&self, peer_id: PeerId, addr: SocketAddr) -> Result<(), ControlError>;

    /// `POST /cluster/{id}/wellness_check` — ask the server to probe a peer.
    async fn wellness_check(&self, peer_id: PeerId) -> Result<(), ControlError>;

    /// `GET /cluster/{id}/manifestHash` — the server's manifest digest.
    async fn manifest_hash(&self) -> Result<Digest, ControlError>;

    /// `GET /cluster/{id}/manifest` — full manifest bytes.
    async fn manifest(&self) -> Result<Manifest, ControlError>;

    /// `POST /cluster/{id}/manifest` — append a file; returns the new digest.
    /// Fails with [`ControlError::Exists`] if the name is already listed.
    async fn push_manifest(&self, info: &FileInfo) -> Result<Digest, ControlError>;

    /// `GET /cluster/{id}/getFileCreator?fileId={hash}` — the creator's
    /// current address, or `None` if the server has nothing.
    async fn file_creator(&self, file_id: &Digest) -> Result<Option<SocketAddr>, ControlError>;
}

#[derive(Serialize, Deserialize)]
struct PeerEntry {
    peer_id: String,
    ip: String,
    port: u16,
}

#[derive(Serialize)]
struct JoinBody {
    peer_id: String,
    ip: String,
    port: u16,
}

#[derive(Serialize)]
struct WellnessBody {
    peer_id: String,
}

#[derive(Serialize)]
struct ManifestPush {
    filename: String,
    crinfo: String,
}

pub struct HttpControlClient {
    http: reqwest::Client,
    base: String,
    cluster: ClusterId,
}

impl HttpControlClient {
    pub fn new(base_url: impl Into<String>, cluster: ClusterId) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            http,
            base: base_url.into().trim_end_matches('/').to_string(),
            cluster,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/cluster/{}{}", self.base, self.cluster.to_hex(), suffix)
    }

    /// One retry on transport-level failures, none on HTTP status errors.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ControlError> {
        match build().send().await {
            Ok(r) => Ok(r),
            Err(e) if e.is_timeout() || e.is_connect() => {
                debug!(error = %e, "control request failed, retrying once");
                Ok(build().send().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check(resp: &reqwest::Response) -> Result<(), ControlError> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ControlError::Server(status.as_u16()))
        }
    }
}

#[async_trait]
impl ControlApi for HttpControlClient {
    async fn peer_list(&self) -> Result<Vec<(PeerId, SocketAddr)>, ControlError> {
        let url = self.url("");
        let resp = self.send_with_retry(|| self.http.get(&url)).await?;
        Self::check(&resp)?;
        let entries: Vec<PeerEntry> = resp.json().await?;
        entries
            .into_iter()
            .map(|e| parse_peer_entry(&e))
            .collect()
    }

    async fn join(&self, peer_id: PeerId, addr: SocketAddr) -> Result<(), ControlError> {
        let url = self.url("/");
        let body = JoinBody {
            peer_id: peer_id.to_hex(),
            ip: addr.ip().to_string(),
            port: addr.port(),
        };
        let resp = self
            .send_with_retry(|| self.http.put(&url).json(&body))
            .await?;
        Self::check(&resp)
    }

    async fn wellness_check(&self, peer_id: PeerId) -> Result<(), ControlError> {
        let url = self.url("/wellness_check");
        let body = WellnessBody {
            peer_id: peer_id.to_hex(),
        };
        let resp = self
            .send_with_retry(|| self.http.post(&url).json(&body))
            .await?;
        Self::check(&resp)
    }

    async fn manifest_hash(&self) -> Result<Digest, ControlError> {
        let url = self.url("/manifestHash");
        let resp = self.send_with_retry(|| self.http.get(&url)).await?;
        Self::check(&resp)?;
        let text = resp.text().await?;
        Digest::from_str(text.trim())
            .map_err(|_| ControlError::Malformed(format!("bad manifest hash: {text:?}")))
    }

    async fn manifest(&self) -> Result<Manifest, ControlError> {
        let url = self.url("/manifest");
        let resp = self.send_with_retry(|| self.http.get(&url)).await?;
        Self::check(&resp)?;
        let bytes = resp.bytes().await?;
        Manifest::decode(&bytes).map_err(|e| ControlError::Malformed(e.to_string()))
    }

    async fn push_manifest(&self, info: &FileInfo) -> Result<Digest, ControlError> {
        let url = self.url("/manifest");
        let body = ManifestPush {
            filename: info.filename.clone(),
            crinfo: String::from_utf8_lossy(&info.encode()).into_owned(),
        };
        let resp = self
            .send_with_retry(|| self.http.post(&url).json(&body))
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(ControlError::Exists);
        }
        Self::check(&resp)?;
        let text = resp.text().await?;
        if text.trim().starts_with("error: exists") {
            return Err(ControlError::Exists);
        }
        Digest::from_str(text.trim())
            .map_err(|_| ControlError::Malformed(format!("bad manifest digest: {text:?}")))
    }

    async fn file_creator(&self, file_id: &Digest) -> Result<Option<SocketAddr>, ControlError> {
        let url = self.url(&format!("/getFileCreator?fileId={}", file_id.to_hex()));
        let resp = self.send_with_retry(|| self.http.get(&url)).await?;
        Self::check(&resp)?;
        let text = resp.text().await?;
        parse_creator(&text)
    }
}

fn parse_peer_entry(e: &PeerEntry) -> Result<(PeerId, SocketAddr), ControlError> {
    let id = PeerId::from_str(&e.peer_id)
        .map_err(|_| ControlError::Malformed(format!("bad peer id: {:?}", e.peer_id)))?;
    let ip = e
        .ip
        .parse::<std::net::IpAddr>()
        .map_err(|_| ControlError::Malformed(format!("bad peer ip: {:?}", e.ip)))?;
    Ok((id, SocketAddr::new(ip, e.port)))
}

fn parse_creator(text: &str) -> Result<Option<SocketAddr>, ControlError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<SocketAddr>()
        .map(Some)
        .map_err(|_| ControlError::Malformed(format!("bad creator address: {text:?}")))
}
