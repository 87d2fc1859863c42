//! The CTP peer runtime: one UDP socket, multiplexed between the client role
//! (send a request, wait for the paired response) and the server role
//! (dispatch inbound requests to a handler on a bounded worker pool).
//!
//! Correlation works off an in-memory table keyed by
//! `(expected_response_seq, remote_addr)`. Inbound frames consult the table
//! first; a matching waiter consumes the frame and the handler never sees it.
//! Unmatched response frames are dropped as late duplicates. Sequence numbers
//! come from a cryptographic RNG, and a response always carries the request's
//! sequence number plus one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use ctp_core::frame::{Frame, FrameError, MsgType};
use ctp_core::id::{ClusterId, PeerId};

/// Default CTP port.
pub const DEFAULT_PORT: u16 = 6969;
/// Default per-request timeout for `send_request`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Default handler worker pool size.
pub const DEFAULT_WORKERS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("no response from {addr} after {attempts} attempt(s)")]
    ConnectionError { addr: SocketAddr, attempts: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unexpected response type {0:?}")]
    UnexpectedResponseType(MsgType),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An inbound request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub frame: Frame,
    pub from: SocketAddr,
}

/// Per-request reply channel handed to handlers. Enforces that the reply is a
/// response type and is sent at most once.
pub struct Responder {
    peer: CtpPeer,
    response_seq: u32,
    dest: SocketAddr,
    responded: AtomicBool,
}

impl Responder {
    pub async fn send(&self, msg_type: MsgType, payload: &[u8]) -> Result<(), NetError> {
        if msg_type.is_request() {
            return Err(NetError::InvalidArgument(
                "send_response requires a response type",
            ));
        }
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(NetError::InvalidArgument("response already sent"));
        }
        let frame = Frame::new(
            msg_type,
            self.response_seq,
            self.peer.cluster(),
            self.peer.peer_id(),
            payload.to_vec(),
        );
        let bytes = frame.encode()?;
        self.peer.inner.socket.send_to(&bytes, self.dest).await?;
        trace!(to = %self.dest, ty = ?msg_type, "sent response");
        Ok(())
    }

    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }
}

/// Capability set a peer supplies to serve inbound requests, one method per
/// request type plus an unconditional `cleanup`. Every default replies
/// `UNEXPECTED_REQ`, so implementers only override what they actually serve.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_status_request(&self, _req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        rsp.send(MsgType::StatusResponse, b"1").await?;
        Ok(())
    }

    async fn handle_notification(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        rsp.send(MsgType::NotificationAck, &req.frame.payload).await?;
        Ok(())
    }

    async fn handle_block_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.unexpected(req, rsp).await
    }

    async fn handle_crinfo_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.unexpected(req, rsp).await
    }

    async fn handle_manifest_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.unexpected(req, rsp).await
    }

    async fn handle_new_crinfo(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.unexpected(req, rsp).await
    }

    async fn handle_peerlist_push(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.unexpected(req, rsp).await
    }

    async fn handle_cluster_join(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.unexpected(req, rsp).await
    }

    /// NO_OP never gets a response.
    async fn handle_no_op(&self, _req: &Inbound) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_unknown_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.unexpected(req, rsp).await
    }

    /// Runs after every request, whether the handler succeeded or not.
    async fn cleanup(&self) {}

    #[doc(hidden)]
    async fn unexpected(&self, _req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        rsp.send(MsgType::UnexpectedReq, b"unexpected request").await?;
        Ok(())
    }
}

type PendingMap = Mutex<HashMap<(u32, SocketAddr), oneshot::Sender<Frame>>>;

struct PeerInner {
    socket: UdpSocket,
    cluster: ClusterId,
    peer_id: PeerId,
    pending: PendingMap,
}

/// A single peer endpoint using CTP: both the client and the server side of
/// the protocol share one socket.
#[derive(Clone)]
pub struct CtpPeer {
    inner: Arc<PeerInner>,
}

impl CtpPeer {
    pub async fn bind(
        addr: SocketAddr,
        cluster: ClusterId,
        peer_id: PeerId,
    ) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(addr = %socket.local_addr()?, "bound ctp socket");
        Ok(Self {
            inner: Arc::new(PeerInner {
                socket,
                cluster,
                peer_id,
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn cluster(&self) -> ClusterId {
        self.inner.cluster
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Send `msg_type` with `payload` to `dest` and wait for the paired
    /// response. On timeout the same frame is retransmitted up to `retries`
    /// additional times; once all attempts are exhausted the call fails with
    /// `ConnectionError`. Blocks the caller for up to
    /// `(retries + 1) * timeout`.
    pub async fn send_request(
        &self,
        msg_type: MsgType,
        payload: &[u8],
        dest: SocketAddr,
        timeout: Duration,
        retries: u32,
    ) -> Result<Frame, NetError> {
        if !msg_type.is_request() {
            return Err(NetError::InvalidArgument(
                "send_request requires a request type",
            ));
        }
        let (tx, mut rx) = oneshot::channel();
        let (seq, key) = self.register_waiter(dest, tx);
        let frame = Frame::new(msg_type, seq, self.cluster(), self.peer_id(), payload.to_vec());
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                self.inner.pending.lock().unwrap().remove(&key);
                return Err(e.into());
            }
        };

        let mut result = Err(NetError::ConnectionError {
            addr: dest,
            attempts: retries + 1,
        });
        for attempt in 0..=retries {
            if let Err(e) = self.inner.socket.send_to(&bytes, dest).await {
                result = Err(e.into());
                break;
            }
            trace!(to = %dest, ty = ?msg_type, seq, attempt, "sent request");
            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(Ok(response)) => {
                    result = Ok(response);
                    break;
                }
                // waiter dropped: the listener was stopped mid-wait
                Ok(Err(_)) => break,
                Err(_) => {
                    debug!(to = %dest, seq, attempt, "request attempt timed out");
                }
            }
        }
        self.inner.pending.lock().unwrap().remove(&key);
        result
    }

    /// Fire-and-forget datagram; used for NO_OP keep-alives where no response
    /// will ever come back.
    pub async fn send_oneway(
        &self,
        msg_type: MsgType,
        payload: &[u8],
        dest: SocketAddr,
    ) -> Result<(), NetError> {
        if !msg_type.is_request() {
            return Err(NetError::InvalidArgument(
                "send_oneway requires a request type",
            ));
        }
        let seq = OsRng.next_u32();
        let frame = Frame::new(msg_type, seq, self.cluster(), self.peer_id(), payload.to_vec());
        self.inner.socket.send_to(&frame.encode()?, dest).await?;
        Ok(())
    }

    /// Pick a fresh sequence number whose correlation key is unused and park
    /// the waiter under it.
    fn register_waiter(
        &self,
        dest: SocketAddr,
        tx: oneshot::Sender<Frame>,
    ) -> (u32, (u32, SocketAddr)) {
        let mut pending = self.inner.pending.lock().unwrap();
        loop {
            let seq = OsRng.next_u32();
            let key = (seq.wrapping_add(1), dest);
            if !pending.contains_key(&key) {
                pending.insert(key, tx);
                return (seq, key);
            }
        }
    }

    /// Start the background dispatcher with the default worker pool size.
    pub fn listen(&self, handler: Arc<dyn RequestHandler>) -> ListenerHandle {
        self.listen_with(handler, DEFAULT_WORKERS)
    }

    /// Start the background dispatcher. Each inbound datagram is decoded;
    /// malformed or wrong-cluster frames are dropped silently. Responses are
    /// routed to waiting `send_request` calls; requests go to a worker pool of
    /// `workers` tasks behind a bounded queue. When the queue is full the
    /// listener answers `UNEXPECTED_REQ "busy"` itself.
    pub fn listen_with(&self, handler: Arc<dyn RequestHandler>, workers: usize) -> ListenerHandle {
        let (job_tx, job_rx) = mpsc::channel::<Inbound>(workers.max(1) * 2);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let worker_tasks: Vec<JoinHandle<()>> = (0..workers.max(1))
            .map(|_| {
                let peer = self.clone();
                let handler = handler.clone();
                let job_rx = job_rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { job_rx.lock().await.recv().await };
                        match job {
                            Some(inbound) => dispatch(&peer, handler.as_ref(), inbound).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let peer = self.clone();
        let listener = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    recv = peer.inner.socket.recv_from(&mut buf) => {
                        let (len, from) = match recv {
                            Ok(ok) => ok,
                            Err(e) => {
                                warn!(error = %e, "recv_from failed");
                                continue;
                            }
                        };
                        peer.route(&buf[..len], from, &job_tx).await;
                    }
                }
            }
            debug!("listener stopped");
        });

        ListenerHandle {
            stop: stop_tx,
            listener,
            workers: worker_tasks,
        }
    }

    async fn route(&self, datagram: &[u8], from: SocketAddr, job_tx: &mpsc::Sender<Inbound>) {
        let frame = match Frame::decode(datagram) {
            Ok(f) => f,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed datagram");
                return;
            }
        };
        if frame.cluster != self.cluster() {
            trace!(%from, "dropping frame from wrong cluster");
            return;
        }
        if frame.msg_type.is_response() {
            let waiter = self
                .inner
                .pending
                .lock()
                .unwrap()
                .remove(&(frame.seq, from));
            match waiter {
                // a dead waiter already timed out; the response is late
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => trace!(%from, seq = frame.seq, "dropping uncorrelated response"),
            }
            return;
        }
        let seq = frame.seq;
        if let Err(mpsc::error::TrySendError::Full(_)) =
            job_tx.try_send(Inbound { frame, from })
        {
            warn!(%from, "worker queue full, answering busy");
            let busy = Frame::new(
                MsgType::UnexpectedReq,
                seq.wrapping_add(1),
                self.cluster(),
                self.peer_id(),
                b"busy".to_vec(),
            );
            if let Ok(bytes) = busy.encode() {
                let _ = self.inner.socket.send_to(&bytes, from).await;
            }
        }
    }
}

async fn dispatch(peer: &CtpPeer, handler: &dyn RequestHandler, inbound: Inbound) {
    let msg_type = inbound.frame.msg_type;
    let rsp = Responder {
        peer: peer.clone(),
        response_seq: inbound.frame.response_seq(),
        dest: inbound.from,
        responded: AtomicBool::new(false),
    };
    let result = match msg_type {
        MsgType::StatusRequest => handler.handle_status_request(&inbound, &rsp).await,
        MsgType::Notification => handler.handle_notification(&inbound, &rsp).await,
        MsgType::BlockRequest => handler.handle_block_request(&inbound, &rsp).await,
        MsgType::CrinfoRequest => handler.handle_crinfo_request(&inbound, &rsp).await,
        MsgType::ManifestRequest => handler.handle_manifest_request(&inbound, &rsp).await,
        MsgType::NewCrinfoNotif => handler.handle_new_crinfo(&inbound, &rsp).await,
        MsgType::PeerlistPush => handler.handle_peerlist_push(&inbound, &rsp).await,
        MsgType::ClusterJoinRequest => handler.handle_cluster_join(&inbound, &rsp).await,
        MsgType::NoOp => handler.handle_no_op(&inbound).await,
        _ => handler.handle_unknown_request(&inbound, &rsp).await,
    };
    if let Err(e) = result {
        warn!(ty = ?msg_type, from = %inbound.from, error = %e, "handler failed");
        // never leak the failure across the wire as silence
        if !rsp.responded() && msg_type != MsgType::NoOp {
            let _ = rsp.send(MsgType::ServerError, b"internal error").await;
        }
    }
    handler.cleanup().await;
}

/// Handle to a running listener. Dropping it does not stop the listener;
/// call [`ListenerHandle::stop`].
pub struct ListenerHandle {
    stop: watch::Sender<bool>,
    listener: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Stop the listener loop and drain the worker pool.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.listener.await;
        for w in self.workers {
            let _ = w.await;
        }
    }
}
