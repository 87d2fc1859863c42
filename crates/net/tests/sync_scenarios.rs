//! End-to-end sync scenarios over loopback peers and an in-memory control
//! server: share/update convergence, per-block failover, creator fallback,
//! wellness reporting, and hash-mismatch recovery.

mod common;

use std::sync::Arc;

use async_trait::async_trait;

use common::{file_bytes, init_tracing, pid, MockControl, TestPeer};
use ctp_core::digest::digest_bytes;
use ctp_core::frame::MsgType;
use ctp_core::wire::{self, BlockStatus};
use ctp_net::{ClusterHandler, ControlApi, Inbound, RequestHandler, Responder, SyncError};

fn write_source_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn two_peer_single_file_share() {
    init_tracing();
    let control = MockControl::new();
    let a = TestPeer::spawn(1, control.clone()).await;
    let b = TestPeer::spawn(2, control.clone()).await;
    b.peers.upsert(a.peer.peer_id(), a.addr);

    let bytes = file_bytes(3000);
    let src = tempfile::TempDir::new().unwrap();
    let path = write_source_file(&src, "hello.txt", &bytes);

    a.engine.share(&path).await.unwrap();
    b.engine.update().await.unwrap();

    // B converged: same bytes, same digest, manifest agrees, nothing partial
    let b_file = std::fs::read(b.dir.path().join("hello.txt")).unwrap();
    assert_eq!(b_file, bytes);
    assert_eq!(
        digest_bytes(&b_file),
        a.store.get_info("hello.txt").unwrap().content_hash
    );
    assert_eq!(b.manifest.load().unwrap().names(), ["hello.txt"]);
    assert_eq!(control.manifest_names(), ["hello.txt"]);
    let temps: Vec<_> = std::fs::read_dir(b.dir.path().join("crtemp"))
        .unwrap()
        .collect();
    assert!(temps.is_empty(), "no .crtemp may remain after convergence");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sharing_twice_reports_already_shared() {
    init_tracing();
    let control = MockControl::new();
    let a = TestPeer::spawn(1, control.clone()).await;

    let src = tempfile::TempDir::new().unwrap();
    let path = write_source_file(&src, "dup.bin", &file_bytes(100));
    a.engine.share(&path).await.unwrap();
    let err = a.engine.share(&path).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyShared(name) if name == "dup.bin"));

    a.shutdown().await;
}

/// Forwards everything to the stock handler but answers "not have" for one
/// block id.
struct DenyOneBlock {
    inner: ClusterHandler,
    deny: u32,
}

#[async_trait]
impl RequestHandler for DenyOneBlock {
    async fn handle_block_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        let (hash, block_id) = wire::parse_block_request(&req.frame.payload)?;
        if block_id == self.deny {
            rsp.send(
                MsgType::BlockResponse,
                &wire::encode_block_response(&hash, block_id, BlockStatus::NotHave, &[]),
            )
            .await?;
            return Ok(());
        }
        self.inner.handle_block_request(req, rsp).await
    }

    async fn handle_crinfo_request(&self, req: &Inbound, rsp: &Responder) -> anyhow::Result<()> {
        self.inner.handle_crinfo_request(req, rsp).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn block_missing_on_first_peer_comes_from_second() {
    init_tracing();
    let control = MockControl::new();
    let mut a = TestPeer::spawn(1, control.clone()).await;
    let b = TestPeer::spawn(2, control.clone()).await;
    let c = TestPeer::spawn(3, control.clone()).await;

    let bytes = file_bytes(3 * 1024);
    let src = tempfile::TempDir::new().unwrap();
    let path = write_source_file(&src, "f.bin", &bytes);
    a.engine.share(&path).await.unwrap();

    // C already holds the full file
    c.store.import_file("f.bin", &bytes, 1).unwrap();

    // A stops serving block 2
    a.listener.take().unwrap().stop().await;
    let filtered = Arc::new(DenyOneBlock {
        inner: a.cluster_handler(),
        deny: 2,
    });
    a.listener = Some(a.peer.listen(filtered));

    b.peers.upsert(a.peer.peer_id(), a.addr);
    b.peers.upsert(c.peer.peer_id(), c.addr);
    b.engine.update().await.unwrap();

    assert_eq!(std::fs::read(b.dir.path().join("f.bin")).unwrap(), bytes);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_peer_is_reported_exactly_once_and_removed() {
    init_tracing();
    let control = MockControl::new();
    let a = TestPeer::spawn(1, control.clone()).await;
    let b = TestPeer::spawn(2, control.clone()).await;

    // share so the manifest lists a 3-block file, then B gets its descriptor
    let bytes = file_bytes(3 * 1024);
    let src = tempfile::TempDir::new().unwrap();
    let path = write_source_file(&src, "f.bin", &bytes);
    let info = a.engine.share(&path).await.unwrap();
    b.store.put_info(&info).unwrap();

    // D is a bound socket nobody reads from: requests time out
    let d_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let d_addr = d_socket.local_addr().unwrap();
    b.peers.upsert(pid(4), d_addr);

    // three block acquisitions, three consecutive timeouts on D
    b.engine.update().await.unwrap();

    assert_eq!(control.wellness_log(), vec![pid(4)]);
    assert!(!b.peers.contains(&pid(4)), "reported peer must disappear");
    // the file could not complete: D was the only candidate
    assert!(!b.store.has_final("f.bin"));

    // another cycle must not report D again
    b.engine.update().await.unwrap();
    assert_eq!(control.wellness_log(), vec![pid(4)]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn creator_fallback_completes_the_file() {
    init_tracing();
    let control = MockControl::new();
    let b = TestPeer::spawn(2, control.clone()).await;
    let c = TestPeer::spawn(3, control.clone()).await;
    let e = TestPeer::spawn(5, control.clone()).await;

    let bytes = file_bytes(2500);
    // C created the file but is unknown to B; the control server knows
    let info = c.store.import_file("f.bin", &bytes, 1).unwrap();
    control.push_manifest(&info).await.unwrap();
    control.set_creator(info.content_hash, c.addr);

    // E mirrors only the descriptor (a peer that synced the info but holds
    // no blocks), so B can learn the file's hash but not its content
    e.store.put_info(&info).unwrap();
    b.peers.upsert(e.peer.peer_id(), e.addr);

    b.engine.update().await.unwrap();

    assert_eq!(std::fs::read(b.dir.path().join("f.bin")).unwrap(), bytes);
    // the creator was learned and added to the peer table
    assert!(b.peers.contains(&c.peer.peer_id()));

    b.shutdown().await;
    c.shutdown().await;
    e.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_block_recovers_over_two_cycles() {
    init_tracing();
    let control = MockControl::new();
    let a = TestPeer::spawn(1, control.clone()).await;
    let b = TestPeer::spawn(2, control.clone()).await;
    b.peers.upsert(a.peer.peer_id(), a.addr);

    let bytes = file_bytes(3 * 1024);
    let src = tempfile::TempDir::new().unwrap();
    let path = write_source_file(&src, "f.bin", &bytes);
    let info = a.engine.share(&path).await.unwrap();

    // inject a corrupted (right-sized) block before B ever syncs
    b.store.put_info(&info).unwrap();
    let handle = b.store.open_temp(&info).unwrap();
    b.store.write_block(&handle, 1, &vec![0xEE; 1024]).unwrap();

    // first cycle: fills blocks 0 and 2, finalize detects the corruption and
    // clears every pointer
    b.engine.update().await.unwrap();
    assert!(!b.store.has_final("f.bin"));
    assert_eq!(
        b.store.missing_blocks(&handle).unwrap(),
        vec![0, 1, 2],
        "hash mismatch must clear all pointers"
    );

    // second cycle: clean re-download succeeds
    b.engine.update().await.unwrap();
    assert_eq!(std::fs::read(b.dir.path().join("f.bin")).unwrap(), bytes);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn peers_converge_to_equal_file_sets() {
    init_tracing();
    let control = MockControl::new();
    let a = TestPeer::spawn(1, control.clone()).await;
    let b = TestPeer::spawn(2, control.clone()).await;
    let c = TestPeer::spawn(3, control.clone()).await;
    for peer in [&b, &c] {
        peer.peers.upsert(a.peer.peer_id(), a.addr);
    }
    b.peers.upsert(c.peer.peer_id(), c.addr);
    c.peers.upsert(b.peer.peer_id(), b.addr);

    let src = tempfile::TempDir::new().unwrap();
    for (name, len) in [("one.bin", 100usize), ("two.bin", 2048), ("three.bin", 5000)] {
        let path = write_source_file(&src, name, &file_bytes(len));
        a.engine.share(&path).await.unwrap();
    }

    // run both to quiescence against the same server manifest
    b.engine.update().await.unwrap();
    c.engine.update().await.unwrap();

    let finalized = |p: &TestPeer| {
        let mut names: Vec<String> = p
            .manifest
            .load()
            .unwrap()
            .names()
            .iter()
            .filter(|n| p.store.has_final(n))
            .cloned()
            .collect();
        names.sort();
        names
    };
    assert_eq!(finalized(&b), finalized(&c));
    assert_eq!(finalized(&b), ["one.bin", "three.bin", "two.bin"]);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}
