//! CTP peer daemon.
//!
//! Joins a cluster, starts the CTP listener and the manifest poll loop, then
//! drops into a small REPL on stdin:
//!
//!   SHARE <path>   share a local file with the cluster
//!   SYNC           force an update cycle now
//!   EXIT           stop the listener and quit
//!
//! Peers can also be seeded from a bootstrap file of
//! `{peer_id} {ip} {port}` lines when the control server is unreachable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ctp_core::id::{ClusterId, PeerId};
use ctp_core::wire::parse_peer_list;
use ctp_net::{
    ClusterHandler, ControlApi, CtpPeer, HttpControlClient, PeerTable, SyncEngine, SyncError,
};
use ctp_store::{FileStore, ManifestStore};

#[derive(Parser)]
#[command(name = "ctp", version, about = "Cluster Transfer Protocol peer")]
struct Args {
    /// Shared directory this peer owns
    #[arg(long)]
    dir: PathBuf,

    /// Address to bind the CTP socket on
    #[arg(long, default_value = "0.0.0.0:6969")]
    addr: SocketAddr,

    /// Base URL of the control server
    #[arg(long)]
    server: String,

    /// Cluster id, 64 hex chars
    #[arg(long)]
    cluster: String,

    /// Peer id, 64 hex chars; generated when omitted
    #[arg(long)]
    peer_id: Option<String>,

    /// Bootstrap peer-list file: one `{peer_id} {ip} {port}` per line
    #[arg(long)]
    bootstrap: Option<PathBuf>,

    /// Handler worker pool size
    #[arg(long, default_value_t = 16)]
    workers: usize,

    /// Manifest-hash poll interval in seconds
    #[arg(long, default_value_t = 30)]
    poll_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cluster: ClusterId = args.cluster.parse().context("parse --cluster")?;
    let peer_id = match &args.peer_id {
        Some(s) => s.parse().context("parse --peer-id")?,
        None => {
            let mut bytes = [0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            PeerId(bytes)
        }
    };
    info!(%peer_id, "starting peer");

    let store = Arc::new(FileStore::open(&args.dir).context("open shared dir")?);
    let manifest = Arc::new(ManifestStore::open(&args.dir).context("open manifest dir")?);
    for name in store.salvageable_temps().unwrap_or_default() {
        info!(file = %name, "resuming partial download");
    }

    let peers = Arc::new(PeerTable::new());
    let control: Arc<dyn ControlApi> = Arc::new(
        HttpControlClient::new(args.server.as_str(), cluster).context("control client")?,
    );

    let peer = CtpPeer::bind(args.addr, cluster, peer_id)
        .await
        .context("bind ctp socket")?;
    let local = peer.local_addr()?;

    // membership: join the cluster, then adopt the server's peer list; fall
    // back to the bootstrap file when the server has nothing for us
    if let Err(e) = control.join(peer_id, local).await {
        warn!(error = %e, "cluster join failed, continuing with bootstrap peers");
    }
    match control.peer_list().await {
        Ok(list) if !list.is_empty() => peers.replace(&list),
        Ok(_) | Err(_) => {
            if let Some(path) = &args.bootstrap {
                let bytes = std::fs::read(path).context("read bootstrap file")?;
                let list = parse_peer_list(&bytes).context("parse bootstrap file")?;
                info!(peers = list.len(), "seeded peer table from bootstrap file");
                peers.replace(&list);
            }
        }
    }

    let (wake_tx, wake_rx) = mpsc::channel(1);
    let handler = Arc::new(ClusterHandler::new(
        store.clone(),
        manifest.clone(),
        peers.clone(),
        Some(wake_tx),
    ));
    let listener = peer.listen_with(handler, args.workers);

    let engine = Arc::new(SyncEngine::new(
        peer.clone(),
        store.clone(),
        manifest.clone(),
        peers.clone(),
        control.clone(),
    ));
    let poll = tokio::spawn(
        engine
            .clone()
            .run(Duration::from_secs(args.poll_secs), wake_rx),
    );

    repl(&engine).await?;

    poll.abort();
    listener.stop().await;
    Ok(())
}

async fn repl(engine: &SyncEngine) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("commands: SHARE <path> | SYNC | EXIT");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        match cmd.to_ascii_uppercase().as_str() {
            "" => {}
            "SHARE" => {
                if rest.is_empty() {
                    println!("usage: SHARE <path>");
                    continue;
                }
                match engine.share(std::path::Path::new(rest)).await {
                    Ok(info) => println!("shared {} ({} bytes)", info.filename, info.file_size),
                    Err(SyncError::AlreadyShared(name)) => {
                        println!("already shared: {name}")
                    }
                    Err(e) => println!("share failed: {e}"),
                }
            }
            "SYNC" => match engine.update().await {
                Ok(()) => println!("in sync"),
                Err(e) => println!("sync failed: {e}"),
            },
            "EXIT" => break,
            other => println!("unknown command: {other}"),
        }
    }
    Ok(())
}
