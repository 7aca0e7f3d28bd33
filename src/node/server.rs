//! Storage node process: controller control link plus the peer data plane.
//!
//! The node joins the controller once, then serves two kinds of traffic:
//! controller instructions (REMOVE, LIST probes, REBALANCE) over the
//! persistent control link, and raw blob transfers (STORE, LOAD_DATA,
//! REBALANCE_STORE) on its own listener. Rebalance pushes go node-to-node;
//! the controller only ever sees the completion line.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use bytes::Bytes;

use crate::common::config::NodeConfig;
use crate::common::net::{read_line_timeout, read_payload, spawn_line_writer, LineSender};
use crate::common::proto::{self, NodeCommand, NodeEvent, PeerRequest, RebalanceInstruction};
use crate::common::{Error, Result};
use crate::node::store::FileStore;

struct NodeCtx {
    port: u16,
    store: FileStore,
    control: LineSender,
    cfg: NodeConfig,
}

impl NodeCtx {
    fn peer_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.cfg.controller_addr.ip(), port)
    }

    fn send_event(&self, event: NodeEvent) {
        let line = event.to_string();
        tracing::debug!("[node {}] sending: {}", self.port, line);
        let _ = self.control.send(line);
    }
}

/// A storage node process. `serve` runs it in the foreground; `spawn`
/// backgrounds it for in-process clusters.
pub struct NodeServer {
    config: NodeConfig,
}

impl NodeServer {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    pub async fn spawn(config: NodeConfig) -> Result<RunningNode> {
        config.validate()?;
        let store = FileStore::open(&config.data_dir).await?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        let port = listener.local_addr()?.port();

        let control_stream = TcpStream::connect(config.controller_addr).await?;
        let (control_read, control_write) = control_stream.into_split();
        let control = spawn_line_writer(control_write);

        tracing::info!("storage node on port {} joining {}", port, config.controller_addr);
        tracing::info!("  data dir: {}", config.data_dir.display());
        control
            .send(proto::Request::Join { port }.to_string())
            .map_err(|_| Error::ConnectionClosed)?;

        let ctx = Arc::new(NodeCtx {
            port,
            store,
            control,
            cfg: config,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(control_loop(
            ctx.clone(),
            BufReader::new(control_read).lines(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(data_loop(ctx, listener, shutdown_rx));

        Ok(RunningNode {
            port,
            shutdown: shutdown_tx,
        })
    }

    pub async fn serve(self) -> Result<()> {
        let node = NodeServer::spawn(self.config).await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down storage node {}", node.port());
        node.shutdown();
        Ok(())
    }
}

/// Live handle to a spawned storage node.
pub struct RunningNode {
    port: u16,
    shutdown: watch::Sender<bool>,
}

impl RunningNode {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Tear the node down: both loops exit, which drops the control queue
    /// and closes the control connection, so the controller sees EOF.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// === Control link ===

async fn control_loop(
    ctx: Arc<NodeCtx>,
    mut lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = lines.next_line() => match res {
                Ok(Some(line)) => handle_control_line(&ctx, &line).await,
                Ok(None) | Err(_) => {
                    tracing::error!("[node {}] controller connection lost", ctx.port);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_control_line(ctx: &Arc<NodeCtx>, line: &str) {
    tracing::debug!("[node {}] received: {}", ctx.port, line);
    match NodeCommand::parse(line) {
        Ok(NodeCommand::Remove { name }) => match ctx.store.remove(&name).await {
            Ok(true) => ctx.send_event(NodeEvent::RemoveAck { name }),
            Ok(false) => ctx.send_event(NodeEvent::FileMissing { name }),
            Err(e) => tracing::error!("[node {}] removing {}: {}", ctx.port, name, e),
        },
        Ok(NodeCommand::List) => {
            ctx.send_event(NodeEvent::FileList(ctx.store.list()));
        }
        Ok(NodeCommand::Rebalance(instr)) => {
            let ctx = ctx.clone();
            tokio::spawn(async move { execute_rebalance(ctx, instr).await });
        }
        Err(e) => tracing::warn!("[node {}] ignoring: {}", ctx.port, e),
    }
}

/// Push every file to its destinations, then delete the local leftovers and
/// report completion. A failed push leaves everything in place; the next
/// round's listing will see the truth and try again.
async fn execute_rebalance(ctx: Arc<NodeCtx>, instr: RebalanceInstruction) {
    let mut all_pushed = true;
    for send in &instr.sends {
        match ctx.store.read(&send.name).await {
            Ok(bytes) => {
                for target in &send.targets {
                    if let Err(e) = push_replica(&ctx, &send.name, bytes.clone(), *target).await {
                        tracing::warn!(
                            "[node {}] pushing {} to node {}: {}",
                            ctx.port,
                            send.name,
                            target,
                            e
                        );
                        all_pushed = false;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("[node {}] cannot read {}: {}", ctx.port, send.name, e);
                all_pushed = false;
            }
        }
    }
    if !all_pushed {
        return;
    }
    for name in &instr.deletes {
        if let Err(e) = ctx.store.remove(name).await {
            tracing::error!("[node {}] deleting {}: {}", ctx.port, name, e);
        }
    }
    ctx.send_event(NodeEvent::RebalanceComplete);
}

async fn push_replica(ctx: &Arc<NodeCtx>, name: &str, bytes: Bytes, target: u16) -> Result<()> {
    let stream = TcpStream::connect(ctx.peer_addr(target)).await?;
    let (read_half, mut write_half) = stream.into_split();
    let header = PeerRequest::RebalanceStore {
        name: name.to_string(),
        size: bytes.len() as u64,
    };
    write_half
        .write_all(format!("{}\n", header).as_bytes())
        .await?;

    let mut lines = BufReader::new(read_half).lines();
    match read_line_timeout(&mut lines, ctx.cfg.timeout()).await? {
        Some(line) if line.trim() == proto::ACK => {}
        Some(line) => return Err(Error::UnexpectedReply(line)),
        None => return Err(Error::ConnectionClosed),
    }
    write_half.write_all(&bytes).await?;
    write_half.flush().await?;
    Ok(())
}

// === Peer data plane ===

async fn data_loop(ctx: Arc<NodeCtx>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_peer(&ctx, stream).await {
                            tracing::warn!("[node {}] data connection from {}: {}", ctx.port, peer, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("[node {}] accept failed: {}", ctx.port, e),
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// One data-plane exchange: a single command line, then raw bytes.
async fn handle_peer(ctx: &Arc<NodeCtx>, stream: TcpStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Ok(());
    }
    match PeerRequest::parse(header.trim_end())? {
        PeerRequest::Store { name, size } => {
            writer.write_all(proto::ACK.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            let data = read_payload(&mut reader, size, ctx.cfg.timeout()).await?;
            ctx.store.save(&name, &data).await?;
            tracing::info!("[node {}] stored {} ({} bytes)", ctx.port, name, size);
            ctx.send_event(NodeEvent::StoreAck { name });
        }
        PeerRequest::RebalanceStore { name, size } => {
            writer.write_all(proto::ACK.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            let data = read_payload(&mut reader, size, ctx.cfg.timeout()).await?;
            ctx.store.save(&name, &data).await?;
            tracing::info!("[node {}] received replica {} ({} bytes)", ctx.port, name, size);
        }
        PeerRequest::LoadData { name } => {
            // a missing or corrupt blob closes the connection without bytes;
            // that is the client's cue to RELOAD
            match ctx.store.read(&name).await {
                Ok(bytes) => {
                    writer.write_all(&bytes).await?;
                    writer.flush().await?;
                }
                Err(e) => tracing::warn!("[node {}] cannot serve {}: {}", ctx.port, name, e),
            }
        }
    }
    Ok(())
}
