//! Controller server: accept loop, protocol dispatch, quorum timers and the
//! rebalance round driver.
//!
//! Every accepted connection starts as a client connection; a JOIN upgrades
//! it into a storage node control link for the rest of its life. Client
//! commands on one connection are dispatched strictly in order; node
//! acknowledgements arrive on their own connections and may interleave
//! freely, which is why all counting goes through [`ClusterState`] under its
//! mutex.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use crate::common::config::ControllerConfig;
use crate::common::net::{spawn_line_writer, LineSender};
use crate::common::proto::{
    FileSend, NodeCommand, NodeEvent, RebalanceInstruction, Reply, Request,
};
use crate::common::Result;
use crate::controller::gate::OpGate;
use crate::controller::placement;
use crate::controller::rebalance::{self, NodePlan, Snapshot};
use crate::controller::session::{Fallback, Session};
use crate::controller::state::{AckOutcome, ClusterState, NodeHandle, OpKind};

type LineReader = Lines<BufReader<OwnedReadHalf>>;

pub(crate) struct Inner {
    cfg: ControllerConfig,
    state: Mutex<ClusterState>,
    gate: OpGate,
}

/// The coordinator process. `serve` runs it in the foreground; `spawn`
/// backgrounds it and returns a handle, which is how the tests drive a whole
/// cluster inside one process.
pub struct Controller {
    config: ControllerConfig,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    pub async fn spawn(config: ControllerConfig) -> Result<ControllerHandle> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let addr = listener.local_addr()?;

        tracing::info!("controller listening on {}", addr);
        tracing::info!("  replication factor: {}", config.replication);
        tracing::info!("  operation timeout: {}ms", config.timeout_ms);
        tracing::info!("  rebalance period: {}ms", config.rebalance_period_ms);

        let inner = Arc::new(Inner {
            gate: OpGate::new(config.auto_rebalance),
            state: Mutex::new(ClusterState::new()),
            cfg: config,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(inner.clone(), listener, shutdown_rx.clone()));
        tokio::spawn(rebalance_timer(inner.clone(), shutdown_rx));

        Ok(ControllerHandle {
            addr,
            inner,
            shutdown: shutdown_tx,
        })
    }

    pub async fn serve(self) -> Result<()> {
        let handle = Controller::spawn(self.config).await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down controller");
        handle.shutdown();
        Ok(())
    }
}

/// Live handle to a spawned controller.
pub struct ControllerHandle {
    addr: SocketAddr,
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
}

impl ControllerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The external "may rebalance" switch; rounds refuse to start while off.
    pub fn set_rebalance_enabled(&self, enabled: bool) {
        self.inner.gate.set_enabled(enabled);
    }

    /// Kick off a rebalance round attempt outside the periodic schedule.
    pub fn trigger_rebalance(&self) {
        let inner = self.inner.clone();
        tokio::spawn(run_rebalance_round(inner));
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(inner.clone(), stream, peer));
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn rebalance_timer(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(inner.cfg.rebalance_period());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let enough = {
                    inner.state.lock().unwrap().node_count() >= inner.cfg.replication
                };
                if enough {
                    run_rebalance_round(inner.clone()).await;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

// === Connection handling ===

async fn handle_connection(inner: Arc<Inner>, stream: TcpStream, peer: SocketAddr) {
    let (read_half, write_half) = stream.into_split();
    let tx = spawn_line_writer(write_half);
    let mut lines = BufReader::new(read_half).lines();
    let mut session = Session::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // client gone; its session dies with this task
            Ok(None) | Err(_) => return,
        };
        // nothing is dispatched while a rebalance round runs
        inner.gate.client_turn().await;
        tracing::debug!("[{}] received: {}", peer, line);

        let request = match Request::parse(&line) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("[{}] ignoring: {}", peer, e);
                continue;
            }
        };
        match request {
            Request::Join { port } => {
                match register_node(&inner, port, tx.clone()) {
                    Some(shutdown_rx) => node_loop(inner, port, lines, shutdown_rx).await,
                    None => tracing::warn!("[{}] rejecting duplicate JOIN for port {}", peer, port),
                }
                return;
            }
            Request::Store { name, size } => handle_store(&inner, &tx, name, size).await,
            Request::Load { name } => handle_load(&inner, &tx, &mut session, name),
            Request::Reload { name } => handle_reload(&inner, &tx, &mut session, name),
            Request::Remove { name } => handle_remove(&inner, &tx, name).await,
            Request::List => handle_list(&inner, &tx),
        }
    }
}

fn send_reply(tx: &LineSender, reply: &Reply) {
    let line = reply.to_string();
    tracing::debug!("sending: {}", line);
    let _ = tx.send(line);
}

// === Membership ===

fn register_node(
    inner: &Arc<Inner>,
    port: u16,
    tx: LineSender,
) -> Option<watch::Receiver<bool>> {
    let joined = {
        let mut st = inner.state.lock().unwrap();
        if st.is_joined(port) {
            None
        } else {
            let (sd_tx, sd_rx) = watch::channel(false);
            st.join(NodeHandle::new(port, tx, sd_tx));
            Some((st.node_count(), sd_rx))
        }
    };
    let (count, sd_rx) = joined?;
    tracing::info!("storage node joined on port {} ({} joined)", port, count);
    if count >= inner.cfg.replication {
        let inner = inner.clone();
        tokio::spawn(run_rebalance_round(inner));
    }
    Some(sd_rx)
}

/// Control-link read loop for one joined node. Ends on EOF, read error, or a
/// forced disconnect from the rebalance driver.
async fn node_loop(
    inner: Arc<Inner>,
    port: u16,
    mut lines: LineReader,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = lines.next_line() => match res {
                Ok(Some(line)) => dispatch_node_event(&inner, port, &line),
                Ok(None) | Err(_) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    node_departed(&inner, port);
}

fn dispatch_node_event(inner: &Arc<Inner>, port: u16, line: &str) {
    tracing::debug!("[node {}] received: {}", port, line);
    match NodeEvent::parse(line) {
        Ok(NodeEvent::StoreAck { name }) => handle_store_ack(inner, &name),
        Ok(NodeEvent::RemoveAck { name }) | Ok(NodeEvent::FileMissing { name }) => {
            handle_remove_ack(inner, &name)
        }
        Ok(NodeEvent::FileList(files)) => handle_node_listing(inner, port, files),
        Ok(NodeEvent::RebalanceComplete) => handle_rebalance_complete(inner),
        Err(e) => tracing::warn!("[node {}] ignoring: {}", port, e),
    }
}

/// Cascading cleanup after a node's control link dies. A node the rebalance
/// driver already disconnected was purged there and is skipped here.
fn node_departed(inner: &Arc<Inner>, port: u16) {
    let purged = {
        let mut st = inner.state.lock().unwrap();
        st.purge_node(port, true).is_some()
    };
    if purged {
        tracing::warn!("storage node on port {} disconnected", port);
        let inner = inner.clone();
        tokio::spawn(run_rebalance_round(inner));
    }
}

// === Store ===

async fn handle_store(inner: &Arc<Inner>, tx: &LineSender, name: String, size: u64) {
    inner.gate.begin_mutation(OpKind::Store).await;
    let outcome = {
        let mut st = inner.state.lock().unwrap();
        if st.node_count() < inner.cfg.replication {
            Err(Reply::NotEnoughNodes)
        } else if st.has_file_or_pending(&name) {
            Err(Reply::FileAlreadyExists)
        } else {
            let targets = placement::choose_targets(&st.load_per_node(), inner.cfg.replication);
            let epoch = st.begin_op(
                name.clone(),
                OpKind::Store,
                inner.cfg.replication,
                targets.clone(),
                size,
                tx.clone(),
            );
            Ok((targets, epoch))
        }
    };
    match outcome {
        Err(reply) => {
            inner.gate.end_mutation(OpKind::Store);
            send_reply(tx, &reply);
        }
        Ok((targets, epoch)) => {
            send_reply(tx, &Reply::StoreTo(targets));
            spawn_op_timer(inner.clone(), name, epoch, OpKind::Store);
        }
    }
}

fn handle_store_ack(inner: &Arc<Inner>, name: &str) {
    let completed = {
        let mut st = inner.state.lock().unwrap();
        match st.ack(name, OpKind::Store) {
            AckOutcome::Complete(op) => {
                st.allocate(name.to_string(), op.targets.clone(), op.size);
                Some(op)
            }
            AckOutcome::Progress => None,
            AckOutcome::Unknown => {
                tracing::warn!("late or duplicate STORE_ACK for {}", name);
                None
            }
            AckOutcome::KindMismatch(kind) => {
                tracing::warn!("STORE_ACK for {} but a {} is pending", name, kind);
                None
            }
        }
    };
    if let Some(op) = completed {
        tracing::info!("store of {} committed to {} nodes", name, op.targets.len());
        let _ = op.client.send(Reply::StoreComplete.to_string());
        inner.gate.end_mutation(OpKind::Store);
    }
}

// === Load / reload ===

fn handle_load(inner: &Arc<Inner>, tx: &LineSender, session: &mut Session, name: String) {
    let reply = {
        let st = inner.state.lock().unwrap();
        if st.node_count() < inner.cfg.replication {
            Reply::NotEnoughNodes
        } else {
            match st.record(&name) {
                Some(rec) if !rec.holders.is_empty() => {
                    session.arm_reload(name.clone(), placement::reload_fallback(&rec.holders));
                    Reply::LoadFrom {
                        port: rec.holders[0],
                        size: rec.size,
                    }
                }
                _ => Reply::FileDoesNotExist,
            }
        }
    };
    send_reply(tx, &reply);
}

fn handle_reload(inner: &Arc<Inner>, tx: &LineSender, session: &mut Session, name: String) {
    let reply = {
        let st = inner.state.lock().unwrap();
        match session.next_fallback(|port| st.is_joined(port)) {
            Fallback::Retry(port) => match st.record(&name) {
                Some(rec) => Some(Reply::LoadFrom {
                    port,
                    size: rec.size,
                }),
                None => Some(Reply::LoadFailed),
            },
            Fallback::Exhausted { tried } => {
                tracing::warn!("load of {} failed after offering {} nodes", name, tried);
                Some(Reply::LoadFailed)
            }
            Fallback::NotArmed => {
                tracing::warn!("RELOAD of {} without a preceding LOAD", name);
                None
            }
        }
    };
    if let Some(reply) = reply {
        send_reply(tx, &reply);
    }
}

// === Remove ===

async fn handle_remove(inner: &Arc<Inner>, tx: &LineSender, name: String) {
    inner.gate.begin_mutation(OpKind::Remove).await;
    let outcome = {
        let mut st = inner.state.lock().unwrap();
        if st.node_count() < inner.cfg.replication {
            Err(Reply::NotEnoughNodes)
        } else {
            // a file mid-remove reads as already gone
            let holders = match st.record(&name) {
                Some(rec) if !st.has_pending(&name) => Some(rec.holders.clone()),
                _ => None,
            };
            match holders {
                Some(holders) => {
                    let epoch = st.begin_op(
                        name.clone(),
                        OpKind::Remove,
                        holders.len(),
                        holders.clone(),
                        0,
                        tx.clone(),
                    );
                    let command = NodeCommand::Remove { name: name.clone() }.to_string();
                    for port in &holders {
                        if let Some(node) = st.node(*port) {
                            node.send(command.clone());
                        }
                    }
                    Ok(epoch)
                }
                None => Err(Reply::FileDoesNotExist),
            }
        }
    };
    match outcome {
        Err(reply) => {
            inner.gate.end_mutation(OpKind::Remove);
            send_reply(tx, &reply);
        }
        Ok(epoch) => spawn_op_timer(inner.clone(), name, epoch, OpKind::Remove),
    }
}

fn handle_remove_ack(inner: &Arc<Inner>, name: &str) {
    let completed = {
        let mut st = inner.state.lock().unwrap();
        match st.ack(name, OpKind::Remove) {
            AckOutcome::Complete(op) => {
                st.deallocate(name);
                Some(op)
            }
            AckOutcome::Progress => None,
            AckOutcome::Unknown => {
                tracing::warn!("late or duplicate remove acknowledgement for {}", name);
                None
            }
            AckOutcome::KindMismatch(kind) => {
                tracing::warn!("remove acknowledgement for {} but a {} is pending", name, kind);
                None
            }
        }
    };
    if let Some(op) = completed {
        tracing::info!("remove of {} committed", name);
        let _ = op.client.send(Reply::RemoveComplete.to_string());
        inner.gate.end_mutation(OpKind::Remove);
    }
}

// === List ===

fn handle_list(inner: &Arc<Inner>, tx: &LineSender) {
    let reply = {
        let st = inner.state.lock().unwrap();
        if st.node_count() < inner.cfg.replication {
            Reply::NotEnoughNodes
        } else {
            Reply::FileList(st.visible_files())
        }
    };
    send_reply(tx, &reply);
}

// === Quorum timers ===

/// Arm the operation timeout: if the quorum has not finalized by then the
/// pending entry is discarded without replying; the client's own read
/// timeout is its signal.
fn spawn_op_timer(inner: Arc<Inner>, name: String, epoch: u64, kind: OpKind) {
    tokio::spawn(async move {
        tokio::time::sleep(inner.cfg.timeout()).await;
        let aborted = {
            let mut st = inner.state.lock().unwrap();
            st.abort_op(&name, epoch).is_some()
        };
        if aborted {
            tracing::warn!(
                "{} of {} abandoned: acknowledgements missing after {}ms",
                kind,
                name,
                inner.cfg.timeout_ms
            );
            inner.gate.end_mutation(kind);
        }
    });
}

// === Rebalance round driver ===

fn handle_node_listing(inner: &Arc<Inner>, port: u16, files: Vec<String>) {
    let recorded = {
        let mut st = inner.state.lock().unwrap();
        st.record_listing(port, files)
    };
    if !recorded {
        tracing::warn!("unexpected LIST reply from node {}", port);
    }
}

fn handle_rebalance_complete(inner: &Arc<Inner>) {
    let counted = {
        let mut st = inner.state.lock().unwrap();
        st.rebalance_completed()
    };
    if !counted {
        tracing::warn!("late REBALANCE_COMPLETE acknowledgement");
    }
}

/// One full rebalance round: listing → reconciliation → planning →
/// transfers. Returns quietly when another round is running, rebalancing is
/// switched off, or there is nothing to do.
pub(crate) async fn run_rebalance_round(inner: Arc<Inner>) {
    if inner.state.lock().unwrap().file_count() == 0 {
        return;
    }
    if !inner.gate.try_begin_rebalance() {
        return;
    }
    // client mutations already in flight finish first; new ones are held at
    // the gate until the round ends
    inner.gate.mutations_drained().await;

    // Phase 1: LIST probes to every joined node
    let listing_rx = {
        let mut st = inner.state.lock().unwrap();
        if st.file_count() == 0 || st.node_count() == 0 {
            drop(st);
            inner.gate.end_rebalance();
            return;
        }
        let ports = st.ports();
        let (done_tx, done_rx) = oneshot::channel();
        st.start_listing(ports.clone(), done_tx);
        let probe = NodeCommand::List.to_string();
        for port in &ports {
            if let Some(node) = st.node(*port) {
                node.send(probe.clone());
            }
        }
        tracing::info!("rebalance round started: probing {} nodes", ports.len());
        done_rx
    };
    let _ = tokio::time::timeout(inner.cfg.timeout(), listing_rx).await;

    // close the books on the listing; nodes that stayed silent are failed
    let snapshot = {
        let mut st = inner.state.lock().unwrap();
        let Some(listing) = st.take_listing() else {
            drop(st);
            inner.gate.end_rebalance();
            return;
        };
        let silent: Vec<u16> = listing
            .expected
            .iter()
            .copied()
            .filter(|p| !listing.replies.iter().any(|(rp, _)| rp == p))
            .collect();
        for port in silent {
            tracing::warn!("node {} missed the LIST probe deadline; disconnecting it", port);
            if let Some(handle) = st.purge_node(port, false) {
                handle.force_disconnect();
            }
        }
        Snapshot {
            entries: listing.replies,
        }
    };

    // Phase 2 + 3 + 4: rebuild ground truth, then plan repairs and moves
    let plan = {
        let mut st = inner.state.lock().unwrap();
        st.rebuild_from_snapshot(rebalance::rebuild_allocation(&snapshot));
        if st.file_count() == 0 {
            tracing::info!("rebalance round over: no files survived the listing");
            drop(st);
            inner.gate.end_rebalance();
            return;
        }
        rebalance::plan(&snapshot, inner.cfg.replication)
    };
    if !plan.balance_found {
        tracing::warn!("no move sequence evens out the load; applying replica repairs only");
    }
    if plan.is_empty() {
        tracing::info!("rebalance round over: nothing to transfer");
        inner.gate.end_rebalance();
        return;
    }

    // Phase 5: one instruction per source node, then wait for completions
    let round_rx = {
        let mut st = inner.state.lock().unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        st.start_round(plan.clone(), plan.per_node.len(), done_tx);
        for (port, entry) in &plan.per_node {
            if let Some(node) = st.node(*port) {
                node.send(NodeCommand::Rebalance(to_instruction(entry)).to_string());
            }
        }
        done_rx
    };
    tracing::info!("rebalance: instructed {} nodes", plan.per_node.len());
    if tokio::time::timeout(inner.cfg.timeout(), round_rx).await.is_err() {
        tracing::warn!("rebalance transfers timed out; committing the plan regardless");
    }
    {
        // On timeout this may record holders whose bytes never landed; the
        // next round's listing phase is what corrects such entries.
        let mut st = inner.state.lock().unwrap();
        if let Some(round) = st.take_round() {
            st.commit_plan(&round.plan);
        }
    }
    inner.gate.end_rebalance();
    tracing::info!("rebalance round complete");
}

fn to_instruction(entry: &NodePlan) -> RebalanceInstruction {
    RebalanceInstruction {
        sends: entry
            .sends
            .iter()
            .map(|(name, targets)| FileSend {
                name: name.clone(),
                targets: targets.clone(),
            })
            .collect(),
        deletes: entry.deletes.clone(),
    }
}
