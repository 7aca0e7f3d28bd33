//! In-memory cluster state owned by the controller.
//!
//! Membership, the allocation table, and pending quorum operations live in a
//! single [`ClusterState`] behind one mutex. The lock is never held across an
//! await point; every mutation is a short critical section, so there is no
//! lock-ordering to get wrong.

use std::collections::HashMap;
use tokio::sync::{oneshot, watch};

use crate::common::LineSender;
use crate::controller::rebalance::Plan;

/// Control-link handle for one joined storage node.
///
/// Outbound lines go through the connection's writer queue; the shutdown
/// signal tears the connection down when the controller declares the node
/// failed (e.g. an unanswered LIST probe).
#[derive(Debug)]
pub struct NodeHandle {
    pub port: u16,
    line_tx: LineSender,
    shutdown_tx: watch::Sender<bool>,
}

impl NodeHandle {
    pub fn new(port: u16, line_tx: LineSender, shutdown_tx: watch::Sender<bool>) -> Self {
        Self {
            port,
            line_tx,
            shutdown_tx,
        }
    }

    pub fn send(&self, line: String) {
        if self.line_tx.send(line).is_err() {
            tracing::debug!("dropping line for departed node {}", self.port);
        }
    }

    pub fn force_disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One committed file: ordered holder set (head is the primary returned for
/// LOAD) plus its size in bytes.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub holders: Vec<u16>,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Store,
    Remove,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Store => write!(f, "store"),
            OpKind::Remove => write!(f, "remove"),
        }
    }
}

/// A store or remove waiting for node acknowledgements.
#[derive(Debug)]
pub struct PendingOp {
    pub kind: OpKind,
    pub required: usize,
    pub received: usize,
    /// Nodes the operation was dispatched to; pruned when a node departs.
    pub targets: Vec<u16>,
    pub size: u64,
    pub client: LineSender,
    /// Distinguishes this operation from a later one reusing the name, so a
    /// stale timeout cannot abort the wrong operation.
    pub epoch: u64,
}

/// Outcome of counting one acknowledgement.
#[derive(Debug)]
pub enum AckOutcome {
    Progress,
    Complete(PendingOp),
    /// Late or duplicate ack: no pending entry for the name.
    Unknown,
    KindMismatch(OpKind),
}

/// Phase-1 listing round: LIST probes outstanding against `expected`.
#[derive(Debug)]
pub struct ListingCollector {
    pub expected: Vec<u16>,
    pub replies: Vec<(u16, Vec<String>)>,
    done: Option<oneshot::Sender<()>>,
}

impl ListingCollector {
    fn check_complete(&mut self) {
        if self.replies.len() == self.expected.len() {
            if let Some(tx) = self.done.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// Phase-5 transfer round: REBALANCE_COMPLETE acks outstanding.
#[derive(Debug)]
pub struct RoundCompletion {
    pub expected: usize,
    pub received: usize,
    pub plan: Plan,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: Vec<NodeHandle>,
    files: HashMap<String, FileRecord>,
    pending: HashMap<String, PendingOp>,
    next_epoch: u64,
    listing: Option<ListingCollector>,
    round: Option<RoundCompletion>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    // === Membership ===

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_joined(&self, port: u16) -> bool {
        self.nodes.iter().any(|n| n.port == port)
    }

    pub fn node(&self, port: u16) -> Option<&NodeHandle> {
        self.nodes.iter().find(|n| n.port == port)
    }

    /// Ports in join order. Placement tie-breaking leans on this order being
    /// stable between calls, nothing more.
    pub fn ports(&self) -> Vec<u16> {
        self.nodes.iter().map(|n| n.port).collect()
    }

    pub fn join(&mut self, handle: NodeHandle) -> bool {
        if self.is_joined(handle.port) {
            return false;
        }
        self.nodes.push(handle);
        true
    }

    /// Remove a node and cascade through every table referencing it.
    ///
    /// `wipe_allocation` distinguishes the two departure paths: a silent
    /// disconnect drops the node's allocation entries immediately, while a
    /// probe-timeout disconnect leaves them for the in-flight round's
    /// ground-truth reconciliation.
    pub fn purge_node(&mut self, port: u16, wipe_allocation: bool) -> Option<NodeHandle> {
        let idx = self.nodes.iter().position(|n| n.port == port)?;
        let handle = self.nodes.remove(idx);

        for op in self.pending.values_mut() {
            op.targets.retain(|p| *p != port);
        }
        if wipe_allocation {
            self.files.retain(|_, rec| {
                rec.holders.retain(|p| *p != port);
                !rec.holders.is_empty()
            });
        }
        if let Some(listing) = &mut self.listing {
            listing.expected.retain(|p| *p != port);
            listing.replies.retain(|(p, _)| *p != port);
            listing.check_complete();
        }
        Some(handle)
    }

    // === Allocation table ===

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn record(&self, name: &str) -> Option<&FileRecord> {
        self.files.get(name)
    }

    /// Number of allocation entries naming `port` as a holder.
    pub fn files_on(&self, port: u16) -> usize {
        self.files
            .values()
            .filter(|rec| rec.holders.contains(&port))
            .count()
    }

    /// (port, held file count) in join order, the placement policy's input.
    pub fn load_per_node(&self) -> Vec<(u16, usize)> {
        self.nodes
            .iter()
            .map(|n| (n.port, self.files_on(n.port)))
            .collect()
    }

    /// Files visible to clients: committed entries with no pending operation.
    pub fn visible_files(&self) -> Vec<String> {
        self.files
            .keys()
            .filter(|name| !self.pending.contains_key(*name))
            .cloned()
            .collect()
    }

    pub fn has_file_or_pending(&self, name: &str) -> bool {
        self.files.contains_key(name) || self.pending.contains_key(name)
    }

    pub fn has_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    pub fn allocate(&mut self, name: String, holders: Vec<u16>, size: u64) {
        self.files.insert(name, FileRecord { holders, size });
    }

    pub fn deallocate(&mut self, name: &str) {
        self.files.remove(name);
    }

    /// Replace the whole table with the ground truth of a listing round.
    /// Sizes survive only for files some node still reported.
    pub fn rebuild_from_snapshot(&mut self, alloc: Vec<(String, Vec<u16>)>) {
        let mut rebuilt = HashMap::with_capacity(alloc.len());
        for (name, holders) in alloc {
            let size = self.files.get(&name).map(|rec| rec.size).unwrap_or_else(|| {
                tracing::warn!("no recorded size for rediscovered file {}", name);
                0
            });
            rebuilt.insert(name, FileRecord { holders, size });
        }
        self.files = rebuilt;
    }

    // === Pending quorum operations ===

    pub fn begin_op(
        &mut self,
        name: String,
        kind: OpKind,
        required: usize,
        targets: Vec<u16>,
        size: u64,
        client: LineSender,
    ) -> u64 {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.pending.insert(
            name,
            PendingOp {
                kind,
                required,
                received: 0,
                targets,
                size,
                client,
                epoch,
            },
        );
        epoch
    }

    /// Count one acknowledgement for `name`. A store commits once exactly
    /// `required` acks arrived; a remove commits once every still-targeted
    /// node answered (a node reporting the file absent counts too).
    pub fn ack(&mut self, name: &str, kind: OpKind) -> AckOutcome {
        let Some(op) = self.pending.get_mut(name) else {
            return AckOutcome::Unknown;
        };
        if op.kind != kind {
            return AckOutcome::KindMismatch(op.kind);
        }
        op.received += 1;
        let complete = match kind {
            OpKind::Store => op.received == op.required,
            OpKind::Remove => op.received >= op.targets.len(),
        };
        if complete {
            match self.pending.remove(name) {
                Some(op) => AckOutcome::Complete(op),
                None => AckOutcome::Unknown,
            }
        } else {
            AckOutcome::Progress
        }
    }

    /// Abort the pending operation for `name` if it is still the one the
    /// timer was armed for. Returns the discarded operation.
    pub fn abort_op(&mut self, name: &str, epoch: u64) -> Option<PendingOp> {
        match self.pending.get(name) {
            Some(op) if op.epoch == epoch => self.pending.remove(name),
            _ => None,
        }
    }

    // === Rebalance round bookkeeping ===

    pub fn start_listing(&mut self, expected: Vec<u16>, done: oneshot::Sender<()>) {
        self.listing = Some(ListingCollector {
            expected,
            replies: Vec::new(),
            done: Some(done),
        });
    }

    pub fn take_listing(&mut self) -> Option<ListingCollector> {
        self.listing.take()
    }

    /// Record one node's LIST reply; false when no listing round is open or
    /// the node was not probed (the reply is then dropped).
    pub fn record_listing(&mut self, port: u16, files: Vec<String>) -> bool {
        let Some(listing) = &mut self.listing else {
            return false;
        };
        if !listing.expected.contains(&port) || listing.replies.iter().any(|(p, _)| *p == port) {
            return false;
        }
        listing.replies.push((port, files));
        listing.check_complete();
        true
    }

    pub fn start_round(&mut self, plan: Plan, expected: usize, done: oneshot::Sender<()>) {
        self.round = Some(RoundCompletion {
            expected,
            received: 0,
            plan,
            done: Some(done),
        });
    }

    pub fn take_round(&mut self) -> Option<RoundCompletion> {
        self.round.take()
    }

    /// Count one REBALANCE_COMPLETE; false when no transfer round is open.
    pub fn rebalance_completed(&mut self) -> bool {
        let Some(round) = &mut self.round else {
            return false;
        };
        round.received += 1;
        if round.received >= round.expected {
            if let Some(tx) = round.done.take() {
                let _ = tx.send(());
            }
        }
        true
    }

    /// Fold a transfer plan into the allocation table. Additions are kept
    /// only for nodes still joined, tolerating departures mid-transfer;
    /// files ending up with no holder at all are dropped.
    pub fn commit_plan(&mut self, plan: &Plan) {
        let joined = self.ports();
        for (src, entry) in &plan.per_node {
            for (name, dests) in &entry.sends {
                if let Some(rec) = self.files.get_mut(name) {
                    for d in dests {
                        if joined.contains(d) && !rec.holders.contains(d) {
                            rec.holders.push(*d);
                        }
                    }
                }
            }
            for name in &entry.deletes {
                if let Some(rec) = self.files.get_mut(name) {
                    rec.holders.retain(|p| p != src);
                }
            }
        }
        self.files.retain(|_, rec| !rec.holders.is_empty());
    }
}
