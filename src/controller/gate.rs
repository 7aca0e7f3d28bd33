//! Mutual exclusion between client mutations and rebalance rounds.
//!
//! The controller never rebalances while a store or remove quorum is in
//! flight, and never dispatches client commands while a rebalance round
//! runs. The state machine lives in a `watch` channel so waiters block on
//! [`watch::Receiver::wait_for`] instead of spinning, and the whole gate is
//! testable on its own.

use tokio::sync::watch;

use crate::controller::state::OpKind;

#[derive(Debug, Clone, Copy)]
struct GateState {
    stores: usize,
    removes: usize,
    rebalancing: bool,
    /// External "may rebalance" switch (test harnesses flip this off).
    enabled: bool,
}

#[derive(Debug)]
pub struct OpGate {
    tx: watch::Sender<GateState>,
}

impl OpGate {
    pub fn new(auto_rebalance: bool) -> Self {
        let (tx, _) = watch::channel(GateState {
            stores: 0,
            removes: 0,
            rebalancing: false,
            enabled: auto_rebalance,
        });
        Self { tx }
    }

    /// Client commands wait out an in-flight rebalance round before being
    /// dispatched at all.
    pub async fn client_turn(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| !s.rebalancing).await;
    }

    /// Claim a mutation slot, waiting for any running rebalance round first.
    /// The check and the increment are one atomic step, so a round that
    /// starts concurrently either sees the slot or blocks this claim.
    pub async fn begin_mutation(&self, kind: OpKind) {
        let mut rx = self.tx.subscribe();
        loop {
            let mut admitted = false;
            self.tx.send_modify(|s| {
                if !s.rebalancing {
                    match kind {
                        OpKind::Store => s.stores += 1,
                        OpKind::Remove => s.removes += 1,
                    }
                    admitted = true;
                }
            });
            if admitted {
                return;
            }
            if rx.wait_for(|s| !s.rebalancing).await.is_err() {
                return;
            }
        }
    }

    pub fn end_mutation(&self, kind: OpKind) {
        self.tx.send_modify(|s| match kind {
            OpKind::Store => s.stores = s.stores.saturating_sub(1),
            OpKind::Remove => s.removes = s.removes.saturating_sub(1),
        });
    }

    /// Single-flight claim on the rebalance phase. Returns false when a
    /// round already runs or rebalancing is switched off.
    pub fn try_begin_rebalance(&self) -> bool {
        let mut claimed = false;
        self.tx.send_modify(|s| {
            if s.enabled && !s.rebalancing {
                s.rebalancing = true;
                claimed = true;
            }
        });
        claimed
    }

    /// Block until every in-flight store and remove has finalized.
    pub async fn mutations_drained(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| s.stores == 0 && s.removes == 0).await;
    }

    pub fn end_rebalance(&self) {
        self.tx.send_modify(|s| s.rebalancing = false);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.tx.send_modify(|s| s.enabled = enabled);
    }

    pub fn is_rebalancing(&self) -> bool {
        self.tx.borrow().rebalancing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn assert_pending<F: std::future::Future>(fut: F) {
        assert!(
            tokio::time::timeout(Duration::from_millis(50), fut)
                .await
                .is_err(),
            "future completed but should have blocked"
        );
    }

    #[tokio::test]
    async fn test_rebalance_waits_for_mutations() {
        let gate = OpGate::new(true);
        gate.begin_mutation(OpKind::Store).await;
        assert!(gate.try_begin_rebalance());
        assert_pending(gate.mutations_drained()).await;
        gate.end_mutation(OpKind::Store);
        gate.mutations_drained().await;
        gate.end_rebalance();
    }

    #[tokio::test]
    async fn test_mutation_waits_for_rebalance() {
        let gate = OpGate::new(true);
        assert!(gate.try_begin_rebalance());
        assert_pending(gate.begin_mutation(OpKind::Remove)).await;
        gate.end_rebalance();
        gate.begin_mutation(OpKind::Remove).await;
        gate.end_mutation(OpKind::Remove);
    }

    #[tokio::test]
    async fn test_rebalance_is_single_flight() {
        let gate = OpGate::new(true);
        assert!(gate.try_begin_rebalance());
        assert!(!gate.try_begin_rebalance());
        gate.end_rebalance();
        assert!(gate.try_begin_rebalance());
    }

    #[tokio::test]
    async fn test_disabled_gate_refuses_rounds() {
        let gate = OpGate::new(false);
        assert!(!gate.try_begin_rebalance());
        gate.set_enabled(true);
        assert!(gate.try_begin_rebalance());
    }

    #[tokio::test]
    async fn test_client_turn_blocks_during_round() {
        let gate = OpGate::new(true);
        assert!(gate.try_begin_rebalance());
        assert_pending(gate.client_turn()).await;
        gate.end_rebalance();
        gate.client_turn().await;
    }
}
