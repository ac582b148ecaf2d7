// 7.0 monitor.rs: the liquidation monitor. owns a working set of open
// position IDs, rebuilt from the replica log at startup and kept current by
// tailing it. every sweep iterates a snapshot of the set against the latest
// cached price and force-closes anything that crossed its stop-loss,
// take-profit, or margin floor. polling, not push: liquidation latency is
// bounded by the sweep interval regardless of how fast prices tick.

use crate::broker::{replay_open_set, LedgerEvent, OpenPositionTopic};
use crate::config::MonitorConfig;
use crate::engine::EngineError;
use crate::events::LiquidationNotice;
use crate::ledger::Ledger;
use crate::position::{liquidation_pnl, liquidation_settlement, liquidation_trigger, PositionStatus};
use crate::store::{Notifier, PriceCache};
use crate::types::{PositionId, Price, Timestamp};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub struct LiquidationMonitor<C: PriceCache, N: Notifier> {
    ledger: Arc<Ledger>,
    cache: Arc<C>,
    open_positions: Arc<OpenPositionTopic>,
    notifier: Arc<N>,
    config: MonitorConfig,
    working_set: HashSet<PositionId>,
}

impl<C: PriceCache, N: Notifier> LiquidationMonitor<C, N> {
    pub fn new(
        ledger: Arc<Ledger>,
        cache: Arc<C>,
        open_positions: Arc<OpenPositionTopic>,
        notifier: Arc<N>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            ledger,
            cache,
            open_positions,
            notifier,
            config,
            working_set: HashSet::new(),
        }
    }

    pub fn working_set(&self) -> &HashSet<PositionId> {
        &self.working_set
    }

    /// Rebuild the working set by replaying the replica log from the
    /// earliest retained offset. Crash recovery without scanning the whole
    /// position table.
    pub fn bootstrap(&mut self) {
        self.working_set = replay_open_set(&self.open_positions.replay());
        info!(
            target: "margin_core::monitor",
            open = self.working_set.len(),
            "working set rebuilt from replica log"
        );
    }

    pub fn apply(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::Upsert(id) => {
                self.working_set.insert(*id);
            }
            LedgerEvent::Tombstone(id) => {
                self.working_set.remove(id);
            }
        }
    }

    /// Re-derive the "should be open" set from the authoritative ledger and
    /// adopt it, healing any divergence a lost replica publish left behind.
    pub fn reconcile(&mut self) {
        let authoritative: HashSet<PositionId> =
            self.ledger.open_position_ids().into_iter().collect();
        let missed = authoritative.difference(&self.working_set).count();
        let stale = self.working_set.difference(&authoritative).count();
        if missed > 0 || stale > 0 {
            warn!(
                target: "margin_core::monitor",
                missed, stale,
                "working set diverged from ledger, reconciled"
            );
        }
        self.working_set = authoritative;
    }

    /// One evaluation pass over a snapshot of the working set. Returns the
    /// number of positions liquidated.
    pub fn sweep(&mut self) -> usize {
        let snapshot: Vec<PositionId> = self.working_set.iter().copied().collect();
        let mut liquidated = 0;

        for id in snapshot {
            let Some(position) = self.ledger.position(id) else {
                // stale entry, drop and move on
                self.working_set.remove(&id);
                continue;
            };
            if !position.is_open() {
                self.working_set.remove(&id);
                continue;
            }

            let Some(price) = self.cache.price(&position.asset) else {
                // no price this cycle, re-check next sweep
                continue;
            };

            let Some(reason) = liquidation_trigger(&position, price) else {
                continue;
            };

            match self.liquidate(id, price) {
                Ok(()) => {
                    debug!(
                        target: "margin_core::monitor",
                        position = %id, ?reason, %price,
                        "position liquidated"
                    );
                    self.working_set.remove(&id);
                    liquidated += 1;
                }
                Err(EngineError::InvalidState(_)) | Err(EngineError::NotFound(_)) => {
                    // raced with a user close; the row is terminal either way
                    self.working_set.remove(&id);
                }
                Err(err) => {
                    warn!(
                        target: "margin_core::monitor",
                        position = %id, %err,
                        "liquidation attempt failed, will retry next sweep"
                    );
                }
            }
        }

        liquidated
    }

    fn liquidate(&self, id: PositionId, price: Price) -> Result<(), EngineError> {
        let (position, pnl) = self.ledger.transaction(|tx| {
            let row = tx.position(id).ok_or(EngineError::NotFound(id))?;
            if !row.is_open() {
                return Err(EngineError::InvalidState(id));
            }

            let pnl = liquidation_pnl(&row, price);
            let settlement = liquidation_settlement(&row, price);
            tx.credit(row.user_id, settlement)?;
            let closed =
                tx.finalize_position(id, PositionStatus::Liquidated, price, Timestamp::now())?;
            Ok((closed, pnl))
        })?;

        if let Err(err) = self.open_positions.publish(LedgerEvent::Tombstone(id)) {
            warn!(
                target: "margin_core::monitor",
                position = %id, %err,
                "liquidation committed but tombstone publish failed"
            );
        }

        let notice = LiquidationNotice {
            position_id: id,
            closed_price: price,
            pnl,
        };
        if let Err(err) = self.notifier.notify(position.user_id, &notice) {
            warn!(
                target: "margin_core::monitor",
                position = %id, user = ?position.user_id, %err,
                "liquidation notice delivery failed"
            );
        }

        Ok(())
    }

    /// Tail the replica log and sweep on the configured interval until
    /// shutdown. Replays the retained log first to rebuild state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tail = self.open_positions.subscribe();
        self.bootstrap();

        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut sweeps: u32 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_tail(&mut tail);
                    sweeps = sweeps.wrapping_add(1);
                    if sweeps % self.config.reconcile_every == 0 {
                        self.reconcile();
                    }
                    self.sweep();
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Apply every replica event that arrived since the last sweep. A
    /// lagged tail means events were dropped; fall back to the ledger.
    fn drain_tail(&mut self, tail: &mut broadcast::Receiver<LedgerEvent>) {
        loop {
            match tail.try_recv() {
                Ok(event) => self.apply(&event),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        target: "margin_core::monitor",
                        skipped,
                        "replica tail lagged, reconciling from ledger"
                    );
                    self.reconcile();
                }
            }
        }
    }
}
