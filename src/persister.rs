// 2.5 persister.rs: drains the trade log into the historical store in
// periodic batches. the per-asset accumulator is owned by this task alone;
// the only way in is the trade topic. candle queries lag live trades by up
// to one flush interval, that is the deal.

use crate::broker::TradeTopicConsumer;
use crate::config::PipelineConfig;
use crate::store::TradeHistory;
use crate::trade::Trade;
use crate::types::Symbol;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct TradePersister<H: TradeHistory> {
    history: Arc<H>,
    pending: HashMap<Symbol, Vec<Trade>>,
    config: PipelineConfig,
}

impl<H: TradeHistory> TradePersister<H> {
    pub fn new(history: Arc<H>, config: PipelineConfig) -> Self {
        Self {
            history,
            pending: HashMap::new(),
            config,
        }
    }

    pub fn accumulate(&mut self, trade: Trade) {
        self.pending.entry(trade.asset.clone()).or_default().push(trade);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Flush every non-empty bucket: one insert per trade. A failed row is
    /// logged and skipped, it blocks neither the rest of its batch nor the
    /// next cycle. Returns how many rows were inserted.
    pub fn flush(&mut self) -> usize {
        let mut inserted = 0;
        for (asset, batch) in self.pending.iter_mut() {
            if batch.is_empty() {
                continue;
            }
            for trade in batch.iter() {
                match self.history.insert_trade(trade) {
                    Ok(()) => inserted += 1,
                    Err(err) => {
                        warn!(
                            target: "margin_core::persister",
                            asset = %asset, %err,
                            "trade insert failed, skipping row"
                        );
                    }
                }
            }
            batch.clear();
        }
        inserted
    }

    /// Consume the trade log and flush on the configured wall-clock
    /// interval until the topic closes or shutdown fires. Flushes once more
    /// on the way out so an orderly stop drops nothing.
    pub async fn run(mut self, mut source: TradeTopicConsumer, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; skip it so the first real
        // flush happens one full interval in
        ticker.tick().await;

        loop {
            tokio::select! {
                trade = source.recv() => match trade {
                    Some(trade) => self.accumulate(trade),
                    None => break,
                },
                _ = ticker.tick() => {
                    let inserted = self.flush();
                    if inserted > 0 {
                        debug!(target: "margin_core::persister", inserted, "flushed trade batch");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush();
    }
}
