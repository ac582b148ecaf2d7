// 2.0 feed.rs: the price feed normalizer. one task per upstream asset
// stream. each event fans out three ways: live pub/sub tick, latest-price
// cache overwrite, durable trade log append. every side effect is
// best-effort: a failing store logs one line per event and the stream keeps
// flowing. nothing is processed until the cache and the trade topic are
// reachable.

use crate::broker::TradeTopic;
use crate::config::PipelineConfig;
use crate::store::{connect_with_retry, PriceCache};
use crate::trade::RawTradeEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub struct FeedNormalizer<C: PriceCache> {
    cache: Arc<C>,
    trade_log: Arc<TradeTopic>,
    config: PipelineConfig,
}

impl<C: PriceCache> FeedNormalizer<C> {
    pub fn new(cache: Arc<C>, trade_log: Arc<TradeTopic>, config: PipelineConfig) -> Self {
        Self {
            cache,
            trade_log,
            config,
        }
    }

    /// Normalize and fan out one upstream event. Never fails: bad events
    /// and store hiccups are logged and dropped.
    pub fn process(&self, raw: &RawTradeEvent) {
        let trade = match raw.normalize() {
            Ok(trade) => trade,
            Err(err) => {
                warn!(target: "margin_core::feed", %err, "dropping malformed trade event");
                return;
            }
        };

        match serde_json::to_string(&trade) {
            Ok(payload) => {
                let channel = self.config.trade_channel(&trade.asset);
                if let Err(err) = self.cache.publish(&channel, &payload) {
                    warn!(target: "margin_core::feed", asset = %trade.asset, %err, "trade publish failed");
                }
            }
            Err(err) => {
                warn!(target: "margin_core::feed", asset = %trade.asset, %err, "trade serialization failed");
            }
        }

        if let Err(err) = self.cache.set_price(&trade.asset, trade.price) {
            warn!(target: "margin_core::feed", asset = %trade.asset, %err, "price cache write failed");
        }

        if let Err(err) = self.trade_log.append(&trade) {
            warn!(target: "margin_core::feed", asset = %trade.asset, %err, "trade log append failed");
        }
    }

    /// Consume one upstream stream until it ends or shutdown fires.
    /// Connections are established first with unbounded fixed-backoff
    /// retry; events queue on the channel until then.
    pub async fn run(
        self,
        mut upstream: mpsc::UnboundedReceiver<RawTradeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let backoff = self.config.reconnect_backoff();
        if !connect_with_retry("price cache", backoff, &mut shutdown, || self.cache.connect()).await
        {
            return;
        }
        if !connect_with_retry("trade log", backoff, &mut shutdown, || self.trade_log.ready())
            .await
        {
            return;
        }
        debug!(target: "margin_core::feed", "normalizer connected, processing events");

        loop {
            tokio::select! {
                event = upstream.recv() => match event {
                    Some(raw) => self.process(&raw),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
