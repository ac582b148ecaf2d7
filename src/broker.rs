// 4.0 broker.rs: the two durable topics between the pipeline components.
//
// TradeTopic is the append-only trade log: the normalizer writes, the
// persister consumes from its earliest uncommitted offset (acknowledged
// history is never redelivered). OpenPositionTopic is the replicated ledger
// of currently-open position IDs: ordered, keyed, fully replayable, with
// tombstones marking removal. Both are in-process stand-ins for a
// partitioned broker, with the same delivery semantics.

use crate::trade::Trade;
use crate::store::StoreError;
use crate::types::PositionId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

// 4.1: trade log. per-asset ordering is the sender's ordering; nothing is
// guaranteed across assets.
pub struct TradeTopic {
    tx: mpsc::UnboundedSender<Trade>,
}

pub struct TradeTopicConsumer {
    rx: mpsc::UnboundedReceiver<Trade>,
}

impl TradeTopic {
    pub fn new() -> (Self, TradeTopicConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TradeTopicConsumer { rx })
    }

    pub fn ready(&self) -> Result<(), StoreError> {
        if self.tx.is_closed() {
            Err(StoreError::Unavailable("trade topic has no consumer".into()))
        } else {
            Ok(())
        }
    }

    pub fn append(&self, trade: &Trade) -> Result<(), StoreError> {
        self.tx
            .send(trade.clone())
            .map_err(|_| StoreError::Rejected("trade topic closed".into()))
    }
}

impl TradeTopicConsumer {
    pub async fn recv(&mut self) -> Option<Trade> {
        self.rx.recv().await
    }
}

// 4.2: replica log events. the wire record is keyed by the decimal string
// of the position ID; an upsert carries `{"positionId": n}`, a tombstone an
// empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEvent {
    Upsert(PositionId),
    Tombstone(PositionId),
}

impl LedgerEvent {
    pub fn position_id(&self) -> PositionId {
        match self {
            LedgerEvent::Upsert(id) | LedgerEvent::Tombstone(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertPayload {
    position_id: PositionId,
}

/// One retained record as it would sit on the broker partition.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub key: String,
    pub value: Option<String>,
}

impl LedgerRecord {
    fn encode(event: &LedgerEvent) -> Self {
        match event {
            LedgerEvent::Upsert(id) => Self {
                key: id.to_string(),
                value: Some(
                    serde_json::to_string(&UpsertPayload { position_id: *id })
                        .expect("upsert payload serializes"),
                ),
            },
            LedgerEvent::Tombstone(id) => Self {
                key: id.to_string(),
                value: None,
            },
        }
    }

    /// Decode back into a typed event. Malformed records are reported, the
    /// replay skips them and keeps going.
    fn decode(&self) -> Result<LedgerEvent, StoreError> {
        match &self.value {
            None => self
                .key
                .parse::<u64>()
                .map(|id| LedgerEvent::Tombstone(PositionId(id)))
                .map_err(|_| StoreError::Rejected(format!("bad tombstone key {:?}", self.key))),
            Some(json) => serde_json::from_str::<UpsertPayload>(json)
                .map(|p| LedgerEvent::Upsert(p.position_id))
                .map_err(|e| StoreError::Rejected(format!("bad upsert payload: {e}"))),
        }
    }
}

// 4.3: the open-position topic itself. publishes append to the retained log
// and fan out to live tails; replay() re-reads the log from offset zero.
pub struct OpenPositionTopic {
    log: Mutex<Vec<LedgerRecord>>,
    tail: broadcast::Sender<LedgerEvent>,
    healthy: AtomicBool,
}

impl OpenPositionTopic {
    pub fn new() -> Self {
        let (tail, _) = broadcast::channel(1024);
        Self {
            log: Mutex::new(Vec::new()),
            tail,
            healthy: AtomicBool::new(true),
        }
    }

    /// Flip availability; used to exercise the publish-after-commit gap.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn publish(&self, event: LedgerEvent) -> Result<(), StoreError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("open-position topic offline".into()));
        }
        self.log.lock().unwrap().push(LedgerRecord::encode(&event));
        // nobody tailing is fine
        let _ = self.tail.send(event);
        Ok(())
    }

    /// Replay every retained record from the beginning, in log order.
    /// Records that fail to decode are skipped, matching a consumer that
    /// logs and moves on.
    pub fn replay(&self) -> Vec<LedgerEvent> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|record| match record.decode() {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(target: "margin_core::broker", %err, "skipping undecodable replica record");
                    None
                }
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tail.subscribe()
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().unwrap().is_empty()
    }
}

impl Default for OpenPositionTopic {
    fn default() -> Self {
        Self::new()
    }
}

// 4.4: fold a replayed log into the "currently open" set. membership for a
// key is decided by the last event written for that key, so replaying any
// prefix-extension of the same log converges to the same answer.
pub fn replay_open_set<'a, I>(events: I) -> HashSet<PositionId>
where
    I: IntoIterator<Item = &'a LedgerEvent>,
{
    let mut open = HashSet::new();
    for event in events {
        match event {
            LedgerEvent::Upsert(id) => {
                open.insert(*id);
            }
            LedgerEvent::Tombstone(id) => {
                open.remove(id);
            }
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Price, Symbol, Timestamp};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn trade_topic_delivers_in_order() {
        let (topic, mut consumer) = TradeTopic::new();
        for i in 1..=3 {
            let trade = Trade {
                asset: Symbol::new("BTCUSDT"),
                price: Price::new_unchecked(dec!(100) + Decimal::from(i)),
                quantity: dec!(1),
                trade_time: Timestamp::from_millis(i),
            };
            topic.append(&trade).unwrap();
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let times: Vec<i64> = rt.block_on(async {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(consumer.recv().await.unwrap().trade_time.as_millis());
            }
            out
        });
        assert_eq!(times, vec![1, 2, 3]);
    }

    #[test]
    fn append_fails_without_consumer() {
        let (topic, consumer) = TradeTopic::new();
        drop(consumer);

        let trade = Trade {
            asset: Symbol::new("BTCUSDT"),
            price: Price::new_unchecked(dec!(100)),
            quantity: dec!(1),
            trade_time: Timestamp::from_millis(0),
        };
        assert!(topic.ready().is_err());
        assert!(topic.append(&trade).is_err());
    }

    #[test]
    fn record_round_trips_through_wire_shape() {
        let upsert = LedgerRecord::encode(&LedgerEvent::Upsert(PositionId(17)));
        assert_eq!(upsert.key, "17");
        assert_eq!(upsert.value.as_deref(), Some(r#"{"positionId":17}"#));
        assert_eq!(upsert.decode().unwrap(), LedgerEvent::Upsert(PositionId(17)));

        let tombstone = LedgerRecord::encode(&LedgerEvent::Tombstone(PositionId(17)));
        assert_eq!(tombstone.key, "17");
        assert!(tombstone.value.is_none());
        assert_eq!(
            tombstone.decode().unwrap(),
            LedgerEvent::Tombstone(PositionId(17))
        );
    }

    #[test]
    fn replay_applies_last_event_wins() {
        let topic = OpenPositionTopic::new();
        topic.publish(LedgerEvent::Upsert(PositionId(1))).unwrap();
        topic.publish(LedgerEvent::Upsert(PositionId(2))).unwrap();
        topic.publish(LedgerEvent::Tombstone(PositionId(1))).unwrap();
        topic.publish(LedgerEvent::Upsert(PositionId(3))).unwrap();
        topic.publish(LedgerEvent::Tombstone(PositionId(3))).unwrap();
        topic.publish(LedgerEvent::Upsert(PositionId(3))).unwrap();

        let open = replay_open_set(&topic.replay());
        assert_eq!(
            open,
            HashSet::from([PositionId(2), PositionId(3)])
        );
    }

    #[test]
    fn unhealthy_topic_rejects_publish() {
        let topic = OpenPositionTopic::new();
        topic.set_healthy(false);
        assert!(topic.publish(LedgerEvent::Upsert(PositionId(1))).is_err());
        assert!(topic.is_empty());

        topic.set_healthy(true);
        assert!(topic.publish(LedgerEvent::Upsert(PositionId(1))).is_ok());
        assert_eq!(topic.len(), 1);
    }
}
