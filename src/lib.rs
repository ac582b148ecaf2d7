// margin-core: leveraged position lifecycle and liquidation engine.
// consistency-first architecture: the ledger transaction is the only place
// balance and position status change, everything else is a derived view.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: Symbol, UserId, PositionId, Side, Leverage,
//        Price, Quote, Timestamp
//   2.x  trade.rs: canonical trade record + upstream normalization
//   2.0  feed.rs: price feed normalizer: pub/sub + cache + trade log fan-out
//   2.5  persister.rs: batched trade-log -> historical store flush
//   3.x  store.rs: cache/history/notifier seams + in-memory collaborators
//   4.x  broker.rs: trade topic + replayable open-position replica log
//   5.x  position.rs: position row, margin/fee/pnl math, liquidation triggers
//   6.x  engine/: open and close against the authoritative ledger
//   7.x  monitor.rs: working set, sweep loop, reconciliation
//   9.x  events.rs: liquidation notice payload
//   10.x config.rs: fees, intervals, env presets
//   ledger.rs: the authoritative balance/position store and its transactions

// market data pipeline
pub mod broker;
pub mod feed;
pub mod persister;
pub mod trade;

// position lifecycle
pub mod engine;
pub mod ledger;
pub mod monitor;
pub mod position;

// integration modules
pub mod config;
pub mod events;
pub mod store;
pub mod types;

// re exports for convenience
pub use broker::{replay_open_set, LedgerEvent, OpenPositionTopic, TradeTopic, TradeTopicConsumer};
pub use config::{CoreConfig, Environment, FeeConfig, MonitorConfig, PipelineConfig};
pub use engine::{CloseResult, EngineError, MarginEngine, OpenRequest};
pub use events::LiquidationNotice;
pub use feed::FeedNormalizer;
pub use ledger::{Ledger, LedgerError, NewPosition, UserAccount};
pub use monitor::LiquidationMonitor;
pub use persister::TradePersister;
pub use position::*;
pub use store::{
    connect_with_retry, MemoryCache, MemoryHistory, MemoryNotifier, Notifier, PriceCache,
    StoreError, TradeHistory,
};
pub use trade::{NormalizeError, RawTradeEvent, Trade};
pub use types::*;
