// 3.0 store.rs: seams to the external cache and historical store.
//
// The engine and pipeline talk to collaborators through traits so the core
// stays testable without a running cache or database. The in-memory
// implementations here are the reference collaborators used by the sim and
// the test suite; each carries a health toggle so the best-effort error
// paths can actually be exercised.

use crate::events::LiquidationNotice;
use crate::trade::Trade;
use crate::types::{Price, Symbol, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::warn;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

// 3.1: latest-price cache plus pub/sub. absence of a price means "price
// unknown" and blocks any operation that needs one.
pub trait PriceCache: Send + Sync {
    /// Establish the connection. Retried by the pipeline with fixed backoff.
    fn connect(&self) -> Result<(), StoreError>;

    /// Overwrite the latest price for an asset. Last write wins, no history.
    fn set_price(&self, asset: &Symbol, price: Price) -> Result<(), StoreError>;

    /// Latest known price, or None if never seen.
    fn price(&self, asset: &Symbol) -> Option<Price>;

    /// Publish a JSON payload on a named channel for live subscribers.
    fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
}

// 3.2: historical store for persisted trades. one row per trade.
pub trait TradeHistory: Send + Sync {
    fn connect(&self) -> Result<(), StoreError>;

    fn insert_trade(&self, trade: &Trade) -> Result<(), StoreError>;
}

// 3.3: delivery of liquidation notices to the affected user's session.
pub trait Notifier: Send + Sync {
    fn notify(&self, user: UserId, notice: &LiquidationNotice) -> Result<(), StoreError>;
}

/// In-memory cache. Prices behind a mutex, published payloads fan out on a
/// broadcast channel so tests and the sim can subscribe like a client would.
pub struct MemoryCache {
    prices: Mutex<HashMap<Symbol, Price>>,
    published: broadcast::Sender<(String, String)>,
    healthy: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        let (published, _) = broadcast::channel(1024);
        Self {
            prices: Mutex::new(HashMap::new()),
            published,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.published.subscribe()
    }

    /// Flip availability. While unhealthy every call fails, letting tests
    /// drive the log-and-continue paths.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("cache offline".into()))
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceCache for MemoryCache {
    fn connect(&self) -> Result<(), StoreError> {
        self.check()
    }

    fn set_price(&self, asset: &Symbol, price: Price) -> Result<(), StoreError> {
        self.check()?;
        self.prices.lock().unwrap().insert(asset.clone(), price);
        Ok(())
    }

    fn price(&self, asset: &Symbol) -> Option<Price> {
        self.prices.lock().unwrap().get(asset).copied()
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.check()?;
        // no subscribers is fine, publishes are fire-and-forget
        let _ = self
            .published
            .send((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

/// In-memory historical store. `fail_next` makes the next N inserts fail so
/// tests can prove one bad row does not sink the rest of a batch.
pub struct MemoryHistory {
    rows: Mutex<Vec<Trade>>,
    fail_budget: AtomicUsize,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            fail_budget: AtomicUsize::new(0),
        }
    }

    pub fn rows(&self) -> Vec<Trade> {
        self.rows.lock().unwrap().clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn rows_for(&self, asset: &Symbol) -> Vec<Trade> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|t| &t.asset == asset)
            .cloned()
            .collect()
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_budget.store(count, Ordering::SeqCst);
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl TradeHistory for MemoryHistory {
    fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn insert_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let remaining = self.fail_budget.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_budget.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Rejected("injected insert failure".into()));
        }
        self.rows.lock().unwrap().push(trade.clone());
        Ok(())
    }
}

/// In-memory notification sink keyed by user, recording everything sent.
pub struct MemoryNotifier {
    sent: Mutex<Vec<(UserId, LiquidationNotice)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn notices_for(&self, user: UserId) -> Vec<LiquidationNotice> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn total_sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Default for MemoryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, user: UserId, notice: &LiquidationNotice) -> Result<(), StoreError> {
        self.sent.lock().unwrap().push((user, notice.clone()));
        Ok(())
    }
}

// 3.4: connection establishment. unbounded retry with a fixed delay; the
// caller is simply unavailable until the collaborator comes up. returns
// false only when the shutdown signal fires first.
pub async fn connect_with_retry(
    what: &str,
    backoff: Duration,
    shutdown: &mut watch::Receiver<bool>,
    mut attempt: impl FnMut() -> Result<(), StoreError>,
) -> bool {
    loop {
        match attempt() {
            Ok(()) => return true,
            Err(err) => {
                warn!(target: "margin_core::store", %err, "{what} connection failed, retrying in {}s", backoff.as_secs());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
