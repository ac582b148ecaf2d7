//! Margin Core Simulation.
//!
//! Wires the in-memory collaborators together and drives the full pipeline:
//! trade ingestion, batched persistence, position lifecycle, and the
//! liquidation monitor, with a synthetic price stream standing in for the
//! upstream exchange.

use margin_core::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Margin Core Simulation");
    println!("Pipeline, Position Lifecycle, Liquidation\n");

    let config = CoreConfig::development();
    config.validate().expect("development config is valid");

    let ledger = Arc::new(Ledger::new());
    let cache = Arc::new(MemoryCache::new());
    let history = Arc::new(MemoryHistory::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let open_positions = Arc::new(OpenPositionTopic::new());

    let (trade_topic, trade_consumer) = TradeTopic::new();
    let trade_topic = Arc::new(trade_topic);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ingestion tasks
    let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
    let normalizer =
        FeedNormalizer::new(cache.clone(), trade_topic.clone(), config.pipeline.clone());
    let feed_task = tokio::spawn(normalizer.run(upstream_rx, shutdown_rx.clone()));

    let persister = TradePersister::new(history.clone(), config.pipeline.clone());
    let persist_task = tokio::spawn(persister.run(trade_consumer, shutdown_rx.clone()));

    let monitor = LiquidationMonitor::new(
        ledger.clone(),
        cache.clone(),
        open_positions.clone(),
        notifier.clone(),
        config.monitor.clone(),
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let engine = MarginEngine::new(
        ledger.clone(),
        cache.clone(),
        open_positions.clone(),
        config.fees.clone(),
    );

    // synthetic upstream stream: a burst of BTC and ETH trades
    println!("Scenario 1: Trade Ingestion\n");
    let mut tick = 0i64;
    for price in ["50000", "50050", "49980"] {
        tick += 1;
        upstream_tx
            .send(RawTradeEvent::new("btcusdt", price, "0.25", tick))
            .unwrap();
    }
    upstream_tx
        .send(RawTradeEvent::new("ethusdt", "3000", "2", tick))
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let btc = Symbol::new("BTCUSDT");
    println!("  Cached BTCUSDT price: {}", cache.price(&btc).unwrap());
    println!("  Trades pending persistence: 4 across 2 assets\n");

    println!("Scenario 2: Open and Close\n");
    let alice = ledger.create_user(Quote::new(dec!(600_000)));
    println!("  Alice deposits $600,000");

    let position = engine
        .open(OpenRequest {
            user_id: alice,
            asset: btc.clone(),
            side: Side::Long,
            quantity: dec!(1),
            leverage: 10,
            stop_loss: None,
            take_profit: None,
        })
        .expect("open succeeds");
    println!(
        "  Opened long {} {} @ {} ({}), margin {}, fee {}",
        position.quantity, position.asset, position.entry_price, position.leverage,
        position.margin, position.fee
    );
    println!("  Balance after open: {}", ledger.balance(alice).unwrap());

    push_price(&upstream_tx, &mut tick, "51000");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let close = engine.close(alice, position.id).expect("close succeeds");
    println!(
        "  Closed at {} for pnl {} (fee taken from exit price)",
        close.closed_price, close.pnl
    );
    println!("  Balance after close: {}\n", ledger.balance(alice).unwrap());

    println!("Scenario 3: Insufficient Balance\n");
    let bob = ledger.create_user(Quote::new(dec!(1_000)));
    let rejected = engine.open(OpenRequest {
        user_id: bob,
        asset: btc.clone(),
        side: Side::Long,
        quantity: dec!(1),
        leverage: 10,
        stop_loss: None,
        take_profit: None,
    });
    match rejected {
        Err(EngineError::InsufficientBalance { required, available }) => {
            println!("  Rejected: required {required}, available {available}");
        }
        other => println!("  Unexpected: {other:?}"),
    }
    println!("  Bob's balance unchanged: {}\n", ledger.balance(bob).unwrap());

    println!("Scenario 4: Stop-Loss Liquidation\n");
    let carol = ledger.create_user(Quote::new(dec!(600_000)));
    let risky = engine
        .open(OpenRequest {
            user_id: carol,
            asset: btc.clone(),
            side: Side::Long,
            quantity: dec!(1),
            leverage: 10,
            stop_loss: Some(Price::new_unchecked(dec!(49_000))),
            take_profit: None,
        })
        .expect("open succeeds");
    println!(
        "  Carol longs 1 BTC @ {} with stop-loss 49000",
        risky.entry_price
    );

    push_price(&upstream_tx, &mut tick, "48500");
    wait_for(|| ledger.position(risky.id).unwrap().is_liquidated).await;

    let row = ledger.position(risky.id).unwrap();
    println!(
        "  Monitor liquidated position {} at {} (status {:?})",
        row.id,
        row.closed_price.unwrap(),
        row.status
    );
    for notice in notifier.notices_for(carol) {
        println!(
            "  Notice to Carol: position {}, closed {}, pnl {}",
            notice.position_id, notice.closed_price, notice.pnl
        );
    }
    println!("  Balance after liquidation: {}\n", ledger.balance(carol).unwrap());

    println!("Scenario 5: Margin Exhaustion\n");
    push_price(&upstream_tx, &mut tick, "50000");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let dave = ledger.create_user(Quote::new(dec!(600_000)));
    let levered = engine
        .open(OpenRequest {
            user_id: dave,
            asset: btc.clone(),
            side: Side::Short,
            quantity: dec!(1),
            leverage: 10,
            stop_loss: None,
            take_profit: None,
        })
        .expect("open succeeds");
    println!(
        "  Dave shorts 1 BTC @ {} at 10x, margin {}",
        levered.entry_price, levered.margin
    );

    // a 10% adverse move wipes the margin on a 10x short
    push_price(&upstream_tx, &mut tick, "55000");
    wait_for(|| ledger.position(levered.id).unwrap().is_liquidated).await;
    println!(
        "  Liquidated at {} after the move against the short\n",
        ledger.position(levered.id).unwrap().closed_price.unwrap()
    );

    // let a flush cycle land before reading history
    tokio::time::sleep(config.pipeline.flush_interval() * 2).await;
    println!("Persisted trade rows: {}", history.row_count());

    shutdown_tx.send(true).unwrap();
    let _ = tokio::join!(feed_task, persist_task, monitor_task);

    println!("\nAll scenarios completed.");
}

fn push_price(
    upstream: &mpsc::UnboundedSender<RawTradeEvent>,
    tick: &mut i64,
    price: &str,
) {
    *tick += 1;
    upstream
        .send(RawTradeEvent::new("btcusdt", price, "0.1", *tick))
        .expect("upstream channel open");
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("condition not reached within the wait budget");
}
