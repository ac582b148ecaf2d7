//! Property tests for the replica replay semantics and the balance
//! arithmetic of the position lifecycle.

use margin_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn engine_harness() -> (Arc<Ledger>, Arc<MemoryCache>, MarginEngine<MemoryCache>) {
    let ledger = Arc::new(Ledger::new());
    let cache = Arc::new(MemoryCache::new());
    let topic = Arc::new(OpenPositionTopic::new());
    let engine = MarginEngine::new(
        ledger.clone(),
        cache.clone(),
        topic,
        FeeConfig::default(),
    );
    (ledger, cache, engine)
}

fn ledger_events() -> impl Strategy<Value = Vec<LedgerEvent>> {
    proptest::collection::vec(
        (0u64..8, proptest::bool::ANY).prop_map(|(id, upsert)| {
            if upsert {
                LedgerEvent::Upsert(PositionId(id))
            } else {
                LedgerEvent::Tombstone(PositionId(id))
            }
        }),
        0..64,
    )
}

proptest! {
    /// Replaying the log yields exactly the keys whose last event was an
    /// upsert, however often the same key repeats.
    #[test]
    fn replay_is_last_event_wins(events in ledger_events()) {
        let mut last: HashMap<PositionId, bool> = HashMap::new();
        for event in &events {
            last.insert(event.position_id(), matches!(event, LedgerEvent::Upsert(_)));
        }
        let expected: HashSet<PositionId> = last
            .into_iter()
            .filter_map(|(id, open)| open.then_some(id))
            .collect();

        prop_assert_eq!(replay_open_set(&events), expected);
    }

    /// Replay is idempotent: folding the same log again from the result of
    /// a fresh fold changes nothing, and publishing through the topic's
    /// wire encoding round-trips to the same set.
    #[test]
    fn replay_through_wire_encoding_matches(events in ledger_events()) {
        let direct = replay_open_set(&events);

        let topic = OpenPositionTopic::new();
        for event in &events {
            topic.publish(*event).unwrap();
        }
        prop_assert_eq!(replay_open_set(&topic.replay()), direct.clone());
        // a second replay of the same retained log agrees
        prop_assert_eq!(replay_open_set(&topic.replay()), direct);
    }

    /// Appending a tombstone for an already-absent key or a duplicate
    /// upsert never disturbs the rest of the set.
    #[test]
    fn redundant_events_are_harmless(events in ledger_events(), id in 0u64..8) {
        let base = replay_open_set(&events);

        let mut with_duplicate = events.clone();
        let duplicate = if base.contains(&PositionId(id)) {
            LedgerEvent::Upsert(PositionId(id))
        } else {
            LedgerEvent::Tombstone(PositionId(id))
        };
        with_duplicate.push(duplicate);

        prop_assert_eq!(replay_open_set(&with_duplicate), base);
    }

    /// balance_after = balance_before - margin - fee, exactly, for any
    /// sufficiently funded open.
    #[test]
    fn open_debits_exactly_margin_plus_fee(
        price_units in 1i64..1_000_000,
        quantity_centis in 1i64..10_000,
        leverage in 1u32..50,
    ) {
        let (ledger, cache, engine) = engine_harness();
        let price = Decimal::new(price_units, 1);
        let quantity = Decimal::new(quantity_centis, 2);
        cache.set_price(&Symbol::new("BTCUSDT"), Price::new_unchecked(price)).unwrap();

        let notional = quantity * price;
        let margin = notional / Decimal::from(leverage);
        let fee = notional * dec!(0.01);
        let funding = notional + fee + dec!(1);

        let user = ledger.create_user(Quote::new(funding));
        let position = engine.open(OpenRequest {
            user_id: user,
            asset: Symbol::new("BTCUSDT"),
            side: Side::Long,
            quantity,
            leverage,
            stop_loss: None,
            take_profit: None,
        }).unwrap();

        prop_assert_eq!(position.margin.value(), margin);
        prop_assert_eq!(position.fee.value(), fee);
        prop_assert_eq!(
            ledger.balance(user).unwrap().value(),
            funding - margin - fee
        );
    }

    /// balance_after = balance_before + margin + pnl on close, with the pnl
    /// sign following the side.
    #[test]
    fn close_credits_exactly_margin_plus_pnl(
        entry_units in 10i64..1_000_000,
        exit_units in 10i64..1_000_000,
        quantity_centis in 1i64..10_000,
        leverage in 1u32..50,
        long in proptest::bool::ANY,
    ) {
        let (ledger, cache, engine) = engine_harness();
        let entry = Decimal::new(entry_units, 1);
        let exit = Decimal::new(exit_units, 1);
        let quantity = Decimal::new(quantity_centis, 2);
        let side = if long { Side::Long } else { Side::Short };
        let btc = Symbol::new("BTCUSDT");

        cache.set_price(&btc, Price::new_unchecked(entry)).unwrap();
        let funding = entry * quantity * dec!(2) + dec!(1);
        let user = ledger.create_user(Quote::new(funding));
        let position = engine.open(OpenRequest {
            user_id: user,
            asset: btc.clone(),
            side,
            quantity,
            leverage,
            stop_loss: None,
            take_profit: None,
        }).unwrap();
        let before_close = ledger.balance(user).unwrap().value();

        cache.set_price(&btc, Price::new_unchecked(exit)).unwrap();
        let close = engine.close(user, position.id).unwrap();

        let effective = exit - exit * dec!(0.01);
        let expected_pnl = match side {
            Side::Long => (effective - entry) * quantity * Decimal::from(leverage),
            Side::Short => (entry - effective) * quantity * Decimal::from(leverage),
        };
        prop_assert_eq!(close.pnl.value(), expected_pnl);
        prop_assert_eq!(
            ledger.balance(user).unwrap().value(),
            before_close + position.margin.value() + expected_pnl
        );
    }

    /// A rejected open never mutates anything.
    #[test]
    fn rejected_open_is_pure(
        price_units in 100i64..1_000_000,
        leverage in 1u32..50,
    ) {
        let (ledger, cache, engine) = engine_harness();
        let price = Decimal::new(price_units, 1);
        cache.set_price(&Symbol::new("BTCUSDT"), Price::new_unchecked(price)).unwrap();

        // fund strictly below the full-notional requirement
        let quantity = dec!(1);
        let notional = price * quantity;
        let user = ledger.create_user(Quote::new(notional / dec!(2)));

        let result = engine.open(OpenRequest {
            user_id: user,
            asset: Symbol::new("BTCUSDT"),
            side: Side::Short,
            quantity,
            leverage,
            stop_loss: None,
            take_profit: None,
        });

        let is_insufficient = matches!(result, Err(EngineError::InsufficientBalance { .. }));
        prop_assert!(is_insufficient);
        prop_assert_eq!(ledger.balance(user).unwrap().value(), notional / dec!(2));
        prop_assert!(ledger.positions_for_user(user).is_empty());
        prop_assert!(ledger.open_position_ids().is_empty());
    }

    /// The margin-exhaustion trigger fires exactly when the unleveraged
    /// direction pnl reaches -margin, independent of leverage's effect on
    /// the stop/take-profit crossings.
    #[test]
    fn margin_exhaustion_matches_formula(
        entry_units in 100i64..100_000,
        move_bps in -5_000i64..5_000,
        leverage in 1u32..50,
        long in proptest::bool::ANY,
    ) {
        let entry = Decimal::new(entry_units, 1);
        let current = entry + entry * Decimal::new(move_bps, 4);
        prop_assume!(current > Decimal::ZERO);

        let side = if long { Side::Long } else { Side::Short };
        let quantity = dec!(1);
        let leverage = Leverage::new(leverage).unwrap();
        let margin = required_margin(quantity, Price::new_unchecked(entry), leverage);

        let position = Position {
            id: PositionId(1),
            user_id: UserId(1),
            asset: Symbol::new("BTCUSDT"),
            side,
            quantity,
            leverage,
            entry_price: Price::new_unchecked(entry),
            margin,
            fee: Quote::zero(),
            stop_loss: None,
            take_profit: None,
            status: PositionStatus::Open,
            closed_price: None,
            closed_at: None,
            is_liquidated: false,
            opened_at: Timestamp::from_millis(0),
        };

        let pnl = direction_pnl(side, position.entry_price, Price::new_unchecked(current), quantity);
        let triggered = liquidation_trigger(&position, Price::new_unchecked(current)).is_some();
        prop_assert_eq!(triggered, pnl.value() <= -margin.value());
    }
}
