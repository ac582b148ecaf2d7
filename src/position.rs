// 5.0: the position row and the pure lifecycle math.
// margin = notional / leverage, fee = 1% of notional, pnl = side-signed
// price move. 5.2 has the liquidation triggers at the bottom.

use crate::types::{Leverage, PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

// A position transitions exactly once, Open -> Closed or Open -> Liquidated,
// and is immutable afterwards. The row in the ledger is authoritative; every
// other view of "open" is a derived cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    pub asset: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub leverage: Leverage,
    pub entry_price: Price,
    pub margin: Quote,
    pub fee: Quote,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub status: PositionStatus,
    pub closed_price: Option<Price>,
    pub closed_at: Option<Timestamp>,
    pub is_liquidated: bool,
    pub opened_at: Timestamp,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn notional(&self) -> Quote {
        Quote::new(self.quantity * self.entry_price.value())
    }
}

// 5.1: the money formulas. kept as free functions so they are trivially
// testable and there is exactly one place each number comes from.

/// Collateral reserved for a position: notional / leverage.
pub fn required_margin(quantity: Decimal, price: Price, leverage: Leverage) -> Quote {
    Quote::new(quantity * price.value() / leverage.as_decimal())
}

/// Opening fee charged on notional.
pub fn open_fee(price: Price, fee_rate: Decimal, quantity: Decimal) -> Quote {
    Quote::new(price.value() * fee_rate * quantity)
}

/// Balance required to open: full notional (margin * leverage) plus fee.
/// Stricter than the `margin + fee` actually debited.
pub fn required_collateral(margin: Quote, leverage: Leverage, fee: Quote) -> Quote {
    margin.mul(leverage.as_decimal()).add(fee)
}

/// Exit price after the closing fee is taken out of it.
pub fn effective_close_price(price: Price, fee_rate: Decimal) -> Decimal {
    price.value() - price.value() * fee_rate
}

/// Unleveraged price-crossing PnL: how far the price has moved in the
/// position's favor, per unit notional direction.
pub fn direction_pnl(side: Side, entry: Price, current: Price, quantity: Decimal) -> Quote {
    Quote::new(side.sign() * (current.value() - entry.value()) * quantity)
}

/// Settlement PnL on close: the unleveraged move at the effective exit
/// price, amplified by leverage.
pub fn close_pnl(
    side: Side,
    entry: Price,
    effective_exit: Decimal,
    quantity: Decimal,
    leverage: Leverage,
) -> Quote {
    Quote::new(side.sign() * (effective_exit - entry.value()) * quantity * leverage.as_decimal())
}

// 5.2: liquidation triggers. any one is sufficient.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReason {
    StopLoss,
    TakeProfit,
    MarginExhausted,
}

/// Evaluate the three liquidation triggers against the latest price.
///
/// The stop-loss and take-profit checks are pure price crossings; leverage
/// plays no part in them. Margin exhaustion fires when the unleveraged
/// direction PnL has eaten the entire reserved margin, i.e. the leveraged
/// loss equals the full notional.
pub fn liquidation_trigger(position: &Position, price: Price) -> Option<TriggerReason> {
    let side = position.side;

    if let Some(stop) = position.stop_loss {
        let crossed = match side {
            Side::Long => price <= stop,
            Side::Short => price >= stop,
        };
        if crossed {
            return Some(TriggerReason::StopLoss);
        }
    }

    if let Some(target) = position.take_profit {
        let crossed = match side {
            Side::Long => price >= target,
            Side::Short => price <= target,
        };
        if crossed {
            return Some(TriggerReason::TakeProfit);
        }
    }

    let pnl = direction_pnl(side, position.entry_price, price, position.quantity);
    if pnl.value() <= -position.margin.value() {
        return Some(TriggerReason::MarginExhausted);
    }

    None
}

/// Leveraged PnL at liquidation time. No closing fee applies on a forced
/// close.
pub fn liquidation_pnl(position: &Position, price: Price) -> Quote {
    direction_pnl(position.side, position.entry_price, price, position.quantity)
        .mul(position.leverage.as_decimal())
}

/// What the user gets back when liquidated: remaining margin after the
/// leveraged loss, never negative.
pub fn liquidation_settlement(position: &Position, price: Price) -> Quote {
    position.margin.add(liquidation_pnl(position, price)).max_zero()
}
