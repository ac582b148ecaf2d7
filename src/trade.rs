//! Canonical trade records and upstream normalization.
//!
//! The upstream exchange stream delivers one event per executed trade with
//! string-encoded numeric fields. Normalization turns those into a `Trade`,
//! the single shape every downstream consumer (cache, pub/sub subscribers,
//! trade log, historical store) sees. Trades carry no identity beyond
//! (asset, tradeTime); duplicates are tolerated end to end.

use crate::types::{Price, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One executed trade, immutable. Wire shape:
/// `{"asset": "BTCUSDT", "price": "50000", "quantity": "0.5", "tradeTime": 1700000000000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub asset: Symbol,
    pub price: Price,
    pub quantity: Decimal,
    pub trade_time: Timestamp,
}

/// Raw event as read off the upstream trade stream, before validation.
/// Price and quantity arrive as strings, the timestamp as exchange millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTradeEvent {
    pub symbol: String,
    pub price: String,
    pub quantity: String,
    pub trade_time: i64,
}

impl RawTradeEvent {
    pub fn new(symbol: &str, price: &str, quantity: &str, trade_time: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            price: price.to_string(),
            quantity: quantity.to_string(),
            trade_time,
        }
    }

    /// Normalize into a canonical `Trade`. Rejects unparseable or
    /// non-positive price/quantity; a rejected event is dropped by the
    /// stream task, it never stops the stream.
    pub fn normalize(&self) -> Result<Trade, NormalizeError> {
        let price = Decimal::from_str(&self.price)
            .ok()
            .and_then(Price::new)
            .ok_or_else(|| NormalizeError::BadPrice(self.price.clone()))?;

        let quantity = Decimal::from_str(&self.quantity)
            .ok()
            .filter(|q| *q > Decimal::ZERO)
            .ok_or_else(|| NormalizeError::BadQuantity(self.quantity.clone()))?;

        Ok(Trade {
            asset: Symbol::new(&self.symbol),
            price,
            quantity,
            trade_time: Timestamp::from_millis(self.trade_time),
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NormalizeError {
    #[error("unparseable or non-positive price {0:?}")]
    BadPrice(String),

    #[error("unparseable or non-positive quantity {0:?}")]
    BadQuantity(String),
}
