//! Open and close operations.
//!
//! Both operations follow the same shape: read the latest cached price,
//! validate, then mutate balance and position state inside one ledger
//! transaction, and only after the commit tell the open-position replica.
//! A failed replica publish is logged and left for reconciliation; it never
//! unwinds a committed transaction.

use super::core::MarginEngine;
use super::results::{CloseResult, EngineError};
use crate::broker::LedgerEvent;
use crate::ledger::NewPosition;
use crate::position::{
    close_pnl, effective_close_price, open_fee, required_collateral, required_margin, Position,
    PositionStatus,
};
use crate::store::PriceCache;
use crate::types::{Leverage, PositionId, Price, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub user_id: UserId,
    pub asset: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub leverage: u32,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

impl<C: PriceCache> MarginEngine<C> {
    /// Open a leveraged position.
    ///
    /// Order matters: price first (`PriceUnavailable` blocks everything),
    /// then input validation, then the transactional compare-then-debit.
    /// The collateral check requires the full notional plus fee even though
    /// only `margin + fee` is debited.
    pub fn open(&self, request: OpenRequest) -> Result<Position, EngineError> {
        let price = self
            .cache
            .price(&request.asset)
            .ok_or_else(|| EngineError::PriceUnavailable(request.asset.clone()))?;

        if request.quantity <= Decimal::ZERO {
            return Err(EngineError::InvalidInput("quantity must be positive"));
        }
        let leverage = Leverage::new(request.leverage)
            .ok_or(EngineError::InvalidInput("leverage must be at least 1"))?;

        let margin = required_margin(request.quantity, price, leverage);
        let fee = open_fee(price, self.fees.open_rate, request.quantity);

        let position = self.ledger.transaction(|tx| {
            let user = tx
                .user(request.user_id)
                .ok_or(EngineError::UserNotFound(request.user_id))?;

            let required = required_collateral(margin, leverage, fee);
            if user.balance < required {
                return Err(EngineError::InsufficientBalance {
                    required,
                    available: user.balance,
                });
            }

            tx.debit(request.user_id, margin.add(fee))?;

            Ok(tx.insert_position(NewPosition {
                user_id: request.user_id,
                asset: request.asset.clone(),
                side: request.side,
                quantity: request.quantity,
                leverage,
                entry_price: price,
                margin,
                fee,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                opened_at: Timestamp::now(),
            }))
        })?;

        if let Err(err) = self.open_positions.publish(LedgerEvent::Upsert(position.id)) {
            // the ledger row is authoritative; the monitor will pick this
            // position up on its next reconciliation pass
            warn!(
                target: "margin_core::engine",
                position = %position.id, %err,
                "open committed but replica publish failed"
            );
        }

        Ok(position)
    }

    /// Close a position at the latest cached price. PnL sign follows the
    /// position's own side; the closing fee comes out of the exit price.
    pub fn close(
        &self,
        user_id: UserId,
        position_id: PositionId,
    ) -> Result<CloseResult, EngineError> {
        self.close_checked(user_id, position_id, None)
    }

    /// Side-specific close endpoint: additionally rejects a position whose
    /// side differs from what the caller asked to close.
    pub fn close_expecting(
        &self,
        user_id: UserId,
        position_id: PositionId,
        side: Side,
    ) -> Result<CloseResult, EngineError> {
        self.close_checked(user_id, position_id, Some(side))
    }

    fn close_checked(
        &self,
        user_id: UserId,
        position_id: PositionId,
        expected_side: Option<Side>,
    ) -> Result<CloseResult, EngineError> {
        let position = self
            .ledger
            .position(position_id)
            .ok_or(EngineError::NotFound(position_id))?;
        if position.user_id != user_id {
            return Err(EngineError::Forbidden(position_id));
        }
        if !position.is_open() {
            return Err(EngineError::InvalidState(position_id));
        }
        if let Some(side) = expected_side {
            if position.side != side {
                return Err(EngineError::InvalidState(position_id));
            }
        }

        let price = self
            .cache
            .price(&position.asset)
            .ok_or_else(|| EngineError::PriceUnavailable(position.asset.clone()))?;
        let effective = effective_close_price(price, self.fees.close_rate);
        let pnl = close_pnl(
            position.side,
            position.entry_price,
            effective,
            position.quantity,
            position.leverage,
        );

        let closed = self.ledger.transaction(|tx| {
            // re-check under the transaction: two racing closes resolve here
            let row = tx
                .position(position_id)
                .ok_or(EngineError::NotFound(position_id))?;
            if !row.is_open() {
                return Err(EngineError::InvalidState(position_id));
            }

            tx.credit(user_id, row.margin.add(pnl))?;
            let closed =
                tx.finalize_position(position_id, PositionStatus::Closed, price, Timestamp::now())?;
            Ok(closed)
        })?;

        if let Err(err) = self
            .open_positions
            .publish(LedgerEvent::Tombstone(position_id))
        {
            warn!(
                target: "margin_core::engine",
                position = %position_id, %err,
                "close committed but tombstone publish failed"
            );
        }

        Ok(CloseResult {
            position: closed,
            pnl,
            closed_price: price,
        })
    }
}
