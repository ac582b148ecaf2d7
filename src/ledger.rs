//! The authoritative balance and position store.
//!
//! Every mutation of a user balance or a position status happens inside a
//! `transaction` closure: one lock acquisition is one atomic multi-row
//! commit, the in-process equivalent of the relational store's isolation.
//! The compare-then-update balance check lives inside the transaction, not
//! in front of it, so concurrent opens cannot race past a stale read.

use crate::position::{Position, PositionStatus};
use crate::types::{Leverage, PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct UserAccount {
    pub id: UserId,
    pub balance: Quote,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("user {0:?} not found")]
    UserNotFound(UserId),

    #[error("position {0} not found")]
    PositionNotFound(PositionId),

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("position {0} is not open")]
    PositionNotOpen(PositionId),
}

#[derive(Debug, Default, Clone)]
struct LedgerInner {
    users: HashMap<UserId, UserAccount>,
    positions: HashMap<PositionId, Position>,
    next_user_id: u64,
    next_position_id: u64,
}

/// Fields of a position row at insert time; the ledger assigns the ID and
/// the open status.
#[derive(Debug, Clone)]
pub struct NewPosition {
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
    pub opened_at: Timestamp,
}

#[derive(Debug, Default)]
pub struct Ledger {
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_user(&self, initial_balance: Quote) -> UserId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_user_id += 1;
        let id = UserId(inner.next_user_id);
        inner.users.insert(
            id,
            UserAccount {
                id,
                balance: initial_balance,
                created_at: Timestamp::now(),
            },
        );
        id
    }

    pub fn balance(&self, user: UserId) -> Option<Quote> {
        self.inner.lock().unwrap().users.get(&user).map(|u| u.balance)
    }

    pub fn position(&self, id: PositionId) -> Option<Position> {
        self.inner.lock().unwrap().positions.get(&id).cloned()
    }

    /// All positions for a user, newest first.
    pub fn positions_for_user(&self, user: UserId) -> Vec<Position> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.opened_at.cmp(&a.opened_at).then(b.id.cmp(&a.id)));
        rows
    }

    /// IDs of every row still marked open. This is the authoritative scan
    /// the monitor reconciles its derived working set against.
    pub fn open_position_ids(&self) -> Vec<PositionId> {
        self.inner
            .lock()
            .unwrap()
            .positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.id)
            .collect()
    }

    /// Run `f` as one atomic transaction: the lock is held throughout and an
    /// error rolls every write in the closure back, so balance and status
    /// mutations commit together or not at all.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&mut LedgerTxn<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner.clone();
        let mut txn = LedgerTxn { inner: &mut inner };
        match f(&mut txn) {
            Ok(value) => Ok(value),
            Err(err) => {
                *inner = snapshot;
                Err(err)
            }
        }
    }
}

/// View handed to a transaction closure. All methods operate on the same
/// locked state, so a sequence of calls commits or fails as a unit.
pub struct LedgerTxn<'a> {
    inner: &'a mut LedgerInner,
}

impl LedgerTxn<'_> {
    pub fn user(&self, id: UserId) -> Option<UserAccount> {
        self.inner.users.get(&id).cloned()
    }

    pub fn position(&self, id: PositionId) -> Option<Position> {
        self.inner.positions.get(&id).cloned()
    }

    /// Debit with the compare-then-update guard: never lets a balance go
    /// below what the debit needs.
    pub fn debit(&mut self, id: UserId, amount: Quote) -> Result<(), LedgerError> {
        let user = self
            .inner
            .users
            .get_mut(&id)
            .ok_or(LedgerError::UserNotFound(id))?;
        if amount.value() > user.balance.value() {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: user.balance,
            });
        }
        user.balance = user.balance.sub(amount);
        Ok(())
    }

    /// Credit a settlement amount. Signed: a deeply negative close PnL can
    /// pull the balance down through this path.
    pub fn credit(&mut self, id: UserId, amount: Quote) -> Result<(), LedgerError> {
        let user = self
            .inner
            .users
            .get_mut(&id)
            .ok_or(LedgerError::UserNotFound(id))?;
        user.balance = user.balance.add(amount);
        Ok(())
    }

    pub fn insert_position(&mut self, new: NewPosition) -> Position {
        self.inner.next_position_id += 1;
        let id = PositionId(self.inner.next_position_id);
        let position = Position {
            id,
            user_id: new.user_id,
            asset: new.asset,
            side: new.side,
            quantity: new.quantity,
            leverage: new.leverage,
            entry_price: new.entry_price,
            margin: new.margin,
            fee: new.fee,
            stop_loss: new.stop_loss,
            take_profit: new.take_profit,
            status: PositionStatus::Open,
            closed_price: None,
            closed_at: None,
            is_liquidated: false,
            opened_at: new.opened_at,
        };
        self.inner.positions.insert(id, position.clone());
        position
    }

    /// Flip an open position to its terminal status. Guards the
    /// exactly-once transition: a second close attempt fails here even if
    /// it raced past the caller's own status check.
    pub fn finalize_position(
        &mut self,
        id: PositionId,
        status: PositionStatus,
        closed_price: Price,
        closed_at: Timestamp,
    ) -> Result<Position, LedgerError> {
        debug_assert!(status != PositionStatus::Open);
        let position = self
            .inner
            .positions
            .get_mut(&id)
            .ok_or(LedgerError::PositionNotFound(id))?;
        if !position.is_open() {
            return Err(LedgerError::PositionNotOpen(id));
        }
        position.status = status;
        position.closed_price = Some(closed_price);
        position.closed_at = Some(closed_at);
        position.is_liquidated = status == PositionStatus::Liquidated;
        Ok(position.clone())
    }
}
