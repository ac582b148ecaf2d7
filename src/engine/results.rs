// 6.3 engine/results.rs: result types and the caller-visible error taxonomy.
// everything here is rejected before any write reaches the ledger.

use crate::ledger::LedgerError;
use crate::position::Position;
use crate::types::{PositionId, Price, Quote, Symbol, UserId};

#[derive(Debug, Clone)]
pub struct CloseResult {
    pub position: Position,
    pub pnl: Quote,
    pub closed_price: Price,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("no price available for {0}")]
    PriceUnavailable(Symbol),

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Quote, available: Quote },

    #[error("user {0:?} not found")]
    UserNotFound(UserId),

    #[error("position {0} not found")]
    NotFound(PositionId),

    #[error("position {0} belongs to another user")]
    Forbidden(PositionId),

    #[error("position {0} is not open")]
    InvalidState(PositionId),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
