//! Engine error taxonomy
//!
//! Pipeline-level failures are typed here. Strategy callback failures are
//! `anyhow::Error` and never surface through this enum; they disable the
//! strategy until the next begin-of-day instead.

use crate::order::OrderState;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the engine components
#[derive(Debug, Error)]
pub enum EngineError {
    /// A state change rejected by the order state machine. Fatal to the
    /// offending step; surfaced after the current bar unless running strict.
    #[error("invalid order state transition {from:?} -> {to:?} for order {uuid}")]
    InvalidTransition {
        uuid: Uuid,
        from: OrderState,
        to: OrderState,
    },

    /// Insertion collision in the OrderManager
    #[error("duplicate order uuid {0}")]
    DuplicateUuid(Uuid),

    /// Lookup of an order the OrderManager does not hold
    #[error("unknown order uuid {0}")]
    UnknownOrder(Uuid),

    /// The market for a product is closed and the order cannot advance
    #[error("market for product_type {product_type} is closed, order {uuid} cannot advance")]
    MarketClosed { product_type: String, uuid: Uuid },

    /// Bar data missing for a tracked symbol; processing for that symbol is
    /// skipped this bar
    #[error("no market data for ({product_type}, {symbol}) at {bartime}")]
    NoMarketData {
        product_type: String,
        symbol: String,
        bartime: String,
    },

    /// An order survived a transient state across a bar boundary
    #[error("order {uuid} stuck in state {state:?}")]
    StuckOrder { uuid: Uuid, state: OrderState },

    /// Malformed order input (side, quantity, missing limit price)
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Snapshot persistence failure
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Run configuration failure
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}
