//! Order entity and its state machine
//!
//! An `Order` is a value-plus-state record of one trading instruction. It
//! carries identity, the instruction itself, and three append-only
//! histories: state transitions, replacements, and fills. State changes go
//! through the `OrderManager`; nothing else mutates state-crossing fields.

use crate::error::{EngineError, Result};
use crate::types::{BarTime, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Order lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Staged,
    RiskAccepted,
    Sent,
    Live,
    CancelRequested,
    CancelSent,
    ReplaceRequested,
    ReplaceRejected,
    ReplaceSent,
    PartiallyFilled,
    RiskRejected,
    Rejected,
    Filled,
    Canceled,
}

impl OrderState {
    /// All states in the closed partition. A transition into this set is
    /// terminal.
    pub const CLOSED: [OrderState; 4] = [
        OrderState::RiskRejected,
        OrderState::Rejected,
        OrderState::Filled,
        OrderState::Canceled,
    ];

    /// All states in the open partition.
    pub const OPEN: [OrderState; 11] = [
        OrderState::Created,
        OrderState::Staged,
        OrderState::RiskAccepted,
        OrderState::Sent,
        OrderState::Live,
        OrderState::CancelRequested,
        OrderState::CancelSent,
        OrderState::ReplaceRequested,
        OrderState::ReplaceRejected,
        OrderState::ReplaceSent,
        OrderState::PartiallyFilled,
    ];

    pub fn is_closed(&self) -> bool {
        Self::CLOSED.contains(self)
    }

    /// Whether `from -> to` is a permitted edge of the state machine.
    ///
    /// The table mirrors the order pipeline: Portfolio stages, Risk accepts
    /// or rejects, Broker sends, the venue drives the live states, and the
    /// cancel/replace request-sent pairs round-trip through the venue.
    /// `Staged -> Filled` is the internal-crossing edge and
    /// `ReplaceSent -> Filled` covers a replacement shrunk below the
    /// already-filled quantity.
    pub fn can_transition(from: OrderState, to: OrderState) -> bool {
        use OrderState::*;
        match from {
            Created => matches!(to, Staged),
            Staged => matches!(to, RiskAccepted | RiskRejected | Filled),
            RiskAccepted => matches!(to, Sent | Rejected),
            Sent => matches!(to, Live | Rejected | Canceled | Filled | PartiallyFilled),
            Live => matches!(
                to,
                PartiallyFilled | Filled | CancelRequested | ReplaceRequested | Canceled
            ),
            PartiallyFilled => matches!(
                to,
                PartiallyFilled | Filled | CancelRequested | ReplaceRequested | Canceled
            ),
            CancelRequested => matches!(to, CancelSent),
            CancelSent => matches!(to, Canceled | Live),
            ReplaceRequested => matches!(to, ReplaceSent),
            ReplaceSent => matches!(to, Live | ReplaceRejected | PartiallyFilled | Filled),
            ReplaceRejected => matches!(to, Live),
            RiskRejected | Rejected | Filled | Canceled => false,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::Created => "CREATED",
            OrderState::Staged => "STAGED",
            OrderState::RiskAccepted => "RISK_ACCEPTED",
            OrderState::Sent => "SENT",
            OrderState::Live => "LIVE",
            OrderState::CancelRequested => "CANCEL_REQUESTED",
            OrderState::CancelSent => "CANCEL_SENT",
            OrderState::ReplaceRequested => "REPLACE_REQUESTED",
            OrderState::ReplaceRejected => "REPLACE_REJECTED",
            OrderState::ReplaceSent => "REPLACE_SENT",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::RiskRejected => "RISK_REJECTED",
            OrderState::Rejected => "REJECTED",
            OrderState::Filled => "FILLED",
            OrderState::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

/// Order type. LIMIT carries its price in `Order::limit_price`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Market => write!(f, "MARKET"),
        }
    }
}

/// One row of the state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub timestamp: DateTime<Utc>,
    pub state: OrderState,
}

/// One row of the replacement history. The first row is the original
/// quantity and details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replace {
    pub quantity: u64,
    pub limit_price: Option<f64>,
}

/// One fill applied to the order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: u64,
    pub timestamp: DateTime<Utc>,
    pub bartime: BarTime,
    pub quantity: u64,
    pub price: f64,
    pub commission: f64,
    pub booked: bool,
}

/// Order object: identity, instruction, state and append-only histories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    uuid: Uuid,
    create_timestamp: DateTime<Utc>,
    pub originator_uuid: Uuid,
    pub originator_id: String,
    pub strategy_uuid: Uuid,
    pub strategy_id: String,
    pub portfolio_uuid: Option<Uuid>,
    pub portfolio_id: Option<String>,
    pub product_type: String,
    pub symbol: String,
    pub buy_sell: Side,
    quantity: u64,
    order_type: OrderType,
    limit_price: Option<f64>,
    state: OrderState,
    closed: bool,
    booked: Option<bool>,
    pub broker_order_id: Option<u64>,
    pub exchange_order_id: Option<u64>,
    fill_price: Option<f64>,
    fill_quantity: u64,
    commission: f64,
    pub reject_reason: Option<String>,
    state_history: Vec<StateChange>,
    replaces: Vec<Replace>,
    fills: Vec<Fill>,
}

impl Order {
    /// Create a new order in CREATED state.
    ///
    /// `buy_sell` accepts `buy`, `sell`, `B`, `S` in any case. A LIMIT
    /// order requires a price; quantity must be positive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        originator_uuid: Uuid,
        originator_id: impl Into<String>,
        strategy_uuid: Uuid,
        strategy_id: impl Into<String>,
        product_type: impl Into<String>,
        symbol: impl Into<String>,
        buy_sell: &str,
        quantity: u64,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> Result<Self> {
        let side = Side::parse(buy_sell).ok_or_else(|| {
            EngineError::InvalidOrder(format!(
                "buy_sell value must be in [buy, sell, B, S]: {buy_sell}"
            ))
        })?;
        if quantity == 0 {
            return Err(EngineError::InvalidOrder(
                "quantity must be positive".to_string(),
            ));
        }
        if order_type == OrderType::Limit && limit_price.is_none() {
            return Err(EngineError::InvalidOrder(
                "LIMIT order requires a price".to_string(),
            ));
        }

        let now = Utc::now();
        let order = Self {
            uuid: Uuid::new_v4(),
            create_timestamp: now,
            originator_uuid,
            originator_id: originator_id.into(),
            strategy_uuid,
            strategy_id: strategy_id.into(),
            portfolio_uuid: None,
            portfolio_id: None,
            product_type: product_type.into(),
            symbol: symbol.into(),
            buy_sell: side,
            quantity,
            order_type,
            limit_price,
            state: OrderState::Created,
            closed: false,
            booked: None,
            broker_order_id: None,
            exchange_order_id: None,
            fill_price: None,
            fill_quantity: 0,
            commission: 0.0,
            reject_reason: None,
            state_history: vec![StateChange {
                timestamp: now,
                state: OrderState::Created,
            }],
            replaces: vec![Replace {
                quantity,
                limit_price,
            }],
            fills: Vec::new(),
        };
        info!(
            uuid = %order.uuid,
            symbol = %order.symbol,
            side = %order.buy_sell,
            quantity,
            "order created"
        );
        Ok(order)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn create_timestamp(&self) -> DateTime<Utc> {
        self.create_timestamp
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn booked(&self) -> Option<bool> {
        self.booked
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    pub fn limit_price(&self) -> Option<f64> {
        self.limit_price
    }

    pub fn fill_price(&self) -> Option<f64> {
        self.fill_price
    }

    pub fn fill_quantity(&self) -> u64 {
        self.fill_quantity
    }

    pub fn commission(&self) -> f64 {
        self.commission
    }

    pub fn remaining_quantity(&self) -> u64 {
        self.quantity.saturating_sub(self.fill_quantity)
    }

    pub fn state_history(&self) -> &[StateChange] {
        &self.state_history
    }

    pub fn replaces(&self) -> &[Replace] {
        &self.replaces
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    /// Apply a state transition, validating the edge and appending to the
    /// state history. Crate-internal: go through `OrderManager::change_state`.
    pub(crate) fn apply_state(&mut self, state: OrderState) -> Result<()> {
        if self.state.is_closed() {
            return Err(EngineError::InvalidTransition {
                uuid: self.uuid,
                from: self.state,
                to: state,
            });
        }
        if !OrderState::can_transition(self.state, state) {
            return Err(EngineError::InvalidTransition {
                uuid: self.uuid,
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        self.state_history.push(StateChange {
            timestamp: Utc::now(),
            state,
        });
        if state.is_closed() {
            self.closed = true;
        }
        info!(uuid = %self.uuid, state = %state, "order state changed");
        Ok(())
    }

    pub(crate) fn set_booked(&mut self, booked: bool) {
        self.booked = Some(booked);
    }

    /// Add a fill. Can be partial or complete; fill aggregates are updated
    /// incrementally (weighted-average price, total quantity, commission).
    pub(crate) fn add_fill(
        &mut self,
        fill_id: u64,
        timestamp: DateTime<Utc>,
        bartime: BarTime,
        quantity: u64,
        price: f64,
        commission: f64,
    ) {
        info!(
            uuid = %self.uuid,
            fill_id,
            quantity,
            price,
            commission,
            "add fill"
        );
        self.fills.push(Fill {
            fill_id,
            timestamp,
            bartime,
            quantity,
            price,
            commission,
            booked: false,
        });
        self.fill_price = Some(match self.fill_price {
            Some(prior) => {
                (prior * self.fill_quantity as f64 + price * quantity as f64)
                    / (self.fill_quantity + quantity) as f64
            }
            None => price,
        });
        self.fill_quantity += quantity;
        self.commission += commission;
    }

    pub(crate) fn mark_fill_booked(&mut self, fill_id: u64) {
        if let Some(fill) = self.fills.iter_mut().find(|f| f.fill_id == fill_id) {
            fill.booked = true;
        }
    }

    /// Whether a fill with this id has already been applied
    pub fn has_fill(&self, fill_id: u64) -> bool {
        self.fills.iter().any(|f| f.fill_id == fill_id)
    }

    /// Append a replacement. Omitted arguments keep the prior values. A
    /// replacement cannot shrink the quantity below what has already
    /// filled.
    pub(crate) fn apply_replace(&mut self, quantity: Option<u64>, limit_price: Option<f64>) {
        let quantity = quantity.unwrap_or(self.quantity).max(self.fill_quantity);
        let limit_price = limit_price.or(self.limit_price);
        self.replaces.push(Replace {
            quantity,
            limit_price,
        });
        self.quantity = quantity;
        self.limit_price = limit_price;
        info!(uuid = %self.uuid, quantity, ?limit_price, "order replaced");
    }

    /// Canonical fingerprint for cross-run comparison:
    /// `uuid|create_timestamp|product_type|symbol|side|quantity|type|detailsJSON`
    pub fn fingerprint(&self) -> String {
        let details = match (self.order_type, self.limit_price) {
            (OrderType::Limit, Some(price)) => format!("{{\"price\":{price}}}"),
            _ => "{}".to_string(),
        };
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.uuid,
            self.create_timestamp.to_rfc3339(),
            self.product_type,
            self.symbol,
            self.buy_sell,
            self.quantity,
            self.order_type,
            details
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(quantity: u64) -> Order {
        Order::new(
            Uuid::new_v4(),
            "strategy.test",
            Uuid::new_v4(),
            "test",
            "stock",
            "TEST",
            "b",
            quantity,
            OrderType::Limit,
            Some(10.0),
        )
        .unwrap()
    }

    #[test]
    fn test_new_order_defaults() {
        let order = new_order(100);
        assert_eq!(order.state(), OrderState::Created);
        assert_eq!(order.buy_sell, Side::Buy);
        assert!(!order.closed());
        assert_eq!(order.booked(), None);
        assert_eq!(order.fill_quantity(), 0);
        assert_eq!(order.state_history().len(), 1);
        assert_eq!(order.replaces().len(), 1);
        assert_eq!(order.replaces()[0].quantity, 100);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mk = |side: &str, qty: u64, price: Option<f64>| {
            Order::new(
                Uuid::new_v4(),
                "strategy.test",
                Uuid::new_v4(),
                "test",
                "stock",
                "TEST",
                side,
                qty,
                OrderType::Limit,
                price,
            )
        };
        assert!(mk("hold", 100, Some(10.0)).is_err());
        assert!(mk("b", 0, Some(10.0)).is_err());
        assert!(mk("b", 100, None).is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut order = new_order(100);
        for state in [
            OrderState::Staged,
            OrderState::RiskAccepted,
            OrderState::Sent,
            OrderState::Live,
            OrderState::PartiallyFilled,
            OrderState::Filled,
        ] {
            order.apply_state(state).unwrap();
        }
        assert!(order.closed());
        assert_eq!(order.state_history().len(), 7);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut order = new_order(100);
        let err = order.apply_state(OrderState::Live).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(order.state(), OrderState::Created);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut order = new_order(100);
        order.apply_state(OrderState::Staged).unwrap();
        order.apply_state(OrderState::RiskRejected).unwrap();
        assert!(order.closed());
        assert!(order.apply_state(OrderState::Staged).is_err());
    }

    #[test]
    fn test_cancel_round_trip() {
        let mut order = new_order(100);
        for state in [
            OrderState::Staged,
            OrderState::RiskAccepted,
            OrderState::Sent,
            OrderState::Live,
            OrderState::CancelRequested,
            OrderState::CancelSent,
            OrderState::Canceled,
        ] {
            order.apply_state(state).unwrap();
        }
        assert!(order.closed());
    }

    #[test]
    fn test_replace_round_trip_with_rejection() {
        let mut order = new_order(100);
        for state in [
            OrderState::Staged,
            OrderState::RiskAccepted,
            OrderState::Sent,
            OrderState::Live,
            OrderState::ReplaceRequested,
            OrderState::ReplaceSent,
            OrderState::ReplaceRejected,
            OrderState::Live,
        ] {
            order.apply_state(state).unwrap();
        }
        assert_eq!(order.state(), OrderState::Live);
    }

    #[test]
    fn test_fill_aggregates() {
        let mut order = new_order(100);
        let now = Utc::now();
        order.add_fill(1, now, now, 40, 10.0, -0.4);
        order.add_fill(2, now, now, 60, 11.0, -0.6);
        assert_eq!(order.fill_quantity(), 100);
        assert_eq!(order.remaining_quantity(), 0);
        let expected = (10.0 * 40.0 + 11.0 * 60.0) / 100.0;
        assert!((order.fill_price().unwrap() - expected).abs() < 1e-9);
        assert!((order.commission() - -1.0).abs() < 1e-9);
        assert!(order.has_fill(1));
        assert!(!order.has_fill(3));
    }

    #[test]
    fn test_replace_keeps_omitted_values() {
        let mut order = new_order(100);
        order.apply_replace(Some(150), None);
        assert_eq!(order.quantity(), 150);
        assert_eq!(order.limit_price(), Some(10.0));
        order.apply_replace(None, Some(9.5));
        assert_eq!(order.quantity(), 150);
        assert_eq!(order.limit_price(), Some(9.5));
        assert_eq!(order.replaces().len(), 3);
    }

    #[test]
    fn test_state_history_is_monotonic() {
        let mut order = new_order(100);
        order.apply_state(OrderState::Staged).unwrap();
        order.apply_state(OrderState::RiskAccepted).unwrap();
        let history = order.state_history();
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let mut order = new_order(100);
        order.apply_state(OrderState::Staged).unwrap();
        let now = Utc::now();
        order.add_fill(7, now, now, 30, 9.9, -0.3);
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(order, back);
    }

    #[test]
    fn test_fingerprint_format() {
        let order = new_order(100);
        let fp = order.fingerprint();
        let parts: Vec<&str> = fp.split('|').collect();
        assert_eq!(parts.len(), 8);
        assert_eq!(parts[0], order.uuid().to_string());
        assert_eq!(parts[2], "stock");
        assert_eq!(parts[3], "TEST");
        assert_eq!(parts[4], "buy");
        assert_eq!(parts[5], "100");
        assert_eq!(parts[6], "LIMIT");
        assert_eq!(parts[7], "{\"price\":10}");
    }
}
