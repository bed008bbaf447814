//! Order manager
//!
//! Central repository for every `Order` in the system and the only mutator
//! of order state. Orders are never removed; a terminal transition moves
//! them from the open partition to the closed partition. Queries preserve
//! insertion order, with timestamp ties broken by uuid.

use crate::error::{EngineError, Result};
use crate::order::{Order, OrderState};
use crate::portfolio::Portfolio;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// Attribute filter for order queries. Each provided key must match
/// (logical AND); `states` matches any member of the set.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub states: Option<Vec<OrderState>>,
    pub originator_uuid: Option<Uuid>,
    pub strategy_uuid: Option<Uuid>,
    pub strategy_id: Option<String>,
    pub portfolio_id: Option<String>,
    pub product_type: Option<String>,
    pub symbol: Option<String>,
    pub booked: Option<Option<bool>>,
}

impl OrderFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: OrderState) -> Self {
        self.states = Some(vec![state]);
        self
    }

    pub fn states(mut self, states: impl Into<Vec<OrderState>>) -> Self {
        self.states = Some(states.into());
        self
    }

    pub fn originator_uuid(mut self, uuid: Uuid) -> Self {
        self.originator_uuid = Some(uuid);
        self
    }

    pub fn strategy_uuid(mut self, uuid: Uuid) -> Self {
        self.strategy_uuid = Some(uuid);
        self
    }

    pub fn strategy_id(mut self, id: impl Into<String>) -> Self {
        self.strategy_id = Some(id.into());
        self
    }

    pub fn portfolio_id(mut self, id: impl Into<String>) -> Self {
        self.portfolio_id = Some(id.into());
        self
    }

    pub fn product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn booked(mut self, booked: Option<bool>) -> Self {
        self.booked = Some(booked);
        self
    }

    fn matches(&self, order: &Order) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&order.state()) {
                return false;
            }
        }
        if let Some(uuid) = self.originator_uuid {
            if order.originator_uuid != uuid {
                return false;
            }
        }
        if let Some(uuid) = self.strategy_uuid {
            if order.strategy_uuid != uuid {
                return false;
            }
        }
        if let Some(id) = &self.strategy_id {
            if &order.strategy_id != id {
                return false;
            }
        }
        if let Some(id) = &self.portfolio_id {
            if order.portfolio_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(product_type) = &self.product_type {
            if &order.product_type != product_type {
                return false;
            }
        }
        if let Some(symbol) = &self.symbol {
            if &order.symbol != symbol {
                return false;
            }
        }
        if let Some(booked) = self.booked {
            if order.booked() != booked {
                return false;
            }
        }
        true
    }
}

/// Order manager: owns every order, validates transitions, maintains the
/// open/closed partitions and the per-product market state.
pub struct OrderManager {
    id: String,
    orders: HashMap<Uuid, Order>,
    open: Vec<Uuid>,
    closed: Vec<Uuid>,
    market_state: HashMap<String, bool>,
    cancel_notices: Vec<Uuid>,
}

impl OrderManager {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        info!(id = %id, "OrderManager initialized");
        Self {
            id,
            orders: HashMap::new(),
            open: Vec::new(),
            closed: Vec::new(),
            market_state: HashMap::new(),
            cancel_notices: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Insert a new order. The order must be in CREATED state and its uuid
    /// must not collide with an existing one.
    pub fn new_order(&mut self, order: Order) -> Result<Uuid> {
        if order.state() != OrderState::Created {
            return Err(EngineError::InvalidOrder(format!(
                "new_order requires CREATED state, got {}",
                order.state()
            )));
        }
        let uuid = order.uuid();
        if self.orders.contains_key(&uuid) {
            return Err(EngineError::DuplicateUuid(uuid));
        }
        self.open.push(uuid);
        self.orders.insert(uuid, order);
        Ok(uuid)
    }

    /// Look up an order by uuid
    pub fn order(&self, uuid: Uuid) -> Option<&Order> {
        self.orders.get(&uuid)
    }

    pub(crate) fn order_mut(&mut self, uuid: Uuid) -> Result<&mut Order> {
        self.orders
            .get_mut(&uuid)
            .ok_or(EngineError::UnknownOrder(uuid))
    }

    /// Change the state of an order, validating the edge against the state
    /// machine and moving the order between partitions on a terminal
    /// transition. A no-op when the state is unchanged.
    ///
    /// An order whose product market is closed cannot advance beyond
    /// STAGED.
    pub fn change_state(&mut self, uuid: Uuid, state: OrderState) -> Result<()> {
        let (market_open, from) = {
            let order = self.orders.get(&uuid).ok_or(EngineError::UnknownOrder(uuid))?;
            if order.state() == state {
                return Ok(());
            }
            (
                *self.market_state.get(&order.product_type).unwrap_or(&false),
                order.state(),
            )
        };
        // a closed market stops orders from advancing beyond STAGED
        let advancing = matches!(state, OrderState::RiskAccepted | OrderState::Sent)
            || (from == OrderState::Staged && state == OrderState::Filled);
        if !market_open && advancing {
            let order = &self.orders[&uuid];
            return Err(EngineError::MarketClosed {
                product_type: order.product_type.clone(),
                uuid,
            });
        }

        let order = self.orders.get_mut(&uuid).unwrap();
        order.apply_state(state)?;
        if order.closed() {
            self.open.retain(|u| *u != uuid);
            self.closed.push(uuid);
        }
        if state == OrderState::Canceled {
            self.cancel_notices.push(uuid);
        }
        Ok(())
    }

    /// Apply a replacement to an open order and transition it to
    /// REPLACE_REQUESTED
    pub fn replace_order(
        &mut self,
        uuid: Uuid,
        quantity: Option<u64>,
        limit_price: Option<f64>,
    ) -> Result<()> {
        let order = self.order_mut(uuid)?;
        if !OrderState::can_transition(order.state(), OrderState::ReplaceRequested) {
            return Err(EngineError::InvalidTransition {
                uuid,
                from: order.state(),
                to: OrderState::ReplaceRequested,
            });
        }
        order.apply_replace(quantity, limit_price);
        self.change_state(uuid, OrderState::ReplaceRequested)
    }

    /// Set the booked flag on an order
    pub fn set_booked(&mut self, uuid: Uuid, booked: bool) -> Result<()> {
        self.order_mut(uuid)?.set_booked(booked);
        Ok(())
    }

    /// Closed orders with unbooked fills, in insertion order. These are the
    /// orders the PositionManager still needs to apply.
    pub fn to_be_booked_list(&self) -> Vec<Uuid> {
        self.closed
            .iter()
            .filter(|uuid| self.orders[uuid].booked() == Some(false))
            .copied()
            .collect()
    }

    /// Orders matching the filter, open partition first, each partition in
    /// insertion order
    pub fn orders_list(&self, filter: &OrderFilter) -> Vec<&Order> {
        self.open
            .iter()
            .chain(self.closed.iter())
            .map(|uuid| &self.orders[uuid])
            .filter(|order| filter.matches(order))
            .collect()
    }

    /// Open orders matching the filter
    pub fn open_orders(&self, filter: &OrderFilter) -> Vec<&Order> {
        self.open
            .iter()
            .map(|uuid| &self.orders[uuid])
            .filter(|order| filter.matches(order))
            .collect()
    }

    /// Closed orders matching the filter
    pub fn closed_orders(&self, filter: &OrderFilter) -> Vec<&Order> {
        self.closed
            .iter()
            .map(|uuid| &self.orders[uuid])
            .filter(|order| filter.matches(order))
            .collect()
    }

    /// Tabular projection of all orders, sorted by (create_timestamp, uuid)
    pub fn orders_table(&self) -> Vec<Order> {
        let mut rows: Vec<Order> = self.orders.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.create_timestamp()
                .cmp(&b.create_timestamp())
                .then(a.uuid().cmp(&b.uuid()))
        });
        rows
    }

    /// Tag an order with the portfolio that staged it
    pub fn assign_portfolio(&mut self, uuid: Uuid, portfolio: &Portfolio) -> Result<()> {
        let order = self.order_mut(uuid)?;
        order.portfolio_uuid = Some(portfolio.uuid());
        order.portfolio_id = Some(portfolio.id().to_string());
        Ok(())
    }

    /// Current market state for a product type; closed unless opened
    pub fn market_state(&self, product_type: &str) -> bool {
        *self.market_state.get(product_type).unwrap_or(&false)
    }

    /// Open or close the market for a product type
    pub fn set_market_state(&mut self, product_type: impl Into<String>, open: bool) {
        let product_type = product_type.into();
        info!(product_type = %product_type, open, "market state changed");
        self.market_state.insert(product_type, open);
    }

    /// Orders newly CANCELED since the last drain. The EventProcessor uses
    /// this to drive `on_cancels` exactly once per order.
    pub(crate) fn drain_cancel_notices(&mut self) -> Vec<Uuid> {
        std::mem::take(&mut self.cancel_notices)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }
}
