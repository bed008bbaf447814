//! Strategy contract
//!
//! A strategy implements the lifecycle callbacks and interacts with the
//! rest of the system only through the `StrategyCtx` bridge handed to each
//! callback: a small record of non-owning handles over the OrderManager,
//! Portfolio, PositionManager and MarketDataManager, plus the explicit
//! authoring entry points. Strategies never mutate order fields directly.
//!
//! Callback errors abort that strategy's contribution to the current bar
//! and disable it until the next begin-of-day; they never abort the
//! pipeline.

use crate::error::{EngineError, Result};
use crate::market_data::MarketDataManager;
use crate::order::{Order, OrderState, OrderType};
use crate::order_manager::{OrderFilter, OrderManager};
use crate::portfolio::Portfolio;
use crate::position_manager::PositionManager;
use crate::types::{Bar, BarTime, SymbolSpec};
use tracing::info;
use uuid::Uuid;

/// Lifecycle callbacks of a trading strategy. All have default no-op
/// implementations; concrete strategies override what they need.
pub trait Strategy {
    fn on_start(&mut self, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_begin_of_day(&mut self, _bartime: BarTime, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_market_open(&mut self, _bartime: BarTime, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_bar(&mut self, _bartime: BarTime, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_fills(
        &mut self,
        _bartime: BarTime,
        _orders: &[Order],
        _ctx: &mut StrategyCtx,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_cancels(
        &mut self,
        _bartime: BarTime,
        _orders: &[Order],
        _ctx: &mut StrategyCtx,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_market_close(&mut self, _bartime: BarTime, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_end_of_day(&mut self, _bartime: BarTime, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stop(&mut self, _bartime: BarTime, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Engine-side record of a registered strategy: identity, configuration
/// and health, wrapping the user implementation
pub struct StrategyHandle {
    pub strategy_id: String,
    pub uuid: Uuid,
    pub portfolio_id: String,
    pub symbols: Vec<SymbolSpec>,
    pub parameters: serde_json::Value,
    pub healthy: bool,
    started: bool,
    pub strategy: Box<dyn Strategy>,
}

impl StrategyHandle {
    pub fn new(
        strategy_id: impl Into<String>,
        portfolio_id: impl Into<String>,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        let strategy_id = strategy_id.into();
        let uuid = Uuid::new_v4();
        info!(strategy_id = %strategy_id, %uuid, "Strategy initialized");
        Self {
            strategy_id,
            uuid,
            portfolio_id: portfolio_id.into(),
            symbols: Vec::new(),
            parameters: serde_json::Value::Null,
            healthy: true,
            started: false,
            strategy,
        }
    }

    /// Register symbols with the strategy and the market data manager.
    /// Only valid before start.
    pub fn add_symbols(
        &mut self,
        specs: impl IntoIterator<Item = SymbolSpec>,
        market_data: &mut MarketDataManager,
    ) -> Result<()> {
        if self.started {
            return Err(EngineError::Config(format!(
                "cannot add symbols after start: {}",
                self.strategy_id
            )));
        }
        for spec in specs {
            market_data.add_symbols(&spec.product_type, &spec.symbol, &spec.frequency);
            if !self.symbols.contains(&spec) {
                self.symbols.push(spec);
            }
        }
        Ok(())
    }

    /// Set the strategy parameters. Only valid before start.
    pub fn set_parameters(&mut self, parameters: serde_json::Value) -> Result<()> {
        if self.started {
            return Err(EngineError::Config(format!(
                "cannot set parameters after start: {}",
                self.strategy_id
            )));
        }
        self.parameters = parameters;
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    /// The identity part of the bridge for this handle
    pub(crate) fn meta(&self) -> StrategyMeta<'_> {
        StrategyMeta {
            strategy_id: &self.strategy_id,
            strategy_uuid: self.uuid,
            symbols: &self.symbols,
            parameters: &self.parameters,
        }
    }

    /// Split into the mutable strategy implementation and its bridge
    /// metadata, so a callback can run while the metadata is borrowed
    pub(crate) fn split(&mut self) -> (&mut Box<dyn Strategy>, StrategyMeta<'_>) {
        let meta = StrategyMeta {
            strategy_id: &self.strategy_id,
            strategy_uuid: self.uuid,
            symbols: &self.symbols,
            parameters: &self.parameters,
        };
        (&mut self.strategy, meta)
    }
}

/// Identity and configuration of the strategy a bridge belongs to
#[derive(Clone, Copy)]
pub struct StrategyMeta<'a> {
    pub strategy_id: &'a str,
    pub strategy_uuid: Uuid,
    pub symbols: &'a [SymbolSpec],
    pub parameters: &'a serde_json::Value,
}

/// The object bridge handed to every strategy callback
pub struct StrategyCtx<'a> {
    meta: StrategyMeta<'a>,
    pub oms: &'a mut OrderManager,
    pub portfolio: &'a mut Portfolio,
    pub positions: &'a PositionManager,
    pub market_data: &'a MarketDataManager,
}

impl<'a> StrategyCtx<'a> {
    pub fn new(
        meta: StrategyMeta<'a>,
        oms: &'a mut OrderManager,
        portfolio: &'a mut Portfolio,
        positions: &'a PositionManager,
        market_data: &'a MarketDataManager,
    ) -> Self {
        Self {
            meta,
            oms,
            portfolio,
            positions,
            market_data,
        }
    }

    pub fn strategy_id(&self) -> &str {
        self.meta.strategy_id
    }

    pub fn parameters(&self) -> &serde_json::Value {
        self.meta.parameters
    }

    fn check_symbol(&self, product_type: &str, symbol: &str) -> Result<()> {
        let known = self
            .meta
            .symbols
            .iter()
            .any(|s| s.product_type == product_type && s.symbol == symbol);
        if known {
            Ok(())
        } else {
            Err(EngineError::InvalidOrder(format!(
                "symbol not added to strategy {}: ({product_type}, {symbol})",
                self.meta.strategy_id
            )))
        }
    }

    /// Create an order in the OrderManager; the Portfolio picks it up at
    /// the next processing step. Returns the order uuid.
    pub fn order(
        &mut self,
        product_type: &str,
        symbol: &str,
        buy_sell: &str,
        quantity: u64,
        order_type: OrderType,
        price: Option<f64>,
    ) -> Result<Uuid> {
        self.check_symbol(product_type, symbol)?;
        info!(
            strategy_id = %self.meta.strategy_id,
            symbol,
            buy_sell,
            quantity,
            "creating order"
        );
        let order = Order::new(
            self.meta.strategy_uuid,
            format!("strategy.{}", self.meta.strategy_id),
            self.meta.strategy_uuid,
            self.meta.strategy_id,
            product_type,
            symbol,
            buy_sell,
            quantity,
            order_type,
            price,
        )?;
        self.oms.new_order(order)
    }

    /// Look up an order by uuid
    pub fn get_order(&self, uuid: Uuid) -> Option<&Order> {
        self.oms.order(uuid)
    }

    /// Request cancellation of an order. A request against an already
    /// closed order is ignored.
    pub fn cancel_order(&mut self, uuid: Uuid) -> Result<()> {
        let Some(order) = self.oms.order(uuid) else {
            return Err(EngineError::UnknownOrder(uuid));
        };
        if order.closed() {
            info!(%uuid, "cancel of closed order ignored");
            return Ok(());
        }
        self.oms.change_state(uuid, OrderState::CancelRequested)
    }

    /// Request replacement of an order's quantity and/or price. A request
    /// against an already closed order is ignored.
    pub fn replace_order(
        &mut self,
        uuid: Uuid,
        quantity: Option<u64>,
        price: Option<f64>,
    ) -> Result<()> {
        let Some(order) = self.oms.order(uuid) else {
            return Err(EngineError::UnknownOrder(uuid));
        };
        if order.closed() {
            info!(%uuid, "replace of closed order ignored");
            return Ok(());
        }
        self.oms.replace_order(uuid, quantity, price)
    }

    /// Orders authored by this strategy, optionally narrowed further
    pub fn orders_list(&self, filter: OrderFilter) -> Vec<&Order> {
        self.oms
            .orders_list(&filter.originator_uuid(self.meta.strategy_uuid))
    }

    /// Declare an absolute target position for (product_type, symbol).
    /// Replaces any pending intent for the same key.
    pub fn intent(&mut self, product_type: &str, symbol: &str, target: i64) -> Result<()> {
        self.check_symbol(product_type, symbol)?;
        self.portfolio
            .set_intent(self.meta.strategy_id, product_type, symbol, target);
        Ok(())
    }

    /// The pending intent target, if any
    pub fn get_intent(&self, product_type: &str, symbol: &str) -> Option<i64> {
        self.portfolio
            .get_intent(self.meta.strategy_id, product_type, symbol)
    }

    /// Current position for (product_type, symbol), zero when flat
    pub fn position(&self, product_type: &str, symbol: &str) -> i64 {
        self.positions
            .current_position(self.meta.strategy_id, product_type, symbol)
    }

    /// The current bar for (product_type, symbol), if present
    pub fn current_bar(&self, product_type: &str, symbol: &str) -> Option<Bar> {
        self.market_data.current_bar(product_type, symbol)
    }

    /// Last price for (product_type, symbol)
    pub fn current_price(&self, product_type: &str, symbol: &str) -> Option<f64> {
        self.market_data.current_price(product_type, symbol)
    }
}
