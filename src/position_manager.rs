//! Position manager
//!
//! Books fills into positions and computes PnL. Rows are keyed by
//! (strategy_id, product_type, symbol). Only the PositionManager mutates
//! position rows; booking is idempotent through the order and fill booked
//! flags.

use crate::error::{EngineError, Result};
use crate::market_data::MarketDataManager;
use crate::order_manager::OrderManager;
use crate::types::{BarTime, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Composite key of a position row
pub type PositionKey = (String, String, String);

/// One position row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub strategy_id: String,
    pub product_type: String,
    pub symbol: String,
    pub current_position: i64,
    pub start_position: i64,
    pub net_quantity: i64,
    pub buy_quantity: u64,
    pub sell_quantity: u64,
    pub buy_avg_price: f64,
    pub sell_avg_price: f64,
    pub buy_pnl: f64,
    pub sell_pnl: f64,
    pub trade_pnl: f64,
    pub position_pnl: f64,
    pub gross_pnl: f64,
    pub commission: f64,
    pub net_pnl: f64,
    pub prior_close_price: Option<f64>,
    pub current_price: Option<f64>,
}

impl Position {
    fn new(strategy_id: &str, product_type: &str, symbol: &str) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            product_type: product_type.to_string(),
            symbol: symbol.to_string(),
            current_position: 0,
            start_position: 0,
            net_quantity: 0,
            buy_quantity: 0,
            sell_quantity: 0,
            buy_avg_price: 0.0,
            sell_avg_price: 0.0,
            buy_pnl: 0.0,
            sell_pnl: 0.0,
            trade_pnl: 0.0,
            position_pnl: 0.0,
            gross_pnl: 0.0,
            commission: 0.0,
            net_pnl: 0.0,
            prior_close_price: None,
            current_price: None,
        }
    }
}

/// One booked trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub bartime: BarTime,
    pub originator_id: String,
    pub strategy_id: String,
    pub product_type: String,
    pub symbol: String,
    pub buy_sell: Side,
    pub quantity: u64,
    pub price: f64,
    pub commission: f64,
    pub order_uuid: Option<Uuid>,
    pub fill_id: Option<u64>,
}

/// Position manager: the keyed position table plus the trade journal
pub struct PositionManager {
    id: String,
    positions: BTreeMap<PositionKey, Position>,
    trades: Vec<Trade>,
    next_trade_id: u64,
}

impl PositionManager {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        info!(id = %id, "PositionManager initialized");
        Self {
            id,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            next_trade_id: 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The position row for a key, if any trades have been booked for it
    pub fn position(&self, strategy_id: &str, product_type: &str, symbol: &str) -> Option<&Position> {
        self.positions.get(&(
            strategy_id.to_string(),
            product_type.to_string(),
            symbol.to_string(),
        ))
    }

    /// Current position for a key, zero when the row does not exist
    pub fn current_position(&self, strategy_id: &str, product_type: &str, symbol: &str) -> i64 {
        self.position(strategy_id, product_type, symbol)
            .map(|p| p.current_position)
            .unwrap_or(0)
    }

    /// Projection of the keyed table, sorted by the composite key
    pub fn positions_table(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    /// All trades booked since initialization
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    fn row_mut(&mut self, strategy_id: &str, product_type: &str, symbol: &str) -> &mut Position {
        self.positions
            .entry((
                strategy_id.to_string(),
                product_type.to_string(),
                symbol.to_string(),
            ))
            .or_insert_with(|| Position::new(strategy_id, product_type, symbol))
    }

    /// Enter one trade and update the keyed row
    #[allow(clippy::too_many_arguments)]
    pub fn enter_trade(
        &mut self,
        originator_id: &str,
        strategy_id: &str,
        bartime: BarTime,
        product_type: &str,
        symbol: &str,
        buy_sell: Side,
        quantity: u64,
        price: f64,
        commission: f64,
    ) -> u64 {
        self.enter_trade_full(
            originator_id,
            strategy_id,
            bartime,
            product_type,
            symbol,
            buy_sell,
            quantity,
            price,
            commission,
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_trade_full(
        &mut self,
        originator_id: &str,
        strategy_id: &str,
        bartime: BarTime,
        product_type: &str,
        symbol: &str,
        buy_sell: Side,
        quantity: u64,
        price: f64,
        commission: f64,
        order_uuid: Option<Uuid>,
        fill_id: Option<u64>,
    ) -> u64 {
        let id = self.next_trade_id;
        self.next_trade_id += 1;
        info!(
            trade_id = id,
            strategy_id,
            symbol,
            side = %buy_sell,
            quantity,
            price,
            "entering trade"
        );
        self.trades.push(Trade {
            id,
            timestamp: Utc::now(),
            bartime,
            originator_id: originator_id.to_string(),
            strategy_id: strategy_id.to_string(),
            product_type: product_type.to_string(),
            symbol: symbol.to_string(),
            buy_sell,
            quantity,
            price,
            commission,
            order_uuid,
            fill_id,
        });

        let row = self.row_mut(strategy_id, product_type, symbol);
        match buy_sell {
            Side::Buy => {
                row.buy_avg_price = (row.buy_avg_price * row.buy_quantity as f64
                    + price * quantity as f64)
                    / (row.buy_quantity + quantity) as f64;
                row.buy_quantity += quantity;
            }
            Side::Sell => {
                row.sell_avg_price = (row.sell_avg_price * row.sell_quantity as f64
                    + price * quantity as f64)
                    / (row.sell_quantity + quantity) as f64;
                row.sell_quantity += quantity;
            }
        }
        row.net_quantity = row.buy_quantity as i64 - row.sell_quantity as i64;
        row.current_position = row.start_position + row.net_quantity;
        row.commission += commission;
        id
    }

    /// Book every unbooked fill of a closed order as a trade. The order
    /// must be closed with at least one fill.
    pub fn enter_trade_from_order(&mut self, oms: &mut OrderManager, uuid: Uuid) -> Result<()> {
        let (originator_id, strategy_id, product_type, symbol, side, unbooked) = {
            let order = oms.order(uuid).ok_or(EngineError::UnknownOrder(uuid))?;
            if !order.closed() || order.fills().is_empty() {
                return Err(EngineError::InvalidOrder(format!(
                    "order cannot be booked, not closed with fills: {uuid}"
                )));
            }
            let unbooked: Vec<_> = order
                .fills()
                .iter()
                .filter(|f| !f.booked)
                .cloned()
                .collect();
            (
                order.originator_id.clone(),
                order.strategy_id.clone(),
                order.product_type.clone(),
                order.symbol.clone(),
                order.buy_sell,
                unbooked,
            )
        };

        for fill in unbooked {
            self.enter_trade_full(
                &originator_id,
                &strategy_id,
                fill.bartime,
                &product_type,
                &symbol,
                side,
                fill.quantity,
                fill.price,
                fill.commission,
                Some(uuid),
                Some(fill.fill_id),
            );
            oms.order_mut(uuid)?.mark_fill_booked(fill.fill_id);
        }
        oms.set_booked(uuid, true)?;
        Ok(())
    }

    /// Book every order the OMS flags as to-be-booked. Returns the booked
    /// orders grouped by originator id.
    pub fn book_fills(&mut self, oms: &mut OrderManager) -> Result<BTreeMap<String, Vec<Uuid>>> {
        info!("booking order fills");
        let mut booked: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for uuid in oms.to_be_booked_list() {
            self.enter_trade_from_order(oms, uuid)?;
            let originator_id = oms.order(uuid).expect("booked order").originator_id.clone();
            booked.entry(originator_id).or_default().push(uuid);
        }
        Ok(booked)
    }

    /// Recompute PnL for every row from current market prices:
    ///
    /// - `buy_pnl  = (current_price - buy_avg_price)  * buy_quantity`
    /// - `sell_pnl = (sell_avg_price - current_price) * sell_quantity`
    /// - `trade_pnl = buy_pnl + sell_pnl`
    /// - `position_pnl = (current_price - prior_close_price) * start_position`
    /// - `gross_pnl = trade_pnl + position_pnl`
    /// - `net_pnl = gross_pnl + commission`
    pub fn update_pnl(&mut self, market_data: &MarketDataManager) {
        for row in self.positions.values_mut() {
            let Some(current_price) = market_data.current_price(&row.product_type, &row.symbol)
            else {
                warn!(
                    product_type = %row.product_type,
                    symbol = %row.symbol,
                    "no current price, pnl not updated"
                );
                continue;
            };
            row.current_price = Some(current_price);
            if row.prior_close_price.is_none() {
                row.prior_close_price = market_data.prior_close(&row.product_type, &row.symbol);
            }

            row.buy_pnl = if row.buy_quantity > 0 {
                (current_price - row.buy_avg_price) * row.buy_quantity as f64
            } else {
                0.0
            };
            row.sell_pnl = if row.sell_quantity > 0 {
                (row.sell_avg_price - current_price) * row.sell_quantity as f64
            } else {
                0.0
            };
            row.trade_pnl = row.buy_pnl + row.sell_pnl;
            row.position_pnl = match (row.start_position, row.prior_close_price) {
                (0, _) => 0.0,
                (start, Some(prior_close)) => (current_price - prior_close) * start as f64,
                (_, None) => 0.0,
            };
            row.gross_pnl = row.trade_pnl + row.position_pnl;
            row.net_pnl = row.gross_pnl + row.commission;
        }
    }

    /// Begin-of-day roll: the current position becomes the start position,
    /// trade quantities, averages and PnL reset, and the prior close is
    /// refreshed on the next PnL update.
    pub fn begin_of_day(&mut self) {
        info!("running BOD position roll");
        for row in self.positions.values_mut() {
            row.start_position = row.current_position;
            row.net_quantity = 0;
            row.buy_quantity = 0;
            row.sell_quantity = 0;
            row.buy_avg_price = 0.0;
            row.sell_avg_price = 0.0;
            row.buy_pnl = 0.0;
            row.sell_pnl = 0.0;
            row.trade_pnl = 0.0;
            row.position_pnl = 0.0;
            row.gross_pnl = 0.0;
            row.commission = 0.0;
            row.net_pnl = 0.0;
            row.prior_close_price = None;
        }
    }

    /// End-of-day: final PnL mark against the day's data
    pub fn end_of_day(&mut self, market_data: &MarketDataManager) {
        info!("running EOD position update");
        self.update_pnl(market_data);
    }

    /// Seed start positions from a persisted snapshot
    pub fn load_start_positions(&mut self, records: &[Position]) {
        for record in records {
            if record.current_position == 0 {
                continue;
            }
            let row = self.row_mut(&record.strategy_id, &record.product_type, &record.symbol);
            row.start_position = record.current_position;
            row.current_position = record.current_position;
        }
    }
}
