//! Paper exchange
//!
//! A simulated venue with a deliberately simple fill model. It accepts
//! orders by value (never the trading-system `Order` object), keeps its own
//! book of `PaperOrder` records, and matches them against the current bar.
//!
//! Orders received while a bar is in flight are queued and only become
//! eligible on the next bar tick. Fill quantity is capped by a per-symbol
//! bar budget of `floor(volume * fill_multiplier)`, consumed FIFO across
//! competing orders.

use crate::error::{EngineError, Result};
use crate::market_data::MarketDataManager;
use crate::order::{OrderState, OrderType};
use crate::types::{BarTime, Side};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// One fill produced by the venue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeFill {
    pub fill_id: u64,
    pub bartime: BarTime,
    pub quantity: u64,
    pub price: f64,
}

/// One replacement request recorded on a paper order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeReplace {
    pub quantity: u64,
    pub limit_price: Option<f64>,
}

/// The venue's own record of a submitted order
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub order_id: u64,
    pub product_type: String,
    pub symbol: String,
    pub buy_sell: Side,
    pub quantity: u64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub state: OrderState,
    pub fill_quantity: u64,
    pub fill_price: Option<f64>,
    pub fills: Vec<ExchangeFill>,
    pub replaces: Vec<ExchangeReplace>,
    pub close_bar_timestamp: Option<BarTime>,
    /// Number of completed matching passes when the order arrived; the
    /// order is eligible once another pass has completed.
    received_pass: u64,
}

impl PaperOrder {
    pub fn remaining_quantity(&self) -> u64 {
        self.quantity.saturating_sub(self.fill_quantity)
    }
}

/// Tunable venue parameters
#[derive(Debug, Clone)]
pub struct ExchangeParams {
    /// Fraction of a bar's volume available to fills, at most 1.0
    pub fill_multiplier: f64,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        Self {
            fill_multiplier: 0.5,
        }
    }
}

/// Paper exchange used in simulation with a `PaperBroker`
pub struct PaperExchange {
    params: ExchangeParams,
    open_orders: BTreeMap<u64, PaperOrder>,
    closed_orders: BTreeMap<u64, PaperOrder>,
    next_order_id: u64,
    next_fill_id: u64,
    completed_passes: u64,
}

impl PaperExchange {
    pub fn new(params: ExchangeParams) -> Result<Self> {
        if !(0.0..=1.0).contains(&params.fill_multiplier) {
            return Err(EngineError::Config(format!(
                "fill_multiplier must be in [0, 1]: {}",
                params.fill_multiplier
            )));
        }
        // time-derived so ids differ between runs, monotonic within one
        let seed = Utc::now().format("%y%m%d%H%M%S").to_string();
        let base: u64 = seed.parse().unwrap_or(1) * 1_000_000;
        info!(fill_multiplier = params.fill_multiplier, "PaperExchange initialized");
        Ok(Self {
            params,
            open_orders: BTreeMap::new(),
            closed_orders: BTreeMap::new(),
            next_order_id: base + 1,
            next_fill_id: base + 1,
            completed_passes: 0,
        })
    }

    pub fn params(&self) -> &ExchangeParams {
        &self.params
    }

    /// Receive an order from a broker. Returns the exchange order id. The
    /// order is queued until the next matching pass.
    #[allow(clippy::too_many_arguments)]
    pub fn receive_order(
        &mut self,
        product_type: &str,
        symbol: &str,
        buy_sell: Side,
        quantity: u64,
        order_type: OrderType,
        limit_price: Option<f64>,
    ) -> u64 {
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        let order = PaperOrder {
            order_id,
            product_type: product_type.to_string(),
            symbol: symbol.to_string(),
            buy_sell,
            quantity,
            order_type,
            limit_price,
            state: OrderState::Sent,
            fill_quantity: 0,
            fill_price: None,
            fills: Vec::new(),
            replaces: vec![ExchangeReplace {
                quantity,
                limit_price,
            }],
            close_bar_timestamp: None,
            received_pass: self.completed_passes,
        };
        self.open_orders.insert(order_id, order);
        info!(order_id, symbol, "order received");
        order_id
    }

    /// Receive a cancel request for an open order
    pub fn receive_cancel(&mut self, order_id: u64) {
        info!(order_id, "cancel request received");
        if let Some(order) = self.open_orders.get_mut(&order_id) {
            order.state = OrderState::CancelSent;
        }
    }

    /// Receive a replace request for an open order
    pub fn receive_replace(&mut self, order_id: u64, quantity: u64, limit_price: Option<f64>) {
        info!(order_id, quantity, "replace request received");
        if let Some(order) = self.open_orders.get_mut(&order_id) {
            order.state = OrderState::ReplaceSent;
            order.replaces.push(ExchangeReplace {
                quantity,
                limit_price,
            });
        }
    }

    /// Look up an order in the open or closed book
    pub fn get_order(&self, order_id: u64) -> Option<&PaperOrder> {
        self.open_orders
            .get(&order_id)
            .or_else(|| self.closed_orders.get(&order_id))
    }

    pub fn open_orders(&self) -> impl Iterator<Item = &PaperOrder> {
        self.open_orders.values()
    }

    pub fn closed_orders(&self) -> impl Iterator<Item = &PaperOrder> {
        self.closed_orders.values()
    }

    fn apply_fill(&mut self, order_id: u64, quantity: u64, price: f64, bartime: BarTime) {
        let fill_id = self.next_fill_id;
        self.next_fill_id += 1;
        let order = self.open_orders.get_mut(&order_id).expect("open order");
        order.fills.push(ExchangeFill {
            fill_id,
            bartime,
            quantity,
            price,
        });
        order.fill_price = Some(match order.fill_price {
            Some(prior) => {
                (prior * order.fill_quantity as f64 + price * quantity as f64)
                    / (order.fill_quantity + quantity) as f64
            }
            None => price,
        });
        order.fill_quantity += quantity;
        info!(order_id, quantity, price, "order fill");
        if order.fill_quantity >= order.quantity {
            self.make_filled(order_id, bartime);
        } else {
            self.open_orders.get_mut(&order_id).expect("open order").state =
                OrderState::PartiallyFilled;
        }
    }

    fn make_filled(&mut self, order_id: u64, bartime: BarTime) {
        let mut order = self.open_orders.remove(&order_id).expect("open order");
        order.state = OrderState::Filled;
        order.close_bar_timestamp = Some(bartime);
        self.closed_orders.insert(order_id, order);
    }

    fn make_canceled(&mut self, order_id: u64, bartime: BarTime) {
        let mut order = self.open_orders.remove(&order_id).expect("open order");
        order.state = OrderState::Canceled;
        order.close_bar_timestamp = Some(bartime);
        self.closed_orders.insert(order_id, order);
        info!(order_id, "order canceled");
    }

    fn apply_replace(&mut self, order_id: u64, bartime: BarTime) {
        let order = self.open_orders.get_mut(&order_id).expect("open order");
        let last = *order.replaces.last().expect("replace history");
        order.quantity = last.quantity;
        if last.limit_price.is_some() {
            order.limit_price = last.limit_price;
        }
        info!(order_id, quantity = last.quantity, "order replaced");
        if order.fill_quantity >= order.quantity {
            self.make_filled(order_id, bartime);
        } else {
            self.open_orders.get_mut(&order_id).expect("open order").state = OrderState::Live;
        }
    }

    /// Run one matching pass over the book against the current bar.
    ///
    /// Pending cancels and replaces resolve first, queued orders from
    /// earlier bars go live, and live orders are matched in arrival order.
    /// A symbol without bar data this bartime is skipped.
    pub fn process_orders(&mut self, market_data: &MarketDataManager) -> Result<()> {
        let Some(bartime) = market_data.bartime() else {
            return Ok(());
        };
        info!(%bartime, "processing orders");

        // remaining fill budget per (product_type, symbol) for this bar
        let mut budgets: HashMap<(String, String), u64> = HashMap::new();

        let order_ids: Vec<u64> = self.open_orders.keys().copied().collect();
        for order_id in order_ids {
            let (state, received_pass) = {
                let order = &self.open_orders[&order_id];
                (order.state, order.received_pass)
            };

            match state {
                OrderState::CancelSent => {
                    self.make_canceled(order_id, bartime);
                    continue;
                }
                OrderState::ReplaceSent => {
                    self.apply_replace(order_id, bartime);
                    if !self.open_orders.contains_key(&order_id) {
                        continue;
                    }
                }
                OrderState::Sent => {
                    if received_pass >= self.completed_passes {
                        continue; // arrived during this bar, eligible next tick
                    }
                    self.open_orders.get_mut(&order_id).expect("open order").state =
                        OrderState::Live;
                }
                _ => {}
            }

            let (product_type, symbol, side, order_type, limit_price, remaining) = {
                let order = &self.open_orders[&order_id];
                if !matches!(order.state, OrderState::Live | OrderState::PartiallyFilled) {
                    continue;
                }
                (
                    order.product_type.clone(),
                    order.symbol.clone(),
                    order.buy_sell,
                    order.order_type,
                    order.limit_price,
                    order.remaining_quantity(),
                )
            };

            let Some(bar) = market_data.current_bar(&product_type, &symbol) else {
                warn!(%product_type, %symbol, %bartime, "no bar data, order skipped");
                continue;
            };

            let budget = budgets
                .entry((product_type.clone(), symbol.clone()))
                .or_insert_with(|| (bar.volume * self.params.fill_multiplier).floor() as u64);
            if *budget == 0 {
                continue;
            }

            let fill_price = match order_type {
                OrderType::Limit => {
                    let limit = limit_price.expect("limit order has price");
                    match side {
                        Side::Buy if bar.low <= limit => Some(limit.min(bar.open)),
                        Side::Sell if bar.high >= limit => Some(limit.max(bar.open)),
                        _ => None,
                    }
                }
                OrderType::Market => Some(bar.open),
            };

            if let Some(price) = fill_price {
                let quantity = remaining.min(*budget);
                if quantity > 0 {
                    *budget -= quantity;
                    self.apply_fill(order_id, quantity, price, bartime);
                }
            }
        }

        self.completed_passes += 1;
        Ok(())
    }

    /// End-of-day sweep: cancel every outstanding order
    pub fn market_close(&mut self, bartime: BarTime) {
        info!("canceling outstanding orders at market close");
        let order_ids: Vec<u64> = self.open_orders.keys().copied().collect();
        for order_id in order_ids {
            self.make_canceled(order_id, bartime);
        }
    }

    /// Test hook: force a fill outside the matching pass. Not called from
    /// the pipeline.
    pub fn fill_order(&mut self, order_id: u64, quantity: u64, bartime: BarTime) -> Result<()> {
        let order = self
            .open_orders
            .get_mut(&order_id)
            .ok_or_else(|| EngineError::InvalidOrder(format!("unknown exchange order {order_id}")))?;
        if order.state == OrderState::Sent {
            order.state = OrderState::Live;
        }
        let price = order.limit_price.ok_or_else(|| {
            EngineError::InvalidOrder("fill_order requires a priced order".to_string())
        })?;
        self.apply_fill(order_id, quantity, price, bartime);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;
    use chrono::TimeZone;

    fn ts(minute: u32) -> BarTime {
        Utc.with_ymd_and_hms(2024, 1, 2, 9, 30 + minute, 0).unwrap()
    }

    fn mdm_with_bar(minute: u32, bar: Bar) -> MarketDataManager {
        let mut mdm = MarketDataManager::new("1min");
        mdm.insert_bar("stock", "TEST", "1min", ts(minute), bar);
        mdm.set_bartime(ts(minute));
        mdm
    }

    fn exchange() -> PaperExchange {
        PaperExchange::new(ExchangeParams::default()).unwrap()
    }

    fn limit(ex: &mut PaperExchange, side: Side, quantity: u64, price: f64) -> u64 {
        ex.receive_order("stock", "TEST", side, quantity, OrderType::Limit, Some(price))
    }

    #[test]
    fn test_order_queued_until_next_pass() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Buy, 100, 10.0);
        let mdm = mdm_with_bar(0, Bar::new_unchecked(9.9, 10.1, 9.8, 10.0, 1000.0));
        // first pass: arrived this bar, stays queued
        ex.process_orders(&mdm).unwrap();
        assert_eq!(ex.get_order(id).unwrap().state, OrderState::Sent);
        // second pass: live and marketable
        let mdm = mdm_with_bar(1, Bar::new_unchecked(9.9, 10.1, 9.8, 10.0, 1000.0));
        ex.process_orders(&mdm).unwrap();
        assert_eq!(ex.get_order(id).unwrap().state, OrderState::Filled);
    }

    #[test]
    fn test_limit_buy_fill_price_is_min_of_limit_and_open() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Buy, 100, 10.0);
        ex.process_orders(&mdm_with_bar(0, Bar::new_unchecked(9.9, 10.1, 9.8, 10.0, 1000.0)))
            .unwrap();
        ex.process_orders(&mdm_with_bar(1, Bar::new_unchecked(9.9, 10.1, 9.8, 10.0, 1000.0)))
            .unwrap();
        let order = ex.get_order(id).unwrap();
        assert_eq!(order.fill_quantity, 100);
        assert_eq!(order.fill_price, Some(9.9));
        assert!(order.close_bar_timestamp.is_some());
    }

    #[test]
    fn test_limit_buy_not_marketable() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Buy, 100, 10.0);
        let bar = Bar::new_unchecked(10.4, 10.5, 10.2, 10.3, 1000.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        let order = ex.get_order(id).unwrap();
        assert_eq!(order.state, OrderState::Live);
        assert!(order.fills.is_empty());
    }

    #[test]
    fn test_limit_sell_fill_price_is_max_of_limit_and_open() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Sell, 100, 10.0);
        let bar = Bar::new_unchecked(10.2, 10.4, 9.9, 10.1, 1000.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        let order = ex.get_order(id).unwrap();
        assert_eq!(order.fill_price, Some(10.2));
    }

    #[test]
    fn test_market_order_fills_at_open() {
        let mut ex = exchange();
        let id = ex.receive_order("stock", "TEST", Side::Buy, 100, OrderType::Market, None);
        let bar = Bar::new_unchecked(10.2, 10.4, 9.9, 10.1, 1000.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        let order = ex.get_order(id).unwrap();
        assert_eq!(order.fill_price, Some(10.2));
        assert_eq!(order.state, OrderState::Filled);
    }

    #[test]
    fn test_volume_cap_partial_fill() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Sell, 100, 10.0);
        // budget = floor(120 * 0.5) = 60
        let bar = Bar::new_unchecked(10.1, 10.2, 9.9, 10.0, 120.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        let order = ex.get_order(id).unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.fill_quantity, 60);
        assert_eq!(order.remaining_quantity(), 40);
    }

    #[test]
    fn test_volume_budget_consumed_fifo() {
        let mut ex = exchange();
        let first = limit(&mut ex, Side::Buy, 80, 10.0);
        let second = limit(&mut ex, Side::Buy, 80, 10.0);
        // budget = floor(200 * 0.5) = 100: first gets 80, second gets 20
        let bar = Bar::new_unchecked(9.9, 10.1, 9.8, 10.0, 200.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        assert_eq!(ex.get_order(first).unwrap().fill_quantity, 80);
        assert_eq!(ex.get_order(second).unwrap().fill_quantity, 20);
        assert_eq!(
            ex.get_order(second).unwrap().state,
            OrderState::PartiallyFilled
        );
    }

    #[test]
    fn test_cancel_resolves_before_matching() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Buy, 100, 10.0);
        let bar = Bar::new_unchecked(9.9, 10.1, 9.8, 10.0, 1000.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.receive_cancel(id);
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        let order = ex.get_order(id).unwrap();
        assert_eq!(order.state, OrderState::Canceled);
        assert!(order.fills.is_empty());
    }

    #[test]
    fn test_replace_shrink_below_fills_completes() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Sell, 100, 10.0);
        // fills 60 of 100
        let bar = Bar::new_unchecked(10.1, 10.2, 9.9, 10.0, 120.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        assert_eq!(ex.get_order(id).unwrap().fill_quantity, 60);
        // shrink to 50 <= 60 filled: order completes
        ex.receive_replace(id, 50, None);
        ex.process_orders(&mdm_with_bar(2, Bar::new_unchecked(10.5, 10.6, 10.4, 10.5, 120.0)))
            .unwrap();
        assert_eq!(ex.get_order(id).unwrap().state, OrderState::Filled);
    }

    #[test]
    fn test_replace_updates_price_and_stays_live() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Buy, 100, 9.0);
        let away = Bar::new_unchecked(10.4, 10.5, 10.2, 10.3, 1000.0);
        ex.process_orders(&mdm_with_bar(0, away)).unwrap();
        ex.process_orders(&mdm_with_bar(1, away)).unwrap();
        ex.receive_replace(id, 100, Some(8.5));
        ex.process_orders(&mdm_with_bar(2, away)).unwrap();
        let order = ex.get_order(id).unwrap();
        assert_eq!(order.state, OrderState::Live);
        assert_eq!(order.limit_price, Some(8.5));
        assert_eq!(order.replaces.len(), 2);
    }

    #[test]
    fn test_market_close_sweep() {
        let mut ex = exchange();
        let a = limit(&mut ex, Side::Buy, 100, 9.0);
        let b = limit(&mut ex, Side::Sell, 50, 12.0);
        ex.market_close(ts(5));
        assert_eq!(ex.get_order(a).unwrap().state, OrderState::Canceled);
        assert_eq!(ex.get_order(b).unwrap().state, OrderState::Canceled);
        assert_eq!(ex.open_orders().count(), 0);
    }

    #[test]
    fn test_missing_bar_skips_order() {
        let mut ex = exchange();
        let id = limit(&mut ex, Side::Buy, 100, 10.0);
        let mut mdm = MarketDataManager::new("1min");
        mdm.set_bartime(ts(0));
        ex.process_orders(&mdm).unwrap();
        mdm.set_bartime(ts(1));
        ex.process_orders(&mdm).unwrap();
        // goes live but cannot match without data
        assert_eq!(ex.get_order(id).unwrap().state, OrderState::Live);
    }

    #[test]
    fn test_fill_ids_monotonic() {
        let mut ex = exchange();
        let a = limit(&mut ex, Side::Buy, 10, 10.0);
        let b = limit(&mut ex, Side::Buy, 10, 10.0);
        let bar = Bar::new_unchecked(9.9, 10.1, 9.8, 10.0, 1000.0);
        ex.process_orders(&mdm_with_bar(0, bar)).unwrap();
        ex.process_orders(&mdm_with_bar(1, bar)).unwrap();
        let fa = ex.get_order(a).unwrap().fills[0].fill_id;
        let fb = ex.get_order(b).unwrap().fills[0].fill_id;
        assert!(fb > fa);
    }
}
