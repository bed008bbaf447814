//! Portfolio
//!
//! Aggregates one or more strategies, pulls their CREATED orders, converts
//! pending intents into delta orders, optionally crosses exactly opposing
//! staged orders off-book, and stages everything else for Risk.

use crate::error::Result;
use crate::market_data::MarketDataManager;
use crate::order::{Order, OrderState, OrderType};
use crate::order_manager::{OrderFilter, OrderManager};
use crate::position_manager::PositionManager;
use crate::types::BarTime;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Intent key: (strategy_id, product_type, symbol)
type IntentKey = (String, String, String);

/// Portfolio: strategy binding, intent table and staging
pub struct Portfolio {
    uuid: Uuid,
    id: String,
    strategies: Vec<(String, Uuid)>,
    intents: BTreeMap<IntentKey, i64>,
    /// Enable off-book crossing of exactly opposing staged orders
    pub crossing: bool,
    /// Offset subtracted from the last close when pricing intent orders
    pub intent_price_offset: f64,
    next_cross_fill_id: u64,
}

impl Portfolio {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        info!(id = %id, "Portfolio initialized");
        Self {
            uuid: Uuid::new_v4(),
            id,
            strategies: Vec::new(),
            intents: BTreeMap::new(),
            crossing: false,
            intent_price_offset: 0.0,
            next_cross_fill_id: 1,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bind a strategy to this portfolio
    pub fn add_strategy(&mut self, strategy_id: impl Into<String>, strategy_uuid: Uuid) {
        self.strategies.push((strategy_id.into(), strategy_uuid));
    }

    /// Strategy ids bound to this portfolio, in registration order
    pub fn strategy_ids(&self) -> Vec<&str> {
        self.strategies.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn has_strategy(&self, strategy_id: &str) -> bool {
        self.strategies.iter().any(|(id, _)| id == strategy_id)
    }

    /// Set the intent for (strategy_id, product_type, symbol). A new intent
    /// for the same key replaces the previous one.
    pub fn set_intent(&mut self, strategy_id: &str, product_type: &str, symbol: &str, target: i64) {
        info!(strategy_id, product_type, symbol, target, "setting intent");
        self.intents.insert(
            (
                strategy_id.to_string(),
                product_type.to_string(),
                symbol.to_string(),
            ),
            target,
        );
    }

    /// The pending intent target for a key, if any
    pub fn get_intent(&self, strategy_id: &str, product_type: &str, symbol: &str) -> Option<i64> {
        self.intents
            .get(&(
                strategy_id.to_string(),
                product_type.to_string(),
                symbol.to_string(),
            ))
            .copied()
    }

    /// Stage strategy orders, materialize intents, and cross. Invoked once
    /// per bar by the event processor.
    pub fn process_orders(
        &mut self,
        oms: &mut OrderManager,
        positions: &PositionManager,
        market_data: &MarketDataManager,
        bartime: BarTime,
    ) -> Result<()> {
        self.stage_strategy_orders(oms)?;
        self.process_intents(oms, positions, market_data)?;
        if self.crossing {
            self.cross_orders(oms, bartime)?;
        }
        Ok(())
    }

    /// Pull every CREATED order authored by a bound strategy, tag it with
    /// this portfolio and transition it to STAGED
    fn stage_strategy_orders(&self, oms: &mut OrderManager) -> Result<()> {
        for (strategy_id, strategy_uuid) in &self.strategies {
            info!(strategy_id, "staging strategy orders");
            let created: Vec<Uuid> = oms
                .orders_list(
                    &OrderFilter::new()
                        .state(OrderState::Created)
                        .strategy_uuid(*strategy_uuid),
                )
                .iter()
                .map(|o| o.uuid())
                .collect();
            for uuid in created {
                oms.assign_portfolio(uuid, self)?;
                oms.change_state(uuid, OrderState::Staged)?;
            }
        }
        Ok(())
    }

    /// Convert each pending intent into a LIMIT delta order originated by
    /// this portfolio. An intent with no trade to do is discarded; one
    /// whose symbol has no price yet is kept for the next bar.
    fn process_intents(
        &mut self,
        oms: &mut OrderManager,
        positions: &PositionManager,
        market_data: &MarketDataManager,
    ) -> Result<()> {
        info!("processing intents");
        let pending: Vec<(IntentKey, i64)> = self
            .intents
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        for ((strategy_id, product_type, symbol), target) in pending {
            let actual = positions.current_position(&strategy_id, &product_type, &symbol);
            let delta = target - actual;
            if delta == 0 {
                self.intents
                    .remove(&(strategy_id.clone(), product_type.clone(), symbol.clone()));
                continue;
            }

            let Some(last_close) = market_data.current_price(&product_type, &symbol) else {
                warn!(%product_type, %symbol, "no price for intent, retrying next bar");
                continue;
            };
            let price = last_close - self.intent_price_offset;
            let buy_sell = if delta > 0 { "buy" } else { "sell" };
            let strategy_uuid = self
                .strategies
                .iter()
                .find(|(id, _)| *id == strategy_id)
                .map(|(_, uuid)| *uuid)
                .unwrap_or(self.uuid);

            info!(
                %symbol,
                buy_sell,
                quantity = delta.unsigned_abs(),
                price,
                "creating order from intent"
            );
            let order = Order::new(
                self.uuid,
                format!("portfolio.{}", self.id),
                strategy_uuid,
                strategy_id.clone(),
                product_type.clone(),
                symbol.clone(),
                buy_sell,
                delta.unsigned_abs(),
                OrderType::Limit,
                Some(price),
            )?;
            let uuid = oms.new_order(order)?;
            oms.assign_portfolio(uuid, self)?;
            oms.change_state(uuid, OrderState::Staged)?;
            self.intents
                .remove(&(strategy_id, product_type, symbol));
        }
        Ok(())
    }

    /// Cross exactly opposing staged pairs off-book: same (product_type,
    /// symbol), same quantity, opposite sides, and limits marketable
    /// against each other. Both legs fill synthetically at the midpoint
    /// and close without passing Risk.
    fn cross_orders(&mut self, oms: &mut OrderManager, bartime: BarTime) -> Result<()> {
        let staged: Vec<(Uuid, String, String, crate::types::Side, u64, Option<f64>)> = oms
            .orders_list(
                &OrderFilter::new()
                    .state(OrderState::Staged)
                    .portfolio_id(self.id.clone()),
            )
            .iter()
            .map(|o| {
                (
                    o.uuid(),
                    o.product_type.clone(),
                    o.symbol.clone(),
                    o.buy_sell,
                    o.quantity(),
                    o.limit_price(),
                )
            })
            .collect();

        let mut crossed: Vec<Uuid> = Vec::new();
        for (i, buy) in staged.iter().enumerate() {
            if buy.3 != crate::types::Side::Buy || crossed.contains(&buy.0) {
                continue;
            }
            // crossing advances beyond STAGED; with the product's market
            // closed the pair stays staged for Risk to reject
            if !oms.market_state(&buy.1) {
                continue;
            }
            let Some(buy_limit) = buy.5 else { continue };
            for sell in staged.iter().skip(i + 1) {
                if sell.3 != crate::types::Side::Sell
                    || crossed.contains(&sell.0)
                    || sell.1 != buy.1
                    || sell.2 != buy.2
                    || sell.4 != buy.4
                {
                    continue;
                }
                let Some(sell_limit) = sell.5 else { continue };
                if buy_limit < sell_limit {
                    continue;
                }

                let price = (buy_limit + sell_limit) / 2.0;
                info!(
                    symbol = %buy.2,
                    quantity = buy.4,
                    price,
                    "crossing staged orders off-book"
                );
                for uuid in [buy.0, sell.0] {
                    let fill_id = self.next_cross_fill_id;
                    self.next_cross_fill_id += 1;
                    oms.order_mut(uuid)?
                        .add_fill(fill_id, Utc::now(), bartime, buy.4, price, 0.0);
                    oms.set_booked(uuid, false)?;
                    oms.change_state(uuid, OrderState::Filled)?;
                }
                crossed.push(buy.0);
                crossed.push(sell.0);
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bar, Side};
    use chrono::TimeZone;

    fn ts(minute: u32) -> BarTime {
        Utc.with_ymd_and_hms(2024, 1, 2, 9, 30 + minute, 0).unwrap()
    }

    fn mdm_with_close(close: f64) -> MarketDataManager {
        let mut mdm = MarketDataManager::new("1min");
        mdm.insert_bar(
            "stock",
            "TEST",
            "1min",
            ts(0),
            Bar::new_unchecked(close, close + 0.1, close - 0.1, close, 1000.0),
        );
        mdm.set_bartime(ts(0));
        mdm
    }

    fn strategy_order(
        oms: &mut OrderManager,
        strategy_uuid: Uuid,
        side: &str,
        quantity: u64,
        price: f64,
    ) -> Uuid {
        let order = Order::new(
            strategy_uuid,
            "strategy.s1",
            strategy_uuid,
            "s1",
            "stock",
            "TEST",
            side,
            quantity,
            OrderType::Limit,
            Some(price),
        )
        .unwrap();
        oms.new_order(order).unwrap()
    }

    #[test]
    fn test_strategy_orders_staged_and_tagged() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let mdm = mdm_with_close(10.0);

        let strategy_uuid = Uuid::new_v4();
        let mut portfolio = Portfolio::new("port1");
        portfolio.add_strategy("s1", strategy_uuid);
        let uuid = strategy_order(&mut oms, strategy_uuid, "b", 100, 10.0);

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();

        let order = oms.order(uuid).unwrap();
        assert_eq!(order.state(), OrderState::Staged);
        assert_eq!(order.portfolio_id.as_deref(), Some("port1"));
        assert_eq!(order.portfolio_uuid, Some(portfolio.uuid()));
        // no CREATED orders remain
        assert!(oms
            .orders_list(&OrderFilter::new().state(OrderState::Created))
            .is_empty());
    }

    #[test]
    fn test_intent_materializes_delta_order() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let mdm = mdm_with_close(10.0);

        let mut portfolio = Portfolio::new("port1");
        portfolio.add_strategy("s1", Uuid::new_v4());
        portfolio.set_intent("s1", "stock", "TEST", 50);

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();

        let staged = oms.orders_list(&OrderFilter::new().state(OrderState::Staged));
        assert_eq!(staged.len(), 1);
        let order = staged[0];
        assert_eq!(order.buy_sell, Side::Buy);
        assert_eq!(order.quantity(), 50);
        assert_eq!(order.originator_id, "portfolio.port1");
        assert_eq!(order.strategy_id, "s1");
        assert_eq!(order.limit_price(), Some(10.0));
        // intent is single-shot
        assert_eq!(portfolio.get_intent("s1", "stock", "TEST"), None);
    }

    #[test]
    fn test_intent_nets_against_position() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let mut positions = PositionManager::new("unit_test");
        positions.enter_trade("orig", "s1", ts(0), "stock", "TEST", Side::Buy, 80, 10.0, 0.0);
        let mdm = mdm_with_close(10.0);

        let mut portfolio = Portfolio::new("port1");
        portfolio.add_strategy("s1", Uuid::new_v4());
        portfolio.set_intent("s1", "stock", "TEST", 50);

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();

        let staged = oms.orders_list(&OrderFilter::new().state(OrderState::Staged));
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].buy_sell, Side::Sell);
        assert_eq!(staged[0].quantity(), 30);
    }

    #[test]
    fn test_intent_at_target_discarded() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let mut positions = PositionManager::new("unit_test");
        positions.enter_trade("orig", "s1", ts(0), "stock", "TEST", Side::Buy, 50, 10.0, 0.0);
        let mdm = mdm_with_close(10.0);

        let mut portfolio = Portfolio::new("port1");
        portfolio.add_strategy("s1", Uuid::new_v4());
        portfolio.set_intent("s1", "stock", "TEST", 50);

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();
        assert!(oms
            .orders_list(&OrderFilter::new().state(OrderState::Staged))
            .is_empty());
        assert_eq!(portfolio.get_intent("s1", "stock", "TEST"), None);
    }

    #[test]
    fn test_intent_replaces_previous() {
        let mut portfolio = Portfolio::new("port1");
        portfolio.set_intent("s1", "stock", "TEST", 50);
        portfolio.set_intent("s1", "stock", "TEST", -20);
        assert_eq!(portfolio.get_intent("s1", "stock", "TEST"), Some(-20));
    }

    #[test]
    fn test_intent_without_price_retries() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let mut mdm = MarketDataManager::new("1min");
        mdm.set_bartime(ts(0));

        let mut portfolio = Portfolio::new("port1");
        portfolio.add_strategy("s1", Uuid::new_v4());
        portfolio.set_intent("s1", "stock", "TEST", 50);

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();
        assert!(oms
            .orders_list(&OrderFilter::new().state(OrderState::Staged))
            .is_empty());
        assert_eq!(portfolio.get_intent("s1", "stock", "TEST"), Some(50));
    }

    #[test]
    fn test_crossing_exact_pair() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let mdm = mdm_with_close(10.0);

        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let mut portfolio = Portfolio::new("port1");
        portfolio.crossing = true;
        portfolio.add_strategy("s1", s1);
        portfolio.add_strategy("s2", s2);

        let buy = strategy_order(&mut oms, s1, "b", 100, 10.2);
        let sell = {
            let order = Order::new(
                s2,
                "strategy.s2",
                s2,
                "s2",
                "stock",
                "TEST",
                "s",
                100,
                OrderType::Limit,
                Some(10.0),
            )
            .unwrap();
            oms.new_order(order).unwrap()
        };

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();

        for uuid in [buy, sell] {
            let order = oms.order(uuid).unwrap();
            assert_eq!(order.state(), OrderState::Filled);
            assert_eq!(order.fill_quantity(), 100);
            assert!((order.fill_price().unwrap() - 10.1).abs() < 1e-9);
            assert_eq!(order.booked(), Some(false));
        }
    }

    #[test]
    fn test_no_cross_when_market_closed() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", false);
        let positions = PositionManager::new("unit_test");
        let mdm = mdm_with_close(10.0);

        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let mut portfolio = Portfolio::new("port1");
        portfolio.crossing = true;
        portfolio.add_strategy("s1", s1);
        portfolio.add_strategy("s2", s2);

        let buy = strategy_order(&mut oms, s1, "b", 100, 10.2);
        let sell = {
            let order = Order::new(
                s2,
                "strategy.s2",
                s2,
                "s2",
                "stock",
                "TEST",
                "s",
                100,
                OrderType::Limit,
                Some(10.0),
            )
            .unwrap();
            oms.new_order(order).unwrap()
        };

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();

        // both legs stay staged for Risk, untouched by the cross
        for uuid in [buy, sell] {
            let order = oms.order(uuid).unwrap();
            assert_eq!(order.state(), OrderState::Staged);
            assert!(order.fills().is_empty());
            assert_eq!(order.booked(), None);
        }
    }

    #[test]
    fn test_no_cross_on_quantity_mismatch() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let mdm = mdm_with_close(10.0);

        let s1 = Uuid::new_v4();
        let mut portfolio = Portfolio::new("port1");
        portfolio.crossing = true;
        portfolio.add_strategy("s1", s1);

        strategy_order(&mut oms, s1, "b", 100, 10.2);
        let order = Order::new(
            s1,
            "strategy.s1",
            s1,
            "s1",
            "stock",
            "TEST",
            "s",
            60,
            OrderType::Limit,
            Some(10.0),
        )
        .unwrap();
        oms.new_order(order).unwrap();

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();
        // both remain staged for risk
        assert_eq!(
            oms.orders_list(&OrderFilter::new().state(OrderState::Staged))
                .len(),
            2
        );
    }

    #[test]
    fn test_no_cross_when_limits_not_marketable() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let mdm = mdm_with_close(10.0);

        let s1 = Uuid::new_v4();
        let mut portfolio = Portfolio::new("port1");
        portfolio.crossing = true;
        portfolio.add_strategy("s1", s1);

        strategy_order(&mut oms, s1, "b", 100, 9.8);
        let order = Order::new(
            s1,
            "strategy.s1",
            s1,
            "s1",
            "stock",
            "TEST",
            "s",
            100,
            OrderType::Limit,
            Some(10.0),
        )
        .unwrap();
        oms.new_order(order).unwrap();

        portfolio
            .process_orders(&mut oms, &positions, &mdm, ts(0))
            .unwrap();
        assert_eq!(
            oms.orders_list(&OrderFilter::new().state(OrderState::Staged))
                .len(),
            2
        );
    }
}
