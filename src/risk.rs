//! Risk gatekeeper
//!
//! Sits between the Portfolio's staged orders and the Broker. Each rule is
//! a pure predicate over the order and a read-only snapshot of the system;
//! evaluation stops at the first reject. Rejection is a normal outcome,
//! recorded on the order, never raised.

use crate::error::Result;
use crate::order::{Order, OrderState};
use crate::order_manager::{OrderFilter, OrderManager};
use crate::position_manager::PositionManager;
use tracing::info;
use uuid::Uuid;

/// Read-only snapshot handed to risk rules
pub struct RiskContext<'a> {
    pub oms: &'a OrderManager,
    pub positions: &'a PositionManager,
}

/// A single risk check: Ok to accept, Err with a reason to reject
pub trait RiskRule {
    fn name(&self) -> &str;
    fn check(&self, order: &Order, ctx: &RiskContext) -> std::result::Result<(), String>;
}

/// Reject orders whose product market is closed
pub struct MarketOpenRule;

impl RiskRule for MarketOpenRule {
    fn name(&self) -> &str {
        "market_open"
    }

    fn check(&self, order: &Order, ctx: &RiskContext) -> std::result::Result<(), String> {
        if ctx.oms.market_state(&order.product_type) {
            Ok(())
        } else {
            Err(format!(
                "market for product_type {} is closed",
                order.product_type
            ))
        }
    }
}

/// Reject orders above a maximum quantity
pub struct MaxQuantityRule {
    pub max_quantity: u64,
}

impl RiskRule for MaxQuantityRule {
    fn name(&self) -> &str {
        "max_quantity"
    }

    fn check(&self, order: &Order, _ctx: &RiskContext) -> std::result::Result<(), String> {
        if order.quantity() <= self.max_quantity {
            Ok(())
        } else {
            Err(format!(
                "quantity {} exceeds maximum {}",
                order.quantity(),
                self.max_quantity
            ))
        }
    }
}

/// Reject limit orders whose notional (quantity times limit price) exceeds
/// a maximum
pub struct MaxNotionalRule {
    pub max_notional: f64,
}

impl RiskRule for MaxNotionalRule {
    fn name(&self) -> &str {
        "max_notional"
    }

    fn check(&self, order: &Order, _ctx: &RiskContext) -> std::result::Result<(), String> {
        let Some(price) = order.limit_price() else {
            return Ok(());
        };
        let notional = order.quantity() as f64 * price;
        if notional <= self.max_notional {
            Ok(())
        } else {
            Err(format!(
                "notional {notional:.2} exceeds maximum {:.2}",
                self.max_notional
            ))
        }
    }
}

/// Risk engine holding the rule set
pub struct Risk {
    rules: Vec<Box<dyn RiskRule>>,
}

impl Default for Risk {
    fn default() -> Self {
        Self {
            rules: vec![Box::new(MarketOpenRule)],
        }
    }
}

impl Risk {
    pub fn new(rules: Vec<Box<dyn RiskRule>>) -> Self {
        Self { rules }
    }

    pub fn add_rule(&mut self, rule: Box<dyn RiskRule>) {
        self.rules.push(rule);
    }

    /// Evaluate the rule set against one order. Returns the first reject
    /// reason, if any.
    fn evaluate(&self, order: &Order, ctx: &RiskContext) -> Option<String> {
        for rule in &self.rules {
            if let Err(reason) = rule.check(order, ctx) {
                return Some(format!("{}: {reason}", rule.name()));
            }
        }
        None
    }

    /// Process every STAGED order of a portfolio: full pass transitions to
    /// RISK_ACCEPTED, any reject transitions to RISK_REJECTED with the
    /// reason recorded on the order.
    pub fn process_portfolio_orders(
        &self,
        oms: &mut OrderManager,
        positions: &PositionManager,
        portfolio_id: &str,
    ) -> Result<()> {
        info!(portfolio_id, "processing staged orders");
        let staged: Vec<Uuid> = oms
            .orders_list(
                &OrderFilter::new()
                    .state(OrderState::Staged)
                    .portfolio_id(portfolio_id),
            )
            .iter()
            .map(|o| o.uuid())
            .collect();

        for uuid in staged {
            let verdict = {
                let order = oms.order(uuid).expect("staged order");
                let ctx = RiskContext { oms, positions };
                self.evaluate(order, &ctx)
            };
            match verdict {
                None => oms.change_state(uuid, OrderState::RiskAccepted)?,
                Some(reason) => {
                    info!(%uuid, reason = %reason, "order risk rejected");
                    oms.order_mut(uuid)?.reject_reason = Some(reason);
                    oms.change_state(uuid, OrderState::RiskRejected)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderType;
    use crate::portfolio::Portfolio;

    fn staged_order(
        oms: &mut OrderManager,
        portfolio: &Portfolio,
        quantity: u64,
        price: f64,
    ) -> Uuid {
        let order = Order::new(
            Uuid::new_v4(),
            "strategy.test",
            Uuid::new_v4(),
            "test",
            "stock",
            "TEST",
            "b",
            quantity,
            OrderType::Limit,
            Some(price),
        )
        .unwrap();
        let uuid = oms.new_order(order).unwrap();
        oms.assign_portfolio(uuid, portfolio).unwrap();
        oms.change_state(uuid, OrderState::Staged).unwrap();
        uuid
    }

    #[test]
    fn test_accept_when_market_open() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let portfolio = Portfolio::new("test_port");
        let uuid = staged_order(&mut oms, &portfolio, 100, 10.0);

        Risk::default()
            .process_portfolio_orders(&mut oms, &positions, portfolio.id())
            .unwrap();
        assert_eq!(oms.order(uuid).unwrap().state(), OrderState::RiskAccepted);
    }

    #[test]
    fn test_reject_when_market_closed() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", false);
        let positions = PositionManager::new("unit_test");
        let portfolio = Portfolio::new("test_port");
        let uuid = staged_order(&mut oms, &portfolio, 100, 10.0);

        Risk::default()
            .process_portfolio_orders(&mut oms, &positions, portfolio.id())
            .unwrap();
        let order = oms.order(uuid).unwrap();
        assert_eq!(order.state(), OrderState::RiskRejected);
        assert!(order.closed());
        assert!(order.reject_reason.as_ref().unwrap().contains("closed"));
    }

    #[test]
    fn test_first_reject_wins() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", false);
        let positions = PositionManager::new("unit_test");
        let portfolio = Portfolio::new("test_port");
        let uuid = staged_order(&mut oms, &portfolio, 1000, 10.0);

        let risk = Risk::new(vec![
            Box::new(MarketOpenRule),
            Box::new(MaxQuantityRule { max_quantity: 100 }),
        ]);
        risk.process_portfolio_orders(&mut oms, &positions, portfolio.id())
            .unwrap();
        let reason = oms.order(uuid).unwrap().reject_reason.clone().unwrap();
        assert!(reason.starts_with("market_open:"));
    }

    #[test]
    fn test_max_quantity_rule() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let portfolio = Portfolio::new("test_port");
        let small = staged_order(&mut oms, &portfolio, 100, 10.0);
        let large = staged_order(&mut oms, &portfolio, 101, 10.0);

        let risk = Risk::new(vec![
            Box::new(MarketOpenRule),
            Box::new(MaxQuantityRule { max_quantity: 100 }),
        ]);
        risk.process_portfolio_orders(&mut oms, &positions, portfolio.id())
            .unwrap();
        assert_eq!(oms.order(small).unwrap().state(), OrderState::RiskAccepted);
        assert_eq!(oms.order(large).unwrap().state(), OrderState::RiskRejected);
    }

    #[test]
    fn test_max_notional_rule() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let portfolio = Portfolio::new("test_port");
        let uuid = staged_order(&mut oms, &portfolio, 100, 200.0);

        let risk = Risk::new(vec![Box::new(MaxNotionalRule {
            max_notional: 10_000.0,
        })]);
        risk.process_portfolio_orders(&mut oms, &positions, portfolio.id())
            .unwrap();
        let order = oms.order(uuid).unwrap();
        assert_eq!(order.state(), OrderState::RiskRejected);
        assert!(order.reject_reason.as_ref().unwrap().contains("notional"));
    }

    #[test]
    fn test_only_this_portfolios_orders_processed() {
        let mut oms = OrderManager::new("unit_test");
        oms.set_market_state("stock", true);
        let positions = PositionManager::new("unit_test");
        let mine = Portfolio::new("mine");
        let other = Portfolio::new("other");
        let mine_uuid = staged_order(&mut oms, &mine, 100, 10.0);
        let other_uuid = staged_order(&mut oms, &other, 100, 10.0);

        Risk::default()
            .process_portfolio_orders(&mut oms, &positions, mine.id())
            .unwrap();
        assert_eq!(oms.order(mine_uuid).unwrap().state(), OrderState::RiskAccepted);
        assert_eq!(oms.order(other_uuid).unwrap().state(), OrderState::Staged);
    }
}
