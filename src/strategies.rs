//! Built-in example strategies
//!
//! Small concrete strategies used by the CLI and as working references for
//! strategy authors. Both are registered in the default registry.

use crate::order::OrderType;
use crate::runner::StrategyRegistry;
use crate::strategy::{Strategy, StrategyCtx};
use crate::types::BarTime;
use anyhow::Context;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

/// Register the built-in strategies under their class names
pub fn register_builtins(registry: &mut StrategyRegistry) {
    registry.register("passive_limit", |params| {
        Ok(Box::new(PassiveLimit::from_params(params)?))
    });
    registry.register("target_hold", |params| {
        Ok(Box::new(TargetHold::from_params(params)?))
    });
}

#[derive(Debug, Deserialize)]
struct PassiveLimitParams {
    product_type: String,
    symbol: String,
    quantity: u64,
    /// How far below the last price to rest the bid
    #[serde(default)]
    offset: f64,
}

/// Rests a single limit buy below the market and re-arms after each fill
pub struct PassiveLimit {
    params: PassiveLimitParams,
    working: Option<Uuid>,
}

impl PassiveLimit {
    pub fn from_params(params: &serde_json::Value) -> anyhow::Result<Self> {
        let params: PassiveLimitParams =
            serde_json::from_value(params.clone()).context("passive_limit parameters")?;
        Ok(Self {
            params,
            working: None,
        })
    }
}

impl Strategy for PassiveLimit {
    fn on_bar(&mut self, _bartime: BarTime, ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        if let Some(uuid) = self.working {
            if !ctx.get_order(uuid).map(|o| o.closed()).unwrap_or(true) {
                return Ok(());
            }
            self.working = None;
        }
        let Some(last) = ctx.current_price(&self.params.product_type, &self.params.symbol) else {
            return Ok(());
        };
        let price = last - self.params.offset;
        let uuid = ctx.order(
            &self.params.product_type,
            &self.params.symbol,
            "buy",
            self.params.quantity,
            OrderType::Limit,
            Some(price),
        )?;
        self.working = Some(uuid);
        Ok(())
    }

    fn on_fills(
        &mut self,
        bartime: BarTime,
        orders: &[crate::order::Order],
        _ctx: &mut StrategyCtx,
    ) -> anyhow::Result<()> {
        for order in orders {
            info!(
                %bartime,
                symbol = %order.symbol,
                quantity = order.fill_quantity(),
                price = ?order.fill_price(),
                "passive_limit filled"
            );
        }
        Ok(())
    }

    fn on_cancels(
        &mut self,
        _bartime: BarTime,
        orders: &[crate::order::Order],
        _ctx: &mut StrategyCtx,
    ) -> anyhow::Result<()> {
        if orders.iter().any(|o| Some(o.uuid()) == self.working) {
            self.working = None;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TargetHoldParams {
    product_type: String,
    symbol: String,
    target: i64,
}

/// Declares an absolute target position each morning and lets the
/// portfolio work the delta
pub struct TargetHold {
    params: TargetHoldParams,
    declared_today: bool,
}

impl TargetHold {
    pub fn from_params(params: &serde_json::Value) -> anyhow::Result<Self> {
        let params: TargetHoldParams =
            serde_json::from_value(params.clone()).context("target_hold parameters")?;
        Ok(Self {
            params,
            declared_today: false,
        })
    }
}

impl Strategy for TargetHold {
    fn on_begin_of_day(&mut self, _bartime: BarTime, _ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        self.declared_today = false;
        Ok(())
    }

    fn on_bar(&mut self, _bartime: BarTime, ctx: &mut StrategyCtx) -> anyhow::Result<()> {
        if self.declared_today {
            return Ok(());
        }
        let current = ctx.position(&self.params.product_type, &self.params.symbol);
        if current != self.params.target {
            ctx.intent(
                &self.params.product_type,
                &self.params.symbol,
                self.params.target,
            )?;
        }
        self.declared_today = true;
        Ok(())
    }
}
