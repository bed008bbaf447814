//! Per-bar event pipeline
//!
//! One `process_bar` call runs the fixed pipeline for a single bartime:
//! day-open hooks, market data update, strategy `on_bar`, portfolio and
//! risk processing, broker send, exchange matching, fill mirroring,
//! booking, fill/cancel callbacks, PnL, day-close hooks with persistence,
//! and the stuck-order check. Strategies run in registration order;
//! everything is single-threaded and runs to completion within the bar.

use crate::broker::PaperBroker;
use crate::error::{EngineError, Result};
use crate::exchange::PaperExchange;
use crate::market_data::MarketDataManager;
use crate::order::{Order, OrderState};
use crate::order_manager::{OrderFilter, OrderManager};
use crate::persistence::TradeStore;
use crate::portfolio::Portfolio;
use crate::position_manager::PositionManager;
use crate::risk::Risk;
use crate::strategy::{StrategyCtx, StrategyHandle};
use crate::types::BarTime;
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Position of a bar within its trading day, derived from the schedule
#[derive(Debug, Clone, Copy, Default)]
pub struct BarFlags {
    pub first_of_day: bool,
    pub last_of_day: bool,
}

const TRANSIENT_STATES: [OrderState; 4] = [
    OrderState::CancelRequested,
    OrderState::CancelSent,
    OrderState::ReplaceRequested,
    OrderState::ReplaceSent,
];

/// Single-bar orchestrator owning every engine component
pub struct EventProcessor {
    strategies: Vec<StrategyHandle>,
    portfolios: Vec<Portfolio>,
    risk: Risk,
    oms: OrderManager,
    positions: PositionManager,
    broker: PaperBroker,
    exchange: PaperExchange,
    market_data: MarketDataManager,
    /// Abort on the first pipeline error instead of finishing the bar
    pub strict: bool,
    deferred: Vec<EngineError>,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategies: Vec<StrategyHandle>,
        portfolios: Vec<Portfolio>,
        risk: Risk,
        oms: OrderManager,
        positions: PositionManager,
        broker: PaperBroker,
        exchange: PaperExchange,
        market_data: MarketDataManager,
    ) -> Result<Self> {
        for handle in &strategies {
            if !portfolios.iter().any(|p| p.id() == handle.portfolio_id) {
                return Err(EngineError::Config(format!(
                    "strategy {} references unknown portfolio {}",
                    handle.strategy_id, handle.portfolio_id
                )));
            }
        }
        info!(
            strategies = strategies.len(),
            portfolios = portfolios.len(),
            "EventProcessor initialized"
        );
        Ok(Self {
            strategies,
            portfolios,
            risk,
            oms,
            positions,
            broker,
            exchange,
            market_data,
            strict: false,
            deferred: Vec::new(),
        })
    }

    pub fn oms(&self) -> &OrderManager {
        &self.oms
    }

    pub fn oms_mut(&mut self) -> &mut OrderManager {
        &mut self.oms
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn market_data(&self) -> &MarketDataManager {
        &self.market_data
    }

    pub fn market_data_mut(&mut self) -> &mut MarketDataManager {
        &mut self.market_data
    }

    pub fn strategies(&self) -> &[StrategyHandle] {
        &self.strategies
    }

    /// Record a pipeline error: fatal immediately in strict mode, deferred
    /// to the end of the bar otherwise
    fn note(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if self.strict => Err(err),
            Err(err) => {
                error!(%err, "pipeline error, deferred to end of bar");
                self.deferred.push(err);
                Ok(())
            }
        }
    }

    /// Run one strategy callback behind the health gate. A callback error
    /// logs, disables the strategy until the next begin-of-day, and never
    /// propagates.
    fn invoke(
        &mut self,
        idx: usize,
        call: impl FnOnce(&mut Box<dyn crate::strategy::Strategy>, &mut StrategyCtx) -> anyhow::Result<()>,
    ) {
        if !self.strategies[idx].healthy {
            return;
        }
        let Some(port_idx) = self
            .portfolios
            .iter()
            .position(|p| p.id() == self.strategies[idx].portfolio_id)
        else {
            return;
        };

        let (strategy, meta) = self.strategies[idx].split();
        let mut ctx = StrategyCtx::new(
            meta,
            &mut self.oms,
            &mut self.portfolios[port_idx],
            &self.positions,
            &self.market_data,
        );
        let result = call(strategy, &mut ctx);
        if let Err(err) = result {
            let handle = &mut self.strategies[idx];
            error!(
                strategy_id = %handle.strategy_id,
                %err,
                "strategy callback failed, disabling until next day"
            );
            handle.healthy = false;
        }
    }

    /// Start every strategy (`on_start`), before the first bar
    pub fn start(&mut self) {
        info!("starting strategies");
        for idx in 0..self.strategies.len() {
            self.invoke(idx, |s, ctx| s.on_start(ctx));
            self.strategies[idx].mark_started();
        }
    }

    /// Run the full pipeline for one bar
    pub fn process_bar(
        &mut self,
        bartime: BarTime,
        flags: BarFlags,
        store: &mut dyn TradeStore,
    ) -> Result<()> {
        info!(%bartime, "processing bar");
        self.deferred.clear();
        let transient_at_start: Vec<Uuid> = self
            .oms
            .orders_list(&OrderFilter::new().states(TRANSIENT_STATES.to_vec()))
            .iter()
            .map(|o| o.uuid())
            .collect();

        self.market_data.set_bartime(bartime);

        // 1-2: day-open hooks
        if flags.first_of_day {
            self.begin_of_day(bartime);
            self.market_open(bartime);
        }

        // 3: market data update for all tracked products and frequencies
        let pairs: Vec<(String, String)> = self
            .market_data
            .tracked()
            .map(|s| (s.product_type.clone(), s.frequency.clone()))
            .collect();
        for (product_type, frequency) in pairs {
            if let Err(err) = self.market_data.update(&product_type, &frequency) {
                warn!(%product_type, %frequency, %err, "market data update failed, skipped");
            }
        }

        // 4: strategy on_bar
        for idx in 0..self.strategies.len() {
            self.invoke(idx, |s, ctx| s.on_bar(bartime, ctx));
        }

        // 5: portfolios stage orders and materialize intents
        for idx in 0..self.portfolios.len() {
            let result = self.portfolios[idx].process_orders(
                &mut self.oms,
                &self.positions,
                &self.market_data,
                bartime,
            );
            self.note(result)?;
        }

        // 6: risk gates staged orders
        for idx in 0..self.portfolios.len() {
            let portfolio_id = self.portfolios[idx].id().to_string();
            let result =
                self.risk
                    .process_portfolio_orders(&mut self.oms, &self.positions, &portfolio_id);
            self.note(result)?;
        }

        // 7: broker forwards cancels, replaces and accepted orders
        let result = self.broker.send_orders(&mut self.oms, &mut self.exchange);
        self.note(result)?;

        // 8: exchange matches against this bar
        let result = self.exchange.process_orders(&self.market_data);
        self.note(result)?;

        // 9: broker mirrors venue fills and state
        let result = self.broker.process_fills(&mut self.oms, &self.exchange);
        self.note(result)?;

        // 10: book fills into positions
        let booked = match self.positions.book_fills(&mut self.oms) {
            Ok(booked) => booked,
            Err(err) => {
                self.note(Err(err))?;
                BTreeMap::new()
            }
        };

        // 11: fill and cancel callbacks
        self.notify_fills(bartime, booked);
        self.notify_cancels(bartime);

        // 12: mark PnL
        self.positions.update_pnl(&self.market_data);

        // 13: day-close hooks and persistence
        if flags.last_of_day {
            self.market_close(bartime)?;
            self.end_of_day(bartime, store)?;
        }

        // 14: stuck-order check, then surface deferred errors
        self.check_stuck_orders(&transient_at_start)?;
        if let Some(err) = self.deferred.pop() {
            return Err(err);
        }
        Ok(())
    }

    fn begin_of_day(&mut self, bartime: BarTime) {
        info!("running BOD process");
        self.positions.begin_of_day();
        for handle in &mut self.strategies {
            if !handle.healthy {
                info!(strategy_id = %handle.strategy_id, "re-enabling strategy");
                handle.healthy = true;
            }
        }
        for idx in 0..self.strategies.len() {
            self.invoke(idx, |s, ctx| s.on_begin_of_day(bartime, ctx));
        }
    }

    fn market_open(&mut self, bartime: BarTime) {
        info!("running market open process");
        for product_type in self.market_data.product_types() {
            self.oms.set_market_state(product_type, true);
        }
        for idx in 0..self.strategies.len() {
            self.invoke(idx, |s, ctx| s.on_market_open(bartime, ctx));
        }
    }

    /// Market close: close the market, sweep-cancel everything left at the
    /// venue, mirror and book the results, then notify strategies
    fn market_close(&mut self, bartime: BarTime) -> Result<()> {
        info!("running market close process");
        for product_type in self.market_data.product_types() {
            self.oms.set_market_state(product_type, false);
        }
        self.exchange.market_close(bartime);
        let result = self.broker.process_fills(&mut self.oms, &self.exchange);
        self.note(result)?;
        let booked = match self.positions.book_fills(&mut self.oms) {
            Ok(booked) => booked,
            Err(err) => {
                self.note(Err(err))?;
                BTreeMap::new()
            }
        };
        self.notify_fills(bartime, booked);
        self.notify_cancels(bartime);
        for idx in 0..self.strategies.len() {
            self.invoke(idx, |s, ctx| s.on_market_close(bartime, ctx));
        }
        Ok(())
    }

    /// End of day: final PnL mark, strategy hooks, snapshot persistence.
    /// A persistence failure is retried once, then fatal.
    fn end_of_day(&mut self, bartime: BarTime, store: &mut dyn TradeStore) -> Result<()> {
        info!("running EOD process");
        self.positions.end_of_day(&self.market_data);
        for idx in 0..self.strategies.len() {
            self.invoke(idx, |s, ctx| s.on_end_of_day(bartime, ctx));
        }
        self.persist_snapshots(bartime, store)
    }

    fn persist_snapshots(&mut self, bartime: BarTime, store: &mut dyn TradeStore) -> Result<()> {
        let source = self.oms.id().to_string();
        let orders = self.oms.orders_table();
        let positions = self.positions.positions_table();

        let mut save = |store: &mut dyn TradeStore| -> Result<()> {
            store.save_orders(&source, bartime, &orders)?;
            store.save_positions(&source, bartime, &positions)
        };
        if let Err(err) = save(store) {
            warn!(%err, "snapshot persistence failed, retrying once");
            save(store).map_err(|err| EngineError::Persistence(format!("retry failed: {err}")))?;
        }
        Ok(())
    }

    /// Final stop processing after the last bar
    pub fn stop(&mut self, store: &mut dyn TradeStore) -> Result<()> {
        info!("running stop process");
        let bartime = self.market_data.bartime().unwrap_or_else(chrono::Utc::now);
        for idx in 0..self.strategies.len() {
            self.invoke(idx, |s, ctx| s.on_stop(bartime, ctx));
        }
        self.positions.update_pnl(&self.market_data);
        self.persist_snapshots(bartime, store)
    }

    fn notify_fills(&mut self, bartime: BarTime, booked: BTreeMap<String, Vec<Uuid>>) {
        for (originator_id, uuids) in booked {
            let Some(strategy_id) = originator_id.strip_prefix("strategy.") else {
                continue; // intent orders belong to the portfolio
            };
            let Some(idx) = self
                .strategies
                .iter()
                .position(|h| h.strategy_id == strategy_id)
            else {
                continue;
            };
            let orders: Vec<Order> = uuids
                .iter()
                .filter_map(|uuid| self.oms.order(*uuid).cloned())
                .collect();
            info!(strategy_id, count = orders.len(), "calling on_fills");
            self.invoke(idx, |s, ctx| s.on_fills(bartime, &orders, ctx));
        }
    }

    fn notify_cancels(&mut self, bartime: BarTime) {
        let canceled = self.oms.drain_cancel_notices();
        if canceled.is_empty() {
            return;
        }
        let mut by_strategy: BTreeMap<String, Vec<Order>> = BTreeMap::new();
        for uuid in canceled {
            let Some(order) = self.oms.order(uuid) else {
                continue;
            };
            if let Some(strategy_id) = order.originator_id.strip_prefix("strategy.") {
                by_strategy
                    .entry(strategy_id.to_string())
                    .or_default()
                    .push(order.clone());
            }
        }
        for (strategy_id, orders) in by_strategy {
            let Some(idx) = self
                .strategies
                .iter()
                .position(|h| h.strategy_id == strategy_id)
            else {
                continue;
            };
            info!(strategy_id = %strategy_id, count = orders.len(), "calling on_cancels");
            self.invoke(idx, |s, ctx| s.on_cancels(bartime, &orders, ctx));
        }
    }

    /// No order may end the bar waiting on the pipeline, and no order may
    /// survive a transient cancel/replace state across a full bar
    fn check_stuck_orders(&self, transient_at_start: &[Uuid]) -> Result<()> {
        info!("checking for stuck orders");
        let pre_send = self.oms.orders_list(&OrderFilter::new().states(vec![
            OrderState::Created,
            OrderState::Staged,
            OrderState::RiskAccepted,
        ]));
        if let Some(order) = pre_send.first() {
            return Err(EngineError::StuckOrder {
                uuid: order.uuid(),
                state: order.state(),
            });
        }
        for uuid in transient_at_start {
            if let Some(order) = self.oms.order(*uuid) {
                if TRANSIENT_STATES.contains(&order.state()) {
                    return Err(EngineError::StuckOrder {
                        uuid: *uuid,
                        state: order.state(),
                    });
                }
            }
        }
        Ok(())
    }
}
