//! Simulation runner
//!
//! The outer loop: builds the component set, generates the bar schedule
//! between two datetimes at a frequency, and drives the EventProcessor
//! across it, flagging day boundaries so the processor can run its
//! open/close hooks.

use crate::broker::{BrokerParams, PaperBroker};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::event_processor::{BarFlags, EventProcessor};
use crate::exchange::{ExchangeParams, PaperExchange};
use crate::market_data::{CsvDataFeed, MarketDataManager};
use crate::order_manager::OrderManager;
use crate::persistence::{JsonFileStore, TradeStore};
use crate::portfolio::Portfolio;
use crate::position_manager::PositionManager;
use crate::risk::{MaxNotionalRule, MaxQuantityRule, Risk};
use crate::strategy::{Strategy, StrategyHandle};
use crate::types::{BarTime, SymbolSpec};
use chrono::{Datelike, Duration, NaiveTime};
use std::collections::HashMap;
use tracing::info;

/// Constructor for a registered strategy class
pub type StrategyCtor = fn(&serde_json::Value) -> anyhow::Result<Box<dyn Strategy>>;

/// Registry mapping strategy class names to constructors; the Rust
/// analogue of the (class_name, module_name) enumeration table
#[derive(Default)]
pub struct StrategyRegistry {
    ctors: HashMap<String, StrategyCtor>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in example strategies
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::strategies::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, class_name: impl Into<String>, ctor: StrategyCtor) {
        self.ctors.insert(class_name.into(), ctor);
    }

    pub fn create(
        &self,
        class_name: &str,
        parameters: &serde_json::Value,
    ) -> Result<Box<dyn Strategy>> {
        let ctor = self.ctors.get(class_name).ok_or_else(|| {
            EngineError::Config(format!("unknown strategy class: {class_name}"))
        })?;
        ctor(parameters).map_err(|e| EngineError::Config(format!("{class_name}: {e}")))
    }
}

/// Parse a frequency string into a step duration. Supported: `Nmin`,
/// `Nh`, `1D`.
pub fn parse_frequency(frequency: &str) -> Result<Duration> {
    if frequency == "1D" {
        return Ok(Duration::days(1));
    }
    if let Some(minutes) = frequency.strip_suffix("min") {
        if let Ok(minutes) = minutes.parse::<i64>() {
            if minutes > 0 {
                return Ok(Duration::minutes(minutes));
            }
        }
    }
    if let Some(hours) = frequency.strip_suffix('h') {
        if let Ok(hours) = hours.parse::<i64>() {
            if hours > 0 {
                return Ok(Duration::hours(hours));
            }
        }
    }
    Err(EngineError::Config(format!(
        "unsupported frequency: {frequency}"
    )))
}

const SESSION_OPEN: (u32, u32) = (9, 30);
const SESSION_CLOSE: (u32, u32) = (16, 0);

/// Generate the bar schedule between two datetimes at a frequency.
/// Weekdays only; intraday frequencies step through the 09:30-16:00
/// session, `1D` yields one bar per day at the session close.
pub fn bartimes(start: BarTime, end: BarTime, frequency: &str) -> Result<Vec<BarTime>> {
    let step = parse_frequency(frequency)?;
    let open = NaiveTime::from_hms_opt(SESSION_OPEN.0, SESSION_OPEN.1, 0).unwrap();
    let close = NaiveTime::from_hms_opt(SESSION_CLOSE.0, SESSION_CLOSE.1, 0).unwrap();

    let mut out = Vec::new();
    let mut day = start.date_naive();
    while day <= end.date_naive() {
        if !matches!(day.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
            if frequency == "1D" {
                let bar = day.and_time(close).and_utc();
                if bar >= start && bar <= end {
                    out.push(bar);
                }
            } else {
                let mut time = day.and_time(open).and_utc();
                let day_close = day.and_time(close).and_utc();
                while time <= day_close {
                    if time >= start && time <= end {
                        out.push(time);
                    }
                    time += step;
                }
            }
        }
        day += Duration::days(1);
    }
    Ok(out)
}

/// Simulation runner: component setup plus the outer bar loop
pub struct SimRunner {
    id: String,
    oms: OrderManager,
    positions: PositionManager,
    risk: Risk,
    broker: PaperBroker,
    exchange: PaperExchange,
    market_data: MarketDataManager,
    portfolios: Vec<Portfolio>,
    strategies: Vec<StrategyHandle>,
    store: Box<dyn TradeStore>,
    strict: bool,
    crossing: bool,
    intent_price_offset: f64,
}

impl SimRunner {
    pub fn new(
        id: impl Into<String>,
        market_data: MarketDataManager,
        store: Box<dyn TradeStore>,
    ) -> Result<Self> {
        let id = id.into();
        info!(id = %id, "initializing SimRunner");
        Ok(Self {
            oms: OrderManager::new(id.clone()),
            positions: PositionManager::new(id.clone()),
            risk: Risk::default(),
            broker: PaperBroker::new("paper_broker", BrokerParams::default()),
            exchange: PaperExchange::new(ExchangeParams::default())?,
            market_data,
            portfolios: Vec::new(),
            strategies: Vec::new(),
            store,
            strict: false,
            crossing: false,
            intent_price_offset: 0.0,
            id,
        })
    }

    /// Build a runner from a run configuration and a strategy registry
    pub fn from_config(config: &Config, registry: &StrategyRegistry) -> Result<Self> {
        let feed = CsvDataFeed::new(&config.data_dir);
        let market_data = MarketDataManager::with_feed(&config.live_frequency, Box::new(feed));
        let store = JsonFileStore::new(&config.results_dir);

        let mut runner = Self::new(&config.source, market_data, Box::new(store))?;
        runner.strict = config.strict;
        runner.crossing = config.portfolio.crossing;
        runner.intent_price_offset = config.portfolio.intent_price_offset;
        runner.exchange = PaperExchange::new(ExchangeParams {
            fill_multiplier: config.exchange.fill_multiplier,
        })?;
        runner.broker = PaperBroker::new(
            "paper_broker",
            BrokerParams {
                fee_per_share: config.broker.fee_per_share.clone(),
            },
        );
        if let Some(max_quantity) = config.risk.max_quantity {
            runner.risk.add_rule(Box::new(MaxQuantityRule { max_quantity }));
        }
        if let Some(max_notional) = config.risk.max_notional {
            runner.risk.add_rule(Box::new(MaxNotionalRule { max_notional }));
        }

        for entry in &config.strategies {
            let strategy = registry.create(&entry.class_name, &entry.parameters)?;
            runner.add_portfolio(&entry.portfolio_id);
            runner.add_strategy(&entry.strategy_id, &entry.portfolio_id, strategy)?;
            let specs: Vec<SymbolSpec> = entry
                .symbols
                .iter()
                .map(|s| SymbolSpec::new(&s.product_type, &s.symbol, &s.frequency))
                .collect();
            runner.add_symbols(&entry.strategy_id, specs)?;
            runner.set_parameters(&entry.strategy_id, entry.parameters.clone())?;
        }
        Ok(runner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn risk_mut(&mut self) -> &mut Risk {
        &mut self.risk
    }

    pub fn market_data_mut(&mut self) -> &mut MarketDataManager {
        &mut self.market_data
    }

    /// Add a portfolio if it does not already exist
    pub fn add_portfolio(&mut self, portfolio_id: &str) {
        if !self.portfolios.iter().any(|p| p.id() == portfolio_id) {
            let mut portfolio = Portfolio::new(portfolio_id);
            portfolio.crossing = self.crossing;
            portfolio.intent_price_offset = self.intent_price_offset;
            self.portfolios.push(portfolio);
        }
    }

    /// Register a strategy under a portfolio
    pub fn add_strategy(
        &mut self,
        strategy_id: &str,
        portfolio_id: &str,
        strategy: Box<dyn Strategy>,
    ) -> Result<()> {
        if self.strategies.iter().any(|h| h.strategy_id == strategy_id) {
            return Err(EngineError::Config(format!(
                "duplicate strategy id: {strategy_id}"
            )));
        }
        let portfolio = self
            .portfolios
            .iter_mut()
            .find(|p| p.id() == portfolio_id)
            .ok_or_else(|| {
                EngineError::Config(format!("unknown portfolio: {portfolio_id}"))
            })?;
        let handle = StrategyHandle::new(strategy_id, portfolio_id, strategy);
        portfolio.add_strategy(strategy_id, handle.uuid);
        self.strategies.push(handle);
        Ok(())
    }

    /// Register symbols for a strategy
    pub fn add_symbols(
        &mut self,
        strategy_id: &str,
        specs: impl IntoIterator<Item = SymbolSpec>,
    ) -> Result<()> {
        let specs: Vec<SymbolSpec> = specs.into_iter().collect();
        let market_data = &mut self.market_data;
        let handle = self
            .strategies
            .iter_mut()
            .find(|h| h.strategy_id == strategy_id)
            .ok_or_else(|| EngineError::Config(format!("unknown strategy: {strategy_id}")))?;
        handle.add_symbols(specs, market_data)
    }

    /// Set parameters for a strategy
    pub fn set_parameters(&mut self, strategy_id: &str, parameters: serde_json::Value) -> Result<()> {
        self.handle_mut(strategy_id)?.set_parameters(parameters)
    }

    fn handle_mut(&mut self, strategy_id: &str) -> Result<&mut StrategyHandle> {
        self.strategies
            .iter_mut()
            .find(|h| h.strategy_id == strategy_id)
            .ok_or_else(|| EngineError::Config(format!("unknown strategy: {strategy_id}")))
    }

    /// Run the simulation across the schedule. Returns the processor so
    /// callers can inspect final orders and positions.
    pub fn run(mut self, start: BarTime, end: BarTime, frequency: &str) -> Result<EventProcessor> {
        let schedule = bartimes(start, end, frequency)?;
        if schedule.is_empty() {
            return Err(EngineError::Config(format!(
                "empty bar schedule from {start} to {end} at {frequency}"
            )));
        }

        let mut processor = EventProcessor::new(
            self.strategies,
            self.portfolios,
            self.risk,
            self.oms,
            self.positions,
            self.broker,
            self.exchange,
            self.market_data,
        )?;
        processor.strict = self.strict;

        info!(
            start = %schedule[0],
            end = %schedule[schedule.len() - 1],
            bars = schedule.len(),
            "beginning run"
        );
        processor.start();
        let mut store = self.store;
        for (i, &bartime) in schedule.iter().enumerate() {
            let flags = BarFlags {
                first_of_day: i == 0
                    || schedule[i - 1].date_naive() < bartime.date_naive(),
                last_of_day: i + 1 == schedule.len()
                    || schedule[i + 1].date_naive() > bartime.date_naive(),
            };
            processor.process_bar(bartime, flags, store.as_mut())?;
        }
        processor.stop(store.as_mut())?;
        info!("run complete");
        Ok(processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn dt(day: u32, hour: u32, minute: u32) -> BarTime {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("1min").unwrap(), Duration::minutes(1));
        assert_eq!(parse_frequency("15min").unwrap(), Duration::minutes(15));
        assert_eq!(parse_frequency("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_frequency("1D").unwrap(), Duration::days(1));
        assert!(parse_frequency("2w").is_err());
        assert!(parse_frequency("0min").is_err());
    }

    #[test]
    fn test_bartimes_intraday_session() {
        // 2024-01-02 is a Tuesday
        let bars = bartimes(dt(2, 9, 30), dt(2, 16, 0), "1h").unwrap();
        assert_eq!(bars[0], dt(2, 9, 30));
        assert_eq!(*bars.last().unwrap(), dt(2, 15, 30));
        assert_eq!(bars.len(), 7);
    }

    #[test]
    fn test_bartimes_skips_weekends() {
        // Jan 5 2024 is a Friday, Jan 8 a Monday
        let bars = bartimes(dt(5, 9, 30), dt(8, 16, 0), "1D").unwrap();
        assert_eq!(bars, vec![dt(5, 16, 0), dt(8, 16, 0)]);
    }

    #[test]
    fn test_bartimes_daily() {
        let bars = bartimes(dt(2, 0, 0), dt(4, 23, 59), "1D").unwrap();
        assert_eq!(bars, vec![dt(2, 16, 0), dt(3, 16, 0), dt(4, 16, 0)]);
    }

    #[test]
    fn test_registry_unknown_class() {
        let registry = StrategyRegistry::with_builtins();
        assert!(registry.create("nope", &serde_json::Value::Null).is_err());
    }
}
