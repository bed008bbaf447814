//! Run configuration
//!
//! JSON configuration for a run: engine parameters plus the strategy
//! enumeration table (strategy_id, portfolio_id, class_name, parameters,
//! symbols).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: String,
    pub data_dir: String,
    pub results_dir: String,
    pub live_frequency: String,
    pub strict: bool,
    pub exchange: ExchangeConfig,
    pub broker: BrokerConfig,
    pub risk: RiskConfig,
    pub portfolio: PortfolioConfig,
    pub strategies: Vec<StrategyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            source: "simulation".to_string(),
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            live_frequency: "1min".to_string(),
            strict: false,
            exchange: ExchangeConfig::default(),
            broker: BrokerConfig::default(),
            risk: RiskConfig::default(),
            portfolio: PortfolioConfig::default(),
            strategies: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        serde_json::from_str(&contents).context("Failed to parse config JSON")
    }
}

/// Paper exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub fill_multiplier: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            fill_multiplier: 0.5,
        }
    }
}

/// Paper broker fee configuration, per-share commission by product type
/// (negative values are costs)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub fee_per_share: HashMap<String, f64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let mut fee_per_share = HashMap::new();
        fee_per_share.insert("stock".to_string(), -0.01);
        BrokerConfig { fee_per_share }
    }
}

/// Optional risk rules beyond the default market-state check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_quantity: Option<u64>,
    pub max_notional: Option<f64>,
}

/// Portfolio behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub crossing: bool,
    pub intent_price_offset: f64,
}

/// One row of the strategy enumeration table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    pub portfolio_id: String,
    pub class_name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
}

/// One symbol registration row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub product_type: String,
    pub symbol: String,
    pub frequency: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.source, "simulation");
        assert_eq!(config.exchange.fill_multiplier, 0.5);
        assert_eq!(config.broker.fee_per_share["stock"], -0.01);
        assert!(!config.portfolio.crossing);
        assert!(config.strategies.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            "source": "test_run",
            "exchange": {"fill_multiplier": 1.0},
            "risk": {"max_quantity": 500},
            "strategies": [
                {
                    "strategy_id": "s1",
                    "portfolio_id": "p1",
                    "class_name": "passive_limit",
                    "parameters": {"quantity": 100},
                    "symbols": [
                        {"product_type": "stock", "symbol": "TEST", "frequency": "1min"}
                    ]
                }
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.source, "test_run");
        assert_eq!(config.exchange.fill_multiplier, 1.0);
        assert_eq!(config.risk.max_quantity, Some(500));
        assert_eq!(config.strategies.len(), 1);
        assert_eq!(config.strategies[0].class_name, "passive_limit");
        assert_eq!(config.strategies[0].symbols[0].symbol, "TEST");
        // unspecified sections fall back to defaults
        assert_eq!(config.live_frequency, "1min");
        assert_eq!(config.broker.fee_per_share["stock"], -0.01);
    }
}
