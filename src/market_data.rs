//! Market data management
//!
//! The engine consumes market data through the `MarketDataManager`: a
//! settable bartime, `update` to pull new bars from the attached feed, and
//! point reads (`current_bar`, `current_price`, `prior_close`). Bars live
//! in time-sorted series keyed by (product_type, symbol, frequency).
//!
//! The market-data subsystem proper is a collaborator; this module supplies
//! a CSV-backed feed for runs and direct bar insertion for simulations and
//! tests.

use crate::error::{EngineError, Result};
use crate::types::{Bar, BarTime, SymbolSpec};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source of bars for the MarketDataManager
pub trait DataFeed {
    /// Load all bars for a series up to and including `through`
    fn load(
        &mut self,
        product_type: &str,
        symbol: &str,
        frequency: &str,
        through: BarTime,
    ) -> Result<Vec<(BarTime, Bar)>>;
}

#[derive(Debug, Deserialize)]
struct CsvBarRow {
    datetime: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Feed reading bars from CSV files named
/// `{product_type}_{symbol}_{frequency}.csv` with columns
/// `datetime,open,high,low,close,volume`
pub struct CsvDataFeed {
    data_dir: PathBuf,
}

impl CsvDataFeed {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }
}

impl DataFeed for CsvDataFeed {
    fn load(
        &mut self,
        product_type: &str,
        symbol: &str,
        frequency: &str,
        through: BarTime,
    ) -> Result<Vec<(BarTime, Bar)>> {
        let path = self
            .data_dir
            .join(format!("{product_type}_{symbol}_{frequency}.csv"));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| EngineError::Persistence(format!("{}: {e}", path.display())))?;
        let mut bars = Vec::new();
        for row in reader.deserialize::<CsvBarRow>() {
            let row = row.map_err(|e| EngineError::Persistence(format!("{}: {e}", path.display())))?;
            if row.datetime <= through {
                bars.push((
                    row.datetime,
                    Bar::new_unchecked(row.open, row.high, row.low, row.close, row.volume),
                ));
            }
        }
        debug!(path = %path.display(), count = bars.len(), "loaded bars from csv");
        Ok(bars)
    }
}

type SeriesKey = (String, String, String);

/// Market data access for the engine: tracked series, a bartime cursor and
/// point reads against it
pub struct MarketDataManager {
    bartime: Option<BarTime>,
    live_frequency: String,
    tracked: BTreeSet<SymbolSpec>,
    series: HashMap<SeriesKey, BTreeMap<BarTime, Bar>>,
    feed: Option<Box<dyn DataFeed>>,
}

impl MarketDataManager {
    /// Create a manager with no feed; bars are supplied via `insert_bar`
    pub fn new(live_frequency: impl Into<String>) -> Self {
        Self {
            bartime: None,
            live_frequency: live_frequency.into(),
            tracked: BTreeSet::new(),
            series: HashMap::new(),
            feed: None,
        }
    }

    /// Create a manager backed by a feed
    pub fn with_feed(live_frequency: impl Into<String>, feed: Box<dyn DataFeed>) -> Self {
        let mut mdm = Self::new(live_frequency);
        mdm.feed = Some(feed);
        mdm
    }

    pub fn live_frequency(&self) -> &str {
        &self.live_frequency
    }

    /// Register a (product_type, symbol, frequency) for tracking
    pub fn add_symbols(&mut self, product_type: &str, symbol: &str, frequency: &str) {
        let spec = SymbolSpec::new(product_type, symbol, frequency);
        if self.tracked.insert(spec) {
            info!(product_type, symbol, frequency, "tracking symbol");
        }
    }

    /// Tracked specs, sorted
    pub fn tracked(&self) -> impl Iterator<Item = &SymbolSpec> {
        self.tracked.iter()
    }

    /// Distinct tracked product types
    pub fn product_types(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.tracked.iter().map(|s| s.product_type.as_str()).collect();
        set.into_iter().map(String::from).collect()
    }

    /// Distinct tracked frequencies for a product type
    pub fn frequencies(&self, product_type: &str) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .tracked
            .iter()
            .filter(|s| s.product_type == product_type)
            .map(|s| s.frequency.as_str())
            .collect();
        set.into_iter().map(String::from).collect()
    }

    pub fn bartime(&self) -> Option<BarTime> {
        self.bartime
    }

    pub fn set_bartime(&mut self, bartime: BarTime) {
        self.bartime = Some(bartime);
    }

    /// Insert a bar directly (simulation and tests)
    pub fn insert_bar(
        &mut self,
        product_type: &str,
        symbol: &str,
        frequency: &str,
        bartime: BarTime,
        bar: Bar,
    ) {
        self.add_symbols(product_type, symbol, frequency);
        self.series
            .entry((
                product_type.to_string(),
                symbol.to_string(),
                frequency.to_string(),
            ))
            .or_default()
            .insert(bartime, bar);
    }

    /// Pull bars from the feed for every tracked symbol of
    /// (product_type, frequency), up to the current bartime. A no-op
    /// without a feed.
    pub fn update(&mut self, product_type: &str, frequency: &str) -> Result<()> {
        let Some(bartime) = self.bartime else {
            return Ok(());
        };
        let Some(feed) = self.feed.as_mut() else {
            return Ok(());
        };
        let specs: Vec<SymbolSpec> = self
            .tracked
            .iter()
            .filter(|s| s.product_type == product_type && s.frequency == frequency)
            .cloned()
            .collect();
        for spec in specs {
            let bars = feed.load(&spec.product_type, &spec.symbol, &spec.frequency, bartime)?;
            let series = self
                .series
                .entry((
                    spec.product_type.clone(),
                    spec.symbol.clone(),
                    spec.frequency.clone(),
                ))
                .or_default();
            for (ts, bar) in bars {
                series.insert(ts, bar);
            }
        }
        Ok(())
    }

    fn series(&self, product_type: &str, symbol: &str, frequency: &str) -> Option<&BTreeMap<BarTime, Bar>> {
        self.series.get(&(
            product_type.to_string(),
            symbol.to_string(),
            frequency.to_string(),
        ))
    }

    /// The bar at exactly the current bartime, at the live frequency
    pub fn current_bar(&self, product_type: &str, symbol: &str) -> Option<Bar> {
        let bartime = self.bartime?;
        self.series(product_type, symbol, &self.live_frequency)?
            .get(&bartime)
            .copied()
    }

    /// Last price at the current bartime: the close of the most recent bar
    /// at or before the bartime
    pub fn current_price(&self, product_type: &str, symbol: &str) -> Option<f64> {
        let bartime = self.bartime?;
        self.series(product_type, symbol, &self.live_frequency)?
            .range(..=bartime)
            .next_back()
            .map(|(_, bar)| bar.close)
    }

    /// Prior session close: the close of the last bar strictly before the
    /// current bartime's calendar day. Prefers a 1D series when tracked.
    pub fn prior_close(&self, product_type: &str, symbol: &str) -> Option<f64> {
        let bartime = self.bartime?;
        let day_start = bartime
            .date_naive()
            .and_hms_opt(0, 0, 0)?
            .and_utc();
        let daily = self.series(product_type, symbol, "1D");
        let series = match daily {
            Some(s) if !s.is_empty() => s,
            _ => self.series(product_type, symbol, &self.live_frequency)?,
        };
        series
            .range(..day_start)
            .next_back()
            .map(|(_, bar)| bar.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32, hour: u32, minute: u32) -> BarTime {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn bar(close: f64) -> Bar {
        Bar::new_unchecked(close, close + 0.5, close - 0.5, close, 1000.0)
    }

    #[test]
    fn test_current_bar_exact_match() {
        let mut mdm = MarketDataManager::new("1min");
        mdm.insert_bar("stock", "TEST", "1min", ts(2, 9, 30), bar(10.0));
        mdm.set_bartime(ts(2, 9, 30));
        assert_eq!(mdm.current_bar("stock", "TEST").unwrap().close, 10.0);
        mdm.set_bartime(ts(2, 9, 31));
        assert!(mdm.current_bar("stock", "TEST").is_none());
    }

    #[test]
    fn test_current_price_last_valid() {
        let mut mdm = MarketDataManager::new("1min");
        mdm.insert_bar("stock", "TEST", "1min", ts(2, 9, 30), bar(10.0));
        mdm.insert_bar("stock", "TEST", "1min", ts(2, 9, 31), bar(10.5));
        mdm.set_bartime(ts(2, 9, 33));
        assert_eq!(mdm.current_price("stock", "TEST"), Some(10.5));
        mdm.set_bartime(ts(2, 9, 30));
        assert_eq!(mdm.current_price("stock", "TEST"), Some(10.0));
    }

    #[test]
    fn test_prior_close_uses_daily_series() {
        let mut mdm = MarketDataManager::new("1min");
        mdm.insert_bar("stock", "TEST", "1D", ts(1, 16, 0), bar(9.8));
        mdm.insert_bar("stock", "TEST", "1min", ts(2, 9, 30), bar(10.0));
        mdm.set_bartime(ts(2, 9, 30));
        assert_eq!(mdm.prior_close("stock", "TEST"), Some(9.8));
    }

    #[test]
    fn test_prior_close_falls_back_to_live_frequency() {
        let mut mdm = MarketDataManager::new("1min");
        mdm.insert_bar("stock", "TEST", "1min", ts(1, 15, 59), bar(9.7));
        mdm.insert_bar("stock", "TEST", "1min", ts(2, 9, 30), bar(10.0));
        mdm.set_bartime(ts(2, 9, 30));
        assert_eq!(mdm.prior_close("stock", "TEST"), Some(9.7));
    }

    #[test]
    fn test_missing_symbol_returns_none() {
        let mut mdm = MarketDataManager::new("1min");
        mdm.set_bartime(ts(2, 9, 30));
        assert!(mdm.current_bar("stock", "NOPE").is_none());
        assert!(mdm.current_price("stock", "NOPE").is_none());
        assert!(mdm.prior_close("stock", "NOPE").is_none());
    }

    #[test]
    fn test_csv_feed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stock_TEST_1min.csv");
        std::fs::write(
            &path,
            "datetime,open,high,low,close,volume\n\
             2024-01-02T09:30:00Z,10.0,10.2,9.9,10.1,1000\n\
             2024-01-02T09:31:00Z,10.1,10.3,10.0,10.2,1200\n",
        )
        .unwrap();

        let feed = CsvDataFeed::new(dir.path());
        let mut mdm = MarketDataManager::with_feed("1min", Box::new(feed));
        mdm.add_symbols("stock", "TEST", "1min");
        mdm.set_bartime(ts(2, 9, 30));
        mdm.update("stock", "1min").unwrap();

        let bar = mdm.current_bar("stock", "TEST").unwrap();
        assert_eq!(bar.close, 10.1);
        // second row was beyond the bartime and not loaded yet
        mdm.set_bartime(ts(2, 9, 31));
        assert!(mdm.current_bar("stock", "TEST").is_none());
        mdm.update("stock", "1min").unwrap();
        assert_eq!(mdm.current_bar("stock", "TEST").unwrap().close, 10.2);
    }

    #[test]
    fn test_product_types_and_frequencies() {
        let mut mdm = MarketDataManager::new("1min");
        mdm.add_symbols("stock", "AAA", "1min");
        mdm.add_symbols("stock", "BBB", "1D");
        mdm.add_symbols("future", "CCC", "1min");
        assert_eq!(mdm.product_types(), vec!["future", "stock"]);
        assert_eq!(mdm.frequencies("stock"), vec!["1D", "1min"]);
    }
}
