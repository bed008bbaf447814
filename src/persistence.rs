//! Snapshot persistence
//!
//! End-of-day order and position snapshots go through the `TradeStore`
//! trait. The JSON file store writes one file per (source, kind, datetime)
//! under a root directory; the in-memory store backs tests.

use crate::error::{EngineError, Result};
use crate::order::Order;
use crate::position_manager::Position;
use crate::types::BarTime;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Storage for order and position snapshots keyed by (source, datetime)
pub trait TradeStore {
    fn save_orders(&mut self, source: &str, ts: BarTime, orders: &[Order]) -> Result<()>;
    fn save_positions(&mut self, source: &str, ts: BarTime, positions: &[Position]) -> Result<()>;
    fn get_orders(&self, source: &str, ts: BarTime) -> Result<Vec<Order>>;
    fn get_positions(&self, source: &str, ts: BarTime) -> Result<Vec<Position>>;
}

/// JSON-file-backed store: `{root}/{source}/{kind}_{datetime}.json`
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path(&self, source: &str, kind: &str, ts: BarTime) -> PathBuf {
        self.root
            .join(source)
            .join(format!("{kind}_{}.json", ts.format("%Y%m%dT%H%M%SZ")))
    }

    fn write<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        fs::write(path, json)?;
        info!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    fn read<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let contents = fs::read_to_string(path).map_err(|e| {
            EngineError::Persistence(format!("{}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl TradeStore for JsonFileStore {
    fn save_orders(&mut self, source: &str, ts: BarTime, orders: &[Order]) -> Result<()> {
        self.write(&self.path(source, "orders", ts), &orders)
    }

    fn save_positions(&mut self, source: &str, ts: BarTime, positions: &[Position]) -> Result<()> {
        self.write(&self.path(source, "positions", ts), &positions)
    }

    fn get_orders(&self, source: &str, ts: BarTime) -> Result<Vec<Order>> {
        self.read(&self.path(source, "orders", ts))
    }

    fn get_positions(&self, source: &str, ts: BarTime) -> Result<Vec<Position>> {
        self.read(&self.path(source, "positions", ts))
    }
}

/// In-memory store for tests and throwaway runs
#[derive(Default)]
pub struct MemoryStore {
    orders: HashMap<(String, BarTime), Vec<Order>>,
    positions: HashMap<(String, BarTime), Vec<Position>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_snapshots(&self) -> usize {
        self.orders.len()
    }

    pub fn position_snapshots(&self) -> usize {
        self.positions.len()
    }
}

impl TradeStore for MemoryStore {
    fn save_orders(&mut self, source: &str, ts: BarTime, orders: &[Order]) -> Result<()> {
        self.orders.insert((source.to_string(), ts), orders.to_vec());
        Ok(())
    }

    fn save_positions(&mut self, source: &str, ts: BarTime, positions: &[Position]) -> Result<()> {
        self.positions
            .insert((source.to_string(), ts), positions.to_vec());
        Ok(())
    }

    fn get_orders(&self, source: &str, ts: BarTime) -> Result<Vec<Order>> {
        self.orders
            .get(&(source.to_string(), ts))
            .cloned()
            .ok_or_else(|| {
                EngineError::Persistence(format!("no order snapshot for ({source}, {ts})"))
            })
    }

    fn get_positions(&self, source: &str, ts: BarTime) -> Result<Vec<Position>> {
        self.positions
            .get(&(source.to_string(), ts))
            .cloned()
            .ok_or_else(|| {
                EngineError::Persistence(format!("no position snapshot for ({source}, {ts})"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderType;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn ts() -> BarTime {
        Utc.with_ymd_and_hms(2024, 1, 2, 16, 0, 0).unwrap()
    }

    fn sample_order() -> Order {
        Order::new(
            Uuid::new_v4(),
            "strategy.s1",
            Uuid::new_v4(),
            "s1",
            "stock",
            "TEST",
            "b",
            100,
            OrderType::Limit,
            Some(10.0),
        )
        .unwrap()
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::new(dir.path());

        let orders = vec![sample_order(), sample_order()];
        store.save_orders("sim", ts(), &orders).unwrap();
        let loaded = store.get_orders("sim", ts()).unwrap();
        assert_eq!(orders, loaded);

        assert!(store.get_orders("sim", ts() + chrono::Duration::days(1)).is_err());
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryStore::new();
        let orders = vec![sample_order()];
        store.save_orders("sim", ts(), &orders).unwrap();
        assert_eq!(store.get_orders("sim", ts()).unwrap(), orders);
        assert_eq!(store.order_snapshots(), 1);
        assert!(store.get_positions("sim", ts()).is_err());
    }
}
