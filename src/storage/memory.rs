//! Bounded in-memory backend.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DEFAULT_CAPACITY, StorageGateway, TradeQuery};
use crate::Result;
use crate::models::{Trade, TradeStatistics};

/// Keeps the most recent `capacity` trades per symbol in memory.
///
/// Once a symbol's buffer is full the oldest trade is evicted for each new
/// one. Nothing survives the process.
pub struct MemoryStorage {
    capacity: usize,
    trades: Mutex<HashMap<String, VecDeque<Trade>>>,
    statistics: Mutex<HashMap<String, TradeStatistics>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            trades: Mutex::new(HashMap::new()),
            statistics: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of trades currently held for `symbol`.
    pub async fn len(&self, symbol: &str) -> usize {
        self.trades.lock().await.get(symbol).map_or(0, VecDeque::len)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn store_trades(&self, symbol: &str, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }

        let mut buffers = self.trades.lock().await;
        let buffer = buffers.entry(symbol.to_string()).or_default();
        let mut evicted = 0usize;
        for trade in trades {
            if buffer.len() == self.capacity {
                buffer.pop_front();
                evicted += 1;
            }
            buffer.push_back(trade.clone());
        }
        if evicted > 0 {
            debug!(symbol, evicted, "Evicted oldest trades from memory buffer");
        }

        Ok(())
    }

    async fn get_trades(&self, symbol: &str, query: TradeQuery) -> Result<Vec<Trade>> {
        let buffers = self.trades.lock().await;
        Ok(buffers
            .get(symbol)
            .map(|buffer| query.select(buffer.iter()))
            .unwrap_or_default())
    }

    async fn store_statistics(&self, symbol: &str, stats: &TradeStatistics) -> Result<()> {
        self.statistics
            .lock()
            .await
            .insert(symbol.to_string(), stats.clone());
        Ok(())
    }

    async fn get_statistics(&self, symbol: &str) -> Result<Option<TradeStatistics>> {
        Ok(self.statistics.lock().await.get(symbol).cloned())
    }
}
