//! Pluggable persistence for normalized market data.
//!
//! Every backend implements [`StorageGateway`]; collectors and readers hold
//! an `Arc<dyn StorageGateway>` and never know which one they talk to.
//!
//! - [`MemoryStorage`] - bounded FIFO buffers per symbol
//! - [`TtlStorage`] - key-value store whose entries expire after a fixed window
//! - [`PostgresStorage`] - relational time-series store, survives restarts

mod memory;
mod postgres;
mod ttl;

use async_trait::async_trait;

pub use memory::MemoryStorage;
pub use postgres::{PostgresStorage, TradeBucket};
pub use ttl::{DEFAULT_TTL, TtlStorage};

use crate::Result;
use crate::models::{Trade, TradeStatistics};

/// Default number of trades a bounded backend keeps per symbol.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Time range and size filter for [`StorageGateway::get_trades`].
///
/// Both bounds are inclusive epoch seconds. `limit` keeps the most recent
/// matching trades.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradeQuery {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub limit: Option<usize>,
}

impl TradeQuery {
    /// Matches every stored trade.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: f64, end: f64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            limit: None,
        }
    }

    pub fn since(start: f64) -> Self {
        Self {
            start: Some(start),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `timestamp` falls within the range.
    pub fn contains(&self, timestamp: f64) -> bool {
        self.start.is_none_or(|s| timestamp >= s) && self.end.is_none_or(|e| timestamp <= e)
    }

    /// Filters `trades` (in insertion order), orders them by timestamp and
    /// keeps the most recent `limit`. Trades sharing a timestamp keep their
    /// insertion order.
    pub(crate) fn select<'a>(&self, trades: impl Iterator<Item = &'a Trade>) -> Vec<Trade> {
        let mut selected: Vec<Trade> = trades.filter(|t| self.contains(t.timestamp)).cloned().collect();
        selected.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        if let Some(limit) = self.limit {
            let excess = selected.len().saturating_sub(limit);
            selected.drain(..excess);
        }
        selected
    }
}

/// Capability set shared by every storage backend.
///
/// Implementations must tolerate concurrent callers. Trades are append-only
/// and never reordered relative to insertion; statistics are last-write-wins
/// per symbol.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Acquires the backing resource.
    async fn connect(&self) -> Result<()>;

    /// Releases the backing resource. Idempotent and safe to call even if
    /// [`connect`](Self::connect) never succeeded.
    async fn disconnect(&self) -> Result<()>;

    /// Appends one trade.
    async fn store_trade(&self, symbol: &str, trade: &Trade) -> Result<()> {
        self.store_trades(symbol, std::slice::from_ref(trade)).await
    }

    /// Appends trades as one atomic batch, preserving their order.
    async fn store_trades(&self, symbol: &str, trades: &[Trade]) -> Result<()>;

    /// Returns trades for `symbol` matching `query`, oldest first.
    async fn get_trades(&self, symbol: &str, query: TradeQuery) -> Result<Vec<Trade>>;

    /// Replaces the statistics held for `symbol`.
    async fn store_statistics(&self, symbol: &str, stats: &TradeStatistics) -> Result<()>;

    /// Returns the last statistics stored for `symbol`, `None` if absent.
    async fn get_statistics(&self, symbol: &str) -> Result<Option<TradeStatistics>>;
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::models::Side;

    fn trade(id: &str, ts: f64) -> Trade {
        Trade {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(1),
            quantity: dec!(1),
            timestamp: ts,
            side: Side::Buy,
            trade_id: id.into(),
            is_maker: false,
        }
    }

    fn ids(trades: &[Trade]) -> Vec<&str> {
        trades.iter().map(|t| t.trade_id.as_str()).collect()
    }

    #[test]
    fn select_orders_by_timestamp_stably() {
        let stored = [trade("a", 3.0), trade("b", 1.0), trade("c", 3.0), trade("d", 2.0)];
        let selected = TradeQuery::all().select(stored.iter());
        assert_eq!(ids(&selected), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn select_range_is_inclusive() {
        let stored = [trade("a", 1.0), trade("b", 2.0), trade("c", 3.0), trade("d", 4.0)];
        let selected = TradeQuery::between(2.0, 3.0).select(stored.iter());
        assert_eq!(ids(&selected), vec!["b", "c"]);
    }

    #[test]
    fn select_limit_keeps_most_recent() {
        let stored = [trade("a", 1.0), trade("b", 2.0), trade("c", 3.0)];
        let selected = TradeQuery::since(0.0).limit(2).select(stored.iter());
        assert_eq!(ids(&selected), vec!["b", "c"]);

        let selected = TradeQuery::all().limit(0).select(stored.iter());
        assert!(selected.is_empty());
    }
}
