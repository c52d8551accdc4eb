//! Rolling per-symbol trade statistics and the read models the collector
//! exposes to downstream consumers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::{Side, Trade};

/// Running summary of the trades seen for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub symbol: String,
    pub trade_count: u64,
    pub volume: Decimal,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    /// Sum of `price * quantity`, kept so the VWAP stays exact.
    pub notional: Decimal,
    pub last_price: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    /// Epoch seconds of the most recent trade folded in.
    pub updated_at: f64,
}

impl TradeStatistics {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            trade_count: 0,
            volume: Decimal::ZERO,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            notional: Decimal::ZERO,
            last_price: None,
            high: None,
            low: None,
            updated_at: 0.0,
        }
    }

    /// Folds one trade into the summary.
    pub fn record(&mut self, trade: &Trade) {
        self.trade_count += 1;
        self.volume += trade.quantity;
        match trade.side {
            Side::Buy => self.buy_volume += trade.quantity,
            Side::Sell => self.sell_volume += trade.quantity,
        }
        self.notional += trade.notional();
        self.last_price = Some(trade.price);
        self.high = Some(self.high.map_or(trade.price, |h| h.max(trade.price)));
        self.low = Some(self.low.map_or(trade.price, |l| l.min(trade.price)));
        if trade.timestamp > self.updated_at {
            self.updated_at = trade.timestamp;
        }
    }

    /// Volume-weighted average price, `None` before the first trade.
    pub fn vwap(&self) -> Option<Decimal> {
        if self.volume.is_zero() {
            None
        } else {
            Some(self.notional / self.volume)
        }
    }
}

/// Current state for one symbol as seen by the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketData {
    pub symbol: String,
    pub last_trade: Option<Trade>,
    pub statistics: TradeStatistics,
    /// Most recent trades, oldest first.
    pub recent_trades: Vec<Trade>,
}

/// Occupancy of one symbol's in-collector trade buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub buffered: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of the buffer in use, in `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.buffered as f64 / self.capacity as f64
        }
    }
}
