//! Normalized market data models shared by every venue adapter, the
//! order-book engine and the storage backends.
//!
//! Venue wire formats never leave the [`venue`](crate::venue) module; what
//! flows through the rest of the crate are the types defined here.

pub mod book;
pub mod statistics;
pub mod status;
pub mod trade;

pub use book::{BookDelta, BookMetrics, BookSide, Depth, OrderBookLevel, OrderBookSnapshot};
pub use statistics::{CacheStats, MarketData, TradeStatistics};
pub use status::{CollectorState, CollectorStatus};
pub use trade::{Side, Trade, TradeKey};

/// A tradable event decoded from a venue message.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    /// One or more executed trades, in venue order.
    Trades(Vec<Trade>),
    /// A complete book replacing whatever the engine holds.
    BookSnapshot(OrderBookSnapshot),
    /// An incremental book change.
    BookDelta(BookDelta),
    /// The venue refused to send a fresh book for `symbol`.
    BookRejected { symbol: String, reason: String },
}

impl NormalizedEvent {
    /// Symbol the event refers to. A trade batch reports its first trade's
    /// symbol; decoders never mix symbols within one batch.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Trades(trades) => trades.first().map(|t| t.symbol.as_str()),
            Self::BookSnapshot(snapshot) => Some(&snapshot.symbol),
            Self::BookDelta(delta) => Some(&delta.symbol),
            Self::BookRejected { symbol, .. } => Some(symbol),
        }
    }
}

/// Current wall-clock time as fractional epoch seconds.
pub fn now_epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
