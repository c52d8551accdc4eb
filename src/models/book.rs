//! Order book models.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// A single price level. A quantity of zero removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl OrderBookLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Returns `true` if this level removes its price from the book.
    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Point-in-time view of one symbol's book.
///
/// Bids are sorted by descending price and asks by ascending price; neither
/// side contains duplicate prices and the best bid is strictly below the best
/// ask whenever both sides are populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub last_update_id: u64,
    /// Fractional epoch seconds of the last applied change.
    pub timestamp: f64,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    /// Summed quantity of the best `n` levels on each side.
    pub fn depth_at(&self, n: usize) -> Depth {
        Depth {
            levels: n,
            bid_quantity: self.bids.iter().take(n).map(|l| l.quantity).sum(),
            ask_quantity: self.asks.iter().take(n).map(|l| l.quantity).sum(),
        }
    }

    /// Checks the sorting, uniqueness and non-crossing invariants.
    pub fn is_consistent(&self) -> bool {
        let bids_sorted = self.bids.windows(2).all(|w| w[0].price > w[1].price);
        let asks_sorted = self.asks.windows(2).all(|w| w[0].price < w[1].price);
        let uncrossed = match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price < ask.price,
            _ => true,
        };
        bids_sorted && asks_sorted && uncrossed
    }
}

/// An incremental change covering the update-id range
/// `first_update_id..=last_update_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub symbol: String,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: f64,
}

impl BookDelta {
    /// A delta touching exactly one level under a single update id.
    pub fn single(
        symbol: impl Into<String>,
        side: BookSide,
        level: OrderBookLevel,
        update_id: u64,
        timestamp: f64,
    ) -> Self {
        let (bids, asks) = match side {
            BookSide::Bid => (vec![level], Vec::new()),
            BookSide::Ask => (Vec::new(), vec![level]),
        };
        Self {
            symbol: symbol.into(),
            first_update_id: update_id,
            last_update_id: update_id,
            bids,
            asks,
            timestamp,
        }
    }
}

/// Quantity resting within the best `levels` levels of each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Depth {
    pub levels: usize,
    pub bid_quantity: Decimal,
    pub ask_quantity: Decimal,
}

/// Derived read-only figures over a two-sided book.
#[derive(Debug, Clone, PartialEq)]
pub struct BookMetrics {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    /// `best_ask - best_bid`.
    pub spread: Decimal,
    /// `(best_bid + best_ask) / 2`.
    pub mid_price: Decimal,
    snapshot: Arc<OrderBookSnapshot>,
}

impl BookMetrics {
    /// Computes metrics over `snapshot`, or `None` when either side is empty.
    pub fn from_snapshot(snapshot: Arc<OrderBookSnapshot>) -> Option<Self> {
        let best_bid = snapshot.best_bid()?.price;
        let best_ask = snapshot.best_ask()?.price;
        Some(Self {
            best_bid,
            best_ask,
            spread: best_ask - best_bid,
            mid_price: (best_bid + best_ask) / Decimal::TWO,
            snapshot,
        })
    }

    /// Depth over the best `n` levels of the book these metrics were taken from.
    pub fn depth_at(&self, n: usize) -> Depth {
        self.snapshot.depth_at(n)
    }

    pub fn update_id(&self) -> u64 {
        self.snapshot.last_update_id
    }
}
