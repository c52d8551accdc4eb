//! Executed trade model.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::DriftnetError;

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = DriftnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" | "BUY" | "b" => Ok(Side::Buy),
            "sell" | "SELL" | "s" => Ok(Side::Sell),
            other => Err(DriftnetError::Decode(format!("unknown trade side: {other}"))),
        }
    }
}

/// A single executed trade, normalized across venues.
///
/// Trades are immutable once constructed and uniquely identified by
/// `(exchange, symbol, trade_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Execution time in fractional epoch seconds.
    pub timestamp: f64,
    pub side: Side,
    pub trade_id: String,
    /// Maker flag as reported by the venue; each adapter documents its
    /// meaning.
    pub is_maker: bool,
}

/// Identity of a trade across venues.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TradeKey {
    pub exchange: String,
    pub symbol: String,
    pub trade_id: String,
}

impl Trade {
    /// Returns the identity tuple of this trade.
    pub fn key(&self) -> TradeKey {
        TradeKey {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            trade_id: self.trade_id.clone(),
        }
    }

    /// Quote-currency value of the trade.
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}
