//! Per-symbol order book reconstruction.
//!
//! [`OrderBookEngine`] rebuilds each symbol's book from a snapshot followed
//! by incremental updates. Updates must continue the update-id sequence of
//! the last applied change; anything else is rejected, the symbol is flagged
//! for a re-snapshot, and the book stays exactly as it was until a new
//! snapshot arrives.
//!
//! Readers never observe partial state: every accepted change publishes a
//! fresh immutable [`OrderBookSnapshot`] behind an [`Arc`], swapped in under
//! the write lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::models::{BookDelta, BookMetrics, BookSide, OrderBookLevel, OrderBookSnapshot};
use crate::{DriftnetError, Result};

/// What happened to an update handed to [`OrderBookEngine::apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update was applied and a new view published.
    Applied,
    /// The update lies entirely before the current book and was ignored.
    Stale,
}

struct BookState {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    /// No update applied since the last snapshot; the next one may straddle
    /// the snapshot's update id.
    fresh: bool,
    published: Arc<OrderBookSnapshot>,
}

#[derive(Default)]
struct Books {
    states: HashMap<String, BookState>,
    /// Symbols whose next accepted input must be a snapshot.
    resnapshot: HashSet<String>,
}

/// Thread-safe store of reconstructed order books keyed by symbol.
pub struct OrderBookEngine {
    depth: usize,
    books: RwLock<Books>,
}

impl OrderBookEngine {
    /// Creates an engine keeping at most `depth` levels per side.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            books: RwLock::new(Books::default()),
        }
    }

    /// Maximum number of levels kept per side.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Replaces the book for `symbol` wholesale.
    ///
    /// Zero-quantity levels are dropped, duplicate prices collapse to the
    /// last occurrence, both sides are sorted and capped to the engine depth.
    ///
    /// # Errors
    ///
    /// Returns [`DriftnetError::InvalidBook`] if the snapshot is crossed; the
    /// previous book (if any) is left in place.
    pub fn apply_snapshot(
        &self,
        symbol: &str,
        snapshot: OrderBookSnapshot,
    ) -> Result<Arc<OrderBookSnapshot>> {
        let mut bids = BTreeMap::new();
        let mut asks = BTreeMap::new();
        apply_levels(&mut bids, &snapshot.bids);
        apply_levels(&mut asks, &snapshot.asks);

        if is_crossed(&bids, &asks) {
            return Err(DriftnetError::InvalidBook(format!(
                "crossed snapshot for {symbol} at update {}",
                snapshot.last_update_id
            )));
        }
        truncate(&mut bids, &mut asks, self.depth);

        let published = Arc::new(publish(
            symbol,
            &bids,
            &asks,
            snapshot.last_update_id,
            snapshot.timestamp,
        ));

        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        books.resnapshot.remove(symbol);
        books.states.insert(
            symbol.to_string(),
            BookState {
                bids,
                asks,
                last_update_id: snapshot.last_update_id,
                fresh: true,
                published: published.clone(),
            },
        );
        debug!(
            symbol,
            update_id = snapshot.last_update_id,
            "Applied book snapshot"
        );

        Ok(published)
    }

    /// Applies a single level change carrying `update_id`.
    ///
    /// The id must be exactly one past the last applied update.
    ///
    /// # Errors
    ///
    /// Returns [`DriftnetError::SequenceGap`] for any other id (including
    /// repeats) and flags the symbol for a re-snapshot.
    pub fn apply_delta(
        &self,
        symbol: &str,
        level: OrderBookLevel,
        side: BookSide,
        update_id: u64,
    ) -> Result<()> {
        let timestamp = crate::models::now_epoch_secs();
        let delta = BookDelta::single(symbol, side, level, update_id, timestamp);
        self.apply(&delta, true).map(|_| ())
    }

    /// Applies a batched update covering `first_update_id..=last_update_id`.
    ///
    /// Updates entirely before the current book are ignored. The first
    /// update after a snapshot may straddle the snapshot's update id; every
    /// later one must start exactly one past the last applied id.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::SequenceGap`] when the update does not continue the
    /// sequence or no snapshot has been applied; [`DriftnetError::InvalidBook`]
    /// when it would cross the book. Both flag the symbol for a re-snapshot
    /// and leave the book unchanged.
    pub fn apply_update(&self, delta: &BookDelta) -> Result<ApplyOutcome> {
        self.apply(delta, false)
    }

    fn apply(&self, delta: &BookDelta, strict: bool) -> Result<ApplyOutcome> {
        if delta.first_update_id > delta.last_update_id {
            return Err(DriftnetError::InvalidBook(format!(
                "update range {}..={} is inverted for {}",
                delta.first_update_id, delta.last_update_id, delta.symbol
            )));
        }

        let symbol = delta.symbol.as_str();
        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        let Books { states, resnapshot } = &mut *books;

        let pending = resnapshot.contains(symbol);
        let state = match states.get_mut(symbol) {
            Some(state) if !pending => state,
            other => {
                let expected = other.map_or(0, |s| s.last_update_id.saturating_add(1));
                resnapshot.insert(symbol.to_string());
                return Err(DriftnetError::SequenceGap {
                    symbol: symbol.to_string(),
                    expected,
                    received: delta.first_update_id,
                });
            }
        };

        // A book at the top of the id space cannot be continued.
        let Some(expected) = state.last_update_id.checked_add(1) else {
            resnapshot.insert(symbol.to_string());
            warn!(symbol, "Book update id space exhausted, re-snapshot required");
            return Err(DriftnetError::SequenceGap {
                symbol: symbol.to_string(),
                expected: u64::MAX,
                received: delta.first_update_id,
            });
        };
        let in_sequence = if strict {
            delta.first_update_id == expected
        } else if delta.last_update_id < expected {
            debug!(
                symbol,
                last_update_id = delta.last_update_id,
                book_update_id = state.last_update_id,
                "Ignoring stale book update"
            );
            return Ok(ApplyOutcome::Stale);
        } else if state.fresh {
            delta.first_update_id <= expected
        } else {
            delta.first_update_id == expected
        };

        if !in_sequence {
            resnapshot.insert(symbol.to_string());
            warn!(
                symbol,
                expected,
                received = delta.first_update_id,
                "Book sequence gap, re-snapshot required"
            );
            return Err(DriftnetError::SequenceGap {
                symbol: symbol.to_string(),
                expected,
                received: delta.first_update_id,
            });
        }

        let mut bids = state.bids.clone();
        let mut asks = state.asks.clone();
        apply_levels(&mut bids, &delta.bids);
        apply_levels(&mut asks, &delta.asks);

        if is_crossed(&bids, &asks) {
            resnapshot.insert(symbol.to_string());
            warn!(
                symbol,
                update_id = delta.last_update_id,
                "Book update would cross the book, re-snapshot required"
            );
            return Err(DriftnetError::InvalidBook(format!(
                "update {} crosses the book for {symbol}",
                delta.last_update_id
            )));
        }
        truncate(&mut bids, &mut asks, self.depth);

        state.published = Arc::new(publish(
            symbol,
            &bids,
            &asks,
            delta.last_update_id,
            delta.timestamp,
        ));
        state.bids = bids;
        state.asks = asks;
        state.last_update_id = delta.last_update_id;
        state.fresh = false;

        Ok(ApplyOutcome::Applied)
    }

    /// Returns the current immutable view of `symbol`'s book.
    pub fn get_book(&self, symbol: &str) -> Option<Arc<OrderBookSnapshot>> {
        let books = self.books.read().unwrap_or_else(PoisonError::into_inner);
        books.states.get(symbol).map(|s| s.published.clone())
    }

    /// Spread, mid price and depth over the current book, or `None` when
    /// there is no book or either side is empty.
    pub fn metrics(&self, symbol: &str) -> Option<BookMetrics> {
        BookMetrics::from_snapshot(self.get_book(symbol)?)
    }

    /// Returns `true` if `symbol` is waiting for a snapshot.
    pub fn needs_snapshot(&self, symbol: &str) -> bool {
        let books = self.books.read().unwrap_or_else(PoisonError::into_inner);
        books.resnapshot.contains(symbol) || !books.states.contains_key(symbol)
    }

    /// Flags `symbol` so every update is rejected until the next snapshot.
    pub fn invalidate(&self, symbol: &str) {
        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        books.resnapshot.insert(symbol.to_string());
    }

    /// Symbols currently flagged for a re-snapshot, sorted.
    pub fn pending_resnapshots(&self) -> Vec<String> {
        let books = self.books.read().unwrap_or_else(PoisonError::into_inner);
        let mut symbols: Vec<String> = books.resnapshot.iter().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Symbols with a book, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let books = self.books.read().unwrap_or_else(PoisonError::into_inner);
        let mut symbols: Vec<String> = books.states.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Drops everything held for `symbol`.
    pub fn remove(&self, symbol: &str) {
        let mut books = self.books.write().unwrap_or_else(PoisonError::into_inner);
        books.states.remove(symbol);
        books.resnapshot.remove(symbol);
    }
}

fn apply_levels(side: &mut BTreeMap<Decimal, Decimal>, levels: &[OrderBookLevel]) {
    for level in levels {
        if level.is_removal() {
            side.remove(&level.price);
        } else {
            side.insert(level.price, level.quantity);
        }
    }
}

fn is_crossed(bids: &BTreeMap<Decimal, Decimal>, asks: &BTreeMap<Decimal, Decimal>) -> bool {
    match (bids.last_key_value(), asks.first_key_value()) {
        (Some((bid, _)), Some((ask, _))) => bid >= ask,
        _ => false,
    }
}

/// Drops the levels farthest from the mid price until each side fits.
fn truncate(
    bids: &mut BTreeMap<Decimal, Decimal>,
    asks: &mut BTreeMap<Decimal, Decimal>,
    depth: usize,
) {
    while bids.len() > depth {
        bids.pop_first();
    }
    while asks.len() > depth {
        asks.pop_last();
    }
}

fn publish(
    symbol: &str,
    bids: &BTreeMap<Decimal, Decimal>,
    asks: &BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    timestamp: f64,
) -> OrderBookSnapshot {
    OrderBookSnapshot {
        symbol: symbol.to_string(),
        bids: bids
            .iter()
            .rev()
            .map(|(p, q)| OrderBookLevel::new(*p, *q))
            .collect(),
        asks: asks
            .iter()
            .map(|(p, q)| OrderBookLevel::new(*p, *q))
            .collect(),
        last_update_id,
        timestamp,
    }
}
