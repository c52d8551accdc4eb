//! Expiring key-value backend.
//!
//! Entries live in a sharded [`DashMap`] and expire `ttl` after they were
//! written, independent of how many are held. A count cap applies on top.
//! Expired entries are never returned; a background sweeper started by
//! [`connect`](StorageGateway::connect) reclaims their memory.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{DEFAULT_CAPACITY, StorageGateway, TradeQuery};
use crate::Result;
use crate::models::{Trade, TradeStatistics};

/// Default time-to-live of stored entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

struct Entry<T> {
    stored_at: Instant,
    value: T,
}

struct TtlInner {
    ttl: Duration,
    capacity: usize,
    trades: DashMap<String, VecDeque<Entry<Trade>>>,
    statistics: DashMap<String, Entry<TradeStatistics>>,
}

impl TtlInner {
    fn is_live(&self, stored_at: Instant, now: Instant) -> bool {
        now.duration_since(stored_at) < self.ttl
    }

    /// Drops expired entries everywhere and returns how many were removed.
    fn purge(&self, now: Instant) -> usize {
        let mut removed = 0;
        for mut buffer in self.trades.iter_mut() {
            while buffer
                .front()
                .is_some_and(|e| !self.is_live(e.stored_at, now))
            {
                buffer.pop_front();
                removed += 1;
            }
        }
        self.trades.retain(|_, buffer| !buffer.is_empty());

        let before = self.statistics.len();
        self.statistics
            .retain(|_, entry| self.is_live(entry.stored_at, now));
        removed + (before - self.statistics.len())
    }
}

/// Key-value store with per-entry expiry.
pub struct TtlStorage {
    inner: Arc<TtlInner>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TtlStorage {
    /// Creates a store expiring entries after `ttl` and keeping at most
    /// `capacity` trades per symbol.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(TtlInner {
                ttl,
                capacity: capacity.max(1),
                trades: DashMap::new(),
                statistics: DashMap::new(),
            }),
            sweep_interval: (ttl / 2).max(Duration::from_millis(100)),
            sweeper: Mutex::new(None),
        }
    }

    /// Overrides how often the background sweeper runs.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Number of entries physically held for `symbol`, expired or not.
    pub fn raw_len(&self, symbol: &str) -> usize {
        self.inner.trades.get(symbol).map_or(0, |b| b.len())
    }

    /// Removes every expired entry now.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge(Instant::now())
    }
}

impl Default for TtlStorage {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl Drop for TtlStorage {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl StorageGateway for TtlStorage {
    fn name(&self) -> &'static str {
        "ttl"
    }

    async fn connect(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let interval = self.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = inner.purge(Instant::now());
                if removed > 0 {
                    debug!(removed, "Purged expired entries");
                }
            }
        }));
        info!(ttl_secs = self.inner.ttl.as_secs_f64(), "TTL store sweeper started");

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("TTL store sweeper stopped");
        }
        Ok(())
    }

    async fn store_trades(&self, symbol: &str, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let mut buffer = self.inner.trades.entry(symbol.to_string()).or_default();
        for trade in trades {
            if buffer.len() == self.inner.capacity {
                buffer.pop_front();
            }
            buffer.push_back(Entry {
                stored_at: now,
                value: trade.clone(),
            });
        }

        Ok(())
    }

    async fn get_trades(&self, symbol: &str, query: TradeQuery) -> Result<Vec<Trade>> {
        let now = Instant::now();
        Ok(self
            .inner
            .trades
            .get(symbol)
            .map(|buffer| {
                query.select(
                    buffer
                        .iter()
                        .filter(|e| self.inner.is_live(e.stored_at, now))
                        .map(|e| &e.value),
                )
            })
            .unwrap_or_default())
    }

    async fn store_statistics(&self, symbol: &str, stats: &TradeStatistics) -> Result<()> {
        self.inner.statistics.insert(
            symbol.to_string(),
            Entry {
                stored_at: Instant::now(),
                value: stats.clone(),
            },
        );
        Ok(())
    }

    async fn get_statistics(&self, symbol: &str) -> Result<Option<TradeStatistics>> {
        let now = Instant::now();
        Ok(self
            .inner
            .statistics
            .get(symbol)
            .filter(|entry| self.inner.is_live(entry.stored_at, now))
            .map(|entry| entry.value.clone()))
    }
}
