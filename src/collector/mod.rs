//! Collector lifecycle.
//!
//! A [`Collector`] owns one supervising task per venue connection. The task
//! connects, subscribes and consumes the stream, feeding trades into storage
//! and book changes into the shared [`OrderBookEngine`]. Connection-level
//! failures are retried with exponential backoff until [`RetryPolicy`] gives
//! up; failures on a single message are logged, counted and skipped.
//!
//! ```text
//!   STOPPED --start--> STARTING --subscribed--> RUNNING
//!      ^                  |  ^                     |
//!      |                  v  | backoff             | failure
//!    stop <---------- ERROR <----------------------+
//!                         |
//!                    retries exhausted (terminal)
//! ```

mod retry;
mod supervisor;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use retry::RetryPolicy;

use crate::models::{
    CacheStats, CollectorState, CollectorStatus, MarketData, Trade, TradeStatistics,
};
use crate::orderbook::OrderBookEngine;
use crate::storage::StorageGateway;
use crate::venue::{ConnectionFactory, VenueRegistry};
use crate::{DriftnetError, Result};

/// Longest symbol accepted by [`validate_symbol`].
pub const MAX_SYMBOL_LEN: usize = 32;

/// Settings for one collector.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Registered venue name, e.g. `"binance"`.
    pub venue: String,
    /// Overrides the venue's default stream endpoint.
    pub endpoint: Option<String>,
    pub symbols: Vec<String>,
    /// How often dirty trade statistics are persisted.
    pub update_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub jitter: bool,
    /// Recent trades kept per symbol and book levels kept per side.
    pub cache_size: usize,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// Longest silence tolerated before the connection is considered lost.
    pub receive_timeout: Duration,
    pub storage_timeout: Duration,
    /// How long `stop()` waits for the task before aborting it.
    pub stop_grace: Duration,
    /// Consecutive undecodable messages that escalate to a reconnect.
    pub max_decode_failures: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            venue: crate::venue::binance::VENUE.to_string(),
            endpoint: None,
            symbols: Vec::new(),
            update_interval: Duration::from_secs(1),
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            jitter: true,
            cache_size: 1_000,
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            max_decode_failures: 100,
        }
    }
}

impl CollectorConfig {
    pub fn new(venue: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            venue: venue.into(),
            symbols,
            ..Self::default()
        }
    }

    /// Checks the symbol set and numeric parameters.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Config`] naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(DriftnetError::Config("symbol set is empty".into()));
        }
        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            validate_symbol(symbol)?;
            if !seen.insert(symbol.to_uppercase()) {
                return Err(DriftnetError::Config(format!("duplicate symbol {symbol:?}")));
            }
        }

        if self.max_retries == 0 {
            return Err(DriftnetError::Config("max_retries must be at least 1".into()));
        }
        if self.cache_size == 0 {
            return Err(DriftnetError::Config("cache_size must be at least 1".into()));
        }
        if self.max_decode_failures == 0 {
            return Err(DriftnetError::Config(
                "max_decode_failures must be at least 1".into(),
            ));
        }
        let durations = [
            ("update_interval", self.update_interval),
            ("connect_timeout", self.connect_timeout),
            ("subscribe_timeout", self.subscribe_timeout),
            ("receive_timeout", self.receive_timeout),
            ("storage_timeout", self.storage_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(DriftnetError::Config(format!("{name} must be non-zero")));
        }
        if self.retry_delay > self.max_retry_delay {
            return Err(DriftnetError::Config(
                "retry_delay must not exceed max_retry_delay".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
            jitter: self.jitter,
        }
    }
}

/// Rejects symbols no venue would accept: empty, too long, characters
/// outside `[A-Za-z0-9/_.-]`, a leading or trailing separator, or a doubled
/// slash.
///
/// # Errors
///
/// [`DriftnetError::Config`] describing the problem.
pub fn validate_symbol(symbol: &str) -> Result<()> {
    let invalid = |reason: &str| Err(DriftnetError::Config(format!("invalid symbol {symbol:?}: {reason}")));

    if symbol.is_empty() {
        return invalid("empty");
    }
    if symbol.len() > MAX_SYMBOL_LEN {
        return invalid("too long");
    }
    if let Some(c) = symbol
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-')))
    {
        return invalid(&format!("unexpected character {c:?}"));
    }
    let is_separator = |c: char| !c.is_ascii_alphanumeric();
    if symbol.starts_with(is_separator) || symbol.ends_with(is_separator) {
        return invalid("leading or trailing separator");
    }
    if symbol.contains("//") {
        return invalid("doubled slash");
    }
    Ok(())
}

/// Recent trades and running statistics for one symbol.
struct SymbolCache {
    recent: VecDeque<Trade>,
    capacity: usize,
    statistics: TradeStatistics,
    /// Statistics changed since the last flush.
    dirty: bool,
}

impl SymbolCache {
    fn new(symbol: &str, capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity.min(1_024)),
            capacity,
            statistics: TradeStatistics::new(symbol),
            dirty: false,
        }
    }

    fn record(&mut self, trade: &Trade) {
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(trade.clone());
        self.statistics.record(trade);
        self.dirty = true;
    }

    fn market_data(&self, symbol: &str) -> MarketData {
        MarketData {
            symbol: symbol.to_string(),
            last_trade: self.recent.back().cloned(),
            statistics: self.statistics.clone(),
            recent_trades: self.recent.iter().cloned().collect(),
        }
    }
}

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    decode_errors: AtomicU64,
    storage_errors: AtomicU64,
    resnapshots: AtomicU64,
}

/// State shared between a [`Collector`] handle and its supervising task.
struct Shared {
    venue: String,
    status: watch::Sender<CollectorStatus>,
    counters: Counters,
    caches: DashMap<String, SymbolCache>,
    books: Arc<OrderBookEngine>,
    cache_size: usize,
}

impl Shared {
    fn update_status(&self, f: impl FnOnce(&mut CollectorStatus)) {
        self.status.send_modify(f);
    }

    fn set_state(&self, state: CollectorState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            if changed {
                debug!(venue = %self.venue, from = %status.state, to = %state, "Collector state change");
                status.state = state;
            }
            changed
        });
    }

    fn record_trades(&self, trades: &[Trade]) {
        for trade in trades {
            self.caches
                .entry(trade.symbol.clone())
                .or_insert_with(|| SymbolCache::new(&trade.symbol, self.cache_size))
                .record(trade);
        }
    }

    /// Takes every statistics summary changed since the last call.
    fn take_dirty_statistics(&self) -> Vec<TradeStatistics> {
        self.caches
            .iter_mut()
            .filter_map(|mut cache| {
                let dirty = std::mem::take(&mut cache.dirty);
                dirty.then(|| cache.statistics.clone())
            })
            .collect()
    }

    fn mark_dirty(&self, symbol: &str) {
        if let Some(mut cache) = self.caches.get_mut(symbol) {
            cache.dirty = true;
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct RunningTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Supervises one venue stream for a fixed symbol set.
///
/// `start` and `stop` are idempotent. Reads (`status`, `get_data`,
/// `get_cache_stats`, `order_books`) never block on the network.
pub struct Collector {
    config: CollectorConfig,
    factory: ConnectionFactory,
    storage: Arc<dyn StorageGateway>,
    shared: Arc<Shared>,
    task: Mutex<Option<RunningTask>>,
}

impl Collector {
    /// Creates a stopped collector using `factory` for every connection
    /// attempt.
    pub fn new(
        config: CollectorConfig,
        factory: ConnectionFactory,
        storage: Arc<dyn StorageGateway>,
    ) -> Self {
        let (status, _) = watch::channel(CollectorStatus::default());
        let shared = Arc::new(Shared {
            venue: config.venue.clone(),
            status,
            counters: Counters::default(),
            caches: DashMap::new(),
            books: Arc::new(OrderBookEngine::new(config.cache_size)),
            cache_size: config.cache_size.max(1),
        });
        Self {
            config,
            factory,
            storage,
            shared,
            task: Mutex::new(None),
        }
    }

    /// Creates a stopped collector for the venue named in `config`.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Config`] if the venue is not registered.
    pub fn from_registry(
        config: CollectorConfig,
        registry: &VenueRegistry,
        storage: Arc<dyn StorageGateway>,
    ) -> Result<Self> {
        let factory = registry.factory(&config.venue)?;
        Ok(Self::new(config, factory, storage))
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Spawns the supervising task. A no-op while a task is alive, including
    /// one backing off between attempts.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Config`] if the configuration is invalid; nothing is
    /// spawned in that case.
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!(venue = %self.config.venue, "Collector already running");
            return Ok(());
        }

        self.shared.update_status(|status| {
            status.state = CollectorState::Starting;
            status.terminal = false;
            status.attempt = 0;
            status.last_error = None;
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = supervisor::Supervisor::new(
            self.config.clone(),
            self.factory.clone(),
            self.storage.clone(),
            self.shared.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(supervisor.run());
        info!(venue = %self.config.venue, symbols = ?self.config.symbols, "Collector started");

        *task = Some(RunningTask { handle, shutdown });
        Ok(())
    }

    /// Signals the task to stop, waits up to `stop_grace`, then aborts it.
    /// Always leaves the collector Stopped; stored data is kept.
    pub async fn stop(&self) {
        let running = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(RunningTask { mut handle, shutdown }) = running {
            if !handle.is_finished() {
                self.shared.set_state(CollectorState::Stopping);
                let _ = shutdown.send(true);
                if tokio::time::timeout(self.config.stop_grace, &mut handle)
                    .await
                    .is_err()
                {
                    warn!(
                        venue = %self.config.venue,
                        grace_ms = self.config.stop_grace.as_millis() as u64,
                        "Collector did not stop in time, aborting"
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
            info!(venue = %self.config.venue, "Collector stopped");
        }

        self.shared.update_status(|status| {
            status.state = CollectorState::Stopped;
            status.terminal = false;
        });
    }

    /// Current state and counters.
    pub fn status(&self) -> CollectorStatus {
        let mut status = self.shared.status.borrow().clone();
        let counters = &self.shared.counters;
        status.messages_received = counters.messages_received.load(Ordering::Relaxed);
        status.decode_errors = counters.decode_errors.load(Ordering::Relaxed);
        status.storage_errors = counters.storage_errors.load(Ordering::Relaxed);
        status.resnapshots = counters.resnapshots.load(Ordering::Relaxed);
        status
    }

    /// Receiver notified on every state transition. Counters in the watched
    /// value are not kept current; use [`status`](Self::status) for those.
    pub fn watch_status(&self) -> watch::Receiver<CollectorStatus> {
        self.shared.status.subscribe()
    }

    /// Latest trade, statistics and recent trades for `symbol`.
    ///
    /// Data is kept under the symbol as the venue reports it; a lookup that
    /// differs only in ASCII case finds it too, and the returned
    /// [`MarketData::symbol`] carries the venue's spelling.
    pub fn get_data(&self, symbol: &str) -> Option<MarketData> {
        if let Some(cache) = self.shared.caches.get(symbol) {
            return Some(cache.market_data(symbol));
        }
        self.shared
            .caches
            .iter()
            .find(|entry| entry.key().eq_ignore_ascii_case(symbol))
            .map(|entry| entry.value().market_data(entry.key()))
    }

    /// Recent-trade buffer occupancy per symbol.
    pub fn get_cache_stats(&self) -> HashMap<String, CacheStats> {
        self.shared
            .caches
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    CacheStats {
                        buffered: entry.recent.len(),
                        capacity: entry.capacity,
                    },
                )
            })
            .collect()
    }

    /// Books reconstructed from this collector's stream.
    pub fn order_books(&self) -> Arc<OrderBookEngine> {
        self.shared.books.clone()
    }

    pub fn storage(&self) -> Arc<dyn StorageGateway> {
        self.storage.clone()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = task.take() {
            running.handle.abort();
        }
    }
}
