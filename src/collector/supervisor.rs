//! The supervising task behind a [`Collector`](super::Collector).
//!
//! One connection attempt is connect, subscribe, then consume until the
//! stream fails or shutdown is requested. Failed attempts back off according
//! to the [`RetryPolicy`]; a successful subscribe resets the attempt count.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{CollectorConfig, RetryPolicy, Shared};
use crate::error::with_timeout;
use crate::models::{BookDelta, CollectorState, NormalizedEvent, OrderBookSnapshot, Trade};
use crate::orderbook::ApplyOutcome;
use crate::storage::StorageGateway;
use crate::venue::{ConnectionFactory, StreamConnection};
use crate::{DriftnetError, Result};

/// Consecutive failed re-snapshots of one symbol that fail the connection.
/// A snapshot that never arrives or that the venue refuses counts as failed.
const MAX_SNAPSHOT_FAILURES: u32 = 2;

/// Why a connection attempt ended.
enum Exit {
    Shutdown,
    Failed(DriftnetError),
}

/// What woke the consume loop.
enum Wake {
    Shutdown,
    Flush,
    Frame(Result<Option<String>>),
    SnapshotOverdue,
    Idle,
}

pub(super) struct Supervisor {
    config: CollectorConfig,
    retry: RetryPolicy,
    factory: ConnectionFactory,
    storage: Arc<dyn StorageGateway>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    /// Symbols waiting for a snapshot delivered on the stream, with the
    /// instant it is given up on.
    awaiting_snapshot: HashMap<String, Instant>,
    snapshot_failures: HashMap<String, u32>,
    decode_failures: u32,
}

/// Resolves once shutdown is requested or the collector handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Supervisor {
    pub(super) fn new(
        config: CollectorConfig,
        factory: ConnectionFactory,
        storage: Arc<dyn StorageGateway>,
        shared: Arc<Shared>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            retry: config.retry_policy(),
            config,
            factory,
            storage,
            shared,
            shutdown,
            awaiting_snapshot: HashMap::new(),
            snapshot_failures: HashMap::new(),
            decode_failures: 0,
        }
    }

    /// Runs connection attempts until shutdown or until retries run out.
    pub(super) async fn run(mut self) {
        let venue = self.config.venue.clone();
        let mut attempt: u32 = 0;

        loop {
            self.shared.update_status(|status| {
                status.state = CollectorState::Starting;
                status.attempt = attempt;
            });

            let mut conn = (self.factory)();
            let endpoint = self
                .config
                .endpoint
                .clone()
                .unwrap_or_else(|| conn.default_endpoint().to_string());
            info!(venue = %venue, endpoint, attempt, "Connecting");

            let exit = match self.establish(conn.as_mut(), &endpoint).await {
                Ok(true) => {
                    attempt = 0;
                    self.shared.update_status(|status| {
                        status.state = CollectorState::Running;
                        status.attempt = 0;
                        status.last_error = None;
                    });
                    info!(venue = %venue, "Collector running");
                    self.consume(conn.as_mut()).await
                }
                Ok(false) => Exit::Shutdown,
                Err(e) => Exit::Failed(e),
            };
            conn.close().await;

            let e = match exit {
                Exit::Shutdown => break,
                Exit::Failed(e) => e,
            };

            attempt += 1;
            let cause = e.to_string();
            if self.retry.exhausted(attempt) {
                error!(venue = %venue, attempt, error = %e, "Retries exhausted, giving up");
                self.shared.update_status(|status| {
                    status.state = CollectorState::Error;
                    status.terminal = true;
                    status.attempt = attempt;
                    status.last_error = Some(cause);
                });
                return;
            }

            let backoff = self.retry.delay(attempt);
            warn!(
                venue = %venue,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %e,
                "Connection failed, backing off"
            );
            self.shared.update_status(|status| {
                status.state = CollectorState::Error;
                status.attempt = attempt;
                status.last_error = Some(cause);
            });

            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = shutdown_requested(&mut self.shutdown) => break,
            }
        }

        info!(venue = %venue, "Supervisor exiting");
    }

    /// Connects and subscribes. `Ok(false)` if shutdown was requested first.
    async fn establish(&mut self, conn: &mut dyn StreamConnection, endpoint: &str) -> Result<bool> {
        let stream_ids = conn.stream_ids(&self.config.symbols);
        let connect_timeout = self.config.connect_timeout;
        let subscribe_timeout = self.config.subscribe_timeout;

        let establish = async {
            with_timeout("connect", connect_timeout, conn.connect(endpoint)).await?;
            with_timeout("subscribe", subscribe_timeout, conn.subscribe(&stream_ids)).await
        };

        let result = tokio::select! {
            result = establish => result.map(|()| true),
            () = shutdown_requested(&mut self.shutdown) => Ok(false),
        };

        if matches!(result, Ok(true)) {
            // Books from an earlier connection cannot be continued.
            for symbol in self.shared.books.symbols() {
                self.shared.books.invalidate(&symbol);
            }
            self.awaiting_snapshot.clear();
            self.snapshot_failures.clear();
            self.decode_failures = 0;
        }
        result
    }

    async fn consume(&mut self, conn: &mut dyn StreamConnection) -> Exit {
        let receive_timeout = self.config.receive_timeout;
        let mut flush = tokio::time::interval(self.config.update_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.reset();
        let idle = tokio::time::sleep(receive_timeout);
        tokio::pin!(idle);

        loop {
            let snapshot_deadline = self.awaiting_snapshot.values().min().copied();
            let wake = tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => Wake::Shutdown,
                _ = flush.tick() => Wake::Flush,
                () = sleep_until_some(snapshot_deadline) => Wake::SnapshotOverdue,
                frame = conn.receive() => Wake::Frame(frame),
                () = &mut idle => Wake::Idle,
            };

            match wake {
                Wake::Shutdown => {
                    self.flush_statistics().await;
                    return Exit::Shutdown;
                }
                Wake::Flush => self.flush_statistics().await,
                Wake::Frame(Ok(Some(raw))) => {
                    idle.as_mut().reset(Instant::now() + receive_timeout);
                    if let Err(e) = self.handle_frame(conn, &raw).await {
                        self.flush_statistics().await;
                        return Exit::Failed(e);
                    }
                }
                Wake::Frame(Ok(None)) => {
                    self.flush_statistics().await;
                    return Exit::Failed(DriftnetError::Connection(
                        "stream closed by venue".into(),
                    ));
                }
                Wake::Frame(Err(e)) => return Exit::Failed(e),
                Wake::SnapshotOverdue => {
                    if let Err(e) = self.expire_snapshots(conn).await {
                        self.flush_statistics().await;
                        return Exit::Failed(e);
                    }
                }
                Wake::Idle => {
                    return Exit::Failed(DriftnetError::Timeout {
                        operation: "receive",
                        after: receive_timeout,
                    });
                }
            }
        }
    }

    /// Handles one raw frame. Only connection-level problems are returned.
    async fn handle_frame(&mut self, conn: &mut dyn StreamConnection, raw: &str) -> Result<()> {
        Shared::bump(&self.shared.counters.messages_received);

        let event = match conn.decode(raw) {
            Ok(event) => {
                self.decode_failures = 0;
                event
            }
            Err(e) => {
                Shared::bump(&self.shared.counters.decode_errors);
                self.decode_failures += 1;
                warn!(
                    venue = %self.config.venue,
                    error = %e,
                    consecutive = self.decode_failures,
                    "Dropping undecodable message"
                );
                if self.decode_failures >= self.config.max_decode_failures {
                    return Err(DriftnetError::Connection(format!(
                        "{} consecutive messages failed to decode",
                        self.decode_failures
                    )));
                }
                return Ok(());
            }
        };

        match event {
            None => Ok(()),
            Some(NormalizedEvent::Trades(trades)) => {
                self.handle_trades(&trades).await;
                Ok(())
            }
            Some(NormalizedEvent::BookSnapshot(snapshot)) => {
                let symbol = snapshot.symbol.clone();
                self.awaiting_snapshot.remove(&symbol);
                self.apply_snapshot(&symbol, snapshot)
            }
            Some(NormalizedEvent::BookDelta(delta)) => self.handle_delta(conn, delta).await,
            Some(NormalizedEvent::BookRejected { symbol, reason }) => {
                if self.awaiting_snapshot.remove(&symbol).is_none() {
                    warn!(
                        symbol = %symbol,
                        reason = %reason,
                        "Ignoring book rejection without a pending snapshot"
                    );
                    return Ok(());
                }
                self.retry_stream_snapshot(conn, &symbol, DriftnetError::Subscription(reason))
                    .await
            }
        }
    }

    async fn handle_trades(&self, trades: &[Trade]) {
        self.shared.record_trades(trades);

        for batch in trades.chunk_by(|a, b| a.symbol == b.symbol) {
            let symbol = batch[0].symbol.as_str();
            let stored = with_timeout(
                "store_trades",
                self.config.storage_timeout,
                self.storage.store_trades(symbol, batch),
            )
            .await;
            if let Err(e) = stored {
                Shared::bump(&self.shared.counters.storage_errors);
                warn!(
                    venue = %self.config.venue,
                    symbol,
                    count = batch.len(),
                    error = %e,
                    "Failed to store trades"
                );
            }
        }
    }

    async fn handle_delta(&mut self, conn: &mut dyn StreamConnection, delta: BookDelta) -> Result<()> {
        if self.awaiting_snapshot.contains_key(&delta.symbol) {
            debug!(symbol = %delta.symbol, "Snapshot pending, dropping book update");
            return Ok(());
        }

        let had_book = self.shared.books.get_book(&delta.symbol).is_some();
        match self.shared.books.apply_update(&delta) {
            Ok(ApplyOutcome::Applied | ApplyOutcome::Stale) => Ok(()),
            Err(e) => {
                if had_book {
                    warn!(symbol = %delta.symbol, error = %e, "Book update rejected");
                } else {
                    debug!(symbol = %delta.symbol, "No book yet, requesting snapshot");
                }
                self.resnapshot(conn, &delta.symbol, Some(&delta)).await
            }
        }
    }

    /// Requests a fresh book for `symbol` once. A snapshot served out of
    /// band is followed by `trigger`, the update that could not be applied,
    /// so the book does not lose it.
    async fn resnapshot(
        &mut self,
        conn: &mut dyn StreamConnection,
        symbol: &str,
        trigger: Option<&BookDelta>,
    ) -> Result<()> {
        Shared::bump(&self.shared.counters.resnapshots);

        let requested = with_timeout(
            "request_snapshot",
            self.config.connect_timeout,
            conn.request_snapshot(symbol),
        )
        .await;

        match requested {
            Ok(Some(snapshot)) => {
                let update_id = match self.shared.books.apply_snapshot(symbol, snapshot) {
                    Ok(book) => book.last_update_id,
                    Err(e) => return self.snapshot_failed(symbol, e),
                };
                if let Some(delta) = trigger {
                    if let Err(e) = self.shared.books.apply_update(delta) {
                        // The snapshot cannot be continued by the stream.
                        return self.snapshot_failed(symbol, e);
                    }
                }
                self.snapshot_failures.remove(symbol);
                debug!(symbol, update_id, "Book restored from snapshot");
                Ok(())
            }
            Ok(None) => {
                debug!(symbol, "Snapshot will arrive on the stream");
                let deadline = Instant::now() + self.config.subscribe_timeout;
                self.awaiting_snapshot.insert(symbol.to_string(), deadline);
                Ok(())
            }
            Err(e) => self.snapshot_failed(symbol, e),
        }
    }

    /// Gives up on stream snapshots whose deadline has passed.
    async fn expire_snapshots(&mut self, conn: &mut dyn StreamConnection) -> Result<()> {
        let now = Instant::now();
        let overdue: Vec<String> = self
            .awaiting_snapshot
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        for symbol in overdue {
            self.awaiting_snapshot.remove(&symbol);
            let e = DriftnetError::Timeout {
                operation: "stream snapshot",
                after: self.config.subscribe_timeout,
            };
            self.retry_stream_snapshot(conn, &symbol, e).await?;
        }
        Ok(())
    }

    /// Counts a stream snapshot that never came or was refused, then asks
    /// for another.
    async fn retry_stream_snapshot(
        &mut self,
        conn: &mut dyn StreamConnection,
        symbol: &str,
        e: DriftnetError,
    ) -> Result<()> {
        self.snapshot_failed(symbol, e)?;
        self.resnapshot(conn, symbol, None).await
    }

    fn apply_snapshot(&mut self, symbol: &str, snapshot: OrderBookSnapshot) -> Result<()> {
        match self.shared.books.apply_snapshot(symbol, snapshot) {
            Ok(book) => {
                self.snapshot_failures.remove(symbol);
                debug!(symbol, update_id = book.last_update_id, "Book restored from snapshot");
                Ok(())
            }
            Err(e) => self.snapshot_failed(symbol, e),
        }
    }

    fn snapshot_failed(&mut self, symbol: &str, e: DriftnetError) -> Result<()> {
        let failures = self.snapshot_failures.entry(symbol.to_string()).or_default();
        *failures += 1;
        self.shared.books.invalidate(symbol);
        warn!(symbol, failures = *failures, error = %e, "Re-snapshot failed");

        if *failures >= MAX_SNAPSHOT_FAILURES {
            return Err(DriftnetError::Connection(format!(
                "re-snapshot of {symbol} failed {failures} times in a row: {e}"
            )));
        }
        Ok(())
    }

    async fn flush_statistics(&self) {
        for stats in self.shared.take_dirty_statistics() {
            let stored = with_timeout(
                "store_statistics",
                self.config.storage_timeout,
                self.storage.store_statistics(&stats.symbol, &stats),
            )
            .await;
            if let Err(e) = stored {
                Shared::bump(&self.shared.counters.storage_errors);
                self.shared.mark_dirty(&stats.symbol);
                warn!(symbol = %stats.symbol, error = %e, "Failed to store statistics");
            }
        }
    }
}
