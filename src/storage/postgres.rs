//! Relational time-series backend on PostgreSQL.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tokio::sync::RwLock;
use tracing::info;

use super::{StorageGateway, TradeQuery};
use crate::models::{Side, Trade, TradeStatistics};
use crate::{DriftnetError, Result};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS trades (
        seq        BIGSERIAL,
        exchange   TEXT NOT NULL,
        symbol     TEXT NOT NULL,
        trade_id   TEXT NOT NULL,
        price      NUMERIC NOT NULL,
        quantity   NUMERIC NOT NULL,
        ts         DOUBLE PRECISION NOT NULL,
        side       TEXT NOT NULL,
        is_maker   BOOLEAN NOT NULL,
        PRIMARY KEY (exchange, symbol, trade_id)
    )
    ",
    r"CREATE INDEX IF NOT EXISTS trades_symbol_ts_idx ON trades (symbol, ts, seq)",
    r"
    CREATE TABLE IF NOT EXISTS trade_statistics (
        symbol     TEXT PRIMARY KEY,
        stats      JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
];

#[derive(FromRow)]
struct TradeRow {
    exchange: String,
    symbol: String,
    trade_id: String,
    price: Decimal,
    quantity: Decimal,
    ts: f64,
    side: String,
    is_maker: bool,
}

impl TryFrom<TradeRow> for Trade {
    type Error = DriftnetError;

    fn try_from(row: TradeRow) -> Result<Self> {
        Ok(Trade {
            exchange: row.exchange,
            symbol: row.symbol,
            price: row.price,
            quantity: row.quantity,
            timestamp: row.ts,
            side: Side::from_str(&row.side)
                .map_err(|e| DriftnetError::Storage(format!("corrupt trade row: {e}")))?,
            trade_id: row.trade_id,
            is_maker: row.is_maker,
        })
    }
}

/// One time bucket of aggregated trades.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TradeBucket {
    /// Bucket start in epoch seconds.
    pub bucket_start: f64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: i64,
}

/// PostgreSQL-backed store. The only backend whose data survives a
/// process restart.
///
/// Trades are keyed by `(exchange, symbol, trade_id)`; re-inserting a known
/// trade is a no-op. A `BIGSERIAL` column records insertion order so trades
/// sharing a timestamp come back in the order they were stored.
pub struct PostgresStorage {
    database_url: String,
    max_connections: u32,
    acquire_timeout: Duration,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresStorage {
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            pool: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    async fn pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| DriftnetError::Storage("postgres storage is not connected".into()))
    }

    /// Aggregates trades for `symbol` in `[start, end]` into buckets of
    /// `bucket` width with open/high/low/close, volume and count.
    ///
    /// # Errors
    ///
    /// Returns [`DriftnetError::Storage`] if not connected or the query fails.
    pub async fn aggregate_trades(
        &self,
        symbol: &str,
        bucket: Duration,
        start: f64,
        end: f64,
    ) -> Result<Vec<TradeBucket>> {
        let width = bucket.as_secs_f64();
        if width <= 0.0 {
            return Err(DriftnetError::Storage("bucket width must be positive".into()));
        }

        let pool = self.pool().await?;
        let buckets = sqlx::query_as::<_, TradeBucket>(
            r"
            SELECT floor(ts / $2) * $2                              AS bucket_start,
                   (array_agg(price ORDER BY ts, seq))[1]           AS open,
                   max(price)                                       AS high,
                   min(price)                                       AS low,
                   (array_agg(price ORDER BY ts DESC, seq DESC))[1] AS close,
                   sum(quantity)                                    AS volume,
                   count(*)                                         AS trade_count
            FROM trades
            WHERE symbol = $1 AND ts >= $3 AND ts <= $4
            GROUP BY bucket_start
            ORDER BY bucket_start
            ",
        )
        .bind(symbol)
        .bind(width)
        .bind(start)
        .bind(end)
        .fetch_all(&pool)
        .await?;

        Ok(buckets)
    }
}

#[async_trait]
impl StorageGateway for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.database_url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!(max_connections = self.max_connections, "Connected to postgres storage");

        *slot = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("Disconnected from postgres storage");
        }
        Ok(())
    }

    async fn store_trades(&self, symbol: &str, trades: &[Trade]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }

        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;
        for trade in trades {
            sqlx::query(
                r"
                INSERT INTO trades
                    (exchange, symbol, trade_id, price, quantity, ts, side, is_maker)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (exchange, symbol, trade_id) DO NOTHING
                ",
            )
            .bind(&trade.exchange)
            .bind(symbol)
            .bind(&trade.trade_id)
            .bind(trade.price)
            .bind(trade.quantity)
            .bind(trade.timestamp)
            .bind(trade.side.as_str())
            .bind(trade.is_maker)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn get_trades(&self, symbol: &str, query: TradeQuery) -> Result<Vec<Trade>> {
        let pool = self.pool().await?;
        let limit = query.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

        let rows = sqlx::query_as::<_, TradeRow>(
            r"
            SELECT exchange, symbol, trade_id, price, quantity, ts, side, is_maker
            FROM (
                SELECT exchange, symbol, trade_id, price, quantity, ts, side, is_maker, seq
                FROM trades
                WHERE symbol = $1
                  AND ($2::DOUBLE PRECISION IS NULL OR ts >= $2)
                  AND ($3::DOUBLE PRECISION IS NULL OR ts <= $3)
                ORDER BY ts DESC, seq DESC
                LIMIT $4
            ) recent
            ORDER BY ts ASC, seq ASC
            ",
        )
        .bind(symbol)
        .bind(query.start)
        .bind(query.end)
        .bind(limit)
        .fetch_all(&pool)
        .await?;

        rows.into_iter().map(Trade::try_from).collect()
    }

    async fn store_statistics(&self, symbol: &str, stats: &TradeStatistics) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query(
            r"
            INSERT INTO trade_statistics (symbol, stats, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (symbol) DO UPDATE
                SET stats = EXCLUDED.stats, updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(symbol)
        .bind(Json(stats))
        .execute(&pool)
        .await?;

        Ok(())
    }

    async fn get_statistics(&self, symbol: &str) -> Result<Option<TradeStatistics>> {
        let pool = self.pool().await?;
        let row: Option<(Json<TradeStatistics>,)> =
            sqlx::query_as("SELECT stats FROM trade_statistics WHERE symbol = $1")
                .bind(symbol)
                .fetch_optional(&pool)
                .await?;

        Ok(row.map(|(Json(stats),)| stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_before_connect_fail_with_storage_error() {
        let storage = PostgresStorage::new("postgres://localhost/driftnet");
        let err = storage
            .get_trades("BTCUSDT", TradeQuery::all())
            .await
            .unwrap_err();
        assert!(matches!(err, DriftnetError::Storage(_)));
        assert!(storage.get_statistics("BTCUSDT").await.is_err());
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_safe() {
        let storage = PostgresStorage::new("postgres://localhost/driftnet");
        storage.disconnect().await.unwrap();
        storage.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn aggregate_rejects_zero_bucket() {
        let storage = PostgresStorage::new("postgres://localhost/driftnet");
        let err = storage
            .aggregate_trades("BTCUSDT", Duration::ZERO, 0.0, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, DriftnetError::Storage(_)));
    }

    #[test]
    fn corrupt_side_is_a_storage_error() {
        let row = TradeRow {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            trade_id: "1".into(),
            price: Decimal::ONE,
            quantity: Decimal::ONE,
            ts: 1.0,
            side: "sideways".into(),
            is_maker: false,
        };
        assert!(matches!(Trade::try_from(row), Err(DriftnetError::Storage(_))));
    }
}
