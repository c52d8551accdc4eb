//! Binance spot market data adapter.
//!
//! Streams used per symbol: `<symbol>@trade` and `<symbol>@depth@100ms`.
//! Prices and quantities arrive as decimal strings, event times in
//! milliseconds. Books are recovered from the REST depth endpoint and
//! stitched to the diff stream through the `U`/`u` update ids.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{StreamConnection, parse_decimal};
use crate::models::{BookDelta, NormalizedEvent, OrderBookLevel, OrderBookSnapshot, Side, Trade};
use crate::websocket::{SubscribeRequest, WsSession, await_ack, binance_ack_verdict};
use crate::{DriftnetError, Result};

/// Venue name stamped on Binance trades.
pub const VENUE: &str = "binance";

/// Default public stream endpoint.
pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Default REST endpoint for depth snapshots.
pub const BINANCE_REST_URL: &str = "https://api.binance.com";

/// Depth requested from the REST snapshot endpoint.
const DEFAULT_SNAPSHOT_LIMIT: u16 = 1000;

/// A `trade` stream event.
#[derive(Debug, Deserialize)]
struct TradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    /// Trade time in milliseconds.
    #[serde(rename = "T")]
    trade_time: u64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// An `aggTrade` stream event.
#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: u64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// A `depthUpdate` diff stream event.
#[derive(Debug, Deserialize)]
struct DepthUpdateEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

/// Response of `GET /api/v3/depth`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthSnapshot {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Binance adapter.
///
/// `is_maker` carries Binance's `m` flag (the buyer was the maker), in which
/// case the aggressor, and so the trade side, is the seller.
pub struct BinanceConnection {
    rest_url: String,
    snapshot_limit: u16,
    http: reqwest::Client,
    session: Option<WsSession>,
    next_request_id: u64,
}

impl BinanceConnection {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rest_url(BINANCE_REST_URL)
    }

    /// An adapter fetching depth snapshots from `rest_url`.
    #[must_use]
    pub fn with_rest_url(rest_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            http,
            session: None,
            next_request_id: 1,
        }
    }

    #[must_use]
    pub fn with_snapshot_limit(mut self, limit: u16) -> Self {
        self.snapshot_limit = limit;
        self
    }

    fn session(&mut self) -> Result<&mut WsSession> {
        self.session
            .as_mut()
            .ok_or_else(|| DriftnetError::Connection("binance stream is not connected".into()))
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

impl Default for BinanceConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamConnection for BinanceConnection {
    fn venue(&self) -> &str {
        VENUE
    }

    fn default_endpoint(&self) -> &str {
        BINANCE_WS_URL
    }

    fn stream_ids(&self, symbols: &[String]) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|symbol| {
                let lower = symbol.to_lowercase();
                [format!("{lower}@trade"), format!("{lower}@depth@100ms")]
            })
            .collect()
    }

    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.close().await;
        self.session = Some(WsSession::open(endpoint).await?);
        info!(venue = VENUE, endpoint, "Connected");
        Ok(())
    }

    async fn subscribe(&mut self, stream_ids: &[String]) -> Result<()> {
        let id = self.request_id();
        let session = self.session()?;
        session.send_json(&SubscribeRequest::new(stream_ids, id)).await?;
        await_ack(session, |value| binance_ack_verdict(value, id)).await?;
        info!(venue = VENUE, ?stream_ids, "Subscribed to streams");
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        self.session()?.next_text().await
    }

    fn decode(&self, raw: &str) -> Result<Option<NormalizedEvent>> {
        let value: Value = serde_json::from_str(raw)?;

        // Combined streams wrap each event as {"stream": ..., "data": {...}}.
        let event = match (value.get("stream"), value.get("data")) {
            (Some(_), Some(data)) => data.clone(),
            _ => value,
        };

        let event_type = event.get("e").and_then(Value::as_str).map(str::to_owned);
        match event_type.as_deref() {
            Some("trade") => {
                let event: TradeEvent = serde_json::from_value(event)?;
                Ok(Some(NormalizedEvent::Trades(vec![trade_from_event(event)?])))
            }
            Some("aggTrade") => {
                let event: AggTradeEvent = serde_json::from_value(event)?;
                Ok(Some(NormalizedEvent::Trades(vec![agg_trade_from_event(event)?])))
            }
            Some("depthUpdate") => {
                let event: DepthUpdateEvent = serde_json::from_value(event)?;
                Ok(Some(NormalizedEvent::BookDelta(delta_from_event(event)?)))
            }
            Some(other) => {
                debug!(venue = VENUE, event = other, "Ignoring unsupported event");
                Ok(None)
            }
            // Replies to requests and anything else without an event type.
            None => Ok(None),
        }
    }

    async fn request_snapshot(&mut self, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        let url = format!("{}/api/v3/depth", self.rest_url);
        let limit = self.snapshot_limit.to_string();
        let snapshot: DepthSnapshot = self
            .http
            .get(&url)
            .query(&[("symbol", symbol.to_uppercase().as_str()), ("limit", limit.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(
            venue = VENUE,
            symbol,
            update_id = snapshot.last_update_id,
            "Fetched depth snapshot"
        );

        Ok(Some(OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: parse_levels(&snapshot.bids)?,
            asks: parse_levels(&snapshot.asks)?,
            last_update_id: snapshot.last_update_id,
            timestamp: crate::models::now_epoch_secs(),
        }))
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

fn millis_to_secs(millis: u64) -> f64 {
    millis as f64 / 1_000.0
}

fn taker_side(buyer_is_maker: bool) -> Side {
    if buyer_is_maker { Side::Sell } else { Side::Buy }
}

fn trade_from_event(event: TradeEvent) -> Result<Trade> {
    Ok(Trade {
        exchange: VENUE.to_string(),
        price: parse_decimal("price", &event.price)?,
        quantity: parse_decimal("quantity", &event.quantity)?,
        timestamp: millis_to_secs(event.trade_time),
        side: taker_side(event.buyer_is_maker),
        trade_id: event.trade_id.to_string(),
        is_maker: event.buyer_is_maker,
        symbol: event.symbol,
    })
}

fn agg_trade_from_event(event: AggTradeEvent) -> Result<Trade> {
    Ok(Trade {
        exchange: VENUE.to_string(),
        price: parse_decimal("price", &event.price)?,
        quantity: parse_decimal("quantity", &event.quantity)?,
        timestamp: millis_to_secs(event.trade_time),
        side: taker_side(event.buyer_is_maker),
        trade_id: format!("a{}", event.agg_id),
        is_maker: event.buyer_is_maker,
        symbol: event.symbol,
    })
}

fn delta_from_event(event: DepthUpdateEvent) -> Result<BookDelta> {
    Ok(BookDelta {
        first_update_id: event.first_update_id,
        last_update_id: event.final_update_id,
        bids: parse_levels(&event.bids)?,
        asks: parse_levels(&event.asks)?,
        timestamp: millis_to_secs(event.event_time),
        symbol: event.symbol,
    })
}

fn parse_levels(levels: &[[String; 2]]) -> Result<Vec<OrderBookLevel>> {
    levels
        .iter()
        .map(|[price, qty]| {
            Ok(OrderBookLevel::new(
                parse_decimal("level price", price)?,
                parse_decimal("level quantity", qty)?,
            ))
        })
        .collect()
}
