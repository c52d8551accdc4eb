//! Kraken WebSocket v2 market data adapter.
//!
//! Kraken subscribes per channel (`trade`, `book`) with a list of symbols and
//! acknowledges every symbol separately. Book messages carry no update ids,
//! so the adapter numbers them per symbol in arrival order; a `snapshot`
//! restarts the book and every `update` follows it contiguously. Recovering
//! a book means re-subscribing the `book` channel, which replays a snapshot
//! on the stream; a refused re-subscribe surfaces as
//! [`NormalizedEvent::BookRejected`] for that symbol.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::DateTime;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::StreamConnection;
use crate::models::{
    BookDelta, NormalizedEvent, OrderBookLevel, OrderBookSnapshot, Side, Trade, now_epoch_secs,
};
use crate::websocket::{AckVerdict, WsSession, await_ack};
use crate::{DriftnetError, Result};

/// Venue name stamped on Kraken trades.
pub const VENUE: &str = "kraken";

/// Default public v2 endpoint.
pub const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";

/// Book depths Kraken accepts on the `book` channel.
pub const BOOK_DEPTHS: [u32; 5] = [10, 25, 100, 500, 1000];

const TRADE_CHANNEL: &str = "trade";
const BOOK_CHANNEL: &str = "book";

/// Channel parameters of a subscribe or unsubscribe request.
#[derive(Debug, Serialize)]
struct ChannelParams {
    channel: String,
    symbol: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ChannelRequest {
    method: &'static str,
    params: ChannelParams,
    req_id: u64,
}

#[derive(Debug, Deserialize)]
struct ChannelMessage<T> {
    #[serde(rename = "type")]
    tpe: String,
    data: Vec<T>,
}

/// A single executed trade on the `trade` channel.
#[derive(Debug, Deserialize)]
struct TradeData {
    symbol: String,
    side: String,
    price: Decimal,
    qty: Decimal,
    trade_id: u64,
    timestamp: String,
}

/// Book snapshot or update for one symbol.
#[derive(Debug, Deserialize)]
struct BookData {
    symbol: String,
    #[serde(default)]
    bids: Vec<PriceLevel>,
    #[serde(default)]
    asks: Vec<PriceLevel>,
    /// Present on updates only.
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PriceLevel {
    price: Decimal,
    qty: Decimal,
}

impl From<PriceLevel> for OrderBookLevel {
    fn from(level: PriceLevel) -> Self {
        OrderBookLevel::new(level.price, level.qty)
    }
}

/// Kraken v2 adapter.
///
/// Kraken does not say whether the trade was against a resting order of
/// ours, so `is_maker` is always `false`; `side` is the taker side.
pub struct KrakenConnection {
    book_depth: u32,
    session: Option<WsSession>,
    next_req_id: u64,
    sequences: DashMap<String, u64>,
    /// Book re-subscribes awaiting their reply, by `req_id`.
    book_requests: DashMap<u64, String>,
}

impl KrakenConnection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            book_depth: 10,
            session: None,
            next_req_id: 1,
            sequences: DashMap::new(),
            book_requests: DashMap::new(),
        }
    }

    /// Subscribes the book channel at `depth` levels. Unsupported depths fall
    /// back to the nearest larger one Kraken accepts.
    #[must_use]
    pub fn with_book_depth(mut self, depth: u32) -> Self {
        self.book_depth = BOOK_DEPTHS
            .iter()
            .copied()
            .find(|d| *d >= depth)
            .unwrap_or(BOOK_DEPTHS[BOOK_DEPTHS.len() - 1]);
        self
    }

    #[must_use]
    pub fn book_depth(&self) -> u32 {
        self.book_depth
    }

    fn session(&mut self) -> Result<&mut WsSession> {
        self.session
            .as_mut()
            .ok_or_else(|| DriftnetError::Connection("kraken stream is not connected".into()))
    }

    fn channel_request(&mut self, method: &'static str, channel: &str, symbols: Vec<String>) -> ChannelRequest {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let subscribing = method == "subscribe";
        let (depth, snapshot) = match channel {
            BOOK_CHANNEL => (Some(self.book_depth), None),
            TRADE_CHANNEL if subscribing => (None, Some(false)),
            _ => (None, None),
        };
        ChannelRequest {
            method,
            params: ChannelParams {
                channel: channel.to_string(),
                symbol: symbols,
                depth,
                snapshot,
            },
            req_id,
        }
    }

    /// Next update id for `symbol`. A snapshot restarts numbering above
    /// everything already handed out so it always supersedes older updates.
    fn next_sequence(&self, symbol: &str) -> u64 {
        let mut entry = self.sequences.entry(symbol.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn decode_trades(&self, value: Value) -> Result<Option<NormalizedEvent>> {
        let message: ChannelMessage<TradeData> = serde_json::from_value(value)?;
        let trades = message
            .data
            .into_iter()
            .map(trade_from_data)
            .collect::<Result<Vec<_>>>()?;
        if trades.is_empty() {
            return Ok(None);
        }
        Ok(Some(NormalizedEvent::Trades(trades)))
    }

    fn decode_book(&self, value: Value) -> Result<Option<NormalizedEvent>> {
        let message: ChannelMessage<BookData> = serde_json::from_value(value)?;
        let is_snapshot = match message.tpe.as_str() {
            "snapshot" => true,
            "update" => false,
            other => {
                return Err(DriftnetError::Decode(format!("unknown book message type {other:?}")));
            }
        };

        // Kraken sends one book entry per message; anything else is unexpected.
        let mut data = message.data.into_iter();
        let (Some(book), None) = (data.next(), data.next()) else {
            return Err(DriftnetError::Decode(
                "book message must carry exactly one symbol".into(),
            ));
        };

        let timestamp = match &book.timestamp {
            Some(ts) => parse_timestamp(ts)?,
            None => now_epoch_secs(),
        };
        let update_id = self.next_sequence(&book.symbol);
        let bids: Vec<OrderBookLevel> = book.bids.into_iter().map(Into::into).collect();
        let asks: Vec<OrderBookLevel> = book.asks.into_iter().map(Into::into).collect();

        let event = if is_snapshot {
            NormalizedEvent::BookSnapshot(OrderBookSnapshot {
                symbol: book.symbol,
                bids,
                asks,
                last_update_id: update_id,
                timestamp,
            })
        } else {
            NormalizedEvent::BookDelta(BookDelta {
                symbol: book.symbol,
                first_update_id: update_id,
                last_update_id: update_id,
                bids,
                asks,
                timestamp,
            })
        };
        Ok(Some(event))
    }
}

impl KrakenConnection {
    /// A failed reply to a book re-subscribe becomes a rejection for its
    /// symbol; every other reply is only logged.
    fn decode_reply(&self, value: &Value) -> Option<NormalizedEvent> {
        let book_symbol = value
            .get("req_id")
            .and_then(Value::as_u64)
            .and_then(|req_id| self.book_requests.remove(&req_id))
            .map(|(_, symbol)| symbol);
        if value.get("success").and_then(Value::as_bool) != Some(false) {
            return None;
        }

        let reason = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        match book_symbol {
            Some(symbol) => Some(NormalizedEvent::BookRejected { symbol, reason }),
            None => {
                warn!(venue = VENUE, reply = %value, "Request failed");
                None
            }
        }
    }
}

impl Default for KrakenConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamConnection for KrakenConnection {
    fn venue(&self) -> &str {
        VENUE
    }

    fn default_endpoint(&self) -> &str {
        KRAKEN_WS_URL
    }

    fn stream_ids(&self, symbols: &[String]) -> Vec<String> {
        [TRADE_CHANNEL, BOOK_CHANNEL]
            .iter()
            .flat_map(|channel| symbols.iter().map(move |s| format!("{channel}:{s}")))
            .collect()
    }

    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.close().await;
        self.sequences.clear();
        self.book_requests.clear();
        self.session = Some(WsSession::open(endpoint).await?);
        info!(venue = VENUE, endpoint, "Connected");
        Ok(())
    }

    async fn subscribe(&mut self, stream_ids: &[String]) -> Result<()> {
        let mut by_channel: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for id in stream_ids {
            let Some((channel, symbol)) = id.split_once(':') else {
                return Err(DriftnetError::Subscription(format!(
                    "malformed stream id {id:?}, expected channel:SYMBOL"
                )));
            };
            by_channel.entry(channel).or_default().push(symbol.to_string());
        }

        for (channel, symbols) in by_channel {
            let request = self.channel_request("subscribe", channel, symbols);
            let req_id = request.req_id;
            let mut pending: HashSet<String> = request.params.symbol.iter().cloned().collect();
            let session = self.session()?;
            session.send_json(&request).await?;
            await_ack(session, |value| kraken_ack_verdict(value, req_id, &mut pending)).await?;
            info!(venue = VENUE, channel, symbols = ?request.params.symbol, "Subscribed to channel");
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        self.session()?.next_text().await
    }

    fn decode(&self, raw: &str) -> Result<Option<NormalizedEvent>> {
        let value: Value = serde_json::from_str(raw)?;

        // Replies to our own requests (subscribe, unsubscribe, pong).
        if value.get("method").is_some() {
            return Ok(self.decode_reply(&value));
        }

        let channel = value.get("channel").and_then(Value::as_str).map(str::to_owned);
        match channel.as_deref() {
            Some(TRADE_CHANNEL) => self.decode_trades(value),
            Some(BOOK_CHANNEL) => self.decode_book(value),
            Some("heartbeat" | "status") => Ok(None),
            Some(other) => {
                debug!(venue = VENUE, channel = other, "Ignoring unsupported channel");
                Ok(None)
            }
            None => Err(DriftnetError::Decode(format!(
                "message without channel: {raw}"
            ))),
        }
    }

    async fn request_snapshot(&mut self, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        let unsubscribe = self.channel_request("unsubscribe", BOOK_CHANNEL, vec![symbol.to_string()]);
        let subscribe = self.channel_request("subscribe", BOOK_CHANNEL, vec![symbol.to_string()]);
        self.book_requests.insert(subscribe.req_id, symbol.to_string());
        let session = self.session()?;
        session.send_json(&unsubscribe).await?;
        session.send_json(&subscribe).await?;
        debug!(venue = VENUE, symbol, "Re-subscribed book channel for a fresh snapshot");

        Ok(None)
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Classifies a reply to a channel subscribe with `req_id`. Kraken answers
/// once per symbol, so the subscription completes when `pending` is empty.
fn kraken_ack_verdict(value: &Value, req_id: u64, pending: &mut HashSet<String>) -> AckVerdict {
    if value.get("method").and_then(Value::as_str) != Some("subscribe")
        || value.get("req_id").and_then(Value::as_u64) != Some(req_id)
    {
        return AckVerdict::Unrelated;
    }

    match value.get("success").and_then(Value::as_bool) {
        Some(true) => {
            let symbol = value
                .pointer("/result/symbol")
                .and_then(Value::as_str)
                .unwrap_or_default();
            pending.remove(symbol);
            if pending.is_empty() {
                AckVerdict::Accepted
            } else {
                AckVerdict::Partial
            }
        }
        Some(false) => {
            let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            AckVerdict::Rejected(format!("venue rejected subscription: {error}"))
        }
        None => AckVerdict::Rejected(format!("ambiguous subscription reply: {value}")),
    }
}

fn parse_timestamp(raw: &str) -> Result<f64> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| DriftnetError::Decode(format!("invalid timestamp {raw:?}: {e}")))?;
    Ok(parsed.timestamp_micros() as f64 / 1_000_000.0)
}

fn trade_from_data(data: TradeData) -> Result<Trade> {
    Ok(Trade {
        exchange: VENUE.to_string(),
        price: data.price,
        quantity: data.qty,
        timestamp: parse_timestamp(&data.timestamp)?,
        side: data.side.parse::<Side>()?,
        trade_id: data.trade_id.to_string(),
        is_maker: false,
        symbol: data.symbol,
    })
}
