//! Shared test utilities: a scripted venue connection and a local WebSocket
//! server.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use driftnet::collector::{Collector, CollectorConfig};
use driftnet::models::{
    CollectorStatus, NormalizedEvent, OrderBookLevel, OrderBookSnapshot, Trade, TradeStatistics,
};
use driftnet::storage::{StorageGateway, TradeQuery};
use driftnet::venue::{BinanceConnection, ConnectionFactory, StreamConnection};
use driftnet::{DriftnetError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

/// Binance public endpoint used by the live tests.
pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Kraken WebSocket V2 public endpoint URL.
pub const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";

/// What the scripted venue does on each call. Calls beyond the script
/// succeed.
#[derive(Default)]
pub struct Script {
    pub connect_results: VecDeque<Result<()>>,
    pub subscribe_results: VecDeque<Result<()>>,
    /// Frames delivered per successful connection, in order.
    pub sessions: VecDeque<Vec<String>>,
    /// Close the stream once a session's frames run out instead of idling.
    pub close_after_frames: bool,
    /// Out-of-band snapshots served in order; the last one keeps being served.
    pub snapshots: HashMap<String, VecDeque<OrderBookSnapshot>>,
    /// Answer snapshot requests on the stream, like a venue that replays the
    /// book on re-subscribe, using `stream_replies` in order.
    pub stream_snapshots: bool,
    pub stream_replies: VecDeque<StreamReply>,

    pub connect_attempts: u32,
    pub subscribed: Vec<Vec<String>>,
    pub snapshot_requests: Vec<String>,
}

pub type SharedScript = Arc<Mutex<Script>>;

/// How the scripted venue answers one snapshot request on the stream.
pub enum StreamReply {
    Snapshot(OrderBookSnapshot),
    Rejected(String),
    /// Nothing ever arrives.
    Silent,
}

/// Stream frames only the scripted venue understands.
#[derive(Serialize, Deserialize)]
#[serde(tag = "scripted", rename_all = "snake_case")]
enum ScriptedFrame {
    Snapshot { book: OrderBookSnapshot },
    BookRejected { symbol: String, reason: String },
}

/// A [`StreamConnection`] replaying a [`Script`]. Frames are decoded as
/// Binance payloads.
pub struct ScriptedVenue {
    script: SharedScript,
    decoder: BinanceConnection,
    frames: VecDeque<String>,
}

#[async_trait]
impl StreamConnection for ScriptedVenue {
    fn venue(&self) -> &str {
        "scripted"
    }

    fn default_endpoint(&self) -> &str {
        "ws://scripted.invalid"
    }

    fn stream_ids(&self, symbols: &[String]) -> Vec<String> {
        self.decoder.stream_ids(symbols)
    }

    async fn connect(&mut self, _endpoint: &str) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.connect_attempts += 1;
        if let Some(Err(e)) = script.connect_results.pop_front() {
            return Err(e);
        }
        self.frames = script.sessions.pop_front().unwrap_or_default().into();
        Ok(())
    }

    async fn subscribe(&mut self, stream_ids: &[String]) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.subscribed.push(stream_ids.to_vec());
        script.subscribe_results.pop_front().unwrap_or(Ok(()))
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }
        let close = self.script.lock().unwrap().close_after_frames;
        if close {
            return Ok(None);
        }
        std::future::pending().await
    }

    fn decode(&self, raw: &str) -> Result<Option<NormalizedEvent>> {
        match serde_json::from_str::<ScriptedFrame>(raw) {
            Ok(ScriptedFrame::Snapshot { book }) => Ok(Some(NormalizedEvent::BookSnapshot(book))),
            Ok(ScriptedFrame::BookRejected { symbol, reason }) => {
                Ok(Some(NormalizedEvent::BookRejected { symbol, reason }))
            }
            Err(_) => self.decoder.decode(raw),
        }
    }

    async fn request_snapshot(&mut self, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        let mut script = self.script.lock().unwrap();
        script.snapshot_requests.push(symbol.to_string());

        if script.stream_snapshots {
            let frame = match script.stream_replies.pop_front().unwrap_or(StreamReply::Silent) {
                StreamReply::Snapshot(book) => Some(stream_snapshot_frame(&book)),
                StreamReply::Rejected(reason) => Some(book_rejected_frame(symbol, &reason)),
                StreamReply::Silent => None,
            };
            self.frames.extend(frame);
            return Ok(None);
        }

        let Some(queue) = script.snapshots.get_mut(symbol) else {
            return Err(DriftnetError::Connection(format!("no snapshot for {symbol}")));
        };
        let snapshot = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
        snapshot
            .map(Some)
            .ok_or_else(|| DriftnetError::Connection(format!("no snapshot for {symbol}")))
    }

    async fn close(&mut self) {
        self.frames.clear();
    }
}

/// A factory handing out [`ScriptedVenue`]s that share `script`.
pub fn scripted_factory(script: &SharedScript) -> ConnectionFactory {
    let script = script.clone();
    Arc::new(move || {
        Box::new(ScriptedVenue {
            script: script.clone(),
            decoder: BinanceConnection::new(),
            frames: VecDeque::new(),
        })
    })
}

/// A storage backend whose writes always fail.
#[derive(Default)]
pub struct FailingStorage;

#[async_trait]
impl StorageGateway for FailingStorage {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn store_trades(&self, _symbol: &str, _trades: &[Trade]) -> Result<()> {
        Err(DriftnetError::Storage("disk full".into()))
    }

    async fn get_trades(&self, _symbol: &str, _query: TradeQuery) -> Result<Vec<Trade>> {
        Ok(Vec::new())
    }

    async fn store_statistics(&self, _symbol: &str, _stats: &TradeStatistics) -> Result<()> {
        Err(DriftnetError::Storage("disk full".into()))
    }

    async fn get_statistics(&self, _symbol: &str) -> Result<Option<TradeStatistics>> {
        Ok(None)
    }
}

/// Collector settings with short delays so retry tests finish quickly.
pub fn fast_config(symbols: &[&str]) -> CollectorConfig {
    let mut config =
        CollectorConfig::new("scripted", symbols.iter().map(|s| s.to_string()).collect());
    config.retry_delay = Duration::from_millis(10);
    config.max_retry_delay = Duration::from_millis(40);
    config.jitter = false;
    config.update_interval = Duration::from_millis(20);
    config.stop_grace = Duration::from_secs(1);
    config
}

/// Polls `collector.status()` until `predicate` holds.
pub async fn wait_for_status<F>(collector: &Collector, predicate: F) -> CollectorStatus
where
    F: Fn(&CollectorStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = collector.status();
            if predicate(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("status never matched, last: {:?}", collector.status()))
}

/// A Binance `trade` stream event.
pub fn trade_frame(symbol: &str, id: u64, price: &str, qty: &str, time_ms: u64) -> String {
    serde_json::json!({
        "e": "trade",
        "E": time_ms,
        "s": symbol,
        "t": id,
        "p": price,
        "q": qty,
        "T": time_ms,
        "m": false,
        "M": true
    })
    .to_string()
}

/// A Binance `depthUpdate` diff event.
pub fn depth_frame(
    symbol: &str,
    first: u64,
    last: u64,
    bids: &[(&str, &str)],
    asks: &[(&str, &str)],
) -> String {
    let levels = |side: &[(&str, &str)]| -> Vec<[String; 2]> {
        side.iter()
            .map(|(p, q)| [p.to_string(), q.to_string()])
            .collect()
    };
    serde_json::json!({
        "e": "depthUpdate",
        "E": 1_700_000_000_000u64,
        "s": symbol,
        "U": first,
        "u": last,
        "b": levels(bids),
        "a": levels(asks)
    })
    .to_string()
}

/// A book snapshot delivered on the scripted venue's stream.
pub fn stream_snapshot_frame(book: &OrderBookSnapshot) -> String {
    serde_json::to_string(&ScriptedFrame::Snapshot { book: book.clone() })
        .expect("Failed to encode snapshot frame")
}

/// The scripted venue refusing to send a book for `symbol`.
pub fn book_rejected_frame(symbol: &str, reason: &str) -> String {
    serde_json::to_string(&ScriptedFrame::BookRejected {
        symbol: symbol.to_string(),
        reason: reason.to_string(),
    })
    .expect("Failed to encode rejection frame")
}

/// Polls until the published book for `symbol` reaches `update_id`.
pub async fn wait_for_book(collector: &Collector, symbol: &str, update_id: u64) -> Arc<OrderBookSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(book) = collector.order_books().get_book(symbol) {
                if book.last_update_id == update_id {
                    return book;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        let current = collector.order_books().get_book(symbol).map(|b| b.last_update_id);
        panic!("book for {symbol} never reached {update_id}, last: {current:?}")
    })
}

/// A snapshot with one level per side.
pub fn snapshot(symbol: &str, update_id: u64, bid: Decimal, ask: Decimal) -> OrderBookSnapshot {
    OrderBookSnapshot {
        symbol: symbol.to_string(),
        bids: vec![OrderBookLevel::new(bid, Decimal::ONE)],
        asks: vec![OrderBookLevel::new(ask, Decimal::ONE)],
        last_update_id: update_id,
        timestamp: 1_700_000_000.0,
    }
}

/// Accepts one WebSocket client on a local port and hands it to `handler`.
/// Returns the `ws://` URL to connect to.
pub async fn spawn_ws_server<F, Fut>(handler: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Failed to read listener address");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("Failed to accept client");
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("Failed to complete WebSocket handshake");
        handler(ws).await;
    });

    format!("ws://{addr}")
}
