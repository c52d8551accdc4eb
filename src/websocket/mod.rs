//! WebSocket transport shared by every venue adapter.
//!
//! This module is organized by concern:
//! - [`WsSession`] - an open connection with a backlog of frames that
//!   arrived while a request was waiting for its reply
//! - [`subscription`] - subscribe request/acknowledgment handling

pub mod subscription;

use std::collections::VecDeque;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tungstenite::Message;

use crate::{DriftnetError, Result};

pub use subscription::{AckVerdict, SubscribeRequest, await_ack, binance_ack_verdict};

/// Write half of a venue WebSocket connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a venue WebSocket connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns [`DriftnetError::Connection`] if the connection or TLS handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| DriftnetError::Connection(format!("{url}: {e}")))?;
    info!(url, "WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// An open WebSocket connection.
pub struct WsSession {
    write: WsWriter,
    read: WsReader,
    backlog: VecDeque<String>,
    closed: bool,
}

impl WsSession {
    /// Opens a session to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DriftnetError::Connection`] if the handshake fails.
    pub async fn open(url: &str) -> Result<Self> {
        let (write, read) = connect(url).await?;
        Ok(Self {
            write,
            read,
            backlog: VecDeque::new(),
            closed: false,
        })
    }

    /// Serializes `payload` and sends it as a text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`DriftnetError`] if serialization or sending fails.
    pub async fn send_json<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        debug!("Sending request: {}", json);
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Reads the next frame straight from the socket, skipping control and
    /// binary frames. Returns `None` once the peer closed the connection.
    pub(crate) async fn read_text(&mut self) -> Result<Option<String>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(msg) = self.read.next().await {
            match msg? {
                Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
                Message::Close(frame) => {
                    info!(?frame, "WebSocket closed by peer");
                    self.closed = true;
                    return Ok(None);
                }
                // Ping replies are queued by tungstenite and flushed on the next write.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Binary(_) => debug!("Ignoring binary frame"),
            }
        }
        self.closed = true;
        Ok(None)
    }

    /// Returns the next text frame, serving buffered frames first.
    ///
    /// # Errors
    ///
    /// Returns [`DriftnetError::Connection`] if reading from the socket fails.
    pub async fn next_text(&mut self) -> Result<Option<String>> {
        if let Some(text) = self.backlog.pop_front() {
            return Ok(Some(text));
        }
        self.read_text().await
    }

    /// Holds a frame back for the next [`next_text`](Self::next_text) call.
    pub fn push_backlog(&mut self, text: String) {
        self.backlog.push_back(text);
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Sends a close frame. Failures are logged and otherwise ignored.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.write.close().await {
            warn!("Failed to close WebSocket cleanly: {e}");
        }
    }
}
