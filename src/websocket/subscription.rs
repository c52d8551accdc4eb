//! Subscription requests and acknowledgment handling.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::WsSession;
use crate::{DriftnetError, Result};

/// A `SUBSCRIBE` request in the `{method, params, id}` stream protocol.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub method: String,
    pub params: Vec<String>,
    pub id: u64,
}

impl SubscribeRequest {
    pub fn new(stream_ids: &[String], id: u64) -> Self {
        Self {
            method: "SUBSCRIBE".to_string(),
            params: stream_ids.to_vec(),
            id,
        }
    }
}

/// How an incoming frame relates to an outstanding subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckVerdict {
    /// Not an acknowledgment; keep the frame for normal processing.
    Unrelated,
    /// An acknowledgment that does not yet complete the subscription.
    Partial,
    /// The subscription is fully acknowledged.
    Accepted,
    /// The venue refused or answered ambiguously.
    Rejected(String),
}

/// Classifies a reply to a [`SubscribeRequest`] with id `request_id`.
///
/// Success is a reply carrying `request_id` whose `error` is null or absent.
/// An error object, an error code, a non-null `result` or a reply to another
/// id are all failures.
pub fn binance_ack_verdict(value: &Value, request_id: u64) -> AckVerdict {
    let Some(id) = value.get("id") else {
        return AckVerdict::Unrelated;
    };
    if id.as_u64() != Some(request_id) {
        return AckVerdict::Rejected(format!(
            "reply to unexpected request id {id}, expected {request_id}"
        ));
    }

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return AckVerdict::Rejected(format!("venue returned error: {error}"));
    }
    if let Some(code) = value.get("code").filter(|c| !c.is_null()) {
        let msg = value.get("msg").and_then(Value::as_str).unwrap_or("unknown");
        return AckVerdict::Rejected(format!("venue returned code {code}: {msg}"));
    }
    match value.get("result") {
        None | Some(Value::Null) => AckVerdict::Accepted,
        Some(other) => AckVerdict::Rejected(format!("ambiguous subscription reply: {other}")),
    }
}

/// Reads frames until `classify` accepts or rejects the subscription.
///
/// Frames classified as [`AckVerdict::Unrelated`] (market data arriving
/// before the acknowledgment) are kept in the session backlog, so nothing is
/// lost. Frames that are not JSON are treated as unrelated as well.
///
/// # Errors
///
/// [`DriftnetError::Subscription`] on rejection or if the connection closes
/// first; [`DriftnetError::Connection`] if reading fails.
pub async fn await_ack<F>(session: &mut WsSession, mut classify: F) -> Result<()>
where
    F: FnMut(&Value) -> AckVerdict + Send,
{
    loop {
        let Some(text) = session.read_text().await? else {
            return Err(DriftnetError::Subscription(
                "connection closed before subscription was acknowledged".into(),
            ));
        };

        let verdict = match serde_json::from_str::<Value>(&text) {
            Ok(value) => classify(&value),
            Err(_) => AckVerdict::Unrelated,
        };

        match verdict {
            AckVerdict::Unrelated => session.push_backlog(text),
            AckVerdict::Partial => debug!("Partial subscription acknowledgment"),
            AckVerdict::Accepted => {
                info!(buffered = session.backlog_len(), "Subscription acknowledged");
                return Ok(());
            }
            AckVerdict::Rejected(reason) => return Err(DriftnetError::Subscription(reason)),
        }
    }
}
