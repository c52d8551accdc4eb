//! Venue protocol adapters.
//!
//! Every venue implements [`StreamConnection`]: how to connect, what to
//! subscribe to, how to turn its payloads into [`NormalizedEvent`]s and how
//! to recover a book. Field naming, timestamp units, decimal parsing and
//! maker-flag semantics stay inside each adapter.
//!
//! Adapters are selected by name through a [`VenueRegistry`] handed to the
//! collector at construction.

pub mod binance;
pub mod kraken;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use binance::BinanceConnection;
pub use kraken::KrakenConnection;

use crate::models::{NormalizedEvent, OrderBookSnapshot};
use crate::{DriftnetError, Result};

/// Capability set shared by all venue adapters.
#[async_trait]
pub trait StreamConnection: Send {
    /// Venue name stamped on decoded trades.
    fn venue(&self) -> &str;

    /// Endpoint used when the configuration does not name one.
    fn default_endpoint(&self) -> &str;

    /// Venue-specific stream identifiers covering trades and books for `symbols`.
    fn stream_ids(&self, symbols: &[String]) -> Vec<String>;

    /// Opens the transport. Any previous connection is dropped first.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Connection`] if the venue refuses the connection.
    async fn connect(&mut self, endpoint: &str) -> Result<()>;

    /// Subscribes to `stream_ids` and waits for a positive acknowledgment.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Subscription`] on a negative or ambiguous reply.
    async fn subscribe(&mut self, stream_ids: &[String]) -> Result<()>;

    /// Next raw message, or `None` once the connection has closed. A closed
    /// connection needs a fresh [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Connection`] if the transport fails.
    async fn receive(&mut self) -> Result<Option<String>>;

    /// Decodes one raw message. Heartbeats, acknowledgments and other
    /// control frames decode to `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Decode`] if the message is malformed.
    fn decode(&self, raw: &str) -> Result<Option<NormalizedEvent>>;

    /// Starts book recovery for `symbol`. Returns the snapshot when the venue
    /// serves it out of band, `None` when it will arrive on the stream.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Connection`] if the request cannot be made.
    async fn request_snapshot(&mut self, symbol: &str) -> Result<Option<OrderBookSnapshot>>;

    /// Closes the transport. Idempotent.
    async fn close(&mut self);
}

/// Builds a fresh, unconnected adapter.
pub type ConnectionFactory = Arc<dyn Fn() -> Box<dyn StreamConnection> + Send + Sync>;

/// Explicit venue name → adapter factory mapping.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    factories: HashMap<String, ConnectionFactory>,
}

impl VenueRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in Binance and Kraken adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(binance::VENUE, || Box::new(BinanceConnection::new()));
        registry.register(kraken::VENUE, || Box::new(KrakenConnection::new()));
        registry
    }

    /// Registers (or replaces) the factory for `venue`.
    pub fn register<F>(&mut self, venue: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn StreamConnection> + Send + Sync + 'static,
    {
        self.factories
            .insert(venue.into().to_lowercase(), Arc::new(factory));
    }

    /// Looks up the factory for `venue` (case-insensitive).
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Config`] if no adapter is registered under that name.
    pub fn factory(&self, venue: &str) -> Result<ConnectionFactory> {
        self.factories
            .get(&venue.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                DriftnetError::Config(format!(
                    "unknown venue {venue:?}, registered: {:?}",
                    self.venues()
                ))
            })
    }

    /// Builds a fresh adapter for `venue`.
    ///
    /// # Errors
    ///
    /// [`DriftnetError::Config`] if `venue` is unknown.
    pub fn create(&self, venue: &str) -> Result<Box<dyn StreamConnection>> {
        Ok((self.factory(venue)?)())
    }

    /// Registered venue names, sorted.
    pub fn venues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for VenueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VenueRegistry")
            .field("venues", &self.venues())
            .finish()
    }
}

/// Parses a decimal field, naming it in the error.
pub(crate) fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| DriftnetError::Decode(format!("invalid {field} {raw:?}: {e}")))
}
