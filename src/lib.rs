//! Real-time cryptocurrency market data collection.
//!
//! A [`collector::Collector`] keeps one venue WebSocket stream alive,
//! normalizes its trades and order-book updates into [`models`], rebuilds
//! books in an [`orderbook::OrderBookEngine`] and persists trades through
//! a pluggable [`storage::StorageGateway`]. Venue wire formats live in
//! [`venue`], one adapter per exchange.

pub mod collector;
pub mod config;
pub mod error;
pub mod models;
pub mod orderbook;
pub mod storage;
pub mod venue;
pub mod websocket;

pub use error::{DriftnetError, Result};
