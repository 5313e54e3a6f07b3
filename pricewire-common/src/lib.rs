//! # PriceWire Common Library
//!
//! Shared code for all PriceWire services including:
//! - Data model (anomalies, glitches, subscribers, model catalog state)
//! - SQLite-backed stream bus, KV store, and delay queue adapters
//! - Stream consumer framework with retries and dead-letter routing
//! - Shutdown coordinator
//! - Metrics and DLQ inspection

pub mod bus;
pub mod config;
pub mod consumer;
pub mod db;
pub mod delay;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod models;
pub mod shutdown;

pub use error::{Error, Result, WorkerError};
