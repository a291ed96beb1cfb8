//! Kafka message exchange harness.
//!
//! A single binary running in `producer` or `consumer` mode. The producer
//! publishes schema-framed messages on a fixed cadence and records each one
//! in a Redis delivery ledger; the consumer decodes, reconciles the ledger,
//! and runs lag and SLO observability workers alongside. Everything the
//! process learns is exposed on the prometheus `/metrics` endpoint.

pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod schema;
pub mod services;
pub mod tracker;

pub use config::{Config, Mode};
pub use error::{AppError, Result};
