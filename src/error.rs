use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Error taxonomy for the harness.
///
/// Message-level failures (`MalformedEnvelope`, `Encoding`, `Decoding`) are
/// fatal to a single message only and never abort a loop. `SchemaNotFound`
/// is transient: registry propagation is eventually consistent, so a retry
/// on a later message may succeed. `Store` failures degrade delivery
/// tracking to a no-op; `Kafka` failures flip the connectivity gauge and
/// back off.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("schema resolution failed: {0}")]
    SchemaResolution(String),

    #[error("schema id {0} not found in registry")]
    SchemaNotFound(u32),

    #[error("failed to encode message: {0}")]
    Encoding(String),

    #[error("failed to decode message: {0}")]
    Decoding(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("ledger store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("schema registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
