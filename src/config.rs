/// Configuration management
use serde::Deserialize;

use crate::error::{AppError, Result};

/// Which half of the exchange this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_brokers")]
    pub kafka_brokers: String,
    #[serde(default = "default_topic")]
    pub kafka_topic: String,
    #[serde(default = "default_group_id")]
    pub kafka_group_id: String,
    pub kafka_username: Option<String>,
    pub kafka_password: Option<String>,
    #[serde(default = "default_registry_url")]
    pub schema_registry_url: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prefix for delivery ledger keys in Redis.
    #[serde(default = "default_key_prefix")]
    pub ledger_key_prefix: String,
    /// Records older than this without reconciliation count as SLO breaches.
    #[serde(default = "default_slo_threshold")]
    pub slo_threshold_secs: u64,
    #[serde(default = "default_produce_interval")]
    pub produce_interval_ms: u64,
    #[serde(default = "default_lag_interval")]
    pub lag_interval_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_mode() -> Mode {
    Mode::Producer
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "test-topic".to_string()
}

fn default_group_id() -> String {
    "test-group".to_string()
}

fn default_registry_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "kafka-msg:".to_string()
}

fn default_slo_threshold() -> u64 {
    60
}

fn default_produce_interval() -> u64 {
    1000
}

fn default_lag_interval() -> u64 {
    30
}

// The ledger scan is heavier than the offset queries; it runs on a longer
// cadence than the lag monitor.
fn default_scan_interval() -> u64 {
    60
}

fn default_health_port() -> u16 {
    8080
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config: Config =
            envy::from_env().map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.broker_list().is_empty() {
            return Err(AppError::Config("KAFKA_BROKERS must not be empty".into()));
        }
        if self.kafka_topic.trim().is_empty() {
            return Err(AppError::Config("KAFKA_TOPIC must not be empty".into()));
        }
        if self.ledger_key_prefix.is_empty() {
            return Err(AppError::Config(
                "LEDGER_KEY_PREFIX must not be empty".into(),
            ));
        }
        if self.slo_threshold_secs == 0 {
            return Err(AppError::Config(
                "SLO_THRESHOLD_SECS must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Broker addresses split out of the comma-separated `KAFKA_BROKERS`
    /// value, used to label the per-broker connectivity gauge.
    pub fn broker_list(&self) -> Vec<String> {
        self.kafka_brokers
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    /// Subject under which the message schema is registered.
    pub fn schema_subject(&self) -> String {
        format!("{}-value", self.kafka_topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> std::result::Result<Config, envy::Error> {
        envy::from_iter(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.mode, Mode::Producer);
        assert_eq!(config.kafka_brokers, "localhost:9092");
        assert_eq!(config.kafka_topic, "test-topic");
        assert_eq!(config.ledger_key_prefix, "kafka-msg:");
        assert_eq!(config.slo_threshold_secs, 60);
        assert!(config.kafka_username.is_none());
    }

    #[test]
    fn mode_parses_lowercase() {
        let config = from_pairs(&[("MODE", "consumer")]).unwrap();
        assert_eq!(config.mode, Mode::Consumer);
        assert!(from_pairs(&[("MODE", "sidecar")]).is_err());
    }

    #[test]
    fn broker_list_trims_and_drops_empty_entries() {
        let config =
            from_pairs(&[("KAFKA_BROKERS", " broker-1:9092 , broker-2:9092 ,")]).unwrap();
        assert_eq!(config.broker_list(), vec!["broker-1:9092", "broker-2:9092"]);
    }

    #[test]
    fn zero_slo_threshold_is_rejected() {
        let config = from_pairs(&[("SLO_THRESHOLD_SECS", "0")]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn schema_subject_follows_topic() {
        let config = from_pairs(&[("KAFKA_TOPIC", "orders")]).unwrap();
        assert_eq!(config.schema_subject(), "orders-value");
    }
}
