pub mod consumer;
pub mod lag;
pub mod producer;
pub mod slo;

pub use consumer::ConsumerLoop;
pub use lag::LagMonitor;
pub use producer::ProducerLoop;
pub use slo::SloScanner;

use rdkafka::ClientConfig;

use crate::config::Config;

/// Base librdkafka client settings shared by every Kafka client in the
/// process: broker list plus SASL/SCRAM credentials when configured.
pub(crate) fn base_client_config(config: &Config) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.kafka_brokers);
    if let (Some(username), Some(password)) = (&config.kafka_username, &config.kafka_password) {
        client
            .set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanisms", "SCRAM-SHA-512")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
    client
}
