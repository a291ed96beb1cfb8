//! Consumer loop: decode each inbound envelope, reconcile it against the
//! delivery ledger, and emit latency metrics. Message-level failures are
//! counted and skipped; read failures flip the connectivity gauge and back
//! off before the next attempt.

use std::time::{Duration, Instant};

use chrono::Utc;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::MessageDecoder;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::metrics::{
    set_kafka_connected, CONSUMER_DECODE_DURATION, CONSUMER_E2E_LATENCY, CONSUMER_ERRORS_TOTAL,
    CONSUMER_PROCESSING_DURATION, CONSUMER_RECEIVED_BYTES, CONSUMER_RECEIVED_TOTAL,
    DELIVERY_HASH_MISMATCH_TOTAL,
};
use crate::schema::SchemaRegistry;
use crate::services::base_client_config;
use crate::tracker::{DeliveryTracker, LedgerStore, ReconcileOutcome};

pub struct ConsumerLoop<S, R> {
    consumer: StreamConsumer,
    decoder: MessageDecoder<R>,
    tracker: Option<DeliveryTracker<S>>,
    topic: String,
    brokers: Vec<String>,
}

impl<S: LedgerStore, R: SchemaRegistry> ConsumerLoop<S, R> {
    pub fn new(
        config: &Config,
        decoder: MessageDecoder<R>,
        tracker: Option<DeliveryTracker<S>>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = base_client_config(config)
            .set("group.id", &config.kafka_group_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.partition.eof", "false")
            .create()?;
        consumer.subscribe(&[&config.kafka_topic])?;

        Ok(Self {
            consumer,
            decoder,
            tracker,
            topic: config.kafka_topic.clone(),
            brokers: config.broker_list(),
        })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<()>) {
        info!(topic = %self.topic, "consumer loop started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("consumer stopped");
                    return;
                }
                received = self.consumer.recv() => match received {
                    Ok(message) => {
                        set_kafka_connected(&self.brokers, true);
                        self.handle_message(&message).await;
                    }
                    Err(e) => {
                        error!("kafka read error: {e}");
                        CONSUMER_ERRORS_TOTAL
                            .with_label_values(&[&self.topic, "read"])
                            .inc();
                        set_kafka_connected(&self.brokers, false);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: &BorrowedMessage<'_>) {
        let started = Instant::now();
        let partition = message.partition().to_string();

        let Some(payload) = message.payload() else {
            warn!(offset = message.offset(), "message has no payload");
            CONSUMER_ERRORS_TOTAL
                .with_label_values(&[&self.topic, "decode"])
                .inc();
            return;
        };

        let decode_started = Instant::now();
        let decoded = self.decoder.decode(payload).await;
        CONSUMER_DECODE_DURATION
            .with_label_values(&[&self.topic, &partition])
            .observe(decode_started.elapsed().as_secs_f64());

        let (schema_id, decoded) = match decoded {
            Ok(result) => result,
            Err(e) => {
                let error_type = match &e {
                    AppError::MalformedEnvelope(_) => "malformed",
                    AppError::SchemaNotFound(_)
                    | AppError::SchemaResolution(_)
                    | AppError::Registry(_) => "schema",
                    _ => "decode",
                };
                error!(offset = message.offset(), "failed to decode message: {e}");
                CONSUMER_ERRORS_TOTAL
                    .with_label_values(&[&self.topic, error_type])
                    .inc();
                return;
            }
        };

        if let Some(tracker) = &self.tracker {
            if let Some(key) = message.key().and_then(|k| std::str::from_utf8(k).ok()) {
                match tracker.on_receive(key, payload).await {
                    Ok(ReconcileOutcome::Matched) => debug!(key, "delivery reconciled"),
                    Ok(ReconcileOutcome::Mismatched) => {
                        // Corruption signal, kept distinct from plain loss.
                        warn!(key, "content digest mismatch");
                        DELIVERY_HASH_MISMATCH_TOTAL
                            .with_label_values(&[&self.topic, &partition])
                            .inc();
                    }
                    Ok(ReconcileOutcome::Untracked) => {
                        debug!(key, "no delivery record for message")
                    }
                    Err(e) => warn!(key, "delivery reconciliation failed: {e}"),
                }
            }
        }

        if let Some(sent_at) = decoded.timestamp {
            let elapsed_ms = (Utc::now() - sent_at).num_milliseconds().max(0);
            CONSUMER_E2E_LATENCY
                .with_label_values(&[&self.topic, &partition])
                .observe(elapsed_ms as f64 / 1000.0);
        }

        CONSUMER_PROCESSING_DURATION
            .with_label_values(&[&self.topic, &partition])
            .observe(started.elapsed().as_secs_f64());
        CONSUMER_RECEIVED_TOTAL
            .with_label_values(&[&self.topic, &partition])
            .inc();
        CONSUMER_RECEIVED_BYTES
            .with_label_values(&[&self.topic, &partition])
            .inc_by(payload.len() as u64);

        info!(
            message_id = ?decoded.id,
            schema_id,
            partition = message.partition(),
            offset = message.offset(),
            "received message"
        );
    }
}
