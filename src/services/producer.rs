//! Producer loop: one message per tick, encoded into the wire envelope,
//! published, then recorded in the delivery ledger. A single message's
//! failure is counted and skipped, never fatal to the loop.

use std::time::{Duration, Instant};

use chrono::Utc;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::codec::{LogicalMessage, WireCodec};
use crate::config::Config;
use crate::error::Result;
use crate::metrics::{
    set_kafka_connected, PRODUCER_ENCODE_DURATION, PRODUCER_ERRORS_TOTAL, PRODUCER_SENT_BYTES,
    PRODUCER_SENT_TOTAL, PRODUCER_SEND_DURATION,
};
use crate::services::base_client_config;
use crate::tracker::{DeliveryTracker, LedgerStore};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProducerLoop<S> {
    producer: FutureProducer,
    codec: WireCodec,
    tracker: Option<DeliveryTracker<S>>,
    topic: String,
    brokers: Vec<String>,
    tick: Duration,
}

impl<S: LedgerStore> ProducerLoop<S> {
    pub fn new(
        config: &Config,
        codec: WireCodec,
        tracker: Option<DeliveryTracker<S>>,
    ) -> Result<Self> {
        let producer: FutureProducer = base_client_config(config)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("compression.type", "lz4")
            .create()?;

        Ok(Self {
            producer,
            codec,
            tracker,
            topic: config.kafka_topic.clone(),
            brokers: config.broker_list(),
            tick: Duration::from_millis(config.produce_interval_ms),
        })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<()>) {
        info!(topic = %self.topic, "producer loop started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut message_id: i64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("producer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    message_id += 1;
                    self.publish_one(message_id).await;
                }
            }
        }
    }

    async fn publish_one(&self, message_id: i64) {
        let started = Instant::now();
        let message = LogicalMessage {
            id: message_id,
            timestamp: Utc::now(),
            payload: format!("Test message #{message_id}"),
        };

        let encode_started = Instant::now();
        let encoded = self.codec.encode(&message);
        PRODUCER_ENCODE_DURATION
            .with_label_values(&[&self.topic])
            .observe(encode_started.elapsed().as_secs_f64());

        let wire = match encoded {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(message_id, "failed to encode message: {e}");
                PRODUCER_ERRORS_TOTAL
                    .with_label_values(&[&self.topic, "encode"])
                    .inc();
                return;
            }
        };

        let key = format!("key-{message_id}");
        let record = FutureRecord::to(&self.topic).key(&key).payload(&wire);
        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok(_) => set_kafka_connected(&self.brokers, true),
            Err((e, _)) => {
                error!(message_id, "failed to publish message: {e}");
                PRODUCER_ERRORS_TOTAL
                    .with_label_values(&[&self.topic, "send"])
                    .inc();
                set_kafka_connected(&self.brokers, false);
                return;
            }
        }

        // Advisory only: a ledger write failure never fails the publish.
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.on_publish(&key, &wire).await {
                warn!(%key, "delivery ledger write failed: {e}");
            }
        }

        PRODUCER_SENT_TOTAL.with_label_values(&[&self.topic]).inc();
        PRODUCER_SENT_BYTES
            .with_label_values(&[&self.topic])
            .inc_by(wire.len() as u64);
        PRODUCER_SEND_DURATION
            .with_label_values(&[&self.topic])
            .observe(started.elapsed().as_secs_f64());

        info!(message_id, "published message");
    }
}
