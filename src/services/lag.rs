//! Consumer lag observability.
//!
//! Each cycle reconciles two independently fetched offset sets for the
//! topic: the group's committed offsets and the per-partition high
//! watermarks. Partitions missing from either set are skipped for the
//! cycle; reporting zero for them would be a false "caught up" signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::metrics::CONSUMER_LAG;
use crate::services::base_client_config;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// One partition's offsets for a single reconciliation pass. Derived, never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagSample {
    pub partition: i32,
    pub committed: i64,
    pub high_watermark: i64,
}

impl LagSample {
    /// Committed offsets can briefly run ahead of the watermark after
    /// compaction; lag is clamped, never negative.
    pub fn lag(&self) -> i64 {
        (self.high_watermark - self.committed).max(0)
    }
}

/// Join the two offset maps, keeping only partitions present in both.
pub fn reconcile_offsets(
    committed: &HashMap<i32, i64>,
    watermarks: &HashMap<i32, i64>,
) -> Vec<LagSample> {
    let mut samples: Vec<LagSample> = committed
        .iter()
        .filter_map(|(partition, committed)| {
            watermarks.get(partition).map(|high| LagSample {
                partition: *partition,
                committed: *committed,
                high_watermark: *high,
            })
        })
        .collect();
    samples.sort_by_key(|s| s.partition);
    samples
}

/// Periodic lag gauge updater. Holds its own metadata client so the main
/// consume loop never blocks on offset queries.
pub struct LagMonitor {
    consumer: BaseConsumer,
    topic: String,
    group_id: String,
    interval: Duration,
}

impl LagMonitor {
    pub fn new(config: &Config) -> Result<Self> {
        let consumer: BaseConsumer = base_client_config(config)
            .set("group.id", &config.kafka_group_id)
            .create()?;
        Ok(Self {
            consumer,
            topic: config.kafka_topic.clone(),
            group_id: config.kafka_group_id.clone(),
            interval: Duration::from_secs(config.lag_interval_secs),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        info!(topic = %self.topic, group_id = %self.group_id, "lag monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("lag monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let monitor = Arc::clone(&self);
                    // librdkafka offset queries are blocking calls.
                    match tokio::task::spawn_blocking(move || monitor.observe_once()).await {
                        Ok(Ok(samples)) => self.publish(&samples),
                        Ok(Err(e)) => debug!("lag cycle abandoned: {e}"),
                        Err(e) => warn!("lag query task failed: {e}"),
                    }
                }
            }
        }
    }

    /// One full reconciliation pass. Any failure abandons the cycle without
    /// publishing a partial cross-partition snapshot; the next tick retries.
    fn observe_once(&self) -> Result<Vec<LagSample>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.topic), QUERY_TIMEOUT)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or_else(|| {
                KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownTopicOrPartition)
            })?;
        let partitions: Vec<i32> = topic_metadata.partitions().iter().map(|p| p.id()).collect();

        let mut query = TopicPartitionList::new();
        for partition in &partitions {
            query.add_partition(&self.topic, *partition);
        }
        let mut committed = HashMap::new();
        for elem in self
            .consumer
            .committed_offsets(query, QUERY_TIMEOUT)?
            .elements()
        {
            // Offset::Invalid means the group has never committed here;
            // leave the partition out rather than report a fake zero.
            if let Offset::Offset(offset) = elem.offset() {
                committed.insert(elem.partition(), offset);
            }
        }

        let mut watermarks = HashMap::new();
        for partition in &partitions {
            let (_, high) = self
                .consumer
                .fetch_watermarks(&self.topic, *partition, QUERY_TIMEOUT)?;
            watermarks.insert(*partition, high);
        }

        Ok(reconcile_offsets(&committed, &watermarks))
    }

    fn publish(&self, samples: &[LagSample]) {
        for sample in samples {
            CONSUMER_LAG
                .with_label_values(&[
                    &self.topic,
                    &sample.partition.to_string(),
                    &self.group_id,
                ])
                .set(sample.lag());
        }
        debug!(partitions = samples.len(), "updated consumer lag gauges");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(committed: i64, high: i64) -> LagSample {
        LagSample {
            partition: 0,
            committed,
            high_watermark: high,
        }
    }

    #[test]
    fn lag_is_watermark_minus_committed() {
        assert_eq!(sample(100, 130).lag(), 30);
        assert_eq!(sample(130, 130).lag(), 0);
    }

    #[test]
    fn lag_never_goes_negative() {
        // Committed ahead of the watermark after compaction.
        assert_eq!(sample(150, 130).lag(), 0);
    }

    #[test]
    fn partitions_missing_from_either_side_are_skipped() {
        let committed = HashMap::from([(0, 100), (1, 50)]);
        let watermarks = HashMap::from([(0, 130), (2, 70)]);

        let samples = reconcile_offsets(&committed, &watermarks);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].partition, 0);
        assert_eq!(samples[0].lag(), 30);
    }

    #[test]
    fn samples_come_back_in_partition_order() {
        let committed = HashMap::from([(2, 10), (0, 20), (1, 30)]);
        let watermarks = HashMap::from([(0, 25), (1, 35), (2, 15)]);

        let partitions: Vec<i32> = reconcile_offsets(&committed, &watermarks)
            .iter()
            .map(|s| s.partition)
            .collect();
        assert_eq!(partitions, vec![0, 1, 2]);
    }
}
