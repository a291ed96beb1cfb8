use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
};

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C) -> C {
    prometheus::default_registry()
        .register(Box::new(collector.clone()))
        .expect("metric registered twice");
    collector
}

// Producer metrics

pub static PRODUCER_SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "kafka_producer_messages_sent_total",
                "Total number of messages sent by producer",
            ),
            &["topic"],
        )
        .expect("valid metric kafka_producer_messages_sent_total"),
    )
});

pub static PRODUCER_SENT_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "kafka_producer_messages_sent_bytes_total",
                "Total bytes sent by producer",
            ),
            &["topic"],
        )
        .expect("valid metric kafka_producer_messages_sent_bytes_total"),
    )
});

pub static PRODUCER_SEND_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "kafka_producer_message_send_duration_seconds",
                "Duration from message creation to broker acknowledgment",
            )
            .buckets(exponential_buckets(0.001, 2.0, 10).expect("valid buckets")),
            &["topic"],
        )
        .expect("valid metric kafka_producer_message_send_duration_seconds"),
    )
});

pub static PRODUCER_ENCODE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "kafka_producer_message_encode_duration_seconds",
                "Duration of encoding a message into the wire envelope",
            )
            .buckets(exponential_buckets(0.0001, 2.0, 10).expect("valid buckets")),
            &["topic"],
        )
        .expect("valid metric kafka_producer_message_encode_duration_seconds"),
    )
});

pub static PRODUCER_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "kafka_producer_errors_total",
                "Total number of producer errors",
            ),
            &["topic", "error_type"],
        )
        .expect("valid metric kafka_producer_errors_total"),
    )
});

// Consumer metrics

pub static CONSUMER_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "kafka_consumer_messages_received_total",
                "Total number of messages received by consumer",
            ),
            &["topic", "partition"],
        )
        .expect("valid metric kafka_consumer_messages_received_total"),
    )
});

pub static CONSUMER_RECEIVED_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "kafka_consumer_messages_received_bytes_total",
                "Total bytes received by consumer",
            ),
            &["topic", "partition"],
        )
        .expect("valid metric kafka_consumer_messages_received_bytes_total"),
    )
});

pub static CONSUMER_PROCESSING_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "kafka_consumer_message_processing_duration_seconds",
                "Duration from receiving a message to completing its handling",
            )
            .buckets(exponential_buckets(0.001, 2.0, 10).expect("valid buckets")),
            &["topic", "partition"],
        )
        .expect("valid metric kafka_consumer_message_processing_duration_seconds"),
    )
});

pub static CONSUMER_DECODE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "kafka_consumer_message_decode_duration_seconds",
                "Duration of decoding a message from the wire envelope",
            )
            .buckets(exponential_buckets(0.0001, 2.0, 10).expect("valid buckets")),
            &["topic", "partition"],
        )
        .expect("valid metric kafka_consumer_message_decode_duration_seconds"),
    )
});

pub static CONSUMER_E2E_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "kafka_consumer_end_to_end_latency_seconds",
                "Latency from message creation timestamp to consumption",
            )
            .buckets(exponential_buckets(0.01, 2.0, 12).expect("valid buckets")),
            &["topic", "partition"],
        )
        .expect("valid metric kafka_consumer_end_to_end_latency_seconds"),
    )
});

pub static CONSUMER_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "kafka_consumer_errors_total",
                "Total number of consumer errors",
            ),
            &["topic", "error_type"],
        )
        .expect("valid metric kafka_consumer_errors_total"),
    )
});

pub static CONSUMER_LAG: Lazy<IntGaugeVec> = Lazy::new(|| {
    register(
        IntGaugeVec::new(
            Opts::new(
                "kafka_consumer_lag",
                "Offset distance between the high watermark and the group's committed position",
            ),
            &["topic", "partition", "group_id"],
        )
        .expect("valid metric kafka_consumer_lag"),
    )
});

// Delivery ledger metrics

pub static DELIVERY_HASH_MISMATCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "delivery_hash_mismatch_total",
                "Messages whose content digest differed from the ledger record",
            ),
            &["topic", "partition"],
        )
        .expect("valid metric delivery_hash_mismatch_total"),
    )
});

pub static DELIVERY_PENDING_RECORDS: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new(
            "delivery_pending_records",
            "Ledger records published but not yet reconciled",
        )
        .expect("valid metric delivery_pending_records"),
    )
});

pub static DELIVERY_STALE_RECORDS: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new(
            "delivery_stale_records",
            "Unreconciled ledger records older than the SLO threshold",
        )
        .expect("valid metric delivery_stale_records"),
    )
});

// Schema registry metrics

pub static REGISTRY_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "schema_registry_requests_total",
                "Total number of schema registry API requests",
            ),
            &["operation"],
        )
        .expect("valid metric schema_registry_requests_total"),
    )
});

pub static REGISTRY_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "schema_registry_request_duration_seconds",
                "Duration of schema registry API requests",
            )
            .buckets(exponential_buckets(0.001, 2.0, 10).expect("valid buckets")),
            &["operation"],
        )
        .expect("valid metric schema_registry_request_duration_seconds"),
    )
});

pub static REGISTRY_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new(
                "schema_registry_errors_total",
                "Total number of schema registry errors",
            ),
            &["operation", "error_type"],
        )
        .expect("valid metric schema_registry_errors_total"),
    )
});

// Connectivity

pub static KAFKA_CONNECTION_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register(
        IntGaugeVec::new(
            Opts::new(
                "kafka_connection_status",
                "Kafka connection status (1 = connected, 0 = disconnected)",
            ),
            &["broker"],
        )
        .expect("valid metric kafka_connection_status"),
    )
});

pub static REGISTRY_CONNECTION_STATUS: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new(
            "schema_registry_connection_status",
            "Schema registry connection status (1 = connected, 0 = disconnected)",
        )
        .expect("valid metric schema_registry_connection_status"),
    )
});

/// Flip the per-broker connectivity gauge for every configured broker.
pub fn set_kafka_connected(brokers: &[String], connected: bool) {
    let value = i64::from(connected);
    for broker in brokers {
        KAFKA_CONNECTION_STATUS
            .with_label_values(&[broker])
            .set(value);
    }
}
