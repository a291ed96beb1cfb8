use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kafka_canary::codec::{MessageDecoder, WireCodec};
use kafka_canary::config::{Config, Mode};
use kafka_canary::health::{self, Lifecycle, Stage};
use kafka_canary::metrics::{set_kafka_connected, REGISTRY_CONNECTION_STATUS};
use kafka_canary::schema::{HttpSchemaRegistry, SchemaResolver};
use kafka_canary::services::{ConsumerLoop, LagMonitor, ProducerLoop, SloScanner};
use kafka_canary::tracker::{DeliveryTracker, RedisLedger};

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kafka_canary=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(mode = ?config.mode, topic = %config.kafka_topic, "starting kafka-canary");

    let lifecycle = Lifecycle::new();

    // The probe endpoint runs for the whole process lifetime; it dies with
    // the process rather than observing the shutdown signal itself.
    {
        let lifecycle = lifecycle.clone();
        let port = config.health_port;
        actix_web::rt::spawn(async move {
            if let Err(e) = health::run_server(port, lifecycle).await {
                tracing::error!("health server error: {e}");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received, draining");
            lifecycle.advance(Stage::Draining);
            let _ = shutdown_tx.send(());
        });
    }

    match config.mode {
        Mode::Producer => run_producer(&config, &lifecycle, shutdown_rx).await?,
        Mode::Consumer => run_consumer(&config, &lifecycle, shutdown_rx).await?,
    }

    lifecycle.advance(Stage::Stopped);
    info!("kafka-canary stopped");
    Ok(())
}

async fn run_producer(
    config: &Config,
    lifecycle: &Lifecycle,
    shutdown: watch::Receiver<()>,
) -> Result<()> {
    let registry = HttpSchemaRegistry::new(&config.schema_registry_url)
        .context("failed to build schema registry client")?;
    let resolver = SchemaResolver::new(registry);
    let schema = resolver
        .get_or_register(&config.schema_subject())
        .await
        .context("failed to resolve message schema")?;
    REGISTRY_CONNECTION_STATUS.set(1);
    info!(schema_id = schema.id, "message schema resolved");

    let codec = WireCodec::new(schema);
    let tracker = connect_tracker(config).await;
    let producer =
        ProducerLoop::new(config, codec, tracker).context("failed to create kafka producer")?;
    set_kafka_connected(&config.broker_list(), true);

    lifecycle.advance(Stage::Ready);
    info!("producer is ready");
    producer.run(shutdown).await;
    Ok(())
}

async fn run_consumer(
    config: &Config,
    lifecycle: &Lifecycle,
    shutdown: watch::Receiver<()>,
) -> Result<()> {
    let registry = HttpSchemaRegistry::new(&config.schema_registry_url)
        .context("failed to build schema registry client")?;
    let resolver = Arc::new(SchemaResolver::new(registry));
    REGISTRY_CONNECTION_STATUS.set(1);

    let store = match RedisLedger::connect(&config.redis_url).await {
        Ok(store) => {
            info!("redis connected for delivery verification");
            Some(store)
        }
        Err(e) => {
            warn!("redis unavailable, delivery verification disabled: {e}");
            None
        }
    };
    let tracker = store
        .clone()
        .map(|store| DeliveryTracker::new(store, &config.ledger_key_prefix));
    let consumer = ConsumerLoop::new(config, MessageDecoder::new(resolver), tracker)
        .context("failed to create kafka consumer")?;
    set_kafka_connected(&config.broker_list(), true);

    let lag_monitor =
        Arc::new(LagMonitor::new(config).context("failed to create lag monitor client")?);
    tokio::spawn(lag_monitor.run(shutdown.clone()));

    if let Some(store) = store {
        let scanner = SloScanner::new(
            store,
            &config.ledger_key_prefix,
            Duration::from_secs(config.slo_threshold_secs),
            Duration::from_secs(config.scan_interval_secs),
        );
        tokio::spawn(scanner.run(shutdown.clone()));
    }

    lifecycle.advance(Stage::Ready);
    info!("consumer is ready");
    consumer.run(shutdown).await;
    Ok(())
}

/// Connect the delivery ledger. Advisory subsystem: when the store is down
/// the harness keeps exchanging messages without tracking them.
async fn connect_tracker(config: &Config) -> Option<DeliveryTracker<RedisLedger>> {
    match RedisLedger::connect(&config.redis_url).await {
        Ok(store) => {
            info!("redis connected for delivery tracking");
            Some(DeliveryTracker::new(store, &config.ledger_key_prefix))
        }
        Err(e) => {
            warn!("redis unavailable, delivery tracking disabled: {e}");
            None
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
