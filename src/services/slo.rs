//! SLO scanning over the delivery ledger.
//!
//! A record still in the ledger is a message published but not yet
//! reconciled. The scanner walks the namespace page by page, counting every
//! record as pending and the over-threshold ones as stale, and only
//! publishes the gauges after a full successful pass. An aborted pass
//! leaves the previous gauge values standing.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::{DELIVERY_PENDING_RECORDS, DELIVERY_STALE_RECORDS};
use crate::tracker::{DeliveryRecord, LedgerStore, RECEIVED_COUNTER, SENT_COUNTER};

const SCAN_PAGE_SIZE: usize = 100;

/// Walk the whole ledger namespace and classify its records.
///
/// Returns `(pending, stale)`. A key that disappears between the scan page
/// and its read was reconciled mid-pass and still counts as pending for
/// this cycle; a store error aborts the pass entirely.
pub async fn scan_counts<S: LedgerStore>(
    store: &S,
    prefix: &str,
    now_ms: i64,
    threshold: Duration,
) -> Result<(u64, u64)> {
    let pattern = format!("{prefix}*");
    let sent_key = format!("{prefix}{SENT_COUNTER}");
    let received_key = format!("{prefix}{RECEIVED_COUNTER}");
    let threshold_ms = threshold.as_millis() as i64;

    let mut pending = 0u64;
    let mut stale = 0u64;
    let mut cursor = 0u64;

    loop {
        let (next_cursor, keys) = store.scan_page(&pattern, cursor, SCAN_PAGE_SIZE).await?;
        for key in keys {
            if key == sent_key || key == received_key {
                continue;
            }
            pending += 1;
            let Some(value) = store.get(&key).await? else {
                continue;
            };
            let Some(record) = DeliveryRecord::parse(&value) else {
                debug!(%key, "skipping unparseable ledger record");
                continue;
            };
            if record.age_ms(now_ms) > threshold_ms {
                stale += 1;
            }
        }
        if next_cursor == 0 {
            break;
        }
        cursor = next_cursor;
    }

    Ok((pending, stale))
}

/// Periodic ledger scanner publishing the pending/stale gauges.
pub struct SloScanner<S> {
    store: S,
    prefix: String,
    threshold: Duration,
    interval: Duration,
}

impl<S: LedgerStore> SloScanner<S> {
    pub fn new(store: S, prefix: &str, threshold: Duration, interval: Duration) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            threshold,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        info!(
            prefix = %self.prefix,
            threshold_secs = self.threshold.as_secs(),
            "slo scanner started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("slo scanner stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let now_ms = Utc::now().timestamp_millis();
                    match scan_counts(&self.store, &self.prefix, now_ms, self.threshold).await {
                        Ok((pending, stale)) => {
                            DELIVERY_PENDING_RECORDS.set(pending as i64);
                            DELIVERY_STALE_RECORDS.set(stale as i64);
                            debug!(pending, stale, "ledger scan complete");
                        }
                        Err(e) => warn!("ledger scan abandoned: {e}"),
                    }
                }
            }
        }
    }
}
