//! Delivery verification ledger.
//!
//! Every published message leaves a `digest:timestamp` record in the store
//! under a namespaced key. The consumer that observes a matching digest
//! removes the record exactly once; anything left behind is either in
//! flight or lost, and the SLO scanner ages it out. All store access goes
//! through single-key atomic primitives, so no cross-key transactions are
//! needed.

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

/// Counter keys living inside the ledger namespace. The scanner skips them.
pub const SENT_COUNTER: &str = "metrics:sent_total";
pub const RECEIVED_COUNTER: &str = "metrics:received_total";

/// Key/value operations the tracker and scanner consume. Single-key atomic,
/// per the store's own guarantees.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Delete `key` only if its current value equals `expected`. Returns
    /// whether a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
    async fn incr(&self, key: &str) -> Result<i64>;
    /// One page of keys matching `pattern`. A zero returned cursor means the
    /// iteration is complete.
    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize)
        -> Result<(u64, Vec<String>)>;
}

static COMPARE_AND_DELETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

/// Redis-backed ledger store.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
}

impl RedisLedger {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LedgerStore for RedisLedger {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn.clone();
        let page: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(page)
    }
}

/// Hex-encoded SHA-256 of the raw wire bytes.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One ledger entry, serialized as `"<64-hex-char-digest>:<epoch-millis>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub digest: String,
    pub published_at_ms: i64,
}

impl DeliveryRecord {
    pub fn new(payload: &[u8], published_at_ms: i64) -> Self {
        Self {
            digest: content_digest(payload),
            published_at_ms,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (digest, millis) = value.split_once(':')?;
        Some(Self {
            digest: digest.to_string(),
            published_at_ms: millis.parse().ok()?,
        })
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.published_at_ms
    }
}

impl std::fmt::Display for DeliveryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.digest, self.published_at_ms)
    }
}

/// How a received message reconciled against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Digest matched; the record was consumed exactly once.
    Matched,
    /// Digest differed: corruption, distinct from plain loss. The record
    /// stays in place so the scanner can still age it out.
    Mismatched,
    /// No record for the key: it predates tracking or was already
    /// reconciled. Not an error.
    Untracked,
}

/// Write-once, read-once delivery tracker over a [`LedgerStore`].
pub struct DeliveryTracker<S> {
    store: S,
    prefix: String,
}

impl<S: LedgerStore> DeliveryTracker<S> {
    pub fn new(store: S, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
        }
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    pub fn sent_counter_key(&self) -> String {
        format!("{}{SENT_COUNTER}", self.prefix)
    }

    pub fn received_counter_key(&self) -> String {
        format!("{}{RECEIVED_COUNTER}", self.prefix)
    }

    /// Record a freshly published message. Best-effort: the caller logs a
    /// failure and moves on, tracking never fails the publish itself.
    pub async fn on_publish(&self, key: &str, payload: &[u8]) -> Result<()> {
        let record = DeliveryRecord::new(payload, Utc::now().timestamp_millis());
        self.store
            .set(&self.record_key(key), &record.to_string())
            .await?;
        self.store.incr(&self.sent_counter_key()).await?;
        Ok(())
    }

    /// Reconcile a received message against its ledger record. Uses an
    /// atomic compare-and-delete so a duplicate consumption can never count
    /// the same record twice: the loser of the race sees `Untracked`.
    pub async fn on_receive(&self, key: &str, payload: &[u8]) -> Result<ReconcileOutcome> {
        let record_key = self.record_key(key);
        let Some(stored) = self.store.get(&record_key).await? else {
            return Ok(ReconcileOutcome::Untracked);
        };

        let expected = stored.split(':').next().unwrap_or_default();
        if content_digest(payload) != expected {
            return Ok(ReconcileOutcome::Mismatched);
        }

        if self.store.compare_and_delete(&record_key, &stored).await? {
            self.store.incr(&self.received_counter_key()).await?;
            Ok(ReconcileOutcome::Matched)
        } else {
            debug!(key, "record consumed concurrently");
            Ok(ReconcileOutcome::Untracked)
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory ledger store for tests.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryLedger {
        data: Arc<Mutex<BTreeMap<String, String>>>,
    }

    impl MemoryLedger {
        pub fn insert(&self, key: &str, value: &str) {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        pub fn value(&self, key: &str) -> Option<String> {
            self.data.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl LedgerStore for MemoryLedger {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.insert(key, value);
            Ok(())
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
            let mut data = self.data.lock().unwrap();
            if data.get(key).map(String::as_str) == Some(expected) {
                data.remove(key);
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn incr(&self, key: &str) -> Result<i64> {
            let mut data = self.data.lock().unwrap();
            let next = data
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
                + 1;
            data.insert(key.to_string(), next.to_string());
            Ok(next)
        }

        async fn scan_page(
            &self,
            pattern: &str,
            _cursor: u64,
            _count: usize,
        ) -> Result<(u64, Vec<String>)> {
            let prefix = pattern.trim_end_matches('*');
            let keys = self
                .data
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            Ok((0, keys))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryLedger;
    use super::*;

    fn tracker(store: &MemoryLedger) -> DeliveryTracker<MemoryLedger> {
        DeliveryTracker::new(store.clone(), "kafka-msg:")
    }

    #[test]
    fn digest_is_64_hex_chars() {
        let digest = content_digest(b"");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn record_value_format_round_trips() {
        let record = DeliveryRecord::new(b"payload", 1_700_000_000_123);
        let rendered = record.to_string();
        assert_eq!(rendered, format!("{}:1700000000123", record.digest));
        assert_eq!(DeliveryRecord::parse(&rendered), Some(record));
    }

    #[test]
    fn malformed_record_values_do_not_parse() {
        assert!(DeliveryRecord::parse("no-colon").is_none());
        assert!(DeliveryRecord::parse("abc:not-a-number").is_none());
    }

    #[tokio::test]
    async fn reconciliation_consumes_the_record_exactly_once() {
        let store = MemoryLedger::default();
        let tracker = tracker(&store);

        tracker.on_publish("key-1", b"wire bytes").await.unwrap();
        assert_eq!(
            tracker.on_receive("key-1", b"wire bytes").await.unwrap(),
            ReconcileOutcome::Matched
        );
        // Second delivery of the same message finds nothing to reconcile.
        assert_eq!(
            tracker.on_receive("key-1", b"wire bytes").await.unwrap(),
            ReconcileOutcome::Untracked
        );
        assert_eq!(store.value(&tracker.received_counter_key()).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn mismatch_is_reported_and_record_retained() {
        let store = MemoryLedger::default();
        let tracker = tracker(&store);

        tracker.on_publish("key-2", b"original").await.unwrap();
        assert_eq!(
            tracker.on_receive("key-2", b"corrupted").await.unwrap(),
            ReconcileOutcome::Mismatched
        );
        // The record survives for the SLO scanner to age out.
        assert!(store.value("kafka-msg:key-2").is_some());
        assert!(store.value(&tracker.received_counter_key()).is_none());
    }

    #[tokio::test]
    async fn receive_without_publish_is_untracked() {
        let store = MemoryLedger::default();
        let tracker = tracker(&store);
        assert_eq!(
            tracker.on_receive("key-3", b"anything").await.unwrap(),
            ReconcileOutcome::Untracked
        );
    }

    #[tokio::test]
    async fn publish_bumps_sent_counter() {
        let store = MemoryLedger::default();
        let tracker = tracker(&store);
        tracker.on_publish("key-4", b"a").await.unwrap();
        tracker.on_publish("key-5", b"b").await.unwrap();
        assert_eq!(store.value(&tracker.sent_counter_key()).as_deref(), Some("2"));
    }
}
