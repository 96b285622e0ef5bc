use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::engagement::Engagement;
use crate::domain::ledger::LedgerAccount;
use crate::domain::metrics::{Message, ResponseMetrics};
use crate::domain::payment::PaymentRecord;
use crate::domain::ports::{
    Anomaly, AnomalyStore, Clock, EngagementStore, IdempotencyStore, LedgerStore, MessageStore,
    PaymentStore, ResponseMetricsStore, Stores, SubscriptionStore,
};
use crate::domain::subscription::Subscription;
use crate::error::{EngineError, Result};
use crate::infrastructure::clock::SystemClock;

pub const CF_ENGAGEMENTS: &str = "engagements";
pub const CF_LEDGERS: &str = "ledgers";
pub const CF_SUBSCRIPTIONS: &str = "subscriptions";
pub const CF_PAYMENTS: &str = "payments";
pub const CF_IDEMPOTENCY: &str = "idempotency";
pub const CF_MESSAGES: &str = "messages";
pub const CF_METRICS: &str = "metrics";
pub const CF_ANOMALIES: &str = "anomalies";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_ENGAGEMENTS,
    CF_LEDGERS,
    CF_SUBSCRIPTIONS,
    CF_PAYMENTS,
    CF_IDEMPOTENCY,
    CF_MESSAGES,
    CF_METRICS,
    CF_ANOMALIES,
];

/// A persistent store implementation using RocksDB.
///
/// Every aggregate lives in its own column family as JSON keyed by its
/// natural id. Read-check-write sequences (version checks, idempotency keys)
/// run under `write_lock`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            clock: Arc::new(SystemClock),
        })
    }

    /// Stamps idempotency keys with `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Every port served by this one database.
    pub fn stores(&self) -> Stores {
        Stores {
            engagements: Arc::new(self.clone()),
            ledgers: Arc::new(self.clone()),
            subscriptions: Arc::new(self.clone()),
            payments: Arc::new(self.clone()),
            idempotency: Arc::new(self.clone()),
            messages: Arc::new(self.clone()),
            metrics: Arc::new(self.clone()),
            anomalies: Arc::new(self.clone()),
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            EngineError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                name
            ))))
        })
    }

    fn put<T: Serialize>(&self, name: &str, key: &str, value: &T) -> Result<()> {
        let cf = self.cf(name)?;
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, name: &str, key: &str) -> Result<Option<T>> {
        let cf = self.cf(name)?;
        match self.db.get_pinned_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, name: &str, prefix: &str) -> Result<Vec<T>> {
        let cf = self.cf(name)?;
        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }
}

// Sorts lexicographically in time order.
fn time_key(at: DateTime<Utc>) -> String {
    format!("{:020}", at.timestamp_micros().max(0))
}

#[async_trait]
impl EngagementStore for RocksDBStore {
    async fn insert(&self, engagement: Engagement) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self
            .fetch::<Engagement>(CF_ENGAGEMENTS, &engagement.code)?
            .is_some()
        {
            return Err(EngineError::ValidationError(format!(
                "Engagement code {} is already taken",
                engagement.code
            )));
        }
        self.put(CF_ENGAGEMENTS, &engagement.code, &engagement)
    }

    async fn get(&self, code: &str) -> Result<Option<Engagement>> {
        self.fetch(CF_ENGAGEMENTS, code)
    }

    async fn update(&self, engagement: Engagement, expected_version: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let current: Engagement = self
            .fetch(CF_ENGAGEMENTS, &engagement.code)?
            .ok_or_else(|| EngineError::not_found("engagement", engagement.code.clone()))?;
        if current.version != expected_version {
            return Err(EngineError::ConcurrentConflict {
                id: engagement.code,
                expected: expected_version,
            });
        }
        self.put(CF_ENGAGEMENTS, &engagement.code, &engagement)
    }

    async fn due_for_auto_confirm(&self, now: DateTime<Utc>) -> Result<Vec<Engagement>> {
        let mut due: Vec<Engagement> = self
            .scan::<Engagement>(CF_ENGAGEMENTS, "")?
            .into_iter()
            .filter(|e| e.is_due_for_auto_confirm(now))
            .collect();
        due.sort_by_key(|e| e.confirmation.auto_confirm_deadline);
        Ok(due)
    }

    async fn get_all(&self) -> Result<Vec<Engagement>> {
        let mut all: Vec<Engagement> = self.scan(CF_ENGAGEMENTS, "")?;
        all.sort_by(|a, b| (a.created_at, &a.code).cmp(&(b.created_at, &b.code)));
        Ok(all)
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn store(&self, account: LedgerAccount) -> Result<()> {
        self.put(CF_LEDGERS, &account.professional, &account)
    }

    async fn get(&self, professional: &str) -> Result<Option<LedgerAccount>> {
        self.fetch(CF_LEDGERS, professional)
    }

    async fn get_all(&self) -> Result<Vec<LedgerAccount>> {
        self.scan(CF_LEDGERS, "")
    }
}

#[async_trait]
impl SubscriptionStore for RocksDBStore {
    async fn store(&self, subscription: Subscription) -> Result<()> {
        self.put(CF_SUBSCRIPTIONS, &subscription.user, &subscription)
    }

    async fn get(&self, user: &str) -> Result<Option<Subscription>> {
        self.fetch(CF_SUBSCRIPTIONS, user)
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn store(&self, record: PaymentRecord) -> Result<()> {
        self.put(CF_PAYMENTS, &record.id, &record)
    }

    async fn get(&self, id: &str) -> Result<Option<PaymentRecord>> {
        self.fetch(CF_PAYMENTS, id)
    }
}

#[async_trait]
impl IdempotencyStore for RocksDBStore {
    async fn insert_if_absent(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.fetch::<DateTime<Utc>>(CF_IDEMPOTENCY, key)?.is_some() {
            return Ok(false);
        }
        self.put(CF_IDEMPOTENCY, key, &self.clock.now())?;
        Ok(true)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let cf = self.cf(CF_IDEMPOTENCY)?;
        Ok(self.db.get_pinned_cf(cf, key.as_bytes())?.is_some())
    }
}

#[async_trait]
impl MessageStore for RocksDBStore {
    async fn append(&self, message: Message) -> Result<()> {
        let key = format!(
            "{}/{}/{}",
            message.engagement,
            time_key(message.sent_at),
            uuid::Uuid::new_v4().simple()
        );
        self.put(CF_MESSAGES, &key, &message)
    }

    async fn thread(&self, engagement: &str) -> Result<Vec<Message>> {
        self.scan(CF_MESSAGES, &format!("{}/", engagement))
    }

    async fn get_all(&self) -> Result<Vec<Message>> {
        let mut all: Vec<Message> = self.scan(CF_MESSAGES, "")?;
        all.sort_by_key(|m| m.sent_at);
        Ok(all)
    }
}

#[async_trait]
impl ResponseMetricsStore for RocksDBStore {
    async fn store(&self, metrics: ResponseMetrics) -> Result<()> {
        self.put(CF_METRICS, &metrics.professional, &metrics)
    }

    async fn get(&self, professional: &str) -> Result<Option<ResponseMetrics>> {
        self.fetch(CF_METRICS, professional)
    }
}

#[async_trait]
impl AnomalyStore for RocksDBStore {
    async fn record(&self, anomaly: Anomaly) -> Result<()> {
        let key = format!("{}/{}", time_key(anomaly.at), uuid::Uuid::new_v4().simple());
        self.put(CF_ANOMALIES, &key, &anomaly)
    }

    async fn get_all(&self) -> Result<Vec<Anomaly>> {
        self.scan(CF_ANOMALIES, "")
    }
}
