use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::engagement::{Address, Engagement, UserId};
use super::ledger::LedgerAccount;
use super::metrics::{Message, ResponseMetrics};
use super::payment::PaymentRecord;
use super::subscription::Subscription;
use crate::error::Result;

#[async_trait]
pub trait EngagementStore: Send + Sync {
    /// Fails with `ValidationError` if the code is already taken.
    async fn insert(&self, engagement: Engagement) -> Result<()>;
    async fn get(&self, code: &str) -> Result<Option<Engagement>>;
    /// Replaces the stored engagement only if its version is still
    /// `expected_version`; `ConcurrentConflict` otherwise.
    async fn update(&self, engagement: Engagement, expected_version: u64) -> Result<()>;
    async fn due_for_auto_confirm(&self, now: DateTime<Utc>) -> Result<Vec<Engagement>>;
    async fn get_all(&self) -> Result<Vec<Engagement>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn store(&self, account: LedgerAccount) -> Result<()>;
    async fn get(&self, professional: &str) -> Result<Option<LedgerAccount>>;
    async fn get_all(&self) -> Result<Vec<LedgerAccount>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn store(&self, subscription: Subscription) -> Result<()>;
    async fn get(&self, user: &str) -> Result<Option<Subscription>>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn store(&self, record: PaymentRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<PaymentRecord>>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns `true` if the key was not seen before.
    async fn insert_if_absent(&self, key: &str) -> Result<bool>;
    async fn contains(&self, key: &str) -> Result<bool>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: Message) -> Result<()>;
    /// Messages of one engagement in send order.
    async fn thread(&self, engagement: &str) -> Result<Vec<Message>>;
    async fn get_all(&self) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait ResponseMetricsStore: Send + Sync {
    async fn store(&self, metrics: ResponseMetrics) -> Result<()>;
    async fn get(&self, professional: &str) -> Result<Option<ResponseMetrics>>;
}

/// Something that arrived from outside and matched nothing we know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub at: DateTime<Utc>,
    pub source: String,
    pub reference: String,
    pub detail: String,
}

#[async_trait]
pub trait AnomalyStore: Send + Sync {
    async fn record(&self, anomaly: Anomaly) -> Result<()>;
    async fn get_all(&self) -> Result<Vec<Anomaly>>;
}

/// The storage backends the engine runs on.
#[derive(Clone)]
pub struct Stores {
    pub engagements: Arc<dyn EngagementStore>,
    pub ledgers: Arc<dyn LedgerStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub payments: Arc<dyn PaymentStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub messages: Arc<dyn MessageStore>,
    pub metrics: Arc<dyn ResponseMetricsStore>,
    pub anomalies: Arc<dyn AnomalyStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user: UserId,
    pub title: String,
    pub body: String,
    pub deep_link: String,
}

/// Fire-and-forget delivery to a user's live connections.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageQuote {
    pub covered: bool,
    pub distance_km: Option<Decimal>,
    pub travel_surcharge: Decimal,
}

/// Decides whether a professional serves an address and at what surcharge.
#[async_trait]
pub trait CoverageProvider: Send + Sync {
    async fn quote(&self, professional: &str, address: &Address) -> Result<CoverageQuote>;
}
