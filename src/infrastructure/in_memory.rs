use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::engagement::Engagement;
use crate::domain::ledger::LedgerAccount;
use crate::domain::metrics::{Message, ResponseMetrics};
use crate::domain::payment::PaymentRecord;
use crate::domain::ports::{
    Anomaly, AnomalyStore, EngagementStore, IdempotencyStore, LedgerStore, MessageStore,
    PaymentStore, ResponseMetricsStore, Stores, SubscriptionStore,
};
use crate::domain::subscription::Subscription;
use crate::error::{EngineError, Result};

/// A thread-safe in-memory store for engagements.
///
/// Uses `Arc<RwLock<HashMap<String, Engagement>>>` keyed by order code. The
/// version check in [`EngagementStore::update`] runs under the write lock.
#[derive(Default, Clone)]
pub struct InMemoryEngagementStore {
    engagements: Arc<RwLock<HashMap<String, Engagement>>>,
}

impl InMemoryEngagementStore {
    /// Creates a new, empty in-memory engagement store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngagementStore for InMemoryEngagementStore {
    async fn insert(&self, engagement: Engagement) -> Result<()> {
        let mut engagements = self.engagements.write().await;
        if engagements.contains_key(&engagement.code) {
            return Err(EngineError::ValidationError(format!(
                "Engagement code {} is already taken",
                engagement.code
            )));
        }
        engagements.insert(engagement.code.clone(), engagement);
        Ok(())
    }

    async fn get(&self, code: &str) -> Result<Option<Engagement>> {
        let engagements = self.engagements.read().await;
        Ok(engagements.get(code).cloned())
    }

    async fn update(&self, engagement: Engagement, expected_version: u64) -> Result<()> {
        let mut engagements = self.engagements.write().await;
        let current = engagements
            .get(&engagement.code)
            .ok_or_else(|| EngineError::not_found("engagement", engagement.code.clone()))?;
        if current.version != expected_version {
            return Err(EngineError::ConcurrentConflict {
                id: engagement.code,
                expected: expected_version,
            });
        }
        engagements.insert(engagement.code.clone(), engagement);
        Ok(())
    }

    async fn due_for_auto_confirm(&self, now: DateTime<Utc>) -> Result<Vec<Engagement>> {
        let engagements = self.engagements.read().await;
        let mut due: Vec<Engagement> = engagements
            .values()
            .filter(|e| e.is_due_for_auto_confirm(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.confirmation.auto_confirm_deadline);
        Ok(due)
    }

    async fn get_all(&self) -> Result<Vec<Engagement>> {
        let engagements = self.engagements.read().await;
        let mut all: Vec<Engagement> = engagements.values().cloned().collect();
        all.sort_by(|a, b| (a.created_at, &a.code).cmp(&(b.created_at, &b.code)));
        Ok(all)
    }
}

/// A thread-safe in-memory store for token accounts.
///
/// Uses `Arc<RwLock<HashMap<String, LedgerAccount>>>` keyed by professional.
/// The ledger service serialises writers per account, so no version is kept.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    accounts: Arc<RwLock<HashMap<String, LedgerAccount>>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory token account store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn store(&self, account: LedgerAccount) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        accounts.insert(account.professional.clone(), account);
        Ok(())
    }

    async fn get(&self, professional: &str) -> Result<Option<LedgerAccount>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(professional).cloned())
    }

    async fn get_all(&self) -> Result<Vec<LedgerAccount>> {
        let accounts = self.accounts.read().await;
        let mut all: Vec<LedgerAccount> = accounts.values().cloned().collect();
        all.sort_by(|a, b| a.professional.cmp(&b.professional));
        Ok(all)
    }
}

/// A thread-safe in-memory store for subscriptions, one per user.
#[derive(Default, Clone)]
pub struct InMemorySubscriptionStore {
    subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
}

impl InMemorySubscriptionStore {
    /// Creates a new, empty in-memory subscription store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn store(&self, subscription: Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(subscription.user.clone(), subscription);
        Ok(())
    }

    async fn get(&self, user: &str) -> Result<Option<Subscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions.get(user).cloned())
    }
}

/// A thread-safe in-memory store for payment records.
///
/// Keyed by the id the provider echoes back as the external reference.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    records: Arc<RwLock<HashMap<String, PaymentRecord>>>,
}

impl InMemoryPaymentStore {
    /// Creates a new, empty in-memory payment store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn store(&self, record: PaymentRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PaymentRecord>> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }
}

/// Remembers which webhook deliveries were already applied.
///
/// Uses `Arc<RwLock<HashSet<String>>>`; the insert doubles as the check.
#[derive(Default, Clone)]
pub struct InMemoryIdempotencyStore {
    keys: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryIdempotencyStore {
    /// Creates a new, empty in-memory idempotency key store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn insert_if_absent(&self, key: &str) -> Result<bool> {
        let mut keys = self.keys.write().await;
        Ok(keys.insert(key.to_string()))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let keys = self.keys.read().await;
        Ok(keys.contains(key))
    }
}

/// Message threads kept in arrival order.
#[derive(Default, Clone)]
pub struct InMemoryMessageStore {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl InMemoryMessageStore {
    /// Creates a new, empty in-memory message store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        messages.push(message);
        Ok(())
    }

    async fn thread(&self, engagement: &str) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.engagement == engagement)
            .cloned()
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        Ok(messages.clone())
    }
}

/// A thread-safe in-memory store for per-professional response metrics.
#[derive(Default, Clone)]
pub struct InMemoryResponseMetricsStore {
    metrics: Arc<RwLock<HashMap<String, ResponseMetrics>>>,
}

impl InMemoryResponseMetricsStore {
    /// Creates a new, empty in-memory response metrics store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseMetricsStore for InMemoryResponseMetricsStore {
    async fn store(&self, metrics: ResponseMetrics) -> Result<()> {
        let mut all = self.metrics.write().await;
        all.insert(metrics.professional.clone(), metrics);
        Ok(())
    }

    async fn get(&self, professional: &str) -> Result<Option<ResponseMetrics>> {
        let all = self.metrics.read().await;
        Ok(all.get(professional).cloned())
    }
}

/// Append-only log of unmatched external events.
#[derive(Default, Clone)]
pub struct InMemoryAnomalyStore {
    anomalies: Arc<RwLock<Vec<Anomaly>>>,
}

impl InMemoryAnomalyStore {
    /// Creates a new, empty in-memory anomaly store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnomalyStore for InMemoryAnomalyStore {
    async fn record(&self, anomaly: Anomaly) -> Result<()> {
        let mut anomalies = self.anomalies.write().await;
        anomalies.push(anomaly);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Anomaly>> {
        let anomalies = self.anomalies.read().await;
        Ok(anomalies.clone())
    }
}

impl Stores {
    /// Fresh, empty in-memory backends for every aggregate.
    pub fn in_memory() -> Self {
        Self {
            engagements: Arc::new(InMemoryEngagementStore::new()),
            ledgers: Arc::new(InMemoryLedgerStore::new()),
            subscriptions: Arc::new(InMemorySubscriptionStore::new()),
            payments: Arc::new(InMemoryPaymentStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            messages: Arc::new(InMemoryMessageStore::new()),
            metrics: Arc::new(InMemoryResponseMetricsStore::new()),
            anomalies: Arc::new(InMemoryAnomalyStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engagement::{Address, EngagementState};
    use crate::domain::ledger::TokenPlan;
    use chrono::Duration;

    fn request(code: &str) -> Engagement {
        Engagement::request(
            code.into(),
            "client".into(),
            "pro".into(),
            "Paint wall".into(),
            Address::new("Calle 1", "Once", "Buenos Aires"),
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_engagement_insert_rejects_duplicates() {
        let store = InMemoryEngagementStore::new();
        store.insert(request("SOL-1")).await.unwrap();
        assert!(matches!(
            store.insert(request("SOL-1")).await,
            Err(EngineError::ValidationError(_))
        ));
        assert!(store.get("SOL-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engagement_update_checks_version() {
        let store = InMemoryEngagementStore::new();
        store.insert(request("SOL-1")).await.unwrap();

        let mut next = store.get("SOL-1").await.unwrap().unwrap();
        next.state = EngagementState::Contacted;
        next.version = 1;
        store.update(next.clone(), 0).await.unwrap();

        let result = store.update(next, 0).await;
        assert!(matches!(
            result,
            Err(EngineError::ConcurrentConflict { expected: 0, .. })
        ));
        assert_eq!(store.get("SOL-1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_due_for_auto_confirm() {
        let store = InMemoryEngagementStore::new();
        let now = Utc::now();

        let mut due = request("SOL-1");
        due.state = EngagementState::PendingConfirmation;
        due.confirmation.auto_confirm_deadline = Some(now - Duration::minutes(1));
        let mut later = request("SOL-2");
        later.state = EngagementState::PendingConfirmation;
        later.confirmation.auto_confirm_deadline = Some(now + Duration::hours(1));
        store.insert(due).await.unwrap();
        store.insert(later).await.unwrap();
        store.insert(request("SOL-3")).await.unwrap();

        let found = store.due_for_auto_confirm(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "SOL-1");
    }

    #[tokio::test]
    async fn test_ledger_store_round_trip() {
        let store = InMemoryLedgerStore::new();
        store.store(LedgerAccount::new("b", TokenPlan::Basic)).await.unwrap();
        store.store(LedgerAccount::new("a", TokenPlan::Premium)).await.unwrap();

        let all = store.get_all().await.unwrap();
        let names: Vec<_> = all.iter().map(|a| a.professional.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.get("a").await.unwrap().unwrap().plan, TokenPlan::Premium);
    }

    #[tokio::test]
    async fn test_idempotency_keys() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.insert_if_absent("pay-1:mp-1").await.unwrap());
        assert!(!store.insert_if_absent("pay-1:mp-1").await.unwrap());
        assert!(store.contains("pay-1:mp-1").await.unwrap());
    }
}
