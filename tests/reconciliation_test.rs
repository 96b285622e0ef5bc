mod common;

use async_trait::async_trait;
use common::{CLIENT, PRO, harness, harness_from, harness_with};
use engagement_ledger::application::reconciliation::ReconciliationOutcome;
use engagement_ledger::config::{EngineConfig, UnknownReferencePolicy};
use engagement_ledger::domain::engagement::{EngagementState, PaymentState};
use engagement_ledger::domain::ledger::{EntryKind, TokenPlan};
use engagement_ledger::domain::payment::{PaymentRecord, PaymentStatus, WebhookPayload};
use engagement_ledger::domain::ports::{
    AnomalyStore, Notification, Notifier, PaymentStore, Stores, SubscriptionStore,
};
use engagement_ledger::domain::subscription::{Plan, SubscriptionStatus};
use engagement_ledger::domain::transition::{Actor, Event};
use engagement_ledger::error::{EngineError, Result};
use engagement_ledger::infrastructure::in_memory::InMemoryPaymentStore;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A notifier whose deliveries never complete.
struct StuckNotifier;

#[async_trait]
impl Notifier for StuckNotifier {
    async fn notify(&self, _notification: Notification) -> Result<()> {
        std::future::pending().await
    }
}

/// Fails the first write of an approved record once armed.
#[derive(Default)]
struct FlakyPayments {
    inner: InMemoryPaymentStore,
    armed: AtomicBool,
}

#[async_trait]
impl PaymentStore for FlakyPayments {
    async fn store(&self, record: PaymentRecord) -> Result<()> {
        if record.status == PaymentStatus::Approved && self.armed.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Io(std::io::Error::other("disk full")));
        }
        self.inner.store(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<PaymentRecord>> {
        self.inner.get(id).await
    }
}

#[tokio::test]
async fn test_approved_redelivery_credits_once() {
    let h = harness();
    h.professional(TokenPlan::Basic).await;
    let record = h
        .services
        .reconciler
        .start_checkout(PRO, Plan::Professional, Some("pay-1".into()))
        .await
        .unwrap();
    assert_eq!(record.amount, dec!(2999));
    assert_eq!(record.status, PaymentStatus::Pending);

    let payload = WebhookPayload::new("mp-1", "approved", "pay-1");
    let first = h.services.reconciler.reconcile(payload.clone()).await.unwrap();
    assert_eq!(first.outcome, ReconciliationOutcome::Applied);

    for _ in 0..5 {
        let again = h.services.reconciler.reconcile(payload.clone()).await.unwrap();
        assert_eq!(again.outcome, ReconciliationOutcome::Replay);
    }
    let other_delivery = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-2", "approved", "pay-1"))
        .await
        .unwrap();
    assert_eq!(other_delivery.outcome, ReconciliationOutcome::Replay);

    let account = h.services.ledger.account(PRO).await.unwrap();
    assert_eq!(account.available, 22);
    assert_eq!(account.plan, TokenPlan::Professional);
    assert!(account.renewal_date.is_some());
    let recharges = account
        .history
        .iter()
        .filter(|e| e.kind == EntryKind::Recharge)
        .count();
    assert_eq!(recharges, 1);

    let stored = h.services.stores.payments.get("pay-1").await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Approved);
    assert!(stored.tokens_credited);
    assert_eq!(stored.provider.payment_id.as_deref(), Some("mp-1"));
}

#[tokio::test]
async fn test_pending_then_approved() {
    let h = harness();
    let (_, mut inbox) = h.registry.register(PRO).await;
    h.services
        .reconciler
        .start_checkout(PRO, Plan::Premium, Some("pay-9".into()))
        .await
        .unwrap();

    let pending = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-9", "in_process", "pay-9"))
        .await
        .unwrap();
    assert_eq!(pending.outcome, ReconciliationOutcome::Applied);
    assert_eq!(pending.payment.unwrap().status, PaymentStatus::Pending);
    let subscription = h.services.stores.subscriptions.get(PRO).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Pending);

    h.services
        .reconciler
        .reconcile(WebhookPayload::new("mp-9", "approved", "pay-9"))
        .await
        .unwrap();

    let subscription = h.services.stores.subscriptions.get(PRO).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.plan, Plan::Premium);
    assert!(subscription.expires_at.is_some());
    assert_eq!(h.services.ledger.account(PRO).await.unwrap().available, 50);

    let notification = inbox.recv().await.unwrap();
    assert_eq!(notification.title, "Subscription activated");
}

#[tokio::test]
async fn test_rejected_cancels_pending_subscription() {
    let h = harness();
    h.services
        .reconciler
        .start_checkout(PRO, Plan::Professional, Some("pay-2".into()))
        .await
        .unwrap();

    let payload = WebhookPayload::new("mp-2", "rejected", "pay-2");
    let rejected = h.services.reconciler.reconcile(payload.clone()).await.unwrap();
    assert_eq!(rejected.outcome, ReconciliationOutcome::Applied);
    let replay = h.services.reconciler.reconcile(payload).await.unwrap();
    assert_eq!(replay.outcome, ReconciliationOutcome::Replay);

    let subscription = h.services.stores.subscriptions.get(PRO).await.unwrap().unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
    assert!(matches!(
        h.services.ledger.account(PRO).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_unknown_reference_is_acknowledged_and_recorded() {
    let h = harness();
    let result = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-3", "approved", "nobody-knows"))
        .await
        .unwrap();
    assert_eq!(result.outcome, ReconciliationOutcome::UnknownReference);

    let anomalies = h.services.stores.anomalies.get_all().await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].reference, "nobody-knows");
}

#[tokio::test]
async fn test_unknown_reference_can_be_rejected() {
    let h = harness_with(EngineConfig {
        unknown_reference: UnknownReferencePolicy::Reject,
        ..EngineConfig::default()
    });
    let result = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-3", "approved", "nobody-knows"))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound { .. })));
    assert_eq!(h.services.stores.anomalies.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_incomplete_payload_is_invalid() {
    let h = harness();
    let result = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("", "approved", "pay-1"))
        .await;
    assert!(matches!(result, Err(EngineError::ValidationError(_))));
}

#[tokio::test]
async fn test_reservation_payment_generates_order_once() {
    let h = harness();
    h.professional(TokenPlan::Basic).await;
    h.reservation("OS-1").await;
    let payload = WebhookPayload::new("mp-4", "approved", "OS-1");

    let first = h.services.reconciler.reconcile(payload.clone()).await.unwrap();
    assert_eq!(first.outcome, ReconciliationOutcome::Applied);
    let engagement = first.engagement.unwrap();
    assert_eq!(engagement.state, EngagementState::OrderGenerated);
    assert_eq!(engagement.version, 2);

    let second = h.services.reconciler.reconcile(payload).await.unwrap();
    assert_eq!(second.outcome, ReconciliationOutcome::Replay);
    assert_eq!(second.engagement.unwrap().version, 2);
}

#[tokio::test]
async fn test_approved_reservation_payment_never_regresses() {
    let h = harness();
    h.professional(TokenPlan::Basic).await;
    h.reservation("OS-1").await;
    h.services
        .reconciler
        .reconcile(WebhookPayload::new("mp-5", "approved", "OS-1"))
        .await
        .unwrap();

    let late = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-6", "rejected", "OS-1"))
        .await
        .unwrap();
    let engagement = late.engagement.unwrap();
    assert_eq!(engagement.state, EngagementState::OrderGenerated);
    let payment = engagement.payment.unwrap();
    assert_eq!(payment.state, PaymentState::Approved);
    assert_eq!(payment.external_id.as_deref(), Some("mp-5"));
}

#[tokio::test]
async fn test_rejected_reservation_payment_can_be_retried() {
    let h = harness();
    h.professional(TokenPlan::Basic).await;
    h.reservation("OS-1").await;

    let rejected = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-7", "rejected", "OS-1"))
        .await
        .unwrap()
        .engagement
        .unwrap();
    assert_eq!(rejected.state, EngagementState::PaymentPending);
    assert_eq!(rejected.payment.unwrap().state, PaymentState::Rejected);

    let approved = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-8", "approved", "OS-1"))
        .await
        .unwrap()
        .engagement
        .unwrap();
    assert_eq!(approved.state, EngagementState::OrderGenerated);
    assert_eq!(approved.payment.unwrap().state, PaymentState::Approved);
}

#[tokio::test]
async fn test_payment_after_acceptance_is_recorded_without_moving_state() {
    let h = harness();
    h.professional(TokenPlan::Basic).await;
    h.reservation("OS-1").await;
    h.services
        .engine
        .apply_transition("OS-1", Event::Accept, Actor::user(PRO))
        .await
        .unwrap();

    let result = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-10", "approved", "OS-1"))
        .await
        .unwrap();
    assert_eq!(result.outcome, ReconciliationOutcome::Applied);
    let engagement = result.engagement.unwrap();
    assert_eq!(engagement.state, EngagementState::InProgress);
    assert_eq!(engagement.payment.unwrap().state, PaymentState::Approved);

    let replay = h
        .services
        .reconciler
        .reconcile(WebhookPayload::new("mp-10", "approved", "OS-1"))
        .await
        .unwrap();
    assert_eq!(replay.outcome, ReconciliationOutcome::Replay);
}

#[tokio::test]
async fn test_stuck_notifier_does_not_hold_up_reconciliation() {
    let h = harness_from(
        Stores::in_memory(),
        Some(Arc::new(StuckNotifier)),
        EngineConfig {
            notify_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        },
    );
    h.professional(TokenPlan::Basic).await;
    h.services
        .reconciler
        .start_checkout(PRO, Plan::Professional, Some("pay-11".into()))
        .await
        .unwrap();

    let payload = WebhookPayload::new("mp-11", "approved", "pay-11");
    let first = tokio::time::timeout(
        Duration::from_secs(2),
        h.services.reconciler.reconcile(payload.clone()),
    )
    .await
    .expect("reconcile waited on the notifier")
    .unwrap();
    assert_eq!(first.outcome, ReconciliationOutcome::Applied);

    let again = tokio::time::timeout(Duration::from_secs(2), h.services.reconciler.reconcile(payload))
        .await
        .expect("reference lock still held")
        .unwrap();
    assert_eq!(again.outcome, ReconciliationOutcome::Replay);
    assert_eq!(h.services.ledger.account(PRO).await.unwrap().available, 22);
}

#[tokio::test]
async fn test_retry_after_failed_write_credits_once() {
    let payments = Arc::new(FlakyPayments::default());
    let mut stores = Stores::in_memory();
    stores.payments = payments.clone();
    let h = harness_from(stores, None, EngineConfig::default());
    h.professional(TokenPlan::Basic).await;
    h.services
        .reconciler
        .start_checkout(PRO, Plan::Professional, Some("pay-12".into()))
        .await
        .unwrap();

    payments.armed.store(true, Ordering::SeqCst);
    let payload = WebhookPayload::new("mp-12", "approved", "pay-12");
    let failed = h.services.reconciler.reconcile(payload.clone()).await;
    assert!(matches!(failed, Err(EngineError::Io(_))));

    let retried = h.services.reconciler.reconcile(payload).await.unwrap();
    assert_eq!(retried.outcome, ReconciliationOutcome::Applied);

    let account = h.services.ledger.account(PRO).await.unwrap();
    assert_eq!(account.available, 22);
    let recharges = account
        .history
        .iter()
        .filter(|e| e.kind == EntryKind::Recharge)
        .count();
    assert_eq!(recharges, 1);
    assert!(account.is_consistent());
    let stored = h.services.stores.payments.get("pay-12").await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Approved);
}

#[tokio::test]
async fn test_payment_for_cancelled_reservation_is_kept_and_flagged() {
    let h = harness();
    h.professional(TokenPlan::Basic).await;
    h.reservation("OS-1").await;
    h.services
        .engine
        .apply_transition("OS-1", Event::Cancel { reason: None }, Actor::user(CLIENT))
        .await
        .unwrap();

    let payload = WebhookPayload::new("mp-13", "approved", "OS-1");
    let result = h.services.reconciler.reconcile(payload.clone()).await.unwrap();
    assert_eq!(result.outcome, ReconciliationOutcome::Applied);
    let engagement = result.engagement.unwrap();
    assert_eq!(engagement.state, EngagementState::Cancelled);
    let payment = engagement.payment.unwrap();
    assert_eq!(payment.state, PaymentState::Approved);
    assert_eq!(payment.external_id.as_deref(), Some("mp-13"));

    let replay = h.services.reconciler.reconcile(payload).await.unwrap();
    assert_eq!(replay.outcome, ReconciliationOutcome::Replay);

    let anomalies = h.services.stores.anomalies.get_all().await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].reference, "OS-1");
}
