use std::sync::Arc;
use tracing::{info, warn};

use super::engine::{EngagementEngine, TransitionOutcome};
use super::ledger::LedgerService;
use super::locks::KeyedLocks;
use crate::config::UnknownReferencePolicy;
use crate::domain::engagement::{Engagement, EngagementKind, EngagementState, PaymentState};
use crate::domain::ports::{Anomaly, Clock, Notification, Stores};
use crate::domain::payment::{PaymentRecord, PaymentStatus, WebhookPayload};
use crate::domain::subscription::{Plan, Subscription, SubscriptionStatus};
use crate::domain::transition::{Actor, Event};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    Applied,
    /// Already reconciled; nothing changed.
    Replay,
    /// Acknowledged without effect because the reference matched nothing.
    UnknownReference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
    pub reference: String,
    pub outcome: ReconciliationOutcome,
    pub payment: Option<PaymentRecord>,
    pub engagement: Option<Engagement>,
}

/// Turns payment-provider webhooks into ledger credits and state transitions.
///
/// Deliveries for the same reference are serialised; an applied delivery is
/// remembered in the idempotency store so a redelivery changes nothing.
/// Notifications go out through the engine once the reference lock is released.
pub struct PaymentReconciler {
    stores: Stores,
    ledger: Arc<LedgerService>,
    engine: Arc<EngagementEngine>,
    clock: Arc<dyn Clock>,
    policy: UnknownReferencePolicy,
    locks: KeyedLocks,
}

impl PaymentReconciler {
    pub fn new(
        stores: Stores,
        ledger: Arc<LedgerService>,
        engine: Arc<EngagementEngine>,
        clock: Arc<dyn Clock>,
        policy: UnknownReferencePolicy,
    ) -> Self {
        Self {
            stores,
            ledger,
            engine,
            clock,
            policy,
            locks: KeyedLocks::new(),
        }
    }

    /// Creates the pending payment record a provider checkout will point back to.
    pub async fn start_checkout(
        &self,
        user: &str,
        plan: Plan,
        id: Option<String>,
    ) -> Result<PaymentRecord> {
        let now = self.clock.now();
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = PaymentRecord::checkout(id, user, plan, now)?;
        if self.stores.payments.get(&record.id).await?.is_some() {
            return Err(EngineError::ValidationError(format!(
                "Payment {} already exists",
                record.id
            )));
        }

        if self.stores.subscriptions.get(user).await?.is_none() {
            let mut pending = Subscription::free(user, now);
            pending.plan = plan;
            pending.status = SubscriptionStatus::Pending;
            pending.price = record.amount;
            self.stores.subscriptions.store(pending).await?;
        }
        self.stores.payments.store(record.clone()).await?;
        info!(payment = %record.id, account = user, plan = ?plan, amount = %record.amount, "Checkout started");
        Ok(record)
    }

    pub async fn reconcile(&self, payload: WebhookPayload) -> Result<ReconciliationResult> {
        payload.validate()?;
        let guard = self.locks.lock(&payload.external_reference).await;
        let result = self.reconcile_locked(&payload).await;
        drop(guard);

        if let Ok(reconciled) = &result
            && reconciled.outcome == ReconciliationOutcome::Applied
            && let Some(record) = &reconciled.payment
            && record.status == PaymentStatus::Approved
        {
            self.engine.dispatch(vec![Notification {
                user: record.user.clone(),
                title: "Subscription activated".to_string(),
                body: format!("Your {:?} plan is active", record.plan),
                deep_link: "/subscription".to_string(),
            }]);
        }
        result
    }

    async fn reconcile_locked(&self, payload: &WebhookPayload) -> Result<ReconciliationResult> {
        let reference = payload.external_reference.clone();

        if let Some(record) = self.stores.payments.get(&reference).await? {
            return match self.apply_subscription_payment(record.clone(), payload).await {
                Ok(record) => Ok(ReconciliationResult {
                    reference,
                    outcome: ReconciliationOutcome::Applied,
                    payment: Some(record),
                    engagement: None,
                }),
                Err(e) if e.is_benign() => {
                    info!(payment = %reference, status = %payload.status, "Webhook replay ignored");
                    let current = self.stores.payments.get(&reference).await?.unwrap_or(record);
                    Ok(ReconciliationResult {
                        reference,
                        outcome: ReconciliationOutcome::Replay,
                        payment: Some(current),
                        engagement: None,
                    })
                }
                Err(e) => Err(e),
            };
        }

        if let Some(engagement) = self.stores.engagements.get(&reference).await?
            && engagement.kind == EngagementKind::Reservation
        {
            return self.apply_reservation_payment(engagement, payload).await;
        }

        warn!(payment = %reference, external = %payload.external_payment_id, "Webhook references nothing known");
        self.stores
            .anomalies
            .record(Anomaly {
                at: self.clock.now(),
                source: "payment_webhook".to_string(),
                reference: reference.clone(),
                detail: format!(
                    "payment {} reported {}",
                    payload.external_payment_id, payload.status
                ),
            })
            .await?;

        match self.policy {
            UnknownReferencePolicy::Acknowledge => Ok(ReconciliationResult {
                reference,
                outcome: ReconciliationOutcome::UnknownReference,
                payment: None,
                engagement: None,
            }),
            UnknownReferencePolicy::Reject => Err(EngineError::not_found("payment", reference)),
        }
    }

    async fn apply_subscription_payment(
        &self,
        mut record: PaymentRecord,
        payload: &WebhookPayload,
    ) -> Result<PaymentRecord> {
        let status = PaymentStatus::from_provider(&payload.status);
        let key = payload.idempotency_key();
        if record.status == PaymentStatus::Approved
            || self.stores.idempotency.contains(&key).await?
        {
            return Err(EngineError::ReconciliationReplay {
                payment: record.id,
                status: payload.status.clone(),
            });
        }

        let now = self.clock.now();
        record.provider.payment_id = Some(payload.external_payment_id.clone());
        record.provider.status = Some(payload.status.clone());
        record.status = status;

        match status {
            PaymentStatus::Pending => {
                self.stores.payments.store(record.clone()).await?;
                info!(payment = %record.id, "Payment pending at provider");
                return Ok(record);
            }
            PaymentStatus::Rejected => {
                if let Some(mut subscription) = self.stores.subscriptions.get(&record.user).await?
                    && subscription.status == SubscriptionStatus::Pending
                {
                    subscription.status = SubscriptionStatus::Cancelled;
                    self.stores.subscriptions.store(subscription).await?;
                }
                self.stores.payments.store(record.clone()).await?;
                self.stores.idempotency.insert_if_absent(&key).await?;
                warn!(payment = %record.id, status = %payload.status, "Payment rejected");
                return Ok(record);
            }
            PaymentStatus::Approved => {}
        }

        record.paid_at = Some(now);
        let mut subscription = match self.stores.subscriptions.get(&record.user).await? {
            Some(subscription) => subscription,
            None => Subscription::free(record.user.clone(), now),
        };
        subscription.activate(record.plan, now);
        self.stores.subscriptions.store(subscription).await?;

        if !record.tokens_credited {
            self.ledger
                .recharge(
                    &record.user,
                    record.plan.token_plan(),
                    record.plan.tokens_on_purchase(),
                    Some(&record.id),
                )
                .await?;
            record.tokens_credited = true;
        }
        self.stores.payments.store(record.clone()).await?;
        self.stores.idempotency.insert_if_absent(&key).await?;
        info!(payment = %record.id, account = %record.user, plan = ?record.plan, "Subscription activated");
        Ok(record)
    }

    async fn apply_reservation_payment(
        &self,
        current: Engagement,
        payload: &WebhookPayload,
    ) -> Result<ReconciliationResult> {
        let code = payload.external_reference.as_str();
        let status = PaymentStatus::from_provider(&payload.status);

        let (outcome, engagement) = match status {
            PaymentStatus::Approved if current.state == EngagementState::Cancelled => {
                self.settle_cancelled(current, payload).await?
            }
            PaymentStatus::Approved => {
                let confirmed = self
                    .engine
                    .apply_transition(
                        code,
                        Event::ConfirmPayment {
                            external_id: payload.external_payment_id.clone(),
                        },
                        Actor::System,
                    )
                    .await?;
                match confirmed {
                    TransitionOutcome::Applied(_) => {
                        let ordered = self
                            .engine
                            .apply_transition(code, Event::GenerateOrder, Actor::System)
                            .await?;
                        (ReconciliationOutcome::Applied, ordered.into_engagement())
                    }
                    TransitionOutcome::Stale(current) => {
                        let recorded = current
                            .payment
                            .as_ref()
                            .is_some_and(|p| p.state == PaymentState::Approved);
                        if recorded {
                            (ReconciliationOutcome::Replay, current)
                        } else {
                            // Accepted before the provider confirmed: keep the state, record the money.
                            let updated = self
                                .engine
                                .record_payment(
                                    code,
                                    &payload.external_payment_id,
                                    PaymentState::Approved,
                                )
                                .await?;
                            (ReconciliationOutcome::Applied, updated)
                        }
                    }
                }
            }
            PaymentStatus::Pending => {
                (ReconciliationOutcome::Applied, self.engine.get(code).await?)
            }
            PaymentStatus::Rejected => (
                ReconciliationOutcome::Applied,
                self.engine
                    .record_payment(code, &payload.external_payment_id, PaymentState::Rejected)
                    .await?,
            ),
        };

        Ok(ReconciliationResult {
            reference: code.to_string(),
            outcome,
            payment: None,
            engagement: Some(engagement),
        })
    }

    // Money arrived for a reservation that was already cancelled: keep the
    // state, record the payment and flag it for a manual refund.
    async fn settle_cancelled(
        &self,
        current: Engagement,
        payload: &WebhookPayload,
    ) -> Result<(ReconciliationOutcome, Engagement)> {
        let recorded = current
            .payment
            .as_ref()
            .is_some_and(|p| p.state == PaymentState::Approved);
        if recorded {
            return Ok((ReconciliationOutcome::Replay, current));
        }

        let updated = self
            .engine
            .record_payment(
                &current.code,
                &payload.external_payment_id,
                PaymentState::Approved,
            )
            .await?;
        warn!(engagement = %current.code, payment = %payload.external_payment_id, "Payment approved after cancellation");
        self.stores
            .anomalies
            .record(Anomaly {
                at: self.clock.now(),
                source: "payment_webhook".to_string(),
                reference: current.code.clone(),
                detail: format!(
                    "payment {} approved for cancelled reservation",
                    payload.external_payment_id
                ),
            })
            .await?;
        Ok((ReconciliationOutcome::Applied, updated))
    }
}
