use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ledger::LedgerService;
use super::locks::KeyedLocks;
use crate::config::EngineConfig;
use crate::domain::disclosure::DisclosedView;
use crate::domain::engagement::{
    Address, Costs, Engagement, EngagementKind, PaymentState, ServiceType, UserId, generate_code,
};
use crate::domain::ledger::EntryKind;
use crate::domain::ports::{Clock, CoverageProvider, Notification, Notifier, Stores};
use crate::domain::subscription::CreditUse;
use crate::domain::transition::{Actor, Event, LedgerEffect, plan};
use crate::error::{EngineError, Result};

/// What a client submits to book a paid reservation.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub code: Option<String>,
    pub client: UserId,
    pub professional: UserId,
    pub service_type: ServiceType,
    pub description: String,
    pub address: Address,
    pub hours: Option<Decimal>,
}

/// What a client submits to ask a professional for a quote.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub code: Option<String>,
    pub client: UserId,
    pub professional: UserId,
    pub description: String,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Engagement),
    /// The engagement had already moved past the event; carries its current state.
    Stale(Engagement),
}

impl TransitionOutcome {
    pub fn engagement(&self) -> &Engagement {
        match self {
            Self::Applied(e) | Self::Stale(e) => e,
        }
    }

    pub fn into_engagement(self) -> Engagement {
        match self {
            Self::Applied(e) | Self::Stale(e) => e,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

// Ledger work already committed for a transition that has not been written yet.
enum Charge {
    Token,
    Credit(CreditUse),
    Refund,
}

/// Entry point of the lifecycle: creation, transitions, reads and the sweep.
///
/// Transitions on one engagement are serialised by a keyed lock; the store's
/// version check catches writers that bypass it. Ledger work happens inside
/// the engagement lock so the lock order is always engagement, then account.
pub struct EngagementEngine {
    stores: Stores,
    ledger: Arc<LedgerService>,
    notifier: Arc<dyn Notifier>,
    coverage: Arc<dyn CoverageProvider>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    locks: KeyedLocks,
}

impl EngagementEngine {
    pub fn new(
        stores: Stores,
        ledger: Arc<LedgerService>,
        notifier: Arc<dyn Notifier>,
        coverage: Arc<dyn CoverageProvider>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            stores,
            ledger,
            notifier,
            coverage,
            clock,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn open_reservation(&self, new: NewReservation) -> Result<Engagement> {
        validate_parties(&new.client, &new.professional, &new.description)?;
        let quote = self.coverage.quote(&new.professional, &new.address).await?;
        if !quote.covered {
            return Err(EngineError::ValidationError(format!(
                "{} does not cover {}",
                new.professional, new.address.city
            )));
        }

        let now = self.clock.now();
        let subtotal = self.config.rates.subtotal(new.service_type, new.hours);
        let engagement = Engagement::reservation(
            new.code
                .unwrap_or_else(|| generate_code(EngagementKind::Reservation, now)),
            new.client,
            new.professional,
            new.service_type,
            new.description,
            new.address,
            Costs::new(subtotal, quote.travel_surcharge),
            quote.distance_km,
            now,
        );
        self.stores.engagements.insert(engagement.clone()).await?;
        info!(engagement = %engagement.code, total = %engagement.costs.total, "Opened reservation");

        self.dispatch(vec![notice(
            &engagement.professional,
            "New reservation",
            format!("You have a new reservation: {}", engagement.description),
            &engagement.code,
        )]);
        Ok(engagement)
    }

    pub async fn open_request(&self, new: NewRequest) -> Result<Engagement> {
        validate_parties(&new.client, &new.professional, &new.description)?;
        let quote = self.coverage.quote(&new.professional, &new.address).await?;

        let now = self.clock.now();
        let engagement = Engagement::request(
            new.code
                .unwrap_or_else(|| generate_code(EngagementKind::Request, now)),
            new.client,
            new.professional,
            new.description,
            new.address,
            quote.distance_km,
            now,
        );
        self.stores.engagements.insert(engagement.clone()).await?;
        info!(engagement = %engagement.code, "Opened request");

        self.dispatch(vec![notice(
            &engagement.professional,
            "New request",
            format!(
                "A client in {} needs: {}",
                engagement.address.city, engagement.description
            ),
            &engagement.code,
        )]);
        Ok(engagement)
    }

    pub async fn get(&self, code: &str) -> Result<Engagement> {
        self.stores
            .engagements
            .get(code)
            .await?
            .ok_or_else(|| EngineError::not_found("engagement", code))
    }

    /// Validates and applies one event.
    ///
    /// A stale event is not an error: the caller gets
    /// [`TransitionOutcome::Stale`] with the engagement as it stands.
    pub async fn apply_transition(
        &self,
        code: &str,
        event: Event,
        actor: Actor,
    ) -> Result<TransitionOutcome> {
        let guard = self.locks.lock(code).await;
        let mut engagement = self.get(code).await?;

        let transition = match plan(&engagement, &event, &actor) {
            Ok(transition) => transition,
            Err(e) if e.is_benign() => {
                debug!(engagement = code, event = event.name(), state = %engagement.state, "Stale transition ignored");
                return Ok(TransitionOutcome::Stale(engagement));
            }
            Err(e) => {
                warn!(engagement = code, event = event.name(), actor = actor.label(), error = %e, "Transition rejected");
                return Err(e);
            }
        };

        let is_cancel = matches!(event, Event::Cancel { .. });
        let charge = match transition.effect {
            LedgerEffect::None if is_cancel
                && self.config.refund_on_cancel
                && engagement.accepted_at.is_some() =>
            {
                self.ledger
                    .credit(
                        &engagement.professional,
                        1,
                        EntryKind::Refund,
                        "cancelled after acceptance",
                        Some(code),
                    )
                    .await?;
                Some(Charge::Refund)
            }
            LedgerEffect::None => None,
            LedgerEffect::DebitToken => {
                self.ledger
                    .debit(&engagement.professional, 1, "accepted engagement", Some(code))
                    .await?;
                Some(Charge::Token)
            }
            LedgerEffect::UseCredit => {
                let used = self
                    .ledger
                    .use_credit(&engagement.professional, Some(code))
                    .await?;
                Some(Charge::Credit(used))
            }
        };

        let now = self.clock.now();
        let event_name = event.name();
        let expected = engagement.version;
        engagement.apply(
            event,
            &actor,
            transition,
            now,
            self.config.confirm_window(engagement.kind),
        );
        engagement.version += 1;

        if let Err(e) = self
            .stores
            .engagements
            .update(engagement.clone(), expected)
            .await
        {
            if let Some(charge) = charge {
                self.undo_charge(&engagement, charge).await;
            }
            return Err(e);
        }
        drop(guard);

        info!(
            engagement = code,
            event = event_name,
            from = %transition.from,
            to = %transition.to,
            actor = actor.label(),
            "Transition applied"
        );
        self.dispatch(notifications_for(&engagement, event_name, &actor));
        Ok(TransitionOutcome::Applied(engagement))
    }

    /// Records a provider verdict on a reservation's payment without moving
    /// its state. An approved payment is never overwritten.
    pub async fn record_payment(
        &self,
        code: &str,
        external_id: &str,
        state: PaymentState,
    ) -> Result<Engagement> {
        let _guard = self.locks.lock(code).await;
        let mut engagement = self.get(code).await?;
        let now = self.clock.now();
        let Some(payment) = engagement.payment.as_mut() else {
            return Err(EngineError::ValidationError(format!(
                "{} carries no payment",
                code
            )));
        };
        if payment.state == PaymentState::Approved {
            return Ok(engagement);
        }
        payment.state = state;
        payment.external_id = Some(external_id.to_string());
        if state == PaymentState::Approved {
            payment.paid_at = Some(now);
        }

        let expected = engagement.version;
        engagement.version += 1;
        engagement.updated_at = now;
        self.stores
            .engagements
            .update(engagement.clone(), expected)
            .await?;
        info!(engagement = code, payment = external_id, ?state, "Recorded reservation payment");
        Ok(engagement)
    }

    pub async fn disclosed_view(&self, code: &str, requester: &str) -> Result<DisclosedView> {
        let engagement = self.get(code).await?;
        DisclosedView::of(&engagement, requester)
    }

    /// Auto-approves every engagement whose confirmation deadline has passed.
    /// Returns how many were promoted by this call.
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.stores.engagements.due_for_auto_confirm(now).await?;
        let mut promoted = 0;

        for engagement in due {
            match self
                .apply_transition(
                    &engagement.code,
                    Event::Approve {
                        charged_amount: None,
                    },
                    Actor::System,
                )
                .await
            {
                Ok(TransitionOutcome::Applied(_)) => promoted += 1,
                Ok(TransitionOutcome::Stale(_)) => {}
                Err(e) => {
                    warn!(engagement = %engagement.code, error = %e, "Auto-approval failed");
                }
            }
        }

        if promoted > 0 {
            info!(promoted, "Sweep promoted stalled engagements");
        }
        Ok(promoted)
    }

    async fn undo_charge(&self, engagement: &Engagement, charge: Charge) {
        let result = match charge {
            Charge::Token => self
                .ledger
                .credit(
                    &engagement.professional,
                    1,
                    EntryKind::Refund,
                    "transition not committed",
                    Some(&engagement.code),
                )
                .await
                .map(|_| ()),
            Charge::Credit(used) => {
                self.ledger
                    .return_credit(&engagement.professional, used, Some(&engagement.code))
                    .await
            }
            Charge::Refund => self
                .ledger
                .debit(
                    &engagement.professional,
                    1,
                    "cancellation not committed",
                    Some(&engagement.code),
                )
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            warn!(engagement = %engagement.code, error = %e, "Could not undo ledger charge");
        }
    }

    /// Sends notifications from a spawned task, each bounded by the notify
    /// timeout. Never awaits the notifier on the caller's path.
    pub(crate) fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let notifier = self.notifier.clone();
        let timeout = self.config.notify_timeout;
        tokio::spawn(async move {
            for notification in notifications {
                let user = notification.user.clone();
                match tokio::time::timeout(timeout, notifier.notify(notification)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%user, error = %e, "Notification failed"),
                    Err(_) => warn!(%user, "Notification timed out"),
                }
            }
        });
    }
}

fn validate_parties(client: &str, professional: &str, description: &str) -> Result<()> {
    if client.trim().is_empty() || professional.trim().is_empty() {
        return Err(EngineError::ValidationError(
            "Both parties are required".to_string(),
        ));
    }
    if client == professional {
        return Err(EngineError::ValidationError(
            "A professional cannot hire themselves".to_string(),
        ));
    }
    if description.trim().is_empty() {
        return Err(EngineError::ValidationError(
            "A description is required".to_string(),
        ));
    }
    Ok(())
}

fn notice(user: &str, title: &str, body: String, code: &str) -> Notification {
    Notification {
        user: user.to_string(),
        title: title.to_string(),
        body,
        deep_link: format!("/engagements/{}", code),
    }
}

fn notifications_for(engagement: &Engagement, event: &str, actor: &Actor) -> Vec<Notification> {
    let code = engagement.code.as_str();
    let client = engagement.client.as_str();
    let professional = engagement.professional.as_str();

    match event {
        "generate_order" => vec![
            notice(professional, "Order generated", format!("Order {} is ready", code), code),
            notice(client, "Order generated", format!("Your order {} is confirmed", code), code),
        ],
        "contact" => vec![notice(
            client,
            "A professional replied",
            format!("{} answered your request", professional),
            code,
        )],
        "accept" => vec![notice(
            client,
            "Work accepted",
            format!("{} accepted {}", professional, code),
            code,
        )],
        "mark_done" => vec![notice(
            client,
            "Work marked as done",
            format!("Please review {} and confirm", code),
            code,
        )],
        "approve" => vec![notice(
            professional,
            "Work approved",
            format!("{} was approved", code),
            code,
        )],
        "request_correction" => vec![notice(
            professional,
            "Correction requested",
            format!("The client asked for changes on {}", code),
            code,
        )],
        "cancel" => {
            let body = format!("{} was cancelled", code);
            match actor {
                Actor::User(id) => vec![notice(
                    engagement.counterpart_of(id),
                    "Engagement cancelled",
                    body,
                    code,
                )],
                Actor::System => vec![
                    notice(client, "Engagement cancelled", body.clone(), code),
                    notice(professional, "Engagement cancelled", body, code),
                ],
            }
        }
        _ => Vec::new(),
    }
}
