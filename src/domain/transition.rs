use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::engagement::{
    Cancellation, CorrectionRequest, Engagement, EngagementKind, EngagementState, Party,
    PaymentState, UserId,
};
use crate::error::{EngineError, Result};

/// Who is asking for a transition. Identity comes from the authentication
/// collaborator and is trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    User(UserId),
    /// The webhook handler and the sweeper act as the system.
    System,
}

impl Actor {
    pub fn user(id: impl Into<UserId>) -> Self {
        Self::User(id.into())
    }

    pub fn label(&self) -> &str {
        match self {
            Self::User(id) => id,
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Professional,
    System,
}

impl From<Party> for Role {
    fn from(party: Party) -> Self {
        match party {
            Party::Client => Self::Client,
            Party::Professional => Self::Professional,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ConfirmPayment { external_id: String },
    GenerateOrder,
    Contact { reply: Option<String> },
    Accept,
    MarkDone { notes: Option<String> },
    Approve { charged_amount: Option<Decimal> },
    RequestCorrection { description: String },
    Cancel { reason: Option<String> },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfirmPayment { .. } => "confirm_payment",
            Self::GenerateOrder => "generate_order",
            Self::Contact { .. } => "contact",
            Self::Accept => "accept",
            Self::MarkDone { .. } => "mark_done",
            Self::Approve { .. } => "approve",
            Self::RequestCorrection { .. } => "request_correction",
            Self::Cancel { .. } => "cancel",
        }
    }

    pub fn target(&self) -> EngagementState {
        match self {
            Self::ConfirmPayment { .. } => EngagementState::PaymentConfirmed,
            Self::GenerateOrder => EngagementState::OrderGenerated,
            Self::Contact { .. } => EngagementState::Contacted,
            Self::Accept | Self::RequestCorrection { .. } => EngagementState::InProgress,
            Self::MarkDone { .. } => EngagementState::PendingConfirmation,
            Self::Approve { .. } => EngagementState::Completed,
            Self::Cancel { .. } => EngagementState::Cancelled,
        }
    }

    fn permits(&self, role: Role) -> bool {
        match self {
            Self::ConfirmPayment { .. } | Self::GenerateOrder => role == Role::System,
            Self::Contact { .. } | Self::Accept | Self::MarkDone { .. } => {
                role == Role::Professional
            }
            Self::Approve { .. } => matches!(role, Role::Client | Role::System),
            Self::RequestCorrection { .. } => role == Role::Client,
            Self::Cancel { .. } => true,
        }
    }

    fn applies_to(&self, kind: EngagementKind) -> bool {
        match self {
            Self::ConfirmPayment { .. } | Self::GenerateOrder => {
                kind == EngagementKind::Reservation
            }
            Self::Contact { .. } => kind == EngagementKind::Request,
            _ => true,
        }
    }
}

/// Ledger work a transition requires before it may be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    None,
    /// First acceptance: one token from the professional.
    DebitToken,
    /// Responding to a request: one subscription credit.
    UseCredit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: EngagementState,
    pub to: EngagementState,
    pub effect: LedgerEffect,
}

fn is_legal(kind: EngagementKind, from: EngagementState, event: &Event) -> bool {
    use EngagementState::*;
    match event {
        Event::ConfirmPayment { .. } => from == PaymentPending,
        Event::GenerateOrder => from == PaymentConfirmed,
        Event::Contact { .. } => from == Pending,
        Event::Accept => match kind {
            EngagementKind::Reservation => {
                matches!(from, PaymentPending | PaymentConfirmed | OrderGenerated)
            }
            EngagementKind::Request => from == Contacted,
        },
        Event::MarkDone { .. } => from == InProgress,
        Event::Approve { .. } | Event::RequestCorrection { .. } => from == PendingConfirmation,
        Event::Cancel { .. } => !from.is_terminal(),
    }
}

/// Decides whether `event` may move an engagement out of `from`.
///
/// A request whose target the engagement has already reached or passed is
/// `StaleTransition`; anything else illegal is `InvalidTransition`. A
/// completed engagement has passed every forward step, so late duplicates
/// are stale there too. Cancellation sits off the forward path: only a
/// repeated cancel is stale once cancelled.
pub fn next_state(
    kind: EngagementKind,
    from: EngagementState,
    event: &Event,
    role: Role,
) -> Result<EngagementState> {
    if !event.permits(role) {
        return Err(EngineError::Forbidden(format!(
            "{:?} may not {}",
            role,
            event.name()
        )));
    }
    if event.applies_to(kind) && is_legal(kind, from, event) {
        return Ok(event.target());
    }

    let target = event.target();
    let stale = event.applies_to(kind)
        && match from {
            EngagementState::Cancelled => target == from,
            _ => target != EngagementState::Cancelled && target.rank() <= from.rank(),
        };

    if stale {
        Err(EngineError::StaleTransition {
            state: from.to_string(),
            event: event.name().to_string(),
        })
    } else {
        Err(EngineError::InvalidTransition {
            state: from.to_string(),
            event: event.name().to_string(),
        })
    }
}

/// Validates an event against an engagement and works out its ledger effect.
/// Pure: nothing is mutated.
pub fn plan(engagement: &Engagement, event: &Event, actor: &Actor) -> Result<Transition> {
    let role = match actor {
        Actor::System => Role::System,
        Actor::User(id) => engagement
            .party_of(id)
            .map(Role::from)
            .ok_or_else(|| {
                EngineError::Forbidden(format!(
                    "{} is not a party to {}",
                    id, engagement.code
                ))
            })?,
    };

    let to = next_state(engagement.kind, engagement.state, event, role)?;

    if let Event::Approve { charged_amount } = event {
        match (role, charged_amount) {
            (Role::Client, None) => {
                return Err(EngineError::ValidationError(
                    "The charged amount is required to approve the work".to_string(),
                ));
            }
            (_, Some(amount)) if *amount <= Decimal::ZERO => {
                return Err(EngineError::ValidationError(
                    "The charged amount must be positive".to_string(),
                ));
            }
            _ => {}
        }
    }

    let effect = match event {
        Event::Accept if engagement.accepted_at.is_none() => LedgerEffect::DebitToken,
        Event::Contact { .. } => LedgerEffect::UseCredit,
        _ => LedgerEffect::None,
    };

    Ok(Transition {
        from: engagement.state,
        to,
        effect,
    })
}

impl Engagement {
    /// Writes the outcome of a planned transition onto the engagement.
    ///
    /// `confirm_window` sets the auto-confirm deadline when the professional
    /// marks the work done.
    pub fn apply(
        &mut self,
        event: Event,
        actor: &Actor,
        transition: Transition,
        now: DateTime<Utc>,
        confirm_window: Duration,
    ) {
        match event {
            Event::ConfirmPayment { external_id } => {
                let payment = self.payment.get_or_insert_with(Default::default);
                payment.state = PaymentState::Approved;
                payment.external_id = Some(external_id);
                payment.paid_at = Some(now);
            }
            Event::GenerateOrder => {}
            Event::Contact { reply } => {
                self.professional_reply = reply;
            }
            Event::Accept => {
                self.accepted_at.get_or_insert(now);
            }
            Event::MarkDone { notes } => {
                self.confirmation.professional_done = true;
                self.confirmation.professional_done_at = Some(now);
                self.confirmation.auto_confirm_deadline = Some(now + confirm_window);
                if let Some(correction) = self.correction.as_mut() {
                    correction.active = false;
                }
                if notes.is_some() {
                    self.completion_notes = notes;
                }
            }
            Event::Approve { charged_amount } => {
                self.confirmation.client_approved = true;
                self.confirmation.client_approved_at = Some(now);
                if charged_amount.is_some() {
                    self.costs.charged_amount = charged_amount;
                }
            }
            Event::RequestCorrection { description } => {
                self.confirmation.professional_done = false;
                self.confirmation.professional_done_at = None;
                self.confirmation.auto_confirm_deadline = None;
                self.correction = Some(CorrectionRequest {
                    active: true,
                    description,
                    requested_at: now,
                });
            }
            Event::Cancel { reason } => {
                self.cancellation = Some(Cancellation {
                    by: actor.label().to_string(),
                    reason,
                    at: now,
                });
            }
        }
        self.state = transition.to;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engagement::{Address, Costs, ServiceType};
    use rust_decimal_macros::dec;

    fn reservation() -> Engagement {
        Engagement::reservation(
            "OS-1".into(),
            "client".into(),
            "pro".into(),
            ServiceType::Hourly,
            "Fix sink".into(),
            Address::new("Calle 1", "Palermo", "Buenos Aires"),
            Costs::new(dec!(1000), dec!(0)),
            None,
            Utc::now(),
        )
    }

    fn request() -> Engagement {
        Engagement::request(
            "SOL-1".into(),
            "client".into(),
            "pro".into(),
            "Paint wall".into(),
            Address::new("Calle 1", "Palermo", "Buenos Aires"),
            None,
            Utc::now(),
        )
    }

    fn step(engagement: &mut Engagement, event: Event, actor: &Actor) -> Result<Transition> {
        let transition = plan(engagement, &event, actor)?;
        engagement.apply(event, actor, transition, Utc::now(), Duration::hours(24));
        Ok(transition)
    }

    #[test]
    fn test_reservation_happy_path() {
        let mut r = reservation();
        let system = Actor::System;
        let pro = Actor::user("pro");
        let client = Actor::user("client");

        step(&mut r, Event::ConfirmPayment { external_id: "mp-1".into() }, &system).unwrap();
        step(&mut r, Event::GenerateOrder, &system).unwrap();
        let accepted = step(&mut r, Event::Accept, &pro).unwrap();
        assert_eq!(accepted.effect, LedgerEffect::DebitToken);
        step(&mut r, Event::MarkDone { notes: None }, &pro).unwrap();
        assert!(r.confirmation.auto_confirm_deadline.is_some());
        step(
            &mut r,
            Event::Approve { charged_amount: Some(dec!(1200)) },
            &client,
        )
        .unwrap();

        assert_eq!(r.state, EngagementState::Completed);
        assert_eq!(r.costs.charged_amount, Some(dec!(1200)));
        assert_eq!(r.payment.unwrap().state, PaymentState::Approved);
    }

    #[test]
    fn test_request_happy_path() {
        let mut r = request();
        let pro = Actor::user("pro");
        let contacted = step(&mut r, Event::Contact { reply: Some("Hi".into()) }, &pro).unwrap();
        assert_eq!(contacted.effect, LedgerEffect::UseCredit);
        step(&mut r, Event::Accept, &pro).unwrap();
        step(&mut r, Event::MarkDone { notes: Some("done".into()) }, &pro).unwrap();
        step(&mut r, Event::Approve { charged_amount: None }, &Actor::System).unwrap();
        assert_eq!(r.state, EngagementState::Completed);
        assert_eq!(r.completion_notes.as_deref(), Some("done"));
    }

    #[test]
    fn test_correction_loop_does_not_debit_again() {
        let mut r = request();
        let pro = Actor::user("pro");
        let client = Actor::user("client");
        step(&mut r, Event::Contact { reply: None }, &pro).unwrap();
        step(&mut r, Event::Accept, &pro).unwrap();
        step(&mut r, Event::MarkDone { notes: None }, &pro).unwrap();
        step(
            &mut r,
            Event::RequestCorrection { description: "Still leaking".into() },
            &client,
        )
        .unwrap();

        assert_eq!(r.state, EngagementState::InProgress);
        assert!(!r.confirmation.professional_done);
        assert!(r.confirmation.professional_done_at.is_none());
        assert!(r.correction.as_ref().unwrap().active);

        let again = step(&mut r, Event::MarkDone { notes: None }, &pro).unwrap();
        assert_eq!(again.effect, LedgerEffect::None);
        assert!(!r.correction.as_ref().unwrap().active);
    }

    #[test]
    fn test_role_reservation() {
        let r = reservation();
        let err = plan(&r, &Event::Accept, &Actor::user("client")).unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let err = plan(&r, &Event::Accept, &Actor::user("stranger")).unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        let err = plan(
            &r,
            &Event::ConfirmPayment { external_id: "x".into() },
            &Actor::user("client"),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }

    #[test]
    fn test_stale_versus_invalid() {
        let mut r = reservation();
        let pro = Actor::user("pro");
        step(&mut r, Event::Accept, &pro).unwrap();

        let err = plan(&r, &Event::Accept, &pro).unwrap_err();
        assert!(matches!(err, EngineError::StaleTransition { .. }));

        let err = plan(
            &r,
            &Event::ConfirmPayment { external_id: "late".into() },
            &Actor::System,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::StaleTransition { .. }));

        let err = plan(
            &r,
            &Event::Approve { charged_amount: Some(dec!(10)) },
            &Actor::user("client"),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_states() {
        let mut r = request();
        step(&mut r, Event::Cancel { reason: Some("changed mind".into()) }, &Actor::user("client"))
            .unwrap();
        assert_eq!(r.cancellation.as_ref().unwrap().by, "client");

        let err = plan(&r, &Event::Cancel { reason: None }, &Actor::user("pro")).unwrap_err();
        assert!(matches!(err, EngineError::StaleTransition { .. }));

        let err = plan(&r, &Event::Contact { reply: None }, &Actor::user("pro")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_late_events_on_completed_are_stale() {
        let mut r = reservation();
        let pro = Actor::user("pro");
        step(&mut r, Event::Accept, &pro).unwrap();
        step(&mut r, Event::MarkDone { notes: None }, &pro).unwrap();
        step(&mut r, Event::Approve { charged_amount: None }, &Actor::System).unwrap();
        assert_eq!(r.state, EngagementState::Completed);

        for (event, actor) in [
            (Event::MarkDone { notes: None }, pro.clone()),
            (Event::Accept, pro.clone()),
            (Event::Approve { charged_amount: Some(dec!(10)) }, Actor::user("client")),
            (Event::RequestCorrection { description: "late".into() }, Actor::user("client")),
            (Event::ConfirmPayment { external_id: "mp-9".into() }, Actor::System),
        ] {
            let err = plan(&r, &event, &actor).unwrap_err();
            assert!(
                matches!(err, EngineError::StaleTransition { .. }),
                "{} gave {:?}",
                event.name(),
                err
            );
        }

        let err = plan(&r, &Event::Cancel { reason: None }, &Actor::user("client")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_family_mismatch_is_invalid() {
        let r = request();
        let err = plan(&r, &Event::GenerateOrder, &Actor::System).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let res = reservation();
        let err = plan(&res, &Event::Contact { reply: None }, &Actor::user("pro")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_client_approval_requires_positive_amount() {
        let mut r = reservation();
        let pro = Actor::user("pro");
        step(&mut r, Event::Accept, &pro).unwrap();
        step(&mut r, Event::MarkDone { notes: None }, &pro).unwrap();

        let client = Actor::user("client");
        for amount in [None, Some(dec!(0)), Some(dec!(-5))] {
            let err = plan(&r, &Event::Approve { charged_amount: amount }, &client).unwrap_err();
            assert!(matches!(err, EngineError::ValidationError(_)));
        }
        assert_eq!(r.state, EngagementState::PendingConfirmation);
    }
}
