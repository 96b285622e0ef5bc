use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

pub type UserId = String;

/// Distinguishes the payment-gated flow from the disclosure-gated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    /// Paid up front, scheduled against a coverage check.
    Reservation,
    /// Unpaid, reveals the client's address progressively.
    Request,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reservation => "reservation",
            Self::Request => "request",
        }
    }

    pub fn initial_state(&self) -> EngagementState {
        match self {
            Self::Reservation => EngagementState::PaymentPending,
            Self::Request => EngagementState::Pending,
        }
    }

    fn code_prefix(&self) -> &'static str {
        match self {
            Self::Reservation => "OS",
            Self::Request => "SOL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementState {
    PaymentPending,
    PaymentConfirmed,
    OrderGenerated,
    Pending,
    Contacted,
    InProgress,
    PendingConfirmation,
    Completed,
    Cancelled,
}

impl EngagementState {
    /// Position along the forward path. Both families share the ranks from
    /// `InProgress` onwards; `Cancelled` sits above everything.
    pub fn rank(&self) -> u8 {
        match self {
            Self::PaymentPending | Self::Pending => 0,
            Self::PaymentConfirmed => 1,
            Self::OrderGenerated | Self::Contacted => 2,
            Self::InProgress => 3,
            Self::PendingConfirmation => 4,
            Self::Completed => 5,
            Self::Cancelled => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn belongs_to(&self, kind: EngagementKind) -> bool {
        match self {
            Self::PaymentPending | Self::PaymentConfirmed | Self::OrderGenerated => {
                kind == EngagementKind::Reservation
            }
            Self::Pending | Self::Contacted => kind == EngagementKind::Request,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentPending => "payment_pending",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::OrderGenerated => "order_generated",
            Self::Pending => "pending",
            Self::Contacted => "contacted",
            Self::InProgress => "in_progress",
            Self::PendingConfirmation => "pending_confirmation",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EngagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Hourly,
    TechnicalVisit,
    Emergency,
}

impl FromStr for ServiceType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "hourly" | "porHora" => Ok(Self::Hourly),
            "technical_visit" | "visitaTecnica" => Ok(Self::TechnicalVisit),
            "emergency" | "emergencia" => Ok(Self::Emergency),
            other => Err(EngineError::ValidationError(format!(
                "Unknown service type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub neighborhood: String,
    pub city: String,
    pub coordinates: Option<Coordinates>,
}

impl Address {
    pub fn new(
        street: impl Into<String>,
        neighborhood: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            street: street.into(),
            neighborhood: neighborhood.into(),
            city: city.into(),
            coordinates: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Confirmation {
    pub professional_done: bool,
    pub professional_done_at: Option<DateTime<Utc>>,
    pub client_approved: bool,
    pub client_approved_at: Option<DateTime<Utc>>,
    pub auto_confirm_deadline: Option<DateTime<Utc>>,
}

/// Quoted costs of an engagement.
///
/// `total` is always `subtotal + travel_surcharge`; `charged_amount` is what
/// the client reports paying on completion and is advisory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Costs {
    pub subtotal: Decimal,
    pub travel_surcharge: Decimal,
    pub total: Decimal,
    pub charged_amount: Option<Decimal>,
}

impl Costs {
    pub fn new(subtotal: Decimal, travel_surcharge: Decimal) -> Self {
        Self {
            subtotal,
            travel_surcharge,
            total: subtotal + travel_surcharge,
            charged_amount: None,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.subtotal + self.travel_surcharge
    }
}

impl Default for Costs {
    fn default() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// Payment sub-record carried by reservations only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReservationPayment {
    pub state: PaymentState,
    pub external_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub active: bool,
    pub description: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub by: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Client,
    Professional,
}

/// A unit of work between a client and a professional.
///
/// `state` is the single source of truth; everything else (disclosure,
/// sweeper eligibility, gating) is derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    pub code: String,
    pub kind: EngagementKind,
    pub client: UserId,
    pub professional: UserId,
    pub service_type: ServiceType,
    pub description: String,
    pub address: Address,
    /// Approximate distance reported by the coverage check, in km.
    pub distance_km: Option<Decimal>,
    pub state: EngagementState,
    pub confirmation: Confirmation,
    pub costs: Costs,
    pub payment: Option<ReservationPayment>,
    pub correction: Option<CorrectionRequest>,
    pub cancellation: Option<Cancellation>,
    /// Set on the first acceptance; guards the one-token debit.
    pub accepted_at: Option<DateTime<Utc>>,
    pub professional_reply: Option<String>,
    pub completion_notes: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Engagement {
    #[allow(clippy::too_many_arguments)]
    pub fn reservation(
        code: String,
        client: UserId,
        professional: UserId,
        service_type: ServiceType,
        description: String,
        address: Address,
        costs: Costs,
        distance_km: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut engagement = Self::base(
            EngagementKind::Reservation,
            code,
            client,
            professional,
            description,
            address,
            now,
        );
        engagement.service_type = service_type;
        engagement.costs = costs;
        engagement.distance_km = distance_km;
        engagement.payment = Some(ReservationPayment::default());
        engagement
    }

    pub fn request(
        code: String,
        client: UserId,
        professional: UserId,
        description: String,
        address: Address,
        distance_km: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut engagement = Self::base(
            EngagementKind::Request,
            code,
            client,
            professional,
            description,
            address,
            now,
        );
        engagement.distance_km = distance_km;
        engagement
    }

    fn base(
        kind: EngagementKind,
        code: String,
        client: UserId,
        professional: UserId,
        description: String,
        address: Address,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            kind,
            client,
            professional,
            service_type: ServiceType::default(),
            description,
            address,
            distance_km: None,
            state: kind.initial_state(),
            confirmation: Confirmation::default(),
            costs: Costs::default(),
            payment: None,
            correction: None,
            cancellation: None,
            accepted_at: None,
            professional_reply: None,
            completion_notes: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn party_of(&self, user: &str) -> Option<Party> {
        if self.client == user {
            Some(Party::Client)
        } else if self.professional == user {
            Some(Party::Professional)
        } else {
            None
        }
    }

    pub fn counterpart_of(&self, user: &str) -> &str {
        if self.client == user {
            &self.professional
        } else {
            &self.client
        }
    }

    pub fn is_due_for_auto_confirm(&self, now: DateTime<Utc>) -> bool {
        self.state == EngagementState::PendingConfirmation
            && self
                .confirmation
                .auto_confirm_deadline
                .is_some_and(|deadline| deadline <= now)
    }
}

/// Builds an order code such as `OS-1718000000000-K3ZQ`.
pub fn generate_code(kind: EngagementKind, now: DateTime<Utc>) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(4)
        .collect::<String>()
        .to_uppercase();
    format!("{}-{}-{}", kind.code_prefix(), now.timestamp_millis(), suffix)
}
