use rust_decimal::Decimal;
use serde::Serialize;

use super::engagement::{Coordinates, Engagement, EngagementKind, EngagementState, Party};
use crate::error::{EngineError, Result};

/// How much of the client's address a professional may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureLevel {
    City,
    Neighborhood,
    FullAddress,
}

impl DisclosureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::City => "city",
            Self::Neighborhood => "neighborhood",
            Self::FullAddress => "full_address",
        }
    }
}

pub fn disclosure_level(kind: EngagementKind, state: EngagementState) -> DisclosureLevel {
    use EngagementState::*;
    match kind {
        EngagementKind::Request => match state {
            Pending | Cancelled => DisclosureLevel::City,
            Contacted | InProgress => DisclosureLevel::Neighborhood,
            PendingConfirmation | Completed => DisclosureLevel::FullAddress,
            PaymentPending | PaymentConfirmed | OrderGenerated => DisclosureLevel::City,
        },
        EngagementKind::Reservation => match state {
            OrderGenerated | InProgress | PendingConfirmation | Completed => {
                DisclosureLevel::FullAddress
            }
            _ => DisclosureLevel::Neighborhood,
        },
    }
}

/// Read model of an engagement filtered for one of its parties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisclosedView {
    pub code: String,
    pub kind: EngagementKind,
    pub state: EngagementState,
    pub level: DisclosureLevel,
    pub description: String,
    pub city: String,
    pub neighborhood: Option<String>,
    pub street: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub distance_km: Option<Decimal>,
}

impl DisclosedView {
    /// Projects `engagement` for `requester`. The client always sees its own
    /// address in full; the professional sees it up to the current level.
    pub fn of(engagement: &Engagement, requester: &str) -> Result<Self> {
        let party = engagement.party_of(requester).ok_or_else(|| {
            EngineError::Forbidden(format!(
                "{} is not a party to {}",
                requester, engagement.code
            ))
        })?;

        let level = match party {
            Party::Client => DisclosureLevel::FullAddress,
            Party::Professional => disclosure_level(engagement.kind, engagement.state),
        };
        let address = &engagement.address;

        Ok(Self {
            code: engagement.code.clone(),
            kind: engagement.kind,
            state: engagement.state,
            level,
            description: engagement.description.clone(),
            city: address.city.clone(),
            neighborhood: (level >= DisclosureLevel::Neighborhood)
                .then(|| address.neighborhood.clone()),
            street: (level == DisclosureLevel::FullAddress).then(|| address.street.clone()),
            coordinates: if level == DisclosureLevel::FullAddress {
                address.coordinates
            } else {
                None
            },
            distance_km: match party {
                Party::Professional => engagement.distance_km,
                Party::Client => None,
            },
        })
    }
}
