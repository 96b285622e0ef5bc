use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::engagement::UserId;
use super::subscription::Plan;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl PaymentStatus {
    /// Maps a provider status string onto the record lifecycle.
    pub fn from_provider(status: &str) -> Self {
        match status.trim() {
            "approved" => Self::Approved,
            "pending" | "in_process" => Self::Pending,
            _ => Self::Rejected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// Identifiers and raw status reported by the payment provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderDetails {
    pub payment_id: Option<String>,
    pub status: Option<String>,
}

/// A subscription purchase. Created at checkout, mutated only by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub user: UserId,
    pub plan: Plan,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider: ProviderDetails,
    pub paid_at: Option<DateTime<Utc>>,
    pub tokens_credited: bool,
    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn checkout(
        id: impl Into<String>,
        user: impl Into<UserId>,
        plan: Plan,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let amount = plan.price().ok_or_else(|| {
            EngineError::ValidationError(format!("Plan {:?} cannot be purchased", plan))
        })?;
        Ok(Self {
            id: id.into(),
            user: user.into(),
            plan,
            amount,
            currency: "ARS".to_string(),
            status: PaymentStatus::Pending,
            provider: ProviderDetails::default(),
            paid_at: None,
            tokens_credited: false,
            created_at: now,
        })
    }
}

/// Webhook body as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "payment_id")]
    pub external_payment_id: String,
    pub status: String,
    pub external_reference: String,
}

impl WebhookPayload {
    pub fn new(
        external_payment_id: impl Into<String>,
        status: impl Into<String>,
        external_reference: impl Into<String>,
    ) -> Self {
        Self {
            external_payment_id: external_payment_id.into(),
            status: status.into(),
            external_reference: external_reference.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.external_reference.trim().is_empty() {
            return Err(EngineError::ValidationError(
                "external_reference is required".to_string(),
            ));
        }
        if self.external_payment_id.trim().is_empty() {
            return Err(EngineError::ValidationError(
                "payment id is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Key under which an applied delivery is remembered.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.external_reference, self.external_payment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_mapping() {
        assert_eq!(PaymentStatus::from_provider("approved"), PaymentStatus::Approved);
        assert_eq!(PaymentStatus::from_provider("in_process"), PaymentStatus::Pending);
        assert_eq!(PaymentStatus::from_provider("cancelled"), PaymentStatus::Rejected);
    }

    #[test]
    fn test_checkout_prices() {
        let record = PaymentRecord::checkout("pay-1", "pro", Plan::Premium, Utc::now()).unwrap();
        assert_eq!(record.amount, dec!(4999));
        assert_eq!(record.status, PaymentStatus::Pending);
        assert!(PaymentRecord::checkout("pay-2", "pro", Plan::Free, Utc::now()).is_err());
    }

    #[test]
    fn test_payload_deserialization_and_validation() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"payment_id":"mp-9","status":"approved","external_reference":"pay-1"}"#,
        )
        .unwrap();
        assert_eq!(payload.external_payment_id, "mp-9");
        assert!(payload.validate().is_ok());
        assert_eq!(payload.idempotency_key(), "pay-1:mp-9");

        let missing = WebhookPayload::new("mp-9", "approved", " ");
        assert!(matches!(
            missing.validate(),
            Err(EngineError::ValidationError(_))
        ));
    }
}
