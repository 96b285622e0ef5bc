use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::engagement::UserId;
use super::ledger::TokenPlan;
use crate::error::{EngineError, Result};

pub const FREE_PLAN_CREDITS: u32 = 3;
pub const BILLING_PERIOD_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Professional,
    Premium,
}

impl Plan {
    pub fn is_unlimited(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// Monthly price in ARS. The free plan cannot be purchased.
    pub fn price(&self) -> Option<Decimal> {
        match self {
            Self::Free => None,
            Self::Professional => Some(dec!(2999)),
            Self::Premium => Some(dec!(4999)),
        }
    }

    /// Tokens credited when a purchase of this plan is approved.
    pub fn tokens_on_purchase(&self) -> u32 {
        match self {
            Self::Free => 0,
            Self::Professional => 20,
            Self::Premium => 50,
        }
    }

    pub fn token_plan(&self) -> TokenPlan {
        match self {
            Self::Free => TokenPlan::Basic,
            Self::Professional => TokenPlan::Professional,
            Self::Premium => TokenPlan::Premium,
        }
    }
}

impl FromStr for Plan {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "free" | "gratuito" => Ok(Self::Free),
            "professional" | "profesional" => Ok(Self::Professional),
            "premium" => Ok(Self::Premium),
            other => Err(EngineError::ValidationError(format!(
                "Unknown plan '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credits {
    pub available: u32,
    pub used: u32,
    pub purchased: u32,
}

/// Audit line of a credit use. Unlimited plans record `amount == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditEntry {
    pub timestamp: DateTime<Utc>,
    pub amount: i64,
    pub reason: String,
    pub engagement_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditUse {
    Debited { remaining: u32 },
    Unlimited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user: UserId,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub credits: Credits,
    pub price: Decimal,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub history: Vec<CreditEntry>,
}

impl Subscription {
    pub fn free(user: impl Into<UserId>, now: DateTime<Utc>) -> Self {
        Self {
            user: user.into(),
            plan: Plan::Free,
            status: SubscriptionStatus::Active,
            credits: Credits {
                available: FREE_PLAN_CREDITS,
                ..Credits::default()
            },
            price: Decimal::ZERO,
            started_at: now,
            expires_at: None,
            history: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Spends one credit to respond to a request.
    pub fn use_credit(
        &mut self,
        reason: impl Into<String>,
        engagement_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CreditUse> {
        if !self.is_active() {
            return Err(EngineError::InsufficientLedgerBalance {
                account: self.user.clone(),
                available: 0,
                requested: 1,
            });
        }

        if self.plan.is_unlimited() {
            self.history.push(CreditEntry {
                timestamp: now,
                amount: 0,
                reason: reason.into(),
                engagement_ref,
            });
            return Ok(CreditUse::Unlimited);
        }

        if self.credits.available == 0 {
            return Err(EngineError::InsufficientLedgerBalance {
                account: self.user.clone(),
                available: 0,
                requested: 1,
            });
        }
        self.credits.available -= 1;
        self.credits.used += 1;
        self.history.push(CreditEntry {
            timestamp: now,
            amount: -1,
            reason: reason.into(),
            engagement_ref,
        });
        Ok(CreditUse::Debited {
            remaining: self.credits.available,
        })
    }

    /// Gives back a credit taken by [`Subscription::use_credit`] when the
    /// operation it paid for could not be committed.
    pub fn return_credit(
        &mut self,
        used: CreditUse,
        reason: impl Into<String>,
        engagement_ref: Option<String>,
        now: DateTime<Utc>,
    ) {
        if let CreditUse::Debited { .. } = used {
            self.credits.available += 1;
            self.credits.used = self.credits.used.saturating_sub(1);
            self.history.push(CreditEntry {
                timestamp: now,
                amount: 1,
                reason: reason.into(),
                engagement_ref,
            });
        }
    }

    /// Switches to a purchased plan for one billing period.
    pub fn activate(&mut self, plan: Plan, now: DateTime<Utc>) {
        self.plan = plan;
        self.status = SubscriptionStatus::Active;
        self.price = plan.price().unwrap_or(Decimal::ZERO);
        self.started_at = now;
        self.expires_at = Some(now + Duration::days(BILLING_PERIOD_DAYS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_plan_consumes_credits() {
        let now = Utc::now();
        let mut sub = Subscription::free("pro", now);
        for expected in (0..FREE_PLAN_CREDITS).rev() {
            let used = sub.use_credit("reply", Some("SOL-1".into()), now).unwrap();
            assert_eq!(used, CreditUse::Debited { remaining: expected });
        }
        assert!(matches!(
            sub.use_credit("reply", None, now),
            Err(EngineError::InsufficientLedgerBalance { .. })
        ));
        assert_eq!(sub.credits.used, FREE_PLAN_CREDITS);
        assert_eq!(sub.history.len(), FREE_PLAN_CREDITS as usize);
    }

    #[test]
    fn test_unlimited_plan_writes_zero_audit_entry() {
        let now = Utc::now();
        let mut sub = Subscription::free("pro", now);
        sub.activate(Plan::Premium, now);

        assert_eq!(sub.use_credit("reply", None, now).unwrap(), CreditUse::Unlimited);
        assert_eq!(sub.credits.available, FREE_PLAN_CREDITS);
        assert_eq!(sub.history.len(), 1);
        assert_eq!(sub.history[0].amount, 0);
    }

    #[test]
    fn test_activation_sets_period() {
        let now = Utc::now();
        let mut sub = Subscription::free("pro", now);
        sub.activate(Plan::Professional, now);
        assert_eq!(sub.price, dec!(2999));
        assert_eq!(sub.expires_at, Some(now + Duration::days(30)));
        assert_eq!(Plan::Professional.tokens_on_purchase(), 20);
        assert!(Plan::Free.price().is_none());
    }
}
