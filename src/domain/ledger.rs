use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::engagement::UserId;
use crate::error::{EngineError, Result};

/// A strictly positive number of tokens.
///
/// Mirrors the positive-amount value object used for money: a zero or
/// negative movement is rejected before it can reach an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenAmount(u32);

impl TokenAmount {
    pub const ONE: Self = Self(1);

    pub fn new(value: i64) -> Result<Self> {
        if value > 0 && value <= u32::MAX as i64 {
            Ok(Self(value as u32))
        } else {
            Err(EngineError::ValidationError(
                "Token amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for TokenAmount {
    type Error = EngineError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenPlan {
    #[default]
    Basic,
    Professional,
    Premium,
}

impl TokenPlan {
    /// Tokens granted when an account is first opened on this plan.
    pub fn welcome_tokens(&self) -> u32 {
        match self {
            Self::Basic => 2,
            Self::Professional => 50,
            Self::Premium => 20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Professional => "professional",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for TokenPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenPlan {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "basic" | "basico" => Ok(Self::Basic),
            "professional" | "profesional" => Ok(Self::Professional),
            "premium" => Ok(Self::Premium),
            other => Err(EngineError::ValidationError(format!(
                "Unknown token plan '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Consume,
    Recharge,
    Gift,
    Refund,
}

/// One immutable line of an account's history. `amount` is the signed delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub amount: i64,
    pub reason: String,
    pub engagement_ref: Option<String>,
}

/// Token account of a professional.
///
/// `available` is a cache of the history fold; every mutation goes through
/// [`LedgerAccount::debit`] or [`LedgerAccount::credit`], which append exactly
/// one entry per change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub professional: UserId,
    pub available: u32,
    pub plan: TokenPlan,
    pub renewal_date: Option<DateTime<Utc>>,
    pub history: Vec<LedgerEntry>,
}

impl LedgerAccount {
    pub fn new(professional: impl Into<UserId>, plan: TokenPlan) -> Self {
        Self {
            professional: professional.into(),
            available: 0,
            plan,
            renewal_date: None,
            history: Vec::new(),
        }
    }

    /// Removes tokens if the balance covers them; the account is untouched otherwise.
    pub fn debit(
        &mut self,
        amount: TokenAmount,
        reason: impl Into<String>,
        engagement_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        if self.available < amount.value() {
            return Err(EngineError::InsufficientLedgerBalance {
                account: self.professional.clone(),
                available: self.available,
                requested: amount.value(),
            });
        }
        self.available -= amount.value();
        self.history.push(LedgerEntry {
            timestamp: now,
            kind: EntryKind::Consume,
            amount: -(amount.value() as i64),
            reason: reason.into(),
            engagement_ref,
        });
        Ok(self.available)
    }

    pub fn credit(
        &mut self,
        amount: TokenAmount,
        kind: EntryKind,
        reason: impl Into<String>,
        engagement_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        if kind == EntryKind::Consume {
            return Err(EngineError::ValidationError(
                "A credit cannot be recorded as consumption".to_string(),
            ));
        }
        self.available = self.available.checked_add(amount.value()).ok_or_else(|| {
            EngineError::ValidationError("Token balance would overflow".to_string())
        })?;
        self.history.push(LedgerEntry {
            timestamp: now,
            kind,
            amount: amount.value() as i64,
            reason: reason.into(),
            engagement_ref,
        });
        Ok(self.available)
    }

    /// Balance recomputed from the history alone.
    pub fn replayed_balance(&self) -> i64 {
        self.history.iter().map(|entry| entry.amount).sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.replayed_balance() == self.available as i64
    }

    pub fn has_entry_for(&self, kind: EntryKind, engagement_ref: &str) -> bool {
        self.history
            .iter()
            .any(|e| e.kind == kind && e.engagement_ref.as_deref() == Some(engagement_ref))
    }
}
