use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::locks::KeyedLocks;
use crate::domain::ledger::{EntryKind, LedgerAccount, TokenAmount, TokenPlan};
use crate::domain::ports::{Clock, LedgerStore, SubscriptionStore};
use crate::domain::subscription::{BILLING_PERIOD_DAYS, CreditUse, Subscription};
use crate::error::{EngineError, Result};

/// Serialised access to token accounts and subscription credits.
///
/// Every mutation runs under the per-account lock: load, mutate the domain
/// object, write back. Two debits racing for the last token therefore see
/// each other's result.
pub struct LedgerService {
    ledgers: Arc<dyn LedgerStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl LedgerService {
    pub fn new(
        ledgers: Arc<dyn LedgerStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledgers,
            subscriptions,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    /// Opens a token account with the plan's welcome gift. Opening an
    /// existing account returns it unchanged.
    pub async fn open_account(&self, professional: &str, plan: TokenPlan) -> Result<LedgerAccount> {
        let _guard = self.locks.lock(&ledger_key(professional)).await;
        if let Some(existing) = self.ledgers.get(professional).await? {
            debug!(account = professional, "Token account already open");
            return Ok(existing);
        }

        let mut account = LedgerAccount::new(professional, plan);
        let welcome = TokenAmount::new(plan.welcome_tokens() as i64)?;
        account.credit(welcome, EntryKind::Gift, "welcome tokens", None, self.clock.now())?;
        self.ledgers.store(account.clone()).await?;
        info!(account = professional, plan = %plan, available = account.available, "Opened token account");
        Ok(account)
    }

    pub async fn debit(
        &self,
        professional: &str,
        amount: i64,
        reason: &str,
        engagement_ref: Option<&str>,
    ) -> Result<u32> {
        let amount = TokenAmount::new(amount)?;
        let _guard = self.locks.lock(&ledger_key(professional)).await;
        let mut account = self.load(professional).await?;
        let balance = account
            .debit(amount, reason, engagement_ref.map(str::to_string), self.clock.now())
            .inspect_err(|e| warn!(account = professional, error = %e, "Debit rejected"))?;
        self.ledgers.store(account).await?;
        info!(account = professional, amount = amount.value(), balance, reason, "Debited tokens");
        Ok(balance)
    }

    pub async fn credit(
        &self,
        professional: &str,
        amount: i64,
        kind: EntryKind,
        reason: &str,
        engagement_ref: Option<&str>,
    ) -> Result<u32> {
        let amount = TokenAmount::new(amount)?;
        let _guard = self.locks.lock(&ledger_key(professional)).await;
        let mut account = self.load(professional).await?;
        let balance = account.credit(
            amount,
            kind,
            reason,
            engagement_ref.map(str::to_string),
            self.clock.now(),
        )?;
        self.ledgers.store(account).await?;
        info!(account = professional, amount = amount.value(), balance, ?kind, reason, "Credited tokens");
        Ok(balance)
    }

    /// Credits a plan purchase and moves the renewal date one billing period out.
    ///
    /// A purchase whose `payment_ref` is already in the history is not
    /// credited again; the current balance is returned.
    pub async fn recharge(
        &self,
        professional: &str,
        plan: TokenPlan,
        tokens: u32,
        payment_ref: Option<&str>,
    ) -> Result<u32> {
        let amount = TokenAmount::new(tokens as i64)?;
        let _guard = self.locks.lock(&ledger_key(professional)).await;
        let now = self.clock.now();
        let mut account = match self.ledgers.get(professional).await? {
            Some(account) => account,
            None => LedgerAccount::new(professional, plan),
        };
        if let Some(reference) = payment_ref
            && account.has_entry_for(EntryKind::Recharge, reference)
        {
            debug!(account = professional, payment = reference, "Purchase already credited");
            return Ok(account.available);
        }
        let balance = account.credit(
            amount,
            EntryKind::Recharge,
            format!("{} plan purchase", plan),
            payment_ref.map(str::to_string),
            now,
        )?;
        account.plan = plan;
        account.renewal_date = Some(now + Duration::days(BILLING_PERIOD_DAYS));
        self.ledgers.store(account).await?;
        info!(account = professional, plan = %plan, balance, "Recharged token account");
        Ok(balance)
    }

    pub async fn account(&self, professional: &str) -> Result<LedgerAccount> {
        self.load(professional).await
    }

    /// Checks that the cached balance equals the fold of the history.
    pub async fn verify_replay(&self, professional: &str) -> Result<bool> {
        let account = self.load(professional).await?;
        Ok(account.is_consistent())
    }

    pub async fn open_free_subscription(&self, user: &str) -> Result<Subscription> {
        let _guard = self.locks.lock(&credit_key(user)).await;
        if let Some(existing) = self.subscriptions.get(user).await? {
            return Ok(existing);
        }
        let subscription = Subscription::free(user, self.clock.now());
        self.subscriptions.store(subscription.clone()).await?;
        info!(account = user, credits = subscription.credits.available, "Opened free subscription");
        Ok(subscription)
    }

    /// Spends one subscription credit; unlimited plans only leave an audit entry.
    pub async fn use_credit(&self, user: &str, engagement_ref: Option<&str>) -> Result<CreditUse> {
        let _guard = self.locks.lock(&credit_key(user)).await;
        let mut subscription = self
            .subscriptions
            .get(user)
            .await?
            .ok_or_else(|| EngineError::not_found("subscription", user))?;
        let used = subscription
            .use_credit(
                "request response",
                engagement_ref.map(str::to_string),
                self.clock.now(),
            )
            .inspect_err(|e| warn!(account = user, error = %e, "Credit use rejected"))?;
        self.subscriptions.store(subscription).await?;
        debug!(account = user, ?used, "Used subscription credit");
        Ok(used)
    }

    pub async fn return_credit(
        &self,
        user: &str,
        used: CreditUse,
        engagement_ref: Option<&str>,
    ) -> Result<()> {
        let _guard = self.locks.lock(&credit_key(user)).await;
        if let Some(mut subscription) = self.subscriptions.get(user).await? {
            subscription.return_credit(
                used,
                "returned",
                engagement_ref.map(str::to_string),
                self.clock.now(),
            );
            self.subscriptions.store(subscription).await?;
        }
        Ok(())
    }

    async fn load(&self, professional: &str) -> Result<LedgerAccount> {
        self.ledgers
            .get(professional)
            .await?
            .ok_or_else(|| EngineError::not_found("ledger account", professional))
    }
}

fn ledger_key(professional: &str) -> String {
    format!("ledger:{}", professional)
}

fn credit_key(user: &str) -> String {
    format!("credits:{}", user)
}
