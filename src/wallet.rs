//! Prepaid wallet accounts
//!
//! The wallet is the only writer of balances. Every credit and debit is
//! recorded in the ledger before the cached balance moves. Charging in
//! progress is covered by per-session holds, which reduce the available
//! balance without touching the ledger until the session settles.

use crate::error::{ChargeError, Result};
use crate::ledger::{Ledger, TransactionKind, WalletTransaction, settlement_id};
use crate::logging::get_logger;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::session::{SessionId, UserId};
use crate::tariff::{Money, round_money};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cached state of one user's wallet
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: UserId,
    /// Committed balance, equal to the sum of the user's ledger transactions
    pub balance: Money,
    /// In-flight amounts per session
    pub holds: HashMap<SessionId, Money>,
    loaded: bool,
}

impl Account {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: Decimal::ZERO,
            holds: HashMap::new(),
            loaded: false,
        }
    }

    pub fn held(&self) -> Money {
        self.holds.values().copied().sum()
    }

    pub fn available(&self) -> Money {
        (self.balance - self.held()).max(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub user_id: UserId,
    pub balance: Money,
    pub held: Money,
    pub available: Money,
}

/// Result of asking the wallet to cover a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldOutcome {
    /// Amount actually reserved
    pub granted: Money,
    /// True when less than requested was available
    pub capped: bool,
    /// Available balance after the hold
    pub available_after: Money,
}

/// Check that a user id is usable as a ledger key
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let ok = !user_id.is_empty()
        && user_id.len() <= 64
        && !user_id.starts_with('.')
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ChargeError::validation(
            "user_id",
            "Must be 1-64 characters of letters, digits, '-', '_' or '.'",
        ))
    }
}

pub struct Wallet {
    ledger: Arc<dyn Ledger>,
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
    retry: RetryConfig,
    logger: crate::logging::StructuredLogger,
}

impl Wallet {
    pub fn new(ledger: Arc<dyn Ledger>, retry: RetryConfig) -> Self {
        Self {
            ledger,
            accounts: DashMap::new(),
            retry,
            logger: get_logger("wallet"),
        }
    }

    /// Rebuild every account known to the ledger
    pub async fn load_from_ledger(&self) -> Result<usize> {
        let users = self.ledger.known_users().await?;
        for user in &users {
            let slot = self.slot(user);
            let mut acct = slot.lock().await;
            acct.balance = self.replay(user).await?;
            acct.loaded = true;
        }
        self.logger
            .info(&format!("Loaded {} wallet accounts from ledger", users.len()));
        Ok(users.len())
    }

    fn slot(&self, user_id: &str) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(user_id))))
            .clone()
    }

    async fn replay(&self, user_id: &str) -> Result<Money> {
        let txs = self.ledger.transactions(user_id).await?;
        Ok(txs.iter().map(WalletTransaction::signed_amount).sum())
    }

    /// Lock a user's account, loading it from the ledger on first use
    async fn account(&self, user_id: &str) -> Result<Arc<Mutex<Account>>> {
        validate_user_id(user_id)?;
        let slot = self.slot(user_id);
        {
            let mut acct = slot.lock().await;
            if !acct.loaded {
                acct.balance = self.replay(user_id).await?;
                acct.loaded = true;
            }
        }
        Ok(slot)
    }

    async fn append(&self, tx: &WalletTransaction) -> Result<bool> {
        retry_with_backoff(
            &self.retry,
            || self.ledger.record_transaction(tx),
            "record_transaction",
        )
        .await
    }

    /// Spendable balance: committed balance minus in-flight holds
    pub async fn get_balance(&self, user_id: &str) -> Result<Money> {
        let slot = self.account(user_id).await?;
        let acct = slot.lock().await;
        Ok(acct.available())
    }

    pub async fn committed_balance(&self, user_id: &str) -> Result<Money> {
        let slot = self.account(user_id).await?;
        let acct = slot.lock().await;
        Ok(acct.balance)
    }

    pub async fn snapshot(&self, user_id: &str) -> Result<BalanceSnapshot> {
        let slot = self.account(user_id).await?;
        let acct = slot.lock().await;
        Ok(BalanceSnapshot {
            user_id: acct.user_id.clone(),
            balance: acct.balance,
            held: round_money(acct.held()),
            available: round_money(acct.available()),
        })
    }

    pub async fn credit(
        &self,
        user_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<WalletTransaction> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(ChargeError::validation("amount", "Must be positive"));
        }
        let slot = self.account(user_id).await?;
        let mut acct = slot.lock().await;

        let tx = WalletTransaction::top_up(user_id, amount, description);
        self.append(&tx).await?;
        acct.balance += amount;

        self.logger.info(&format!(
            "Credited {} to {}, balance {}",
            amount, user_id, acct.balance
        ));
        Ok(tx)
    }

    pub async fn debit(
        &self,
        user_id: &str,
        amount: Money,
        description: &str,
        session_id: Option<&str>,
    ) -> Result<WalletTransaction> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(ChargeError::validation("amount", "Must be positive"));
        }
        let slot = self.account(user_id).await?;
        let mut acct = slot.lock().await;

        let available = acct.available();
        if amount > available {
            return Err(ChargeError::insufficient_funds(amount, available));
        }

        let tx = WalletTransaction::deduction(user_id, amount, description, session_id);
        self.append(&tx).await?;
        acct.balance -= amount;
        Ok(tx)
    }

    /// Reserve up to `amount` for a session, capped at the available balance
    pub async fn hold(&self, user_id: &str, session_id: &str, amount: Money) -> Result<HoldOutcome> {
        if amount < Decimal::ZERO {
            return Err(ChargeError::validation("amount", "Cannot be negative"));
        }
        let slot = self.account(user_id).await?;
        let mut acct = slot.lock().await;

        let available = acct.available();
        let granted = amount.min(available);
        *acct.holds.entry(session_id.to_string()).or_default() += granted;

        Ok(HoldOutcome {
            granted,
            capped: granted < amount,
            available_after: available - granted,
        })
    }

    /// Drop a session's hold without charging it
    pub async fn release(&self, user_id: &str, session_id: &str) -> Result<Money> {
        let slot = self.account(user_id).await?;
        let mut acct = slot.lock().await;
        Ok(acct.holds.remove(session_id).unwrap_or_default())
    }

    /// Turn a session's hold into its single closing deduction.
    ///
    /// Debits `min(round_money(amount), balance)` under the session's
    /// settlement id, so repeating the call never charges twice. Returns
    /// `None` when there is nothing to charge. On error the hold is kept.
    pub async fn settle(
        &self,
        user_id: &str,
        session_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<Option<WalletTransaction>> {
        let slot = self.account(user_id).await?;
        let mut acct = slot.lock().await;

        let amount = round_money(amount).min(acct.balance).max(Decimal::ZERO);
        if amount.is_zero() {
            acct.holds.remove(session_id);
            return Ok(None);
        }

        let tx = WalletTransaction::settlement(user_id, session_id, amount, description);
        let recorded = if self.append(&tx).await? {
            acct.balance -= amount;
            tx
        } else {
            // Already settled, possibly before a restart
            let id = settlement_id(session_id);
            self.ledger
                .transactions(user_id)
                .await?
                .into_iter()
                .find(|t| t.id == id)
                .unwrap_or(tx)
        };
        acct.holds.remove(session_id);

        self.logger.info(&format!(
            "Settled session {} for {}: {} (balance {})",
            session_id, user_id, recorded.amount, acct.balance
        ));
        Ok(Some(recorded))
    }

    /// Compare the cached balance with a replay of the ledger
    pub async fn reconcile(&self, user_id: &str) -> Result<Money> {
        let slot = self.account(user_id).await?;
        let acct = slot.lock().await;
        let replayed = self.replay(user_id).await?;
        if replayed != acct.balance {
            self.logger.error(&format!(
                "Balance mismatch for {}: cached {}, ledger {}",
                user_id, acct.balance, replayed
            ));
            return Err(ChargeError::persistence(format!(
                "balance mismatch for {}: cached {}, ledger {}",
                user_id, acct.balance, replayed
            )));
        }
        Ok(replayed)
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<WalletTransaction>> {
        validate_user_id(user_id)?;
        self.ledger.transactions(user_id).await
    }

    pub async fn total_deducted(&self, user_id: &str) -> Result<Money> {
        Ok(self
            .transactions(user_id)
            .await?
            .iter()
            .filter(|t| t.kind == TransactionKind::Deduction)
            .map(|t| t.amount)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use rust_decimal_macros::dec;

    fn wallet() -> Wallet {
        Wallet::new(Arc::new(MemoryLedger::new()), RetryConfig::default())
    }

    #[test]
    fn user_ids() {
        assert!(validate_user_id("user-1").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("a b").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn hold_caps_at_available() {
        let w = wallet();
        w.credit("u1", dec!(10), "Wallet Top-up").await.unwrap();

        let h = w.hold("u1", "s1", dec!(6)).await.unwrap();
        assert_eq!(h.granted, dec!(6));
        assert!(!h.capped);
        assert_eq!(h.available_after, dec!(4));

        let h = w.hold("u1", "s1", dec!(6)).await.unwrap();
        assert_eq!(h.granted, dec!(4));
        assert!(h.capped);
        assert_eq!(h.available_after, dec!(0));
        assert_eq!(w.get_balance("u1").await.unwrap(), dec!(0));
        assert_eq!(w.committed_balance("u1").await.unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn release_restores_available() {
        let w = wallet();
        w.credit("u1", dec!(10), "Wallet Top-up").await.unwrap();
        w.hold("u1", "s1", dec!(3)).await.unwrap();
        assert_eq!(w.release("u1", "s1").await.unwrap(), dec!(3));
        assert_eq!(w.get_balance("u1").await.unwrap(), dec!(10));
    }
}
