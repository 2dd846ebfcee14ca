//! Append-only session and wallet ledger
//!
//! The ledger is the source of truth for both charging sessions and wallet
//! transactions. Session records are appended as snapshots and may not change
//! after they leave `Active`; wallet transactions are idempotent by id so a
//! retried write never double-charges.

use crate::error::{ChargeError, Result};
use crate::session::{ChargingSession, SessionId, SessionStatus, UserId};
use crate::tariff::Money;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod file;
mod memory;

pub use file::FileLedger;
pub use memory::MemoryLedger;

/// Direction of a wallet transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    TopUp,
    Deduction,
}

/// One wallet movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub user_id: UserId,
    pub kind: TransactionKind,

    /// Always positive; `kind` carries the sign
    pub amount: Money,
    pub description: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    pub fn top_up(user_id: &str, amount: Money, description: &str) -> Self {
        Self {
            id: format!("txn-{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            kind: TransactionKind::TopUp,
            amount,
            description: description.to_string(),
            session_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn deduction(
        user_id: &str,
        amount: Money,
        description: &str,
        session_id: Option<&str>,
    ) -> Self {
        Self {
            id: format!("txn-{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            kind: TransactionKind::Deduction,
            amount,
            description: description.to_string(),
            session_id: session_id.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    /// Closing deduction of a session. The id depends only on the session.
    pub fn settlement(user_id: &str, session_id: &str, amount: Money, description: &str) -> Self {
        Self {
            id: settlement_id(session_id),
            ..Self::deduction(user_id, amount, description, Some(session_id))
        }
    }

    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            TransactionKind::TopUp => self.amount,
            TransactionKind::Deduction => -self.amount,
        }
    }
}

pub fn settlement_id(session_id: &str) -> String {
    format!("settle-{}", session_id)
}

/// Durable store for sessions and wallet transactions
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append a session snapshot. Fails once the stored copy is terminal,
    /// unless the write is an exact repeat.
    async fn record_session(&self, session: &ChargingSession) -> Result<()>;

    /// Append a transaction. Returns `false` when the id is already recorded.
    async fn record_transaction(&self, tx: &WalletTransaction) -> Result<bool>;

    async fn get_session(&self, id: &str) -> Result<Option<ChargingSession>>;

    /// Sessions of a user, newest `start_time` first
    async fn query_history(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<ChargingSession>>;

    /// Sessions whose last stored status is Active
    async fn active_sessions(&self) -> Result<Vec<ChargingSession>>;

    /// Transactions of a user in append order
    async fn transactions(&self, user_id: &str) -> Result<Vec<WalletTransaction>>;

    /// Every user with at least one transaction
    async fn known_users(&self) -> Result<Vec<UserId>>;
}

/// Decide whether `new` may be stored over `existing`.
///
/// Returns `Ok(false)` for an identical repeat that needs no write.
pub(crate) fn check_session_write(
    existing: Option<&ChargingSession>,
    new: &ChargingSession,
) -> Result<bool> {
    match existing {
        None => Ok(true),
        Some(old) if old.status.is_terminal() => {
            if old == new {
                Ok(false)
            } else {
                Err(ChargeError::invalid_transition(
                    old.status.to_string(),
                    "modify",
                ))
            }
        }
        Some(old) => {
            if old.user_id != new.user_id || old.start_time != new.start_time {
                return Err(ChargeError::validation(
                    "session",
                    format!("snapshot does not match stored session {}", old.id),
                ));
            }
            Ok(true)
        }
    }
}

pub(crate) fn sort_and_limit(
    mut sessions: Vec<ChargingSession>,
    status: Option<SessionStatus>,
    limit: usize,
) -> Vec<ChargingSession> {
    if let Some(status) = status {
        sessions.retain(|s| s.status == status);
    }
    sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.id.cmp(&a.id)));
    sessions.truncate(limit);
    sessions
}
