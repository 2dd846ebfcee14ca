use super::{Ledger, WalletTransaction, check_session_write, sort_and_limit};
use crate::error::{ChargeError, Result};
use crate::session::{ChargingSession, SessionStatus, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-local ledger for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryLedger {
    sessions: DashMap<String, ChargingSession>,
    transactions: DashMap<UserId, Vec<WalletTransaction>>,
    tx_ids: Mutex<HashSet<String>>,
    fail_writes: AtomicU32,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a persistence error
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<()> {
        let hit = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(ChargeError::persistence("injected write failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_session(&self, session: &ChargingSession) -> Result<()> {
        self.injected_failure()?;
        match self.sessions.entry(session.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
            Entry::Occupied(mut slot) => {
                if check_session_write(Some(slot.get()), session)? {
                    slot.insert(session.clone());
                }
            }
        }
        Ok(())
    }

    async fn record_transaction(&self, tx: &WalletTransaction) -> Result<bool> {
        self.injected_failure()?;
        let mut ids = self
            .tx_ids
            .lock()
            .map_err(|_| ChargeError::persistence("transaction index poisoned"))?;
        if !ids.insert(tx.id.clone()) {
            return Ok(false);
        }
        self.transactions
            .entry(tx.user_id.clone())
            .or_default()
            .push(tx.clone());
        Ok(true)
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChargingSession>> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    async fn query_history(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<ChargingSession>> {
        let sessions: Vec<ChargingSession> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.value().clone())
            .collect();
        Ok(sort_and_limit(sessions, status, limit))
    }

    async fn active_sessions(&self) -> Result<Vec<ChargingSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.value().clone())
            .collect())
    }

    async fn transactions(&self, user_id: &str) -> Result<Vec<WalletTransaction>> {
        Ok(self
            .transactions
            .get(user_id)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }

    async fn known_users(&self) -> Result<Vec<UserId>> {
        let mut users: Vec<UserId> = self.transactions.iter().map(|e| e.key().clone()).collect();
        users.sort();
        Ok(users)
    }
}
