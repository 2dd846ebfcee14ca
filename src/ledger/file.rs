//! JSON-lines ledger on the local filesystem
//!
//! Layout under the root directory:
//!
//! - `sessions/<session_id>.jsonl`: one snapshot per line, last line wins
//! - `transactions/<user_id>.jsonl`: one transaction per line
//!
//! Every append is followed by `sync_data` before the call returns. Writers
//! on the same file are serialized through a per-key async lock; writers on
//! different files proceed independently.

use super::{Ledger, WalletTransaction, check_session_write, sort_and_limit};
use crate::error::{ChargeError, Result};
use crate::logging::get_logger;
use crate::session::{ChargingSession, SessionStatus, UserId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const SESSIONS_DIR: &str = "sessions";
const TRANSACTIONS_DIR: &str = "transactions";
const EXT: &str = "jsonl";

pub struct FileLedger {
    root: PathBuf,
    sessions: DashMap<String, ChargingSession>,
    transactions: DashMap<UserId, Vec<WalletTransaction>>,
    tx_ids: DashSet<String>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    logger: crate::logging::StructuredLogger,
}

impl FileLedger {
    /// Open (or create) a ledger rooted at `root` and load its contents
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(SESSIONS_DIR)).await?;
        fs::create_dir_all(root.join(TRANSACTIONS_DIR)).await?;

        let ledger = Self {
            root,
            sessions: DashMap::new(),
            transactions: DashMap::new(),
            tx_ids: DashSet::new(),
            locks: DashMap::new(),
            logger: get_logger("ledger"),
        };
        ledger.load().await?;
        Ok(ledger)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load(&self) -> Result<()> {
        for path in list_files(&self.root.join(SESSIONS_DIR)).await? {
            let records: Vec<ChargingSession> = self.read_lines(&path).await?;
            if let Some(last) = records.into_iter().last() {
                self.sessions.insert(last.id.clone(), last);
            }
        }

        for path in list_files(&self.root.join(TRANSACTIONS_DIR)).await? {
            let records: Vec<WalletTransaction> = self.read_lines(&path).await?;
            for tx in records {
                if self.tx_ids.insert(tx.id.clone()) {
                    self.transactions
                        .entry(tx.user_id.clone())
                        .or_default()
                        .push(tx);
                }
            }
        }

        self.logger.info(&format!(
            "Loaded ledger from {}: {} sessions, {} transactions",
            self.root.display(),
            self.sessions.len(),
            self.tx_ids.len()
        ));
        Ok(())
    }

    /// Parse one file, skipping lines that do not decode
    async fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let contents = fs::read_to_string(path).await?;
        let mut out = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(v) => out.push(v),
                Err(e) => self.logger.warn(&format!(
                    "Skipping unreadable line {} in {}: {}",
                    n + 1,
                    path.display(),
                    e
                )),
            }
        }
        // Terminate a torn tail so the next append starts on its own line
        if !contents.is_empty() && !contents.ends_with('\n') {
            let mut file = OpenOptions::new().append(true).open(path).await?;
            file.write_all(b"\n").await?;
            file.sync_data().await?;
        }
        Ok(out)
    }

    fn lock_for(&self, key: String) -> Arc<Mutex<()>> {
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn session_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(SESSIONS_DIR)
            .join(format!("{}.{}", safe_file_stem("session_id", id)?, EXT)))
    }

    fn transactions_path(&self, user_id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(TRANSACTIONS_DIR)
            .join(format!("{}.{}", safe_file_stem("user_id", user_id)?, EXT)))
    }
}

async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| ChargeError::persistence(format!("open {}: {}", path.display(), e)))?;
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)
        .await
        .map_err(|e| ChargeError::persistence(format!("write {}: {}", path.display(), e)))?;
    file.sync_data()
        .await
        .map_err(|e| ChargeError::persistence(format!("sync {}: {}", path.display(), e)))?;
    Ok(())
}

/// Reject ids that cannot be used verbatim as a file name
pub(crate) fn safe_file_stem<'a>(field: &str, id: &'a str) -> Result<&'a str> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(id)
    } else {
        Err(ChargeError::validation(
            field,
            format!("'{}' is not a valid identifier", id),
        ))
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn record_session(&self, session: &ChargingSession) -> Result<()> {
        let path = self.session_path(&session.id)?;
        let lock = self.lock_for(format!("session:{}", session.id));
        let _guard = lock.lock().await;

        let existing = self.sessions.get(&session.id).map(|s| s.value().clone());
        if !check_session_write(existing.as_ref(), session)? {
            return Ok(());
        }

        let line = serde_json::to_string(session)?;
        append_line(&path, &line).await?;
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn record_transaction(&self, tx: &WalletTransaction) -> Result<bool> {
        let path = self.transactions_path(&tx.user_id)?;
        let lock = self.lock_for(format!("user:{}", tx.user_id));
        let _guard = lock.lock().await;

        if self.tx_ids.contains(&tx.id) {
            return Ok(false);
        }

        let line = serde_json::to_string(tx)?;
        append_line(&path, &line).await?;
        self.tx_ids.insert(tx.id.clone());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stems() {
        assert!(safe_file_stem("user_id", "user-1").is_ok());
        assert!(safe_file_stem("user_id", "a.b_c").is_ok());
        assert!(safe_file_stem("user_id", "").is_err());
        assert!(safe_file_stem("user_id", "../etc").is_err());
        assert!(safe_file_stem("user_id", ".hidden").is_err());
        assert!(safe_file_stem("user_id", "a/b").is_err());
    }
}
