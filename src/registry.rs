//! Charger status registry
//!
//! Single source of the charger's public status. Status lives in a `watch`
//! channel so lock-free readers always see the latest state.

use crate::config::ChargerConfig;
use crate::error::{ChargeError, Result};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerState {
    Available,
    Charging,
    Offline,
}

impl fmt::Display for ChargerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChargerState::Available => "Available",
            ChargerState::Charging => "Charging",
            ChargerState::Offline => "Offline",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargerStatus {
    pub id: String,
    pub name: String,
    pub location: String,
    pub status: ChargerState,
    pub current_session: Option<SessionId>,
    pub current_power_kw: f64,
    /// Operator asked for Offline while a session was running
    pub offline_pending: bool,
    pub updated_at: DateTime<Utc>,
}

pub struct ChargerRegistry {
    tx: watch::Sender<ChargerStatus>,
}

impl ChargerRegistry {
    pub fn new(cfg: &ChargerConfig) -> Self {
        let (tx, _) = watch::channel(ChargerStatus {
            id: cfg.id.clone(),
            name: cfg.name.clone(),
            location: cfg.location.clone(),
            status: ChargerState::Available,
            current_session: None,
            current_power_kw: 0.0,
            offline_pending: false,
            updated_at: Utc::now(),
        });
        Self { tx }
    }

    pub fn status(&self) -> ChargerStatus {
        self.tx.borrow().clone()
    }

    pub fn ensure_available(&self) -> Result<()> {
        let state = self.tx.borrow().status;
        if state == ChargerState::Available {
            Ok(())
        } else {
            Err(ChargeError::charger_unavailable(state.to_string()))
        }
    }

    /// Claim the charger for a session. Fails unless Available.
    pub fn set_charging(&self, session_id: &str) -> Result<()> {
        let mut refused = None;
        self.tx.send_if_modified(|s| {
            if s.status != ChargerState::Available {
                refused = Some(s.status);
                return false;
            }
            s.status = ChargerState::Charging;
            s.current_session = Some(session_id.to_string());
            s.current_power_kw = 0.0;
            s.updated_at = Utc::now();
            true
        });
        match refused {
            Some(state) => Err(ChargeError::charger_unavailable(state.to_string())),
            None => Ok(()),
        }
    }

    /// Free the charger; applies a pending Offline request
    pub fn set_available(&self) {
        self.tx.send_modify(|s| {
            s.status = if s.offline_pending {
                ChargerState::Offline
            } else {
                ChargerState::Available
            };
            s.offline_pending = false;
            s.current_session = None;
            s.current_power_kw = 0.0;
            s.updated_at = Utc::now();
        });
    }

    /// Take the charger offline, or once the running session ends.
    ///
    /// Returns true when the charger went Offline immediately.
    pub fn set_offline(&self) -> bool {
        let mut immediate = false;
        self.tx.send_if_modified(|s| match s.status {
            ChargerState::Charging => {
                let changed = !s.offline_pending;
                s.offline_pending = true;
                changed
            }
            ChargerState::Available => {
                s.status = ChargerState::Offline;
                s.updated_at = Utc::now();
                immediate = true;
                true
            }
            ChargerState::Offline => {
                immediate = true;
                false
            }
        });
        immediate
    }

    /// Bring the charger back, or cancel a pending Offline request
    pub fn clear_offline(&self) {
        self.tx.send_if_modified(|s| match s.status {
            ChargerState::Offline => {
                s.status = ChargerState::Available;
                s.offline_pending = false;
                s.updated_at = Utc::now();
                true
            }
            _ if s.offline_pending => {
                s.offline_pending = false;
                true
            }
            _ => false,
        });
    }

    pub fn set_current_power(&self, power_kw: f64) {
        self.tx.send_if_modified(|s| {
            if s.status != ChargerState::Charging {
                return false;
            }
            s.current_power_kw = power_kw;
            s.updated_at = Utc::now();
            true
        });
    }
}
