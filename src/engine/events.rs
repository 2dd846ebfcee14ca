use crate::registry::ChargerStatus;
use crate::session::{ChargingSession, LiveData, SessionId, UserId};
use crate::tariff::Money;
use serde::Serialize;

/// Engine notifications, fanned out on a broadcast channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChargerEvent {
    StatusChanged { status: ChargerStatus },
    SessionStarted { session: ChargingSession },
    SessionUpdated { live: LiveData },
    SessionFinished { session: ChargingSession },
    WalletChanged { user_id: UserId, available: Money },
    PersistenceFailure { session_id: SessionId, message: String },
}

impl ChargerEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            ChargerEvent::StatusChanged { .. } => "status_changed",
            ChargerEvent::SessionStarted { .. } => "session_started",
            ChargerEvent::SessionUpdated { .. } => "session_updated",
            ChargerEvent::SessionFinished { .. } => "session_finished",
            ChargerEvent::WalletChanged { .. } => "wallet_changed",
            ChargerEvent::PersistenceFailure { .. } => "persistence_failure",
        }
    }
}
