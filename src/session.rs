//! Charging session records and the live accumulator
//!
//! [`ChargingSession`] is the persisted shape; it carries rounded totals and
//! becomes immutable once it leaves `Active`. [`ActiveSession`] is the
//! engine-owned accumulator behind it, which keeps the unrounded energy and
//! cost so that rounding never drifts over many ticks.

use crate::error::{ChargeError, Result};
use crate::sampler::LiveReading;
use crate::tariff::{Money, Tariff, round_energy, round_money};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type SessionId = String;
pub type UserId = String;

/// Session status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Energy is being metered and billed
    Active,

    /// Ended by the user
    Completed,

    /// Ended by the engine (low balance, persistence failure, recovery)
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Active, SessionStatus::Stopped)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "Active",
            SessionStatus::Completed => "Completed",
            SessionStatus::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    UserRequested,
    InsufficientBalance,
    PersistenceFailure,
    SamplerEnded,
    Recovered,
}

/// Persisted charging session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub charger_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// Energy delivered so far (kWh, 3 dp)
    pub energy_consumed_kwh: Decimal,

    /// Cost of that energy (2 dp)
    pub total_cost: Money,

    pub status: SessionStatus,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,

    /// Unrounded running energy, so a resumed session continues from the
    /// exact total rather than the 3 dp figure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_exact_kwh: Option<Decimal>,

    /// Number of readings applied
    #[serde(default)]
    pub ticks: u64,
    pub updated_at: DateTime<Utc>,
}

impl ChargingSession {
    /// Create a new Active session with zero totals
    pub fn new(user_id: &str, charger_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session-{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            charger_id: charger_id.to_string(),
            start_time: now,
            end_time: None,
            energy_consumed_kwh: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            status: SessionStatus::Active,
            stop_reason: None,
            energy_exact_kwh: None,
            ticks: 0,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Live view of the Active session for polling clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub power_kw: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub energy_session_kwh: Decimal,
    pub cost_session: Money,
    pub ticks: u64,
    pub available_balance: Money,
    pub updated_at: DateTime<Utc>,
}

/// Returned by a successful start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub charger_id: String,
    pub started_at: DateTime<Utc>,
    pub rate_per_kwh: Money,
}

/// Engine-owned accumulator for the Active session
#[derive(Debug, Clone)]
pub struct ActiveSession {
    record: ChargingSession,
    energy_kwh: Decimal,
    cost: Money,
    last_reading: Option<LiveReading>,
}

impl ActiveSession {
    pub fn new(record: ChargingSession) -> Self {
        Self {
            record,
            energy_kwh: Decimal::ZERO,
            cost: Decimal::ZERO,
            last_reading: None,
        }
    }

    /// Reopen a persisted Active session with its stored totals.
    ///
    /// Records written without `energy_exact_kwh` fall back to the rounded
    /// energy; the persisted cost still acts as a floor.
    pub fn restore(record: ChargingSession, tariff: &Tariff) -> Result<Self> {
        if record.status != SessionStatus::Active {
            return Err(ChargeError::invalid_transition(
                record.status.to_string(),
                "resume",
            ));
        }
        let energy_kwh = record
            .energy_exact_kwh
            .unwrap_or(record.energy_consumed_kwh);
        let cost = tariff.cost(energy_kwh);
        Ok(Self {
            record,
            energy_kwh,
            cost,
            last_reading: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn user_id(&self) -> &str {
        &self.record.user_id
    }

    /// Unrounded energy
    pub fn energy_kwh(&self) -> Decimal {
        self.energy_kwh
    }

    /// Unrounded cost, always `tariff.cost(energy_kwh)`
    pub fn cost(&self) -> Money {
        self.cost
    }

    /// Apply one tick worth of energy the wallet has already covered.
    ///
    /// Persisted totals never go down, even after a restore from rounded
    /// figures.
    pub fn apply(&mut self, energy_inc: Decimal, reading: LiveReading, tariff: &Tariff) {
        self.energy_kwh += energy_inc;
        self.cost = tariff.cost(self.energy_kwh);
        self.last_reading = Some(reading);
        self.record.ticks += 1;
        self.record.energy_exact_kwh = Some(self.energy_kwh);
        self.record.energy_consumed_kwh =
            round_energy(self.energy_kwh).max(self.record.energy_consumed_kwh);
        self.record.total_cost = round_money(self.cost).max(self.record.total_cost);
        self.record.updated_at = reading.taken_at;
    }

    /// Persistable checkpoint of the current totals
    pub fn snapshot(&self) -> ChargingSession {
        self.record.clone()
    }

    /// Close the session, freezing totals at the last applied tick
    pub fn finish(
        self,
        status: SessionStatus,
        reason: StopReason,
        at: DateTime<Utc>,
    ) -> Result<ChargingSession> {
        if !self.record.status.can_transition_to(status) {
            return Err(ChargeError::invalid_transition(
                self.record.status.to_string(),
                "finish",
            ));
        }
        let mut record = self.record;
        record.status = status;
        record.stop_reason = Some(reason);
        record.end_time = Some(at);
        record.updated_at = at;
        Ok(record)
    }

    pub fn live(&self, available_balance: Money) -> LiveData {
        let (power_kw, voltage_v, current_a) = self
            .last_reading
            .map(|r| (r.power_kw, r.voltage_v, r.current_a))
            .unwrap_or((0.0, 0.0, 0.0));
        LiveData {
            session_id: self.record.id.clone(),
            status: self.record.status,
            power_kw,
            voltage_v,
            current_a,
            energy_session_kwh: self.record.energy_consumed_kwh,
            cost_session: self.record.total_cost,
            ticks: self.record.ticks,
            available_balance: round_money(available_balance),
            updated_at: self.record.updated_at,
        }
    }
}

/// Per-user charging statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub sessions: usize,
    pub total_energy_kwh: Decimal,
    pub total_spent: Money,
}

impl UserStats {
    pub fn from_sessions(sessions: &[ChargingSession]) -> Self {
        sessions.iter().fold(Self::default(), |mut acc, s| {
            acc.sessions += 1;
            acc.total_energy_kwh += s.energy_consumed_kwh;
            acc.total_spent += s.total_cost;
            acc
        })
    }
}
