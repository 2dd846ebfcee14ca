//! Charging session engine
//!
//! [`ChargingEngine`] owns the single charger's session lifecycle. Start,
//! tick and stop all serialize through one transition lock around the active
//! slot, so a user stop racing a low-balance auto-stop always resolves to
//! exactly one terminal record and one closing deduction.
//!
//! The engine is a cheap `Clone` handle; clones share the same state.

use crate::config::{Config, LedgerBackend};
use crate::error::{ChargeError, Result};
use crate::ledger::{FileLedger, Ledger, MemoryLedger, WalletTransaction};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::registry::{ChargerRegistry, ChargerStatus};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::sampler::{SamplerFactory, SimulatedSamplerFactory};
use crate::session::{
    ActiveSession, ChargingSession, LiveData, SessionHandle, SessionStatus, StopReason, UserStats,
};
use crate::tariff::{Money, Tariff, round_energy};
use crate::wallet::{Wallet, validate_user_id};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, oneshot, watch};

mod events;
mod recovery;
mod tick;

pub use events::ChargerEvent;
pub use recovery::RecoveryReport;
pub use tick::TickOutcome;

const EVENT_CAPACITY: usize = 256;

/// The Active session plus the handle that stops its sampler loop
pub(crate) struct ActiveSlot {
    pub(crate) session: ActiveSession,
    pub(crate) cancel: Option<oneshot::Sender<()>>,
}

pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) tariff: Tariff,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) wallet: Wallet,
    pub(crate) registry: ChargerRegistry,
    pub(crate) samplers: Arc<dyn SamplerFactory>,
    /// Transition lock
    pub(crate) slot: Mutex<Option<ActiveSlot>>,
    /// Finished sessions whose settlement or final record is not yet durable
    pub(crate) unsettled: Mutex<Vec<ChargingSession>>,
    pub(crate) events: broadcast::Sender<ChargerEvent>,
    pub(crate) live_tx: watch::Sender<Option<LiveData>>,
    pub(crate) retry: RetryConfig,
    pub(crate) logger: StructuredLogger,
}

#[derive(Clone)]
pub struct ChargingEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl ChargingEngine {
    /// Build an engine over an existing ledger and reading source
    pub async fn new(
        config: Config,
        ledger: Arc<dyn Ledger>,
        samplers: Arc<dyn SamplerFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let tariff = Tariff::new(config.billing.rate_per_kwh)?;
        let retry = RetryConfig::from(&config.recovery);

        let wallet = Wallet::new(ledger.clone(), retry.clone());
        wallet.load_from_ledger().await?;

        let registry = ChargerRegistry::new(&config.charger);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (live_tx, _) = watch::channel(None);
        let logger = get_logger_with_context(
            LogContext::new("engine").with_charger_id(config.charger.id.clone()),
        );

        logger.info(&format!(
            "Engine ready: rate {}{}/kWh, minimum start balance {}{}",
            config.billing.currency_symbol,
            tariff.rate_per_kwh(),
            config.billing.currency_symbol,
            config.billing.min_start_balance
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                tariff,
                ledger,
                wallet,
                registry,
                samplers,
                slot: Mutex::new(None),
                unsettled: Mutex::new(Vec::new()),
                events,
                live_tx,
                retry,
                logger,
            }),
        })
    }

    /// Build an engine with the configured ledger backend and simulated readings
    pub async fn from_config(config: Config) -> Result<Self> {
        let ledger: Arc<dyn Ledger> = match config.ledger.backend {
            LedgerBackend::Memory => Arc::new(MemoryLedger::new()),
            LedgerBackend::File => Arc::new(FileLedger::open(&config.ledger.path).await?),
        };
        let samplers = Arc::new(SimulatedSamplerFactory::new(config.sampler.clone()));
        Self::new(config, ledger, samplers).await
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn tariff(&self) -> &Tariff {
        &self.inner.tariff
    }

    pub fn wallet(&self) -> &Wallet {
        &self.inner.wallet
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.inner.ledger.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChargerEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_live(&self) -> watch::Receiver<Option<LiveData>> {
        self.inner.live_tx.subscribe()
    }

    pub fn charger_status(&self) -> ChargerStatus {
        self.inner.registry.status()
    }

    pub(crate) fn emit(&self, event: ChargerEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn emit_status(&self) {
        self.emit(ChargerEvent::StatusChanged {
            status: self.inner.registry.status(),
        });
    }

    pub(crate) async fn persist_session(&self, session: &ChargingSession) -> Result<()> {
        let ledger = &self.inner.ledger;
        retry_with_backoff(
            &self.inner.retry,
            || ledger.record_session(session),
            "record_session",
        )
        .await
    }

    /// Open a session for `user_id` and start metering it
    pub async fn start_charging(&self, user_id: &str) -> Result<SessionHandle> {
        validate_user_id(user_id)?;
        let mut slot = self.inner.slot.lock().await;

        // Give queued settlements a chance before new money is committed
        self.retry_unsettled().await;

        if slot.is_some() {
            return Err(ChargeError::charger_unavailable(
                self.inner.registry.status().status.to_string(),
            ));
        }
        self.inner.registry.ensure_available()?;

        // A session left Active by a crash still belongs to its user
        let stale = self
            .inner
            .ledger
            .query_history(user_id, Some(SessionStatus::Active), 1)
            .await?;
        if !stale.is_empty() {
            return Err(ChargeError::validation(
                "user_id",
                "User already has an active session",
            ));
        }

        let required = self.inner.config.billing.min_start_balance;
        let available = self.inner.wallet.get_balance(user_id).await?;
        if available < required {
            return Err(ChargeError::insufficient_balance(required, available));
        }

        let record = ChargingSession::new(user_id, &self.inner.config.charger.id);
        self.inner.registry.set_charging(&record.id)?;
        if let Err(e) = self.persist_session(&record).await {
            self.inner.registry.set_available();
            self.inner
                .logger
                .error(&format!("Could not record new session: {}", e));
            return Err(e);
        }

        let logger = self.inner.logger.for_session(&record.id, user_id);
        logger.info(&format!(
            "Session started with {}{} available",
            self.inner.config.billing.currency_symbol, available
        ));

        let session = ActiveSession::new(record.clone());
        self.inner
            .live_tx
            .send_replace(Some(session.live(available)));
        let cancel = self.spawn_sampler_loop(&record.id);
        *slot = Some(ActiveSlot {
            session,
            cancel: Some(cancel),
        });
        drop(slot);

        self.emit(ChargerEvent::SessionStarted {
            session: record.clone(),
        });
        self.emit_status();

        Ok(SessionHandle {
            session_id: record.id,
            user_id: record.user_id,
            charger_id: record.charger_id,
            started_at: record.start_time,
            rate_per_kwh: self.inner.tariff.rate_per_kwh(),
        })
    }

    /// End the Active session at the user's request
    pub async fn stop_charging(&self, session_id: &str) -> Result<ChargingSession> {
        let mut slot = self.inner.slot.lock().await;
        if slot
            .as_ref()
            .is_some_and(|s| s.session.id() == session_id)
        {
            return self
                .finish_locked(&mut slot, SessionStatus::Completed, StopReason::UserRequested)
                .await;
        }

        if let Some(record) = self.take_unsettled(session_id).await {
            // Stopped earlier but settlement did not stick; try again
            self.close_out(&record).await?;
            return Ok(record);
        }

        match self.inner.ledger.get_session(session_id).await? {
            Some(s) if s.status.is_terminal() => Err(ChargeError::invalid_transition(
                s.status.to_string(),
                "stop",
            )),
            Some(_) => Err(ChargeError::invalid_transition(
                "Active (awaiting recovery)",
                "stop",
            )),
            None => Err(ChargeError::session_not_found(session_id)),
        }
    }

    /// Like [`stop_charging`](Self::stop_charging), but a repeat stop returns
    /// the finalized session instead of an error
    pub async fn stop_charging_idempotent(&self, session_id: &str) -> Result<ChargingSession> {
        match self.stop_charging(session_id).await {
            Err(ChargeError::InvalidTransition { from, action }) => {
                match self.inner.ledger.get_session(session_id).await? {
                    Some(s) if s.status.is_terminal() => Ok(s),
                    _ => Err(ChargeError::InvalidTransition { from, action }),
                }
            }
            other => other,
        }
    }

    /// Force-stop `session_id` if it is still the Active one
    pub(crate) async fn force_stop(
        &self,
        session_id: &str,
        reason: StopReason,
    ) -> Result<Option<ChargingSession>> {
        let mut slot = self.inner.slot.lock().await;
        if !slot
            .as_ref()
            .is_some_and(|s| s.session.id() == session_id)
        {
            return Ok(None);
        }
        self.finish_locked(&mut slot, SessionStatus::Stopped, reason)
            .await
            .map(Some)
    }

    /// Finalize the Active session. Caller holds the transition lock.
    pub(crate) async fn finish_locked(
        &self,
        slot: &mut Option<ActiveSlot>,
        status: SessionStatus,
        reason: StopReason,
    ) -> Result<ChargingSession> {
        let Some(mut active) = slot.take() else {
            return Err(ChargeError::invalid_transition("Idle", "finish"));
        };
        if let Some(cancel) = active.cancel.take() {
            let _ = cancel.send(());
        }

        let record = active.session.finish(status, reason, Utc::now())?;
        let logger = self.inner.logger.for_session(&record.id, &record.user_id);
        logger.info(&format!(
            "Session {} ({:?}): {} kWh, {}{}",
            record.status,
            reason,
            record.energy_consumed_kwh,
            self.inner.config.billing.currency_symbol,
            record.total_cost
        ));

        // Free the charger before settling so readers never see Charging
        // next to a finalized session
        self.inner.registry.set_available();
        let closed = self.close_out(&record).await;

        let available = self
            .inner
            .wallet
            .get_balance(&record.user_id)
            .await
            .unwrap_or_default();
        self.inner
            .live_tx
            .send_replace(Some(finished_live(&record, available)));
        self.emit(ChargerEvent::SessionFinished {
            session: record.clone(),
        });
        self.emit(ChargerEvent::WalletChanged {
            user_id: record.user_id.clone(),
            available,
        });
        self.emit_status();

        closed.map(|_| record)
    }

    /// Post the closing deduction, then store the final record.
    ///
    /// On failure the session is queued for [`retry_unsettled`](Self::retry_unsettled).
    pub(crate) async fn close_out(&self, record: &ChargingSession) -> Result<()> {
        let result = self.settle_and_record(record).await;
        if let Err(ref e) = result {
            self.inner.logger.for_session(&record.id, &record.user_id).error(&format!(
                "Settlement deferred: {}",
                e
            ));
            let mut unsettled = self.inner.unsettled.lock().await;
            if !unsettled.iter().any(|s| s.id == record.id) {
                unsettled.push(record.clone());
            }
            drop(unsettled);
            self.emit(ChargerEvent::PersistenceFailure {
                session_id: record.id.clone(),
                message: e.to_string(),
            });
        }
        result
    }

    async fn settle_and_record(&self, record: &ChargingSession) -> Result<()> {
        let description = format!(
            "Charging session - {} kWh",
            round_energy(record.energy_consumed_kwh)
        );
        self.inner
            .wallet
            .settle(&record.user_id, &record.id, record.total_cost, &description)
            .await?;
        self.persist_session(record).await
    }

    pub(crate) async fn take_unsettled(&self, session_id: &str) -> Option<ChargingSession> {
        let mut unsettled = self.inner.unsettled.lock().await;
        let pos = unsettled.iter().position(|s| s.id == session_id)?;
        Some(unsettled.remove(pos))
    }

    /// Sessions still waiting for a durable settlement
    pub async fn unsettled_sessions(&self) -> Vec<ChargingSession> {
        self.inner.unsettled.lock().await.clone()
    }

    /// Current figures for `session_id`, or its final figures once finished
    pub async fn live_data(&self, session_id: &str) -> Result<LiveData> {
        {
            let slot = self.inner.slot.lock().await;
            if let Some(active) = slot.as_ref().filter(|s| s.session.id() == session_id) {
                let available = self
                    .inner
                    .wallet
                    .get_balance(active.session.user_id())
                    .await?;
                return Ok(active.session.live(available));
            }
        }
        match self.inner.ledger.get_session(session_id).await? {
            Some(record) => {
                let available = self.inner.wallet.get_balance(&record.user_id).await?;
                Ok(finished_live(&record, available))
            }
            None => Err(ChargeError::session_not_found(session_id)),
        }
    }

    /// Id of the Active session, if any
    pub async fn active_session_id(&self) -> Option<String> {
        self.inner
            .slot
            .lock()
            .await
            .as_ref()
            .map(|s| s.session.id().to_string())
    }

    /// Operator control. While a session runs the request is deferred.
    pub fn set_charger_offline(&self) -> ChargerStatus {
        let immediate = self.inner.registry.set_offline();
        self.inner.logger.info(if immediate {
            "Charger set offline"
        } else {
            "Charger will go offline when the current session ends"
        });
        self.emit_status();
        self.inner.registry.status()
    }

    pub fn clear_charger_offline(&self) -> ChargerStatus {
        self.inner.registry.clear_offline();
        self.inner.logger.info("Charger offline override cleared");
        self.emit_status();
        self.inner.registry.status()
    }

    /// Spendable balance
    pub async fn wallet_balance(&self, user_id: &str) -> Result<Money> {
        self.inner.wallet.get_balance(user_id).await
    }

    /// Add funds. Amounts under the configured minimum are rejected.
    pub async fn top_up(&self, user_id: &str, amount: Money) -> Result<WalletTransaction> {
        let billing = &self.inner.config.billing;
        if amount < billing.min_topup {
            return Err(ChargeError::validation(
                "amount",
                format!(
                    "Minimum top-up is {}{}",
                    billing.currency_symbol, billing.min_topup
                ),
            ));
        }
        let tx = self
            .inner
            .wallet
            .credit(user_id, amount, "Wallet Top-up")
            .await?;
        let available = self.inner.wallet.get_balance(user_id).await?;
        self.emit(ChargerEvent::WalletChanged {
            user_id: user_id.to_string(),
            available,
        });
        Ok(tx)
    }

    /// Sessions of a user, newest first
    pub async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<ChargingSession>> {
        self.history_filtered(user_id, None, limit).await
    }

    pub async fn history_filtered(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<ChargingSession>> {
        validate_user_id(user_id)?;
        self.inner.ledger.query_history(user_id, status, limit).await
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<WalletTransaction>> {
        self.inner.wallet.transactions(user_id).await
    }

    /// Session count, energy and money spent, from the ledger
    pub async fn user_stats(&self, user_id: &str) -> Result<UserStats> {
        let sessions = self.history(user_id, usize::MAX).await?;
        let mut stats = UserStats::from_sessions(&sessions);
        stats.total_spent = self.inner.wallet.total_deducted(user_id).await?;
        Ok(stats)
    }

    /// Stop the sampler loop without finalizing. Persisted state is kept for
    /// recovery on the next start.
    pub async fn shutdown(&self) {
        let mut slot = self.inner.slot.lock().await;
        if let Some(mut active) = slot.take() {
            if let Some(cancel) = active.cancel.take() {
                let _ = cancel.send(());
            }
            self.inner
                .logger
                .for_session(active.session.id(), active.session.user_id())
                .warn("Shutting down with an active session; it will be recovered on restart");
        }
        self.inner.logger.info("Engine stopped");
    }
}

fn finished_live(record: &ChargingSession, available: Money) -> LiveData {
    LiveData {
        session_id: record.id.clone(),
        status: record.status,
        power_kw: 0.0,
        voltage_v: 0.0,
        current_a: 0.0,
        energy_session_kwh: record.energy_consumed_kwh,
        cost_session: record.total_cost,
        ticks: record.ticks,
        available_balance: crate::tariff::round_money(available),
        updated_at: record.updated_at,
    }
}
