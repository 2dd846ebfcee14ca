//! Sampler loop and per-tick billing

use super::{ActiveSlot, ChargerEvent, ChargingEngine, EngineInner};
use crate::error::Result;
use crate::sampler::{LiveReading, Sampler};
use crate::session::{ChargingSession, SessionStatus, StopReason};
use rust_decimal::Decimal;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// What happened to one reading
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Totals advanced and were checkpointed
    Applied,
    /// Reading was unusable and skipped
    Rejected,
    /// Session is no longer the Active one
    Discarded,
    /// Wallet ran dry; the session was force-stopped
    Finished(ChargingSession),
}

impl ChargingEngine {
    /// Spawn the reading loop for a new Active session
    pub(crate) fn spawn_sampler_loop(&self, session_id: &str) -> oneshot::Sender<()> {
        let sampler = self.inner.samplers.create(session_id);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run_sampler_loop(
            Arc::downgrade(&self.inner),
            session_id.to_string(),
            sampler,
            cancel_rx,
        ));
        cancel_tx
    }

    /// Apply one reading to the Active session.
    ///
    /// The reading is discarded unless `session_id` is still Active. The cost
    /// increment is held on the wallet first; if the wallet could only cover
    /// part of it, only the energy that was paid for is credited and the
    /// session stops. If the checkpoint cannot be written after retries the
    /// session is force-stopped with [`StopReason::PersistenceFailure`] and
    /// the write error is returned.
    pub async fn process_tick(
        &self,
        session_id: &str,
        reading: LiveReading,
        interval: Duration,
    ) -> Result<TickOutcome> {
        let mut slot = self.inner.slot.lock().await;
        let Some(active) = slot.as_mut().filter(|s| s.session.id() == session_id) else {
            return Ok(TickOutcome::Discarded);
        };
        let logger = self
            .inner
            .logger
            .for_session(session_id, active.session.user_id());

        let energy_inc = match reading.energy_kwh(interval) {
            Ok(e) => e,
            Err(e) => {
                logger.warn(&format!("Skipping reading: {}", e));
                return Ok(TickOutcome::Rejected);
            }
        };

        let tariff = self.inner.tariff;
        let user_id = active.session.user_id().to_string();
        let hold = match self
            .inner
            .wallet
            .hold(&user_id, session_id, tariff.cost(energy_inc))
            .await
        {
            Ok(h) => h,
            Err(e) => {
                logger.error(&format!("Wallet hold failed: {}", e));
                self.stop_after_failure(&mut slot, session_id, &e.to_string())
                    .await;
                return Err(e);
            }
        };
        let credited = if hold.capped {
            tariff.energy_for(hold.granted)
        } else {
            energy_inc
        };

        active.session.apply(credited, reading, &tariff);
        self.inner.registry.set_current_power(reading.power_kw);
        let checkpoint = active.session.snapshot();

        if let Err(e) = self.persist_session(&checkpoint).await {
            logger.error(&format!("Checkpoint failed after retries: {}", e));
            self.stop_after_failure(&mut slot, session_id, &e.to_string())
                .await;
            return Err(e);
        }

        if hold.capped || hold.available_after <= Decimal::ZERO {
            logger.info(&format!(
                "Wallet exhausted after tick {}, stopping",
                checkpoint.ticks
            ));
            let record = self
                .finish_locked(
                    &mut slot,
                    SessionStatus::Stopped,
                    StopReason::InsufficientBalance,
                )
                .await?;
            return Ok(TickOutcome::Finished(record));
        }

        let live = active_live(slot.as_ref(), hold.available_after);
        drop(slot);
        if let Some(live) = live {
            self.inner.live_tx.send_replace(Some(live.clone()));
            self.emit(ChargerEvent::SessionUpdated { live });
        }
        Ok(TickOutcome::Applied)
    }

    async fn stop_after_failure(
        &self,
        slot: &mut Option<ActiveSlot>,
        session_id: &str,
        message: &str,
    ) {
        self.emit(ChargerEvent::PersistenceFailure {
            session_id: session_id.to_string(),
            message: message.to_string(),
        });
        if let Err(e) = self
            .finish_locked(slot, SessionStatus::Stopped, StopReason::PersistenceFailure)
            .await
        {
            self.inner
                .logger
                .error(&format!("Force-stop of {} incomplete: {}", session_id, e));
        }
    }
}

fn active_live(
    slot: Option<&ActiveSlot>,
    available: Decimal,
) -> Option<crate::session::LiveData> {
    slot.map(|s| s.session.live(available))
}

async fn run_sampler_loop(
    weak: Weak<EngineInner>,
    session_id: String,
    mut sampler: Box<dyn Sampler>,
    mut cancel: oneshot::Receiver<()>,
) {
    let interval = sampler.interval();
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut cancel => break,
            r = sampler.next_reading() => r,
        };
        let Some(inner) = weak.upgrade() else { break };
        let engine = ChargingEngine { inner };

        match next {
            Ok(Some(reading)) => match engine.process_tick(&session_id, reading, interval).await {
                Ok(TickOutcome::Applied) | Ok(TickOutcome::Rejected) => {}
                Ok(TickOutcome::Discarded) | Ok(TickOutcome::Finished(_)) | Err(_) => break,
            },
            Ok(None) => {
                engine
                    .inner
                    .logger
                    .warn(&format!("Reading source for {} ended", session_id));
                if let Err(e) = engine.force_stop(&session_id, StopReason::SamplerEnded).await {
                    engine
                        .inner
                        .logger
                        .error(&format!("Force-stop of {} incomplete: {}", session_id, e));
                }
                break;
            }
            Err(e) => {
                engine
                    .inner
                    .logger
                    .warn(&format!("Reading failed for {}: {}", session_id, e));
            }
        }
    }
}
