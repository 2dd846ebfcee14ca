//! Startup recovery and deferred settlement

use super::{ActiveSlot, ChargerEvent, ChargingEngine};
use crate::config::RecoveryPolicy;
use crate::error::Result;
use crate::session::{ActiveSession, ChargingSession, SessionId, SessionStatus, StopReason};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

/// What [`ChargingEngine::recover`] did with sessions left Active
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Finalized as Stopped and settled
    pub force_stopped: Vec<SessionId>,
    /// Reopened and sampling again
    pub resumed: Option<SessionId>,
    /// Finalized, but the settlement is queued for retry
    pub unsettled: Vec<SessionId>,
}

impl ChargingEngine {
    /// Deal with sessions whose last persisted status is Active.
    ///
    /// With [`RecoveryPolicy::ForceStop`] every such session is finalized as
    /// Stopped with its persisted totals. With [`RecoveryPolicy::Resume`] the
    /// newest one is reopened and the rest are force-stopped.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut slot = self.inner.slot.lock().await;
        let mut orphans = self.inner.ledger.active_sessions().await?;
        // The session we are already metering is not an orphan, and neither
        // is one finalized here whose settlement is still queued
        let queued: Vec<SessionId> = self
            .inner
            .unsettled
            .lock()
            .await
            .iter()
            .map(|s| s.id.clone())
            .collect();
        orphans.retain(|s| {
            !queued.contains(&s.id) && slot.as_ref().is_none_or(|a| a.session.id() != s.id)
        });
        orphans.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let mut report = RecoveryReport::default();
        if orphans.is_empty() {
            return Ok(report);
        }
        self.inner.logger.warn(&format!(
            "Found {} session(s) left Active, policy {:?}",
            orphans.len(),
            self.inner.config.recovery.policy
        ));

        for (i, record) in orphans.into_iter().enumerate() {
            let resumable = i == 0
                && self.inner.config.recovery.policy == RecoveryPolicy::Resume
                && slot.is_none()
                && self.inner.registry.ensure_available().is_ok();

            if resumable {
                let id = record.id.clone();
                if let Some(active) = self.resume_session(record).await? {
                    *slot = Some(active);
                    report.resumed = Some(id);
                    continue;
                }
                // Wallet could not cover the persisted cost; it was finalized
                report.force_stopped.push(id);
                continue;
            }

            let id = record.id.clone();
            let closed = ActiveSession::restore(record, &self.inner.tariff)?.finish(
                SessionStatus::Stopped,
                StopReason::Recovered,
                Utc::now(),
            )?;
            match self.close_out(&closed).await {
                Ok(()) => report.force_stopped.push(id),
                Err(_) => report.unsettled.push(id),
            }
            self.emit(ChargerEvent::SessionFinished { session: closed });
        }

        if report.resumed.is_some() {
            self.emit_status();
        }
        Ok(report)
    }

    /// Reopen a persisted Active session. Returns `None` when it had to be
    /// stopped straight away for lack of funds.
    async fn resume_session(&self, record: ChargingSession) -> Result<Option<ActiveSlot>> {
        let session = ActiveSession::restore(record, &self.inner.tariff)?;
        let user_id = session.user_id().to_string();
        let id = session.id().to_string();
        let logger = self.inner.logger.for_session(&id, &user_id);

        let hold = self
            .inner
            .wallet
            .hold(&user_id, &id, session.cost())
            .await?;
        self.inner.registry.set_charging(&id)?;

        let mut slot = Some(ActiveSlot {
            session,
            cancel: None,
        });
        if hold.capped || hold.available_after <= Decimal::ZERO {
            logger.warn("Resumed session has no funds left, stopping");
            self.finish_locked(&mut slot, SessionStatus::Stopped, StopReason::InsufficientBalance)
                .await?;
            return Ok(None);
        }

        if let Some(active) = slot.as_mut() {
            active.cancel = Some(self.spawn_sampler_loop(&id));
            self.inner
                .live_tx
                .send_replace(Some(active.session.live(hold.available_after)));
        }
        logger.info("Resumed session after restart");
        Ok(slot)
    }

    /// Retry settlements that could not be written earlier.
    ///
    /// Returns how many were settled; failures stay queued.
    pub async fn retry_unsettled(&self) -> usize {
        // Entries stay queued until settled so recover() keeps skipping them
        let pending = self.inner.unsettled.lock().await.clone();
        if pending.is_empty() {
            return 0;
        }

        let mut settled = 0;
        for record in pending {
            // On failure close_out leaves it queued
            if self.close_out(&record).await.is_ok() {
                self.take_unsettled(&record.id).await;
                settled += 1;
                let available = self
                    .inner
                    .wallet
                    .get_balance(&record.user_id)
                    .await
                    .unwrap_or_default();
                self.emit(ChargerEvent::WalletChanged {
                    user_id: record.user_id.clone(),
                    available,
                });
            }
        }
        if settled > 0 {
            self.inner
                .logger
                .info(&format!("Settled {} deferred session(s)", settled));
        }
        settled
    }
}
