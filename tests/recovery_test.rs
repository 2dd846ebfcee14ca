mod common;

use chargebill::ChargingEngine;
use chargebill::config::{Config, LedgerBackend, RecoveryPolicy};
use chargebill::ledger::{FileLedger, Ledger};
use chargebill::registry::ChargerState;
use chargebill::sampler::MeterFeed;
use chargebill::session::{ChargingSession, SessionStatus, StopReason};
use common::*;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;

fn file_config(dir: &Path, policy: RecoveryPolicy) -> Config {
    let mut cfg = test_config();
    cfg.ledger.backend = LedgerBackend::File;
    cfg.ledger.path = dir.to_string_lossy().into_owned();
    cfg.recovery.policy = policy;
    cfg
}

async fn engine_on(dir: &Path, policy: RecoveryPolicy) -> (ChargingEngine, Arc<FileLedger>, MeterFeed) {
    let cfg = file_config(dir, policy);
    let ledger = Arc::new(FileLedger::open(dir).await.unwrap());
    let feed = MeterFeed::new(cfg.sampler.interval());
    let engine = ChargingEngine::new(cfg, ledger.clone(), Arc::new(feed.clone()))
        .await
        .unwrap();
    (engine, ledger, feed)
}

/// Run three 60 kW ticks, then go away without stopping
async fn crash_mid_session(dir: &Path) -> String {
    let (engine, _, _) = engine_on(dir, RecoveryPolicy::ForceStop).await;
    engine.top_up("user-1", dec!(20)).await.unwrap();
    let handle = engine.start_charging("user-1").await.unwrap();
    for _ in 0..3 {
        engine
            .process_tick(&handle.session_id, reading(60.0), TICK)
            .await
            .unwrap();
    }
    engine.shutdown().await;
    handle.session_id
}

#[tokio::test]
async fn force_stop_settles_persisted_totals() {
    let dir = tempfile::tempdir().unwrap();
    let id = crash_mid_session(dir.path()).await;

    let (engine, ledger, _) = engine_on(dir.path(), RecoveryPolicy::ForceStop).await;
    let stored = ledger.get_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Active);
    assert_eq!(stored.ticks, 3);
    assert_eq!(engine.wallet_balance("user-1").await.unwrap(), dec!(20));

    let report = engine.recover().await.unwrap();
    assert_eq!(report.force_stopped, vec![id.clone()]);
    assert!(report.resumed.is_none());
    assert!(report.unsettled.is_empty());

    let stored = ledger.get_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Stopped);
    assert_eq!(stored.stop_reason, Some(StopReason::Recovered));
    assert_eq!(stored.energy_consumed_kwh, dec!(0.100));
    assert_eq!(stored.total_cost, dec!(0.80));
    assert!(stored.end_time.is_some());

    assert_eq!(engine.wallet_balance("user-1").await.unwrap(), dec!(19.20));
    assert_eq!(deductions(ledger.as_ref(), "user-1").await.len(), 1);
    assert_eq!(engine.charger_status().status, ChargerState::Available);

    // Nothing left to recover
    let again = engine.recover().await.unwrap();
    assert!(again.force_stopped.is_empty());
    assert_eq!(deductions(ledger.as_ref(), "user-1").await.len(), 1);
}

#[tokio::test]
async fn recovery_survives_a_second_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = crash_mid_session(dir.path()).await;

    {
        let (engine, _, _) = engine_on(dir.path(), RecoveryPolicy::ForceStop).await;
        engine.recover().await.unwrap();
    }

    let (engine, ledger, _) = engine_on(dir.path(), RecoveryPolicy::ForceStop).await;
    let report = engine.recover().await.unwrap();
    assert!(report.force_stopped.is_empty());
    assert_eq!(engine.wallet_balance("user-1").await.unwrap(), dec!(19.20));
    assert_eq!(engine.wallet().reconcile("user-1").await.unwrap(), dec!(19.20));

    let history = engine.history("user-1", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, id);
    assert_eq!(deductions(ledger.as_ref(), "user-1").await.len(), 1);
}

#[tokio::test]
async fn resume_continues_metering_from_persisted_totals() {
    let dir = tempfile::tempdir().unwrap();
    let id = crash_mid_session(dir.path()).await;

    let (engine, ledger, _) = engine_on(dir.path(), RecoveryPolicy::Resume).await;
    let report = engine.recover().await.unwrap();
    assert_eq!(report.resumed.as_deref(), Some(id.as_str()));
    assert!(report.force_stopped.is_empty());

    let status = engine.charger_status();
    assert_eq!(status.status, ChargerState::Charging);
    assert_eq!(status.current_session.as_deref(), Some(id.as_str()));
    assert_eq!(engine.active_session_id().await.as_deref(), Some(id.as_str()));

    // A second call leaves the resumed session alone
    let again = engine.recover().await.unwrap();
    assert_eq!(again, Default::default());

    engine
        .process_tick(&id, reading(60.0), TICK)
        .await
        .unwrap();
    let session = engine.stop_charging(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.ticks, 4);
    assert_eq!(session.total_cost, dec!(1.07));

    assert_eq!(engine.wallet_balance("user-1").await.unwrap(), dec!(18.93));
    let debits = deductions(ledger.as_ref(), "user-1").await;
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].amount, dec!(1.07));
}

#[tokio::test]
async fn resume_picks_the_newest_and_stops_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, ledger, _) = engine_on(dir.path(), RecoveryPolicy::Resume).await;
    engine.top_up("user-a", dec!(20)).await.unwrap();
    engine.top_up("user-b", dec!(20)).await.unwrap();

    let older = ChargingSession::new("user-a", "charger-001");
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let newer = ChargingSession::new("user-b", "charger-001");
    ledger.record_session(&older).await.unwrap();
    ledger.record_session(&newer).await.unwrap();

    let report = engine.recover().await.unwrap();
    assert_eq!(report.resumed.as_deref(), Some(newer.id.as_str()));
    assert_eq!(report.force_stopped, vec![older.id.clone()]);

    let stopped = ledger.get_session(&older.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::Recovered));
    assert_eq!(stopped.total_cost, dec!(0));
    // Zero-cost sessions post no deduction
    assert!(deductions(ledger.as_ref(), "user-a").await.is_empty());

    assert_eq!(
        engine.active_session_id().await.as_deref(),
        Some(newer.id.as_str())
    );
}

#[tokio::test]
async fn resume_without_funds_stops_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _, _) = engine_on(dir.path(), RecoveryPolicy::Resume).await;
    engine.top_up("user-1", dec!(10)).await.unwrap();
    let handle = engine.start_charging("user-1").await.unwrap();
    for _ in 0..3 {
        engine
            .process_tick(&handle.session_id, reading(600.0), TICK)
            .await
            .unwrap();
    }
    engine.shutdown().await;
    drop(engine);

    // Spend what the crashed session had not yet settled
    let (engine, ledger, _) = engine_on(dir.path(), RecoveryPolicy::Resume).await;
    engine
        .wallet()
        .debit("user-1", dec!(10), "Manual adjustment", None)
        .await
        .unwrap();

    let report = engine.recover().await.unwrap();
    assert!(report.resumed.is_none());
    assert_eq!(report.force_stopped, vec![handle.session_id.clone()]);

    let stored = ledger.get_session(&handle.session_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Stopped);
    assert_eq!(stored.stop_reason, Some(StopReason::InsufficientBalance));
    assert_eq!(engine.charger_status().status, ChargerState::Available);
    assert_eq!(engine.wallet_balance("user-1").await.unwrap(), dec!(0));
}

#[tokio::test]
async fn resume_keeps_totals_that_rounded_up() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (engine, _, _) = engine_on(dir.path(), RecoveryPolicy::Resume).await;
        engine.top_up("user-1", dec!(20)).await.unwrap();
        let handle = engine.start_charging("user-1").await.unwrap();
        // 0.003125 kWh costs 0.025, which rounds up to 0.03
        engine
            .process_tick(&handle.session_id, reading(5.625), TICK)
            .await
            .unwrap();
        engine.shutdown().await;
        handle.session_id
    };

    let (engine, ledger, _) = engine_on(dir.path(), RecoveryPolicy::Resume).await;
    let before = ledger.get_session(&id).await.unwrap().unwrap();
    assert_eq!(before.energy_consumed_kwh, dec!(0.003));
    assert_eq!(before.total_cost, dec!(0.03));
    assert_eq!(before.energy_exact_kwh, Some(dec!(0.003125)));

    let report = engine.recover().await.unwrap();
    assert_eq!(report.resumed.as_deref(), Some(id.as_str()));

    engine.process_tick(&id, reading(0.0), TICK).await.unwrap();
    let checkpoint = ledger.get_session(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.ticks, 2);
    assert_eq!(checkpoint.total_cost, dec!(0.03));
    assert_eq!(checkpoint.energy_consumed_kwh, dec!(0.003));

    let done = engine.stop_charging(&id).await.unwrap();
    assert_eq!(done.total_cost, before.total_cost);
    assert_eq!(done.energy_exact_kwh, Some(dec!(0.003125)));
    assert_eq!(engine.wallet_balance("user-1").await.unwrap(), dec!(19.97));
}
