#![allow(dead_code)]

use chargebill::ChargingEngine;
use chargebill::config::{Config, LedgerBackend};
use chargebill::ledger::{Ledger, MemoryLedger, TransactionKind, WalletTransaction};
use chargebill::sampler::{LiveReading, MeterFeed};
use std::sync::Arc;
use std::time::Duration;

pub const TICK: Duration = Duration::from_secs(2);

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.ledger.backend = LedgerBackend::Memory;
    cfg.recovery.retry_delay_ms = 1;
    cfg.recovery.max_retry_delay_ms = 2;
    cfg.web.enabled = false;
    cfg
}

pub struct Harness {
    pub engine: ChargingEngine,
    pub ledger: Arc<MemoryLedger>,
    pub feed: MeterFeed,
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(cfg: Config) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let feed = MeterFeed::new(cfg.sampler.interval());
    let engine = ChargingEngine::new(cfg, ledger.clone(), Arc::new(feed.clone()))
        .await
        .unwrap();
    Harness {
        engine,
        ledger,
        feed,
    }
}

pub fn reading(power_kw: f64) -> LiveReading {
    LiveReading::from_power(power_kw, 220.0)
}

pub async fn deductions(ledger: &dyn Ledger, user_id: &str) -> Vec<WalletTransaction> {
    ledger
        .transactions(user_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == TransactionKind::Deduction)
        .collect()
}
