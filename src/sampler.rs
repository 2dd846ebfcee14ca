//! Reading sources for the metering loop
//!
//! A [`Sampler`] yields one [`LiveReading`] per tick. Each reading stands for
//! one [`Sampler::interval`] worth of charging, which is how elapsed time is
//! turned into energy. The engine asks a [`SamplerFactory`] for a fresh
//! sampler whenever a session starts.

use crate::config::SamplerConfig;
use crate::error::{ChargeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

const MS_PER_HOUR: i64 = 3_600_000;

/// Instantaneous electrical reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveReading {
    pub power_kw: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub taken_at: DateTime<Utc>,
}

impl LiveReading {
    /// Build a reading, deriving current from power and voltage
    pub fn from_power(power_kw: f64, voltage_v: f64) -> Self {
        let current_a = if voltage_v > 0.0 {
            power_kw * 1000.0 / voltage_v
        } else {
            0.0
        };
        Self {
            power_kw,
            voltage_v,
            current_a,
            taken_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.power_kw.is_finite() || self.power_kw < 0.0 {
            return Err(ChargeError::sampler(format!(
                "invalid power reading: {}",
                self.power_kw
            )));
        }
        if !self.voltage_v.is_finite() || self.voltage_v <= 0.0 {
            return Err(ChargeError::sampler(format!(
                "invalid voltage reading: {}",
                self.voltage_v
            )));
        }
        Ok(())
    }

    /// Energy delivered at this power over `interval`, unrounded
    pub fn energy_kwh(&self, interval: Duration) -> Result<Decimal> {
        self.validate()?;
        let power = Decimal::try_from(self.power_kw)
            .map_err(|e| ChargeError::sampler(format!("power not representable: {}", e)))?;
        let millis = Decimal::from(interval.as_millis() as u64);
        power
            .checked_mul(millis)
            .and_then(|v| v.checked_div(Decimal::from(MS_PER_HOUR)))
            .ok_or_else(|| ChargeError::sampler("energy increment overflow"))
    }
}

/// A tick-driven source of readings
#[async_trait]
pub trait Sampler: Send {
    /// Wall-clock time each reading represents
    fn interval(&self) -> Duration;

    /// Wait for the next reading. `Ok(None)` means the source is exhausted.
    async fn next_reading(&mut self) -> Result<Option<LiveReading>>;
}

/// Creates one sampler per charging session
pub trait SamplerFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Box<dyn Sampler>;
}

/// Random readings in configured ranges, one per interval
pub struct SimulatedSampler {
    cfg: SamplerConfig,
    rng: StdRng,
    ticker: Interval,
    period: Duration,
}

impl SimulatedSampler {
    pub fn new(cfg: SamplerConfig) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // tokio::time::interval panics on a zero period
        let period = cfg.interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            cfg,
            rng,
            ticker,
            period,
        }
    }

    fn sample(&mut self) -> LiveReading {
        let power = self
            .rng
            .gen_range(self.cfg.min_power_kw..=self.cfg.max_power_kw);
        let voltage = self
            .rng
            .gen_range(self.cfg.min_voltage_v..=self.cfg.max_voltage_v);
        let mut reading = LiveReading::from_power((power * 100.0).round() / 100.0, voltage);
        reading.current_a = (reading.current_a * 100.0).round() / 100.0;
        reading
    }
}

#[async_trait]
impl Sampler for SimulatedSampler {
    fn interval(&self) -> Duration {
        self.period
    }

    async fn next_reading(&mut self) -> Result<Option<LiveReading>> {
        self.ticker.tick().await;
        Ok(Some(self.sample()))
    }
}

/// Hands out [`SimulatedSampler`]s built from the sampler config
pub struct SimulatedSamplerFactory {
    cfg: SamplerConfig,
}

impl SimulatedSamplerFactory {
    pub fn new(cfg: SamplerConfig) -> Self {
        Self { cfg }
    }
}

impl SamplerFactory for SimulatedSamplerFactory {
    fn create(&self, _session_id: &str) -> Box<dyn Sampler> {
        Box::new(SimulatedSampler::new(self.cfg.clone()))
    }
}

/// Push adapter for an external meter
///
/// Every reading passed to [`MeterFeed::push`] is delivered as one tick to
/// the sampler of the current session. Creating a new sampler replaces the
/// previous channel, so readings never leak into the next session.
#[derive(Clone)]
pub struct MeterFeed {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<LiveReading>>>>,
    interval: Duration,
}

impl MeterFeed {
    pub fn new(interval: Duration) -> Self {
        Self {
            sender: Arc::new(Mutex::new(None)),
            interval,
        }
    }

    /// Deliver a reading. Returns false when no session is listening.
    pub fn push(&self, reading: LiveReading) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|tx| tx.send(reading).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// End the current feed; the sampler reports exhaustion once drained
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sender
            .lock()
            .map(|g| g.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

impl SamplerFactory for MeterFeed {
    fn create(&self, _session_id: &str) -> Box<dyn Sampler> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut guard) = self.sender.lock() {
            *guard = Some(tx);
        }
        Box::new(FeedSampler {
            rx,
            interval: self.interval,
        })
    }
}

/// Receiving half of a [`MeterFeed`]
pub struct FeedSampler {
    rx: mpsc::UnboundedReceiver<LiveReading>,
    interval: Duration,
}

#[async_trait]
impl Sampler for FeedSampler {
    fn interval(&self) -> Duration {
        self.interval
    }

    async fn next_reading(&mut self) -> Result<Option<LiveReading>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn energy_for_one_kw_over_two_seconds() {
        let r = LiveReading::from_power(1.0, 220.0);
        let e = r.energy_kwh(Duration::from_secs(2)).unwrap();
        assert_eq!(crate::tariff::round_energy(e * dec!(10)), dec!(0.006));
        assert!((r.current_a - 4.545).abs() < 0.01);
    }

    #[test]
    fn rejects_bad_readings() {
        let r = LiveReading::from_power(f64::NAN, 220.0);
        assert!(r.validate().is_err());
        let r = LiveReading::from_power(-1.0, 220.0);
        assert!(r.energy_kwh(Duration::from_secs(2)).is_err());
        let r = LiveReading::from_power(1.0, 0.0);
        assert!(r.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_readings_stay_in_range() {
        let cfg = SamplerConfig {
            seed: Some(42),
            ..SamplerConfig::default()
        };
        let mut s = SimulatedSampler::new(cfg.clone());
        for _ in 0..20 {
            let r = s.next_reading().await.unwrap().unwrap();
            assert!(r.power_kw >= cfg.min_power_kw && r.power_kw <= cfg.max_power_kw);
            assert!(r.voltage_v >= cfg.min_voltage_v && r.voltage_v <= cfg.max_voltage_v);
        }
    }

    #[tokio::test]
    async fn feed_delivers_pushed_readings() {
        let feed = MeterFeed::new(Duration::from_secs(2));
        assert!(!feed.push(LiveReading::from_power(1.0, 220.0)));

        let mut sampler = feed.create("s1");
        assert!(feed.is_connected());
        assert!(feed.push(LiveReading::from_power(1.0, 220.0)));
        feed.close();

        let r = sampler.next_reading().await.unwrap();
        assert_eq!(r.map(|r| r.power_kw), Some(1.0));
        assert!(sampler.next_reading().await.unwrap().is_none());
    }
}
