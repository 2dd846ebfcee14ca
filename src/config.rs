//! Configuration management for chargebill
//!
//! This module handles loading, validation, and management of the engine
//! configuration from YAML files.

use crate::error::{ChargeError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of the single charge point
    pub charger: ChargerConfig,

    /// Tariff and wallet thresholds
    pub billing: BillingConfig,

    /// Reading source settings
    pub sampler: SamplerConfig,

    /// Where sessions and wallet transactions are stored
    pub ledger: LedgerConfig,

    /// Restart recovery and write retry behaviour
    pub recovery: RecoveryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web server binding configuration
    pub web: WebConfig,
}

/// Charge point identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargerConfig {
    pub id: String,
    pub name: String,
    pub location: String,
}

/// Billing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Fixed rate per kWh
    pub rate_per_kwh: Decimal,

    /// Currency symbol used in descriptions and API output
    pub currency_symbol: String,

    /// Spendable balance required before a session may start
    pub min_start_balance: Decimal,

    /// Smallest accepted wallet top-up
    pub min_topup: Decimal,
}

/// Simulated sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Tick interval in milliseconds; each reading stands for this much time
    pub interval_ms: u64,

    /// Lower bound of simulated power (kW)
    pub min_power_kw: f64,

    /// Upper bound of simulated power (kW)
    pub max_power_kw: f64,

    /// Lower bound of simulated voltage (V)
    pub min_voltage_v: f64,

    /// Upper bound of simulated voltage (V)
    pub max_voltage_v: f64,

    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

/// Ledger storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    /// Process-local storage, lost on exit
    Memory,
    /// Append-only JSON lines under `ledger.path`
    File,
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,

    /// Directory holding the ledger files
    pub path: String,
}

/// What to do with a session that was Active when the process went down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Finalize as Stopped and settle the persisted totals
    ForceStop,
    /// Reopen the session and restart sampling
    Resume,
}

/// Recovery and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub policy: RecoveryPolicy,

    /// Attempts per ledger write, including the first one
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub retry_delay_ms: u64,

    /// Backoff cap in milliseconds
    pub max_retry_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Console level override
    #[serde(default)]
    pub console_level: Option<String>,

    /// File level override
    #[serde(default)]
    pub file_level: Option<String>,

    /// Log directory, or a file path whose parent directory is used
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "chargebill.yaml",
            "/data/chargebill.yaml",
            "/etc/chargebill/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.charger.id.trim().is_empty() {
            return Err(ChargeError::validation("charger.id", "Cannot be empty"));
        }

        if self.billing.rate_per_kwh <= Decimal::ZERO {
            return Err(ChargeError::validation(
                "billing.rate_per_kwh",
                "Must be positive",
            ));
        }
        if self.billing.min_start_balance < Decimal::ZERO {
            return Err(ChargeError::validation(
                "billing.min_start_balance",
                "Cannot be negative",
            ));
        }
        if self.billing.min_topup <= Decimal::ZERO {
            return Err(ChargeError::validation(
                "billing.min_topup",
                "Must be positive",
            ));
        }

        let s = &self.sampler;
        if s.interval_ms == 0 {
            return Err(ChargeError::validation(
                "sampler.interval_ms",
                "Must be greater than 0",
            ));
        }
        if !(s.min_power_kw.is_finite() && s.max_power_kw.is_finite())
            || s.min_power_kw < 0.0
            || s.min_power_kw > s.max_power_kw
        {
            return Err(ChargeError::validation(
                "sampler.min_power_kw",
                "Power range must be finite, non-negative and ordered",
            ));
        }
        if !(s.min_voltage_v.is_finite() && s.max_voltage_v.is_finite())
            || s.min_voltage_v <= 0.0
            || s.min_voltage_v > s.max_voltage_v
        {
            return Err(ChargeError::validation(
                "sampler.min_voltage_v",
                "Voltage range must be finite, positive and ordered",
            ));
        }

        if self.ledger.backend == LedgerBackend::File && self.ledger.path.trim().is_empty() {
            return Err(ChargeError::validation(
                "ledger.path",
                "Required for the file backend",
            ));
        }

        if self.recovery.max_retries == 0 {
            return Err(ChargeError::validation(
                "recovery.max_retries",
                "At least one attempt is required",
            ));
        }

        if self.web.enabled && self.web.port == 0 {
            return Err(ChargeError::validation(
                "web.port",
                "Port must be greater than 0",
            ));
        }

        Ok(())
    }
}
