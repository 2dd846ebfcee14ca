use super::*;
use rust_decimal_macros::dec;

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            id: "charger-001".to_string(),
            name: "Campus EV Charger".to_string(),
            location: "Main Parking Lot".to_string(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            rate_per_kwh: dec!(8),
            currency_symbol: "₹".to_string(),
            min_start_balance: dec!(10),
            min_topup: dec!(10),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        // Two-wheeler charger on a single-phase 220 V outlet
        Self {
            interval_ms: 2000,
            min_power_kw: 0.8,
            max_power_kw: 1.2,
            min_voltage_v: 218.0,
            max_voltage_v: 224.0,
            seed: None,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::File,
            path: "/data/chargebill".to_string(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policy: RecoveryPolicy::ForceStop,
            max_retries: 3,
            retry_delay_ms: 200,
            max_retry_delay_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/chargebill.log".to_string(),
            backup_count: 5,
            json_format: false,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            charger: ChargerConfig::default(),
            billing: BillingConfig::default(),
            sampler: SamplerConfig::default(),
            ledger: LedgerConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
            web: WebConfig::default(),
        }
    }
}
