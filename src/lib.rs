//! # Chargebill - metering and billing for a single EV charge point
//!
//! Turns charger readings into energy, energy into cost at a fixed tariff,
//! and cost into prepaid-wallet deductions, while keeping the session and
//! wallet ledger consistent across stops, low-balance cut-offs and restarts.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `tariff`: Energy to money conversion and rounding
//! - `sampler`: Simulated and push-fed reading sources
//! - `session`: Session records and the live accumulator
//! - `ledger`: Append-only session and transaction store
//! - `wallet`: Balances, holds and settlements
//! - `registry`: Charger status publication
//! - `engine`: Session state machine and sampler loop
//! - `web`: HTTP adapter and event stream

pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod sampler;
pub mod session;
pub mod tariff;
pub mod wallet;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use engine::{ChargerEvent, ChargingEngine};
pub use error::{ChargeError, Result};
