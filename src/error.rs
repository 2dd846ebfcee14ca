//! Error types and handling for chargebill
//!
//! This module defines the error types used throughout the engine. Validation
//! style errors are meant to be surfaced to the caller as-is; persistence
//! errors are retried by the billing path before they are reported.

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type alias for chargebill operations
pub type Result<T> = std::result::Result<T, ChargeError>;

/// Main error type for chargebill
#[derive(Debug, Error)]
pub enum ChargeError {
    /// Wallet cannot cover the start threshold, or ran dry during a session
    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    /// Charger is busy or taken offline by an operator
    #[error("Charger unavailable: {status}")]
    ChargerUnavailable { status: String },

    /// No session with this id exists
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// Operation is not allowed from the session's current state
    #[error("Invalid transition: cannot {action} a session that is {from}")]
    InvalidTransition { from: String, action: String },

    /// A debit larger than the spendable balance was requested
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    /// Ledger or account write failed
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Reading source failed or produced an unusable reading
    #[error("Sampler error: {message}")]
    Sampler { message: String },

    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// HTTP/Web server errors
    #[error("Web server error: {message}")]
    Web { message: String },
}

impl ChargeError {
    /// Create a new insufficient balance error
    pub fn insufficient_balance(required: Decimal, available: Decimal) -> Self {
        ChargeError::InsufficientBalance {
            required,
            available,
        }
    }

    /// Create a new charger unavailable error
    pub fn charger_unavailable<S: Into<String>>(status: S) -> Self {
        ChargeError::ChargerUnavailable {
            status: status.into(),
        }
    }

    /// Create a new session not found error
    pub fn session_not_found<S: Into<String>>(id: S) -> Self {
        ChargeError::SessionNotFound { id: id.into() }
    }

    /// Create a new invalid transition error
    pub fn invalid_transition<S: Into<String>, A: Into<String>>(from: S, action: A) -> Self {
        ChargeError::InvalidTransition {
            from: from.into(),
            action: action.into(),
        }
    }

    /// Create a new insufficient funds error
    pub fn insufficient_funds(requested: Decimal, available: Decimal) -> Self {
        ChargeError::InsufficientFunds {
            requested,
            available,
        }
    }

    /// Create a new persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        ChargeError::Persistence {
            message: message.into(),
        }
    }

    /// Create a new sampler error
    pub fn sampler<S: Into<String>>(message: S) -> Self {
        ChargeError::Sampler {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        ChargeError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        ChargeError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        ChargeError::Io {
            message: message.into(),
        }
    }

    /// Create a new web error
    pub fn web<S: Into<String>>(message: S) -> Self {
        ChargeError::Web {
            message: message.into(),
        }
    }

    /// Whether retrying the same idempotent operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ChargeError::Persistence { .. } | ChargeError::Io { .. })
    }
}

impl From<std::io::Error> for ChargeError {
    fn from(err: std::io::Error) -> Self {
        ChargeError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ChargeError {
    fn from(err: serde_yaml::Error) -> Self {
        ChargeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ChargeError {
    fn from(err: serde_json::Error) -> Self {
        ChargeError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rust_decimal::Error> for ChargeError {
    fn from(err: rust_decimal::Error) -> Self {
        ChargeError::validation("decimal", err.to_string())
    }
}
