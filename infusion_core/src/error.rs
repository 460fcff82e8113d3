//! Error types for the infusion_core library.
//!
//! These are infrastructure errors (storage, serialization, configuration).
//! Failures reported by the pod itself are [`crate::DeviceFailure`] values and
//! never travel through this type.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for infusion_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audit ledger could not record or read an entry
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Durable recovery slot error
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
