#![forbid(unsafe_code)]

//! Command and reconciliation core for a patch insulin pod.
//!
//! This crate provides:
//! - Failure classification (certain vs uncertain)
//! - The append-only audit ledger
//! - The command executor
//! - TBR reconciliation (fake suspended TBR, splits)
//! - The bolus lifecycle with crash recovery
//! - Collaborator interfaces (pod driver, pump-state view, notifier, durable store)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod outcome;
pub mod ledger;
pub mod executor;
pub mod pod;
pub mod notify;
pub mod recovery;
pub mod sync;
pub mod context;
pub mod tbr;
pub mod bolus;
pub mod manager;
pub mod export;
pub mod scripted;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use outcome::{classify, Certainty, DeviceFailure, FailureKind, FailureStage, OperationOutcome};
pub use ledger::{AuditLedger, JsonlLedger, LedgerEntryType, LedgerRecord, LedgerStore, MemoryLedger};
pub use executor::{CommandExecutor, CommandType};
pub use context::PodContext;
pub use manager::PodManager;
pub use scripted::ScriptedDriver;
