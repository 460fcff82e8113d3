//! Command executor: runs one unit of work against the pod driver.
//!
//! The executor classifies every failure, fires the pod-fault hook, logs,
//! and hands the classified outcome back. It never retries and never turns
//! a failure into a success; ledger and reconciliation policy belong to the
//! caller.

use crate::notify::Notifier;
use crate::outcome::{classify, Certainty, DeviceFailure, FailureKind, OperationOutcome};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Driver command names, used for logging and attempt tracking
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    PairAndPrime,
    InsertCannula,
    ConfigureAlerts,
    GetStatus,
    Deactivate,
    SetBasalSchedule,
    BolusStart,
    BolusCancel,
    SetTemporaryBasal,
    CancelTemporaryBasal,
    AcknowledgeAlerts,
    SuspendDelivery,
    SetTime,
    ReadPulseLog,
}

/// Lifecycle of a single executor attempt
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    #[default]
    Idle,
    Executing,
    Succeeded,
    FailedCertain,
    FailedUncertain,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded | AttemptState::FailedCertain | AttemptState::FailedUncertain
        )
    }
}

/// The most recent attempt seen by the executor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attempt {
    pub command: Option<CommandType>,
    pub state: AttemptState,
}

pub struct CommandExecutor {
    notifier: Arc<dyn Notifier>,
    last_attempt: Mutex<Attempt>,
}

impl CommandExecutor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            last_attempt: Mutex::new(Attempt::default()),
        }
    }

    /// Run a value-returning command.
    pub fn execute<T, F>(&self, command: CommandType, work: F) -> OperationOutcome<T>
    where
        F: FnOnce() -> Result<T, DeviceFailure>,
    {
        self.transition(command, AttemptState::Executing);
        tracing::debug!("Executing {:?}", command);

        let result = work();
        let outcome = OperationOutcome::from_result(result);

        match &outcome {
            OperationOutcome::Success(_) => {
                self.transition(command, AttemptState::Succeeded);
                tracing::debug!("{:?} succeeded", command);
            }
            OperationOutcome::CertainFailure(failure) => {
                self.transition(command, AttemptState::FailedCertain);
                self.handle_failure(command, failure);
            }
            OperationOutcome::UncertainFailure(failure) => {
                self.transition(command, AttemptState::FailedUncertain);
                self.handle_failure(command, failure);
            }
        }

        outcome
    }

    /// Run a fire-and-forget command.
    pub fn run<F>(&self, command: CommandType, work: F) -> OperationOutcome<()>
    where
        F: FnOnce() -> Result<(), DeviceFailure>,
    {
        self.execute(command, work)
    }

    pub fn last_attempt(&self) -> Attempt {
        *self.last_attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, command: CommandType, state: AttemptState) {
        let mut attempt = self.last_attempt.lock().unwrap_or_else(|e| e.into_inner());
        if state == AttemptState::Executing {
            // Each call is a fresh attempt; a previous terminal state is final.
            *attempt = Attempt {
                command: Some(command),
                state,
            };
        } else if attempt.command == Some(command) && attempt.state == AttemptState::Executing {
            attempt.state = state;
        }
    }

    fn handle_failure(&self, command: CommandType, failure: &DeviceFailure) {
        let (certainty, kind) = classify(failure);
        match kind {
            FailureKind::UnexpectedError => {
                tracing::error!(
                    "{:?} failed with an unclassified error [certain={}] (stage {:?}): {}",
                    command,
                    certainty == Certainty::Certain,
                    failure.stage,
                    failure.cause
                );
            }
            _ => {
                tracing::error!(
                    "{:?} failed [certain={}]: {}",
                    command,
                    certainty == Certainty::Certain,
                    failure
                );
            }
        }

        if kind == FailureKind::DeviceFault {
            self.notifier.pod_fault(failure.fault_code);
        }
    }
}
