//! Classification of pod command failures.
//!
//! Every failure raised by the pod driver is a [`DeviceFailure`]. The
//! classifier maps it to a [`Certainty`]: a *certain* failure means the pod
//! provably did not perform the action, an *uncertain* one means it may have.
//! Downstream policy (TBR splitting, assume-delivered boluses) keys off this
//! distinction only.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether the pod is known not to have performed the requested action
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    Certain,
    Uncertain,
}

/// Stable failure taxonomy
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed response from the pod
    DecodingError,
    /// Message sequence number or address mismatch
    SequenceOrAddressError,
    /// Pod is in an unexpected activation/delivery state
    ProgressStateError,
    /// Security counter out of sync
    NonceError,
    /// Pod reported a hardware/safety halt
    DeviceFault,
    /// No response from the pod
    TransportTimeout,
    /// Radio exchange interrupted
    TransportInterrupted,
    /// Radio bridge not reachable
    TransportUnreachable,
    /// Anything the taxonomy does not cover
    UnexpectedError,
}

impl FailureKind {
    /// Default certainty for the kind.
    ///
    /// Link-layer failures and unclassified causes are uncertain: the command
    /// may have been executed before the link dropped.
    pub fn certainty(self) -> Certainty {
        match self {
            FailureKind::DecodingError
            | FailureKind::SequenceOrAddressError
            | FailureKind::ProgressStateError
            | FailureKind::NonceError
            | FailureKind::DeviceFault => Certainty::Certain,
            FailureKind::TransportTimeout
            | FailureKind::TransportInterrupted
            | FailureKind::TransportUnreachable
            | FailureKind::UnexpectedError => Certainty::Uncertain,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FailureKind::DecodingError => "failed to decode pod response",
            FailureKind::SequenceOrAddressError => "invalid message sequence number or address",
            FailureKind::ProgressStateError => "pod is in an invalid progress state",
            FailureKind::NonceError => "nonce out of sync",
            FailureKind::DeviceFault => "pod fault",
            FailureKind::TransportTimeout => "communication failed: no response from pod",
            FailureKind::TransportInterrupted => "communication failed: radio link interrupted",
            FailureKind::TransportUnreachable => "communication failed: radio bridge unreachable",
            FailureKind::UnexpectedError => "unexpected error",
        }
    }
}

/// Where in a compound pod exchange a failure occurred
///
/// Some commands are preceded by a delivery change on the pod (suspending
/// basal before a schedule change, cancelling the running TBR before a new
/// one). The stage tells the caller what is known about that preceding step.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The requested command itself failed
    #[default]
    Command,
    /// Delivery was suspended successfully, then the command failed
    AfterDeliverySuspended,
    /// The preparatory delivery change failed uncertainly
    PrecedingUncertain,
}

/// Failure raised by the pod driver
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceFailure {
    pub kind: FailureKind,
    #[serde(default)]
    pub stage: FailureStage,
    pub cause: String,
    /// Pod-reported fault code, only for [`FailureKind::DeviceFault`]
    #[serde(default)]
    pub fault_code: Option<u8>,
}

impl DeviceFailure {
    pub fn new(kind: FailureKind, cause: impl Into<String>) -> Self {
        Self {
            kind,
            stage: FailureStage::Command,
            cause: cause.into(),
            fault_code: None,
        }
    }

    /// Pod fault carrying the pod's fault event code.
    pub fn device_fault(code: u8) -> Self {
        Self {
            kind: FailureKind::DeviceFault,
            stage: FailureStage::Command,
            cause: format!("pod reported fault event 0x{code:02x}"),
            fault_code: Some(code),
        }
    }

    pub fn with_stage(mut self, stage: FailureStage) -> Self {
        self.stage = stage;
        self
    }

    /// Human-readable comment for result records.
    pub fn comment(&self) -> String {
        match (self.kind, self.fault_code) {
            (FailureKind::DeviceFault, Some(code)) => {
                format!("{} (code {code:#04x})", self.kind.describe())
            }
            (FailureKind::UnexpectedError, _) => {
                format!("{}: {}", self.kind.describe(), self.cause)
            }
            _ => self.kind.describe().to_string(),
        }
    }
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?}): {}", self.kind, self.stage, self.cause)
    }
}

impl std::error::Error for DeviceFailure {}

/// Classify a driver failure.
///
/// A pod fault is always certain: the pod has halted and cannot be
/// delivering. A failure of the preparatory step is always uncertain
/// regardless of kind.
pub fn classify(failure: &DeviceFailure) -> (Certainty, FailureKind) {
    let certainty = match (failure.kind, failure.stage) {
        (FailureKind::DeviceFault, _) => Certainty::Certain,
        (_, FailureStage::PrecedingUncertain) => Certainty::Uncertain,
        (kind, _) => kind.certainty(),
    };
    (certainty, failure.kind)
}

/// Result of one executor attempt
#[derive(Clone, Debug, PartialEq)]
pub enum OperationOutcome<T> {
    Success(T),
    CertainFailure(DeviceFailure),
    UncertainFailure(DeviceFailure),
}

impl<T> OperationOutcome<T> {
    /// Build an outcome from a driver result, classifying any failure.
    pub fn from_result(result: std::result::Result<T, DeviceFailure>) -> Self {
        match result {
            Ok(value) => OperationOutcome::Success(value),
            Err(failure) => match classify(&failure).0 {
                Certainty::Certain => OperationOutcome::CertainFailure(failure),
                Certainty::Uncertain => OperationOutcome::UncertainFailure(failure),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success(_))
    }

    pub fn is_certain_failure(&self) -> bool {
        matches!(self, OperationOutcome::CertainFailure(_))
    }

    pub fn is_uncertain_failure(&self) -> bool {
        matches!(self, OperationOutcome::UncertainFailure(_))
    }

    pub fn failure(&self) -> Option<&DeviceFailure> {
        match self {
            OperationOutcome::Success(_) => None,
            OperationOutcome::CertainFailure(f) | OperationOutcome::UncertainFailure(f) => Some(f),
        }
    }

    pub fn into_result(self) -> std::result::Result<T, DeviceFailure> {
        match self {
            OperationOutcome::Success(value) => Ok(value),
            OperationOutcome::CertainFailure(f) | OperationOutcome::UncertainFailure(f) => Err(f),
        }
    }
}
