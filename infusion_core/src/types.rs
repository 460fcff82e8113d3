//! Core domain types shared by the pod operations.
//!
//! This module defines:
//! - Basal schedules and alert configuration handed to the pod
//! - Pod status and diagnostic responses
//! - Bolus requests and the durable in-flight bolus record
//! - The result record returned to orchestrators

use crate::outcome::{DeviceFailure, FailureKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Schedules and alerts
// ============================================================================

/// One segment of a basal schedule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BasalScheduleEntry {
    /// Units per hour
    pub rate: f64,
    /// Offset from midnight at which this segment starts
    pub start_offset_minutes: u32,
}

/// A 24h basal schedule, already converted from the user's profile
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BasalSchedule {
    pub entries: Vec<BasalScheduleEntry>,
}

impl BasalSchedule {
    pub fn new(entries: Vec<BasalScheduleEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pod alert slots
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ExpirationReminder,
    Expiration,
    LowReservoir,
    AutoOff,
}

/// Configuration of a single pod alert
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlertConfiguration {
    pub alert_type: AlertType,
    pub active: bool,
    /// Minutes since activation at which the alert triggers
    pub trigger_minutes: Option<u32>,
    /// Reservoir level at which the alert triggers
    pub trigger_units: Option<f64>,
}

/// Parameters for the insert-cannula exchange
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CannulaInsertion {
    pub schedule: BasalSchedule,
    pub expiration_reminder_hours: Option<u32>,
    pub low_reservoir_units: Option<f64>,
}

// ============================================================================
// Pod responses
// ============================================================================

/// Delivery status as reported by the pod
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Suspended,
    Normal,
    TempBasalRunning,
    Priming,
    BolusInProgress,
    BolusAndTempBasal,
}

/// Status response from the pod
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub delivery_status: DeliveryStatus,
    pub reservoir_units: Option<f64>,
    pub insulin_delivered: f64,
    pub minutes_since_activation: u32,
    pub fault_code: Option<u8>,
}

/// Recent pulse log read from the pod's diagnostic memory
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PulseLog {
    pub entries: Vec<u32>,
}

/// Therapy events uploaded on pod change
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TherapyEventType {
    InsulinChange,
    CannulaChange,
}

// ============================================================================
// Bolus
// ============================================================================

/// Whether a bolus was requested by the user or by the automation loop
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BolusType {
    Normal,
    /// Automated super micro bolus; no user-facing progress
    Smb,
}

/// A bolus request from the orchestrator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BolusRequest {
    pub id: Uuid,
    pub units: f64,
    pub bolus_type: BolusType,
    #[serde(default)]
    pub carbs: f64,
    #[serde(default)]
    pub carbs_time: Option<DateTime<Utc>>,
}

impl BolusRequest {
    pub fn new(units: f64, bolus_type: BolusType) -> Self {
        Self {
            id: Uuid::new_v4(),
            units,
            bolus_type,
            carbs: 0.0,
            carbs_time: None,
        }
    }

    pub fn with_carbs(mut self, carbs: f64, at: DateTime<Utc>) -> Self {
        self.carbs = carbs;
        self.carbs_time = Some(at);
        self
    }
}

/// In-flight bolus kept in the durable recovery slot
///
/// Written as soon as the pod accepts the bolus, removed once the delivered
/// amount has been committed to the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActiveBolus {
    pub request: BolusRequest,
    pub start_time: DateTime<Utc>,
    pub pump_serial: String,
}

/// Delivered bolus as synced to the pump-state view
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BolusRecord {
    pub time: DateTime<Utc>,
    pub units: f64,
    pub bolus_type: BolusType,
    pub pump_id: u64,
    pub pump_serial: String,
}

/// Carbs split out of a bolus request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbsRecord {
    pub time: DateTime<Utc>,
    pub grams: f64,
    pub pump_serial: String,
}

// ============================================================================
// Results
// ============================================================================

/// Result record returned for each high-level operation
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EnactResult {
    pub success: bool,
    pub enacted: bool,
    pub comment: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub bolus_delivered: Option<f64>,
    pub absolute_rate: Option<f64>,
    pub duration_minutes: Option<u32>,
}

impl EnactResult {
    pub fn succeeded(enacted: bool) -> Self {
        Self {
            success: true,
            enacted,
            ..Self::default()
        }
    }

    pub fn failed(failure: &DeviceFailure) -> Self {
        Self {
            success: false,
            enacted: false,
            comment: Some(failure.comment()),
            failure_kind: Some(failure.kind),
            ..Self::default()
        }
    }

    pub fn rejected(comment: impl Into<String>) -> Self {
        Self {
            success: false,
            enacted: false,
            comment: Some(comment.into()),
            ..Self::default()
        }
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn bolus_delivered(mut self, units: f64) -> Self {
        self.bolus_delivered = Some(units);
        self
    }

    pub fn temp_basal(mut self, rate: f64, duration_minutes: u32) -> Self {
        self.absolute_rate = Some(rate);
        self.duration_minutes = Some(duration_minutes);
        self
    }
}

/// Round a rate or bolus size down to the pod's delivery step.
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    // Nudge before flooring so 0.15 / 0.05 = 2.9999.. still yields 3 pulses.
    let pulses = (value / step + 1e-6).floor();
    (pulses * step * 1000.0).round() / 1000.0
}
