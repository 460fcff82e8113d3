//! Interfaces to the pod driver and the pod state it maintains.
//!
//! The driver is opaque: it encodes messages, manages nonces and talks to the
//! radio bridge. From here it is a set of blocking calls that either return a
//! value or a [`DeviceFailure`]. The driver accepts one command at a time;
//! callers serialize through its session.

use crate::outcome::DeviceFailure;
use crate::types::{AlertConfiguration, BasalSchedule, CannulaInsertion, PulseLog, StatusResponse};
use crossbeam::channel::Receiver;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

pub type DriverResult<T> = std::result::Result<T, DeviceFailure>;

/// Progress callback invoked with (units delivered so far, percentage)
pub type BolusProgress = Box<dyn Fn(f64, u8) + Send + Sync>;

/// How sure the driver is that the bolus command reached the pod
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandDeliveryStatus {
    Success,
    /// The pod may or may not be delivering; the driver could not confirm
    UncertainFailure,
}

/// Final outcome of a bolus, produced once by the driver
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BolusDelivery {
    pub units_delivered: f64,
}

/// Accepted bolus start
///
/// `completion` is a one-shot: the driver sends exactly one
/// [`BolusDelivery`] once the full amount, or the amount reached before a
/// cancel, is known. No timeout is applied by the receiver side.
pub struct BolusStart {
    pub delivery_status: CommandDeliveryStatus,
    pub completion: Receiver<BolusDelivery>,
}

/// Opaque pod command executor
pub trait PodDriver: Send + Sync {
    fn pair_and_prime(&self) -> DriverResult<()>;
    fn insert_cannula(&self, insertion: &CannulaInsertion) -> DriverResult<()>;
    fn configure_alerts(&self, alerts: &[AlertConfiguration]) -> DriverResult<()>;
    fn get_status(&self) -> DriverResult<StatusResponse>;
    fn deactivate(&self) -> DriverResult<()>;
    fn set_basal_schedule(&self, schedule: &BasalSchedule, beeps: bool) -> DriverResult<()>;
    fn bolus_start(
        &self,
        units: f64,
        beeps: bool,
        progress: Option<BolusProgress>,
    ) -> DriverResult<BolusStart>;
    fn bolus_cancel(&self, beeps: bool) -> DriverResult<()>;
    /// Whether the driver still tracks a running bolus
    fn has_active_bolus(&self) -> bool;
    fn set_temporary_basal(&self, rate: f64, duration_minutes: u32, beeps: bool) -> DriverResult<()>;
    fn cancel_temporary_basal(&self, beeps: bool) -> DriverResult<()>;
    fn acknowledge_alerts(&self) -> DriverResult<()>;
    fn suspend_delivery(&self, beeps: bool) -> DriverResult<()>;
    fn set_time(&self, beeps: bool) -> DriverResult<()>;
    fn read_pulse_log(&self) -> DriverResult<PulseLog>;
}

/// Pod state owned by the driver, consulted here
pub trait PodStateView: Send + Sync {
    fn is_activation_completed(&self) -> bool;
    fn is_suspended(&self) -> bool;
    /// Pod address, `None` when no pod is initialized
    fn address(&self) -> Option<u32>;
    fn discard_state(&self);
}

/// Snapshot of the pod state
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodStatus {
    pub address: Option<u32>,
    pub activation_completed: bool,
    pub suspended: bool,
}

/// In-memory pod state
#[derive(Debug, Default)]
pub struct SharedPodState {
    inner: Mutex<PodStatus>,
}

impl SharedPodState {
    pub fn new(status: PodStatus) -> Self {
        Self {
            inner: Mutex::new(status),
        }
    }

    /// A fully activated, delivering pod at the given address.
    pub fn activated(address: u32) -> Self {
        Self::new(PodStatus {
            address: Some(address),
            activation_completed: true,
            suspended: false,
        })
    }

    pub fn snapshot(&self) -> PodStatus {
        self.lock().clone()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.lock().suspended = suspended;
    }

    pub fn set_activation_completed(&self, completed: bool) {
        self.lock().activation_completed = completed;
    }

    fn lock(&self) -> MutexGuard<'_, PodStatus> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PodStateView for SharedPodState {
    fn is_activation_completed(&self) -> bool {
        self.lock().activation_completed
    }

    fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    fn address(&self) -> Option<u32> {
        self.lock().address
    }

    fn discard_state(&self) {
        *self.lock() = PodStatus::default();
    }
}
