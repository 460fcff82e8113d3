//! Scripted pod driver.
//!
//! A deterministic stand-in for the radio driver, used by `podctl` and the
//! tests. Failures are queued per command and returned in order; bolus
//! completion can be immediate or held until [`ScriptedDriver::complete_bolus`]
//! or a cancel.

use crate::executor::CommandType;
use crate::outcome::{DeviceFailure, FailureKind};
use crate::pod::{
    BolusDelivery, BolusProgress, BolusStart, CommandDeliveryStatus, DriverResult, PodDriver,
    SharedPodState,
};
use crate::types::{
    AlertConfiguration, BasalSchedule, CannulaInsertion, DeliveryStatus, PulseLog, StatusResponse,
};
use crossbeam::channel::{bounded, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

struct RunningBolus {
    units: f64,
    completion: Sender<BolusDelivery>,
    progress: Option<BolusProgress>,
}

struct ScriptState {
    failures: HashMap<CommandType, VecDeque<DeviceFailure>>,
    calls: Vec<CommandType>,
    delivered_fraction: f64,
    cancelled_fraction: f64,
    uncertain_bolus_start: bool,
    hold_completion: bool,
    /// Failed cancels left before a held bolus runs to completion
    finish_after_failed_cancels: Option<usize>,
    running_bolus: Option<RunningBolus>,
    reservoir_units: f64,
    insulin_delivered: f64,
}

pub struct ScriptedDriver {
    pod_state: Arc<SharedPodState>,
    state: Mutex<ScriptState>,
}

impl ScriptedDriver {
    pub fn new(pod_state: Arc<SharedPodState>) -> Self {
        Self {
            pod_state,
            state: Mutex::new(ScriptState {
                failures: HashMap::new(),
                calls: Vec::new(),
                delivered_fraction: 1.0,
                cancelled_fraction: 0.5,
                uncertain_bolus_start: false,
                hold_completion: false,
                finish_after_failed_cancels: None,
                running_bolus: None,
                reservoir_units: 200.0,
                insulin_delivered: 0.0,
            }),
        }
    }

    /// Queue a failure for the next call of `command`.
    pub fn fail_next(&self, command: CommandType, failure: DeviceFailure) {
        self.lock()
            .failures
            .entry(command)
            .or_default()
            .push_back(failure);
    }

    /// Commands received so far, in order
    pub fn calls(&self) -> Vec<CommandType> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, command: CommandType) -> usize {
        self.lock().calls.iter().filter(|c| **c == command).count()
    }

    /// Fraction of a bolus reported delivered on normal completion.
    pub fn set_delivered_fraction(&self, fraction: f64) {
        self.lock().delivered_fraction = fraction;
    }

    /// Fraction of a bolus reported delivered when cancelled.
    pub fn set_cancelled_fraction(&self, fraction: f64) {
        self.lock().cancelled_fraction = fraction;
    }

    /// Report the next bolus starts as uncertain.
    pub fn set_uncertain_bolus_start(&self, uncertain: bool) {
        self.lock().uncertain_bolus_start = uncertain;
    }

    /// Keep boluses running until completed or cancelled.
    pub fn hold_bolus_completion(&self, hold: bool) {
        self.lock().hold_completion = hold;
    }

    /// Let a held bolus finish on its own once `count` cancels have failed.
    pub fn finish_bolus_after_failed_cancels(&self, count: usize) {
        self.lock().finish_after_failed_cancels = Some(count);
    }

    /// Finish a held bolus with the configured delivered fraction.
    pub fn complete_bolus(&self) -> bool {
        let mut state = self.lock();
        let fraction = state.delivered_fraction;
        finish_bolus(&mut state, fraction)
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call and pop a queued failure, if any.
    fn begin(&self, command: CommandType) -> DriverResult<MutexGuard<'_, ScriptState>> {
        let mut state = self.lock();
        state.calls.push(command);
        let queued = state
            .failures
            .get_mut(&command)
            .and_then(|queue| queue.pop_front());
        match queued {
            Some(failure) => {
                if command == CommandType::BolusCancel {
                    if failure.kind == FailureKind::DeviceFault {
                        // A faulted pod stops delivering whatever it was doing.
                        let fraction = state.cancelled_fraction;
                        finish_bolus(&mut state, fraction);
                    } else if let Some(left) = state.finish_after_failed_cancels {
                        let left = left.saturating_sub(1);
                        state.finish_after_failed_cancels = Some(left);
                        if left == 0 {
                            let fraction = state.delivered_fraction;
                            finish_bolus(&mut state, fraction);
                        }
                    }
                }
                Err(failure)
            }
            None => Ok(state),
        }
    }
}

fn finish_bolus(state: &mut ScriptState, fraction: f64) -> bool {
    match state.running_bolus.take() {
        Some(bolus) => {
            let delivered = bolus.units * fraction;
            if let Some(progress) = &bolus.progress {
                progress(delivered, (fraction * 100.0).round().clamp(0.0, 100.0) as u8);
            }
            state.insulin_delivered += delivered;
            state.reservoir_units -= delivered;
            let _ = bolus.completion.send(BolusDelivery {
                units_delivered: delivered,
            });
            true
        }
        None => false,
    }
}

impl PodDriver for ScriptedDriver {
    fn pair_and_prime(&self) -> DriverResult<()> {
        self.begin(CommandType::PairAndPrime).map(|_| ())
    }

    fn insert_cannula(&self, _insertion: &CannulaInsertion) -> DriverResult<()> {
        self.begin(CommandType::InsertCannula)?;
        self.pod_state.set_activation_completed(true);
        self.pod_state.set_suspended(false);
        Ok(())
    }

    fn configure_alerts(&self, _alerts: &[AlertConfiguration]) -> DriverResult<()> {
        self.begin(CommandType::ConfigureAlerts).map(|_| ())
    }

    fn get_status(&self) -> DriverResult<StatusResponse> {
        let state = self.begin(CommandType::GetStatus)?;
        let delivery_status = if self.pod_state.snapshot().suspended {
            DeliveryStatus::Suspended
        } else if state.running_bolus.is_some() {
            DeliveryStatus::BolusInProgress
        } else {
            DeliveryStatus::Normal
        };
        Ok(StatusResponse {
            delivery_status,
            reservoir_units: Some(state.reservoir_units),
            insulin_delivered: state.insulin_delivered,
            minutes_since_activation: 0,
            fault_code: None,
        })
    }

    fn deactivate(&self) -> DriverResult<()> {
        self.begin(CommandType::Deactivate)?;
        self.pod_state.set_suspended(true);
        Ok(())
    }

    fn set_basal_schedule(&self, _schedule: &BasalSchedule, _beeps: bool) -> DriverResult<()> {
        self.begin(CommandType::SetBasalSchedule)?;
        self.pod_state.set_suspended(false);
        Ok(())
    }

    fn bolus_start(
        &self,
        units: f64,
        _beeps: bool,
        progress: Option<BolusProgress>,
    ) -> DriverResult<BolusStart> {
        let mut state = self.begin(CommandType::BolusStart)?;
        let (tx, rx) = bounded(1);

        if let Some(progress) = &progress {
            progress(0.0, 0);
        }
        state.running_bolus = Some(RunningBolus {
            units,
            completion: tx,
            progress,
        });
        if !state.hold_completion {
            let fraction = state.delivered_fraction;
            finish_bolus(&mut state, fraction);
        }

        let delivery_status = if state.uncertain_bolus_start {
            CommandDeliveryStatus::UncertainFailure
        } else {
            CommandDeliveryStatus::Success
        };
        Ok(BolusStart {
            delivery_status,
            completion: rx,
        })
    }

    fn bolus_cancel(&self, _beeps: bool) -> DriverResult<()> {
        let mut state = self.begin(CommandType::BolusCancel)?;
        let fraction = state.cancelled_fraction;
        finish_bolus(&mut state, fraction);
        Ok(())
    }

    fn has_active_bolus(&self) -> bool {
        self.lock().running_bolus.is_some()
    }

    fn set_temporary_basal(&self, _rate: f64, _duration_minutes: u32, _beeps: bool) -> DriverResult<()> {
        self.begin(CommandType::SetTemporaryBasal).map(|_| ())
    }

    fn cancel_temporary_basal(&self, _beeps: bool) -> DriverResult<()> {
        self.begin(CommandType::CancelTemporaryBasal).map(|_| ())
    }

    fn acknowledge_alerts(&self) -> DriverResult<()> {
        self.begin(CommandType::AcknowledgeAlerts).map(|_| ())
    }

    fn suspend_delivery(&self, _beeps: bool) -> DriverResult<()> {
        self.begin(CommandType::SuspendDelivery)?;
        self.pod_state.set_suspended(true);
        Ok(())
    }

    fn set_time(&self, _beeps: bool) -> DriverResult<()> {
        self.begin(CommandType::SetTime).map(|_| ())
    }

    fn read_pulse_log(&self) -> DriverResult<PulseLog> {
        self.begin(CommandType::ReadPulseLog)?;
        Ok(PulseLog {
            entries: vec![0x0001_0203, 0x0004_0506],
        })
    }
}
