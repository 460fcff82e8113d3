//! Bolus lifecycle: start, wait for completion, cancel, recover.
//!
//! The in-flight bolus is written to the durable [`ACTIVE_BOLUS_SLOT`] as soon
//! as the pod accepts it and cleared only after the delivered amount is in
//! the ledger. A process that dies in between finds the slot on restart and
//! records the bolus as delivered in full.

use crate::context::PodContext;
use crate::executor::CommandType;
use crate::ledger::{LedgerData, LedgerEntryType};
use crate::notify::{Notification, NotificationId, Urgency};
use crate::outcome::{FailureKind, OperationOutcome};
use crate::pod::{BolusProgress, CommandDeliveryStatus};
use crate::recovery::ACTIVE_BOLUS_SLOT;
use crate::types::{
    round_to_step, ActiveBolus, BolusRecord, BolusRequest, BolusType, CarbsRecord, EnactResult,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Where the current bolus is in its lifecycle
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BolusPhase {
    #[default]
    NotStarted,
    Starting,
    InProgress,
    Completed,
    StartFailed,
}

#[derive(Clone, Debug, Serialize)]
struct BolusPayload {
    units: f64,
    carbs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct BolusManager {
    ctx: Arc<PodContext>,
    phase: Mutex<BolusPhase>,
    /// Set once the pod has accepted (true) or rejected (false) the start
    start_gate: Mutex<Option<Arc<OnceCell<bool>>>>,
}

impl BolusManager {
    pub fn new(ctx: Arc<PodContext>) -> Self {
        Self {
            ctx,
            phase: Mutex::new(BolusPhase::NotStarted),
            start_gate: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> BolusPhase {
        *lock(&self.phase)
    }

    /// Deliver a bolus and block until the pod reports the delivered amount.
    ///
    /// No timeout is applied to the wait; a cancel from another thread is the
    /// only way to end it early.
    pub fn deliver_bolus(&self, request: BolusRequest) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let units = round_to_step(request.units, ctx.config.device.bolus_step);
        let request = BolusRequest { units, ..request };
        let beeps = match request.bolus_type {
            BolusType::Smb => ctx.config.beeps.smb,
            BolusType::Normal => ctx.config.beeps.bolus,
        };

        let gate = Arc::new(OnceCell::new());
        *lock(&self.start_gate) = Some(gate.clone());
        self.set_phase(BolusPhase::Starting);

        let progress: Option<BolusProgress> = match request.bolus_type {
            BolusType::Normal => {
                let notifier = ctx.notifier.clone();
                Some(Box::new(move |delivered: f64, percent: u8| {
                    notifier.bolus_progress(delivered, units, percent)
                }))
            }
            BolusType::Smb => None,
        };

        let outcome = ctx.executor.execute(CommandType::BolusStart, || {
            ctx.driver.bolus_start(units, beeps, progress)
        });

        let start = match outcome {
            OperationOutcome::Success(start) => start,
            OperationOutcome::CertainFailure(failure) => {
                let _ = gate.set(false);
                self.set_phase(BolusPhase::StartFailed);
                ctx.ledger.append_failure(
                    LedgerEntryType::SetBolus,
                    LedgerData::json(&payload(&request, units, Some(failure.comment())))?,
                )?;
                return Ok(EnactResult::failed(&failure));
            }
            OperationOutcome::UncertainFailure(failure) => {
                let _ = gate.set(false);
                self.set_phase(BolusPhase::StartFailed);
                let now = Utc::now();
                let pump_id = ctx.ledger.append(
                    now,
                    LedgerEntryType::SetBolus,
                    LedgerData::json(&payload(&request, units, Some(failure.comment())))?,
                    false,
                )?;
                self.notify_uncertain(&request);
                // The pod may be delivering; account for the full amount.
                self.sync_delivered(&request, now, units, pump_id, &ctx.serial_number());
                return Ok(EnactResult::failed(&failure).bolus_delivered(units));
            }
        };

        let start_time = Utc::now();
        let _ = gate.set(true);
        self.set_phase(BolusPhase::InProgress);

        if start.delivery_status == CommandDeliveryStatus::UncertainFailure {
            self.notify_uncertain(&request);
        }

        let active = ActiveBolus {
            request: request.clone(),
            start_time,
            pump_serial: ctx.serial_number(),
        };
        match serde_json::to_string(&active)
            .map_err(Error::from)
            .and_then(|json| ctx.recovery.put(ACTIVE_BOLUS_SLOT, &json))
        {
            Ok(()) => tracing::debug!("Stored active bolus for recovery"),
            Err(e) => tracing::error!("Failed to store active bolus for recovery: {}", e),
        }

        let delivery = start.completion.recv();
        let delivered = match (start.delivery_status, delivery) {
            (CommandDeliveryStatus::UncertainFailure, _) => units,
            (CommandDeliveryStatus::Success, Ok(delivery)) => delivery.units_delivered,
            (CommandDeliveryStatus::Success, Err(_)) => {
                tracing::warn!("Bolus completion was never reported; recording {units} U");
                units
            }
        };
        tracing::info!("Bolus finished: {delivered:.2}/{units:.2} U delivered");

        let pump_id = ctx.ledger.append(
            start_time,
            LedgerEntryType::SetBolus,
            LedgerData::json(&payload(&request, delivered, None))?,
            true,
        )?;
        self.sync_delivered(&request, start_time, delivered, pump_id, &active.pump_serial);

        if let Err(e) = ctx.recovery.remove(ACTIVE_BOLUS_SLOT) {
            tracing::error!("Failed to clear active bolus slot: {}", e);
        }
        self.set_phase(BolusPhase::Completed);

        Ok(EnactResult::succeeded(true).bolus_delivered(delivered))
    }

    /// Stop the running bolus.
    ///
    /// Waits for the start command to resolve first, then keeps sending the
    /// cancel until the driver no longer reports an active bolus.
    pub fn cancel_bolus(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let gate = lock(&self.start_gate).clone();
        if let Some(gate) = gate {
            if gate.get().is_none() {
                tracing::debug!("Cancel requested while the bolus command is executing; waiting");
            }
            if !*gate.wait() {
                tracing::debug!("Not cancelling bolus: bolus command failed");
                let comment = "Bolus did not start; nothing to cancel";
                ctx.ledger
                    .append_failure(LedgerEntryType::CancelBolus, LedgerData::text(comment))?;
                return Ok(EnactResult::succeeded(false).comment(comment));
            }
        }

        let beeps = ctx.config.beeps.bolus;
        let mut comment = "No active bolus".to_string();
        let mut attempt = 1;
        while ctx.driver.has_active_bolus() {
            tracing::debug!("Attempting to cancel bolus (#{})", attempt);
            match ctx
                .executor
                .run(CommandType::BolusCancel, || ctx.driver.bolus_cancel(beeps))
            {
                OperationOutcome::Success(()) => {
                    tracing::debug!("Cancelled bolus");
                    ctx.ledger
                        .append_success(LedgerEntryType::CancelBolus, LedgerData::None)?;
                    return Ok(EnactResult::succeeded(true));
                }
                OperationOutcome::CertainFailure(failure)
                | OperationOutcome::UncertainFailure(failure) => {
                    if failure.kind == FailureKind::DeviceFault {
                        // A faulted pod has stopped delivering.
                        tracing::debug!("Cancelled bolus implicitly through a pod fault");
                        ctx.ledger
                            .append_success(LedgerEntryType::CancelBolus, LedgerData::None)?;
                        return Ok(EnactResult::succeeded(true));
                    }
                    tracing::debug!("Failed to cancel bolus: {}", failure);
                    comment = failure.comment();
                }
            }
            attempt += 1;
        }

        ctx.ledger
            .append_failure(LedgerEntryType::CancelBolus, LedgerData::text(comment.clone()))?;
        Ok(EnactResult::rejected(comment))
    }

    /// Record a bolus left in the durable slot by an interrupted process.
    pub fn recover_active_bolus(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let Some(raw) = ctx.recovery.get(ACTIVE_BOLUS_SLOT)? else {
            tracing::debug!("No active bolus to recover");
            return Ok(EnactResult::succeeded(false).comment("No interrupted bolus"));
        };

        let active: ActiveBolus = match serde_json::from_str(&raw) {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!("Discarding unreadable active bolus slot: {}", e);
                ctx.ledger.append_failure(
                    LedgerEntryType::RecoverActiveBolus,
                    LedgerData::text(format!("unreadable active bolus: {e}")),
                )?;
                ctx.recovery.remove(ACTIVE_BOLUS_SLOT)?;
                return Ok(EnactResult::rejected("Stored bolus could not be read"));
            }
        };

        let units = active.request.units;
        tracing::info!(
            "Recovering bolus of {units} U started at {}",
            active.start_time
        );
        let pump_id = ctx.ledger.append(
            active.start_time,
            LedgerEntryType::RecoverActiveBolus,
            LedgerData::json(&payload(&active.request, units, None))?,
            true,
        )?;
        self.sync_delivered(
            &active.request,
            active.start_time,
            units,
            pump_id,
            &active.pump_serial,
        );
        ctx.recovery.remove(ACTIVE_BOLUS_SLOT)?;

        Ok(EnactResult::succeeded(true).bolus_delivered(units))
    }

    fn sync_delivered(
        &self,
        request: &BolusRequest,
        time: DateTime<Utc>,
        units: f64,
        pump_id: u64,
        pump_serial: &str,
    ) {
        let sync = &self.ctx.pump_sync;
        if request.carbs > 0.0 {
            if let Some(carbs_time) = request.carbs_time {
                sync.sync_carbs(CarbsRecord {
                    time: carbs_time,
                    grams: request.carbs,
                    pump_serial: pump_serial.to_string(),
                });
            }
        }
        sync.sync_bolus(BolusRecord {
            time,
            units,
            bolus_type: request.bolus_type,
            pump_id,
            pump_serial: pump_serial.to_string(),
        });
    }

    fn notify_uncertain(&self, request: &BolusRequest) {
        let config = &self.ctx.config.notifications;
        let notification = match request.bolus_type {
            BolusType::Smb => Notification::urgent(
                NotificationId::UncertainSmb,
                format!(
                    "Unable to verify whether the SMB of {:.2} U succeeded; assuming it was delivered",
                    request.units
                ),
                config.uncertain_smb_sound,
            ),
            BolusType::Normal => Notification {
                id: NotificationId::UncertainBolus,
                message: format!(
                    "Unable to verify whether the bolus of {:.2} U succeeded; assuming it was delivered",
                    request.units
                ),
                urgency: Urgency::Alarm,
                sound: config.uncertain_bolus_sound,
            },
        };
        self.ctx.notifier.notify(notification);
    }

    fn set_phase(&self, phase: BolusPhase) {
        *lock(&self.phase) = phase;
    }
}

fn payload(request: &BolusRequest, units: f64, error: Option<String>) -> BolusPayload {
    BolusPayload {
        units,
        carbs: request.carbs,
        error,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
