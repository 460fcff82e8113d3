//! High-level pod operations.
//!
//! One call per operation. Each appends its own ledger record whatever the
//! outcome; reconciliation steps triggered along the way (fake suspended TBR,
//! splits) add theirs. `Err` is reserved for ledger and storage failures;
//! device failures come back as an unsuccessful [`EnactResult`].

use crate::bolus::{BolusManager, BolusPhase};
use crate::context::PodContext;
use crate::executor::CommandType;
use crate::ledger::{LedgerData, LedgerEntryType};
use crate::notify::{Notification, NotificationId, Urgency};
use crate::outcome::{Certainty, DeviceFailure, FailureStage, OperationOutcome};
use crate::tbr::TbrEngine;
use crate::types::{
    AlertConfiguration, BasalSchedule, BolusRequest, CannulaInsertion, EnactResult, PulseLog,
    StatusResponse, TherapyEventType,
};
use crate::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;

pub struct PodManager {
    ctx: Arc<PodContext>,
    tbr: TbrEngine,
    bolus: BolusManager,
}

impl PodManager {
    pub fn new(ctx: PodContext) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            tbr: TbrEngine::new(ctx.clone()),
            bolus: BolusManager::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &PodContext {
        &self.ctx
    }

    pub fn tbr(&self) -> &TbrEngine {
        &self.tbr
    }

    pub fn bolus_phase(&self) -> BolusPhase {
        self.bolus.phase()
    }

    pub fn initialize_pod(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let outcome = ctx
            .executor
            .run(CommandType::PairAndPrime, || ctx.driver.pair_and_prime());
        match outcome {
            OperationOutcome::Success(()) => {
                ctx.ledger
                    .append_success(LedgerEntryType::InitializePod, LedgerData::None)?;
                Ok(EnactResult::succeeded(true))
            }
            OperationOutcome::CertainFailure(failure)
            | OperationOutcome::UncertainFailure(failure) => {
                self.record_failure(LedgerEntryType::InitializePod, &failure)
            }
        }
    }

    /// Insert the cannula and start basal delivery with `schedule`.
    pub fn insert_cannula(&self, schedule: &BasalSchedule) -> Result<EnactResult> {
        let ctx = &self.ctx;
        if schedule.is_empty() {
            let comment = "Cannot insert cannula without a basal schedule";
            ctx.ledger
                .append_failure(LedgerEntryType::InsertCannula, LedgerData::text(comment))?;
            return Ok(EnactResult::rejected(comment));
        }

        let insertion = CannulaInsertion {
            schedule: schedule.clone(),
            expiration_reminder_hours: ctx.config.device.expiration_reminder_hours,
            low_reservoir_units: ctx.config.device.low_reservoir_units,
        };
        let outcome = ctx
            .executor
            .run(CommandType::InsertCannula, || ctx.driver.insert_cannula(&insertion));
        if let Some(failure) = outcome.failure() {
            return self.record_failure(LedgerEntryType::InsertCannula, failure);
        }

        ctx.ledger
            .append_success(LedgerEntryType::InsertCannula, LedgerData::None)?;

        ctx.pump_sync.connect_new_pump();
        let now = Utc::now();
        let serial = ctx.serial_number();
        ctx.pump_sync.insert_therapy_event(
            now - Duration::seconds(1),
            TherapyEventType::InsulinChange,
            &serial,
        );
        ctx.pump_sync
            .insert_therapy_event(now, TherapyEventType::CannulaChange, &serial);
        ctx.dismiss(NotificationId::PodNotAttached);

        self.tbr.cancel_suspended_fake_if_exists()?;

        Ok(EnactResult::succeeded(true))
    }

    pub fn configure_alerts(&self, alerts: &[AlertConfiguration]) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let outcome = ctx
            .executor
            .run(CommandType::ConfigureAlerts, || ctx.driver.configure_alerts(alerts));
        if let Some(failure) = outcome.failure() {
            return self.record_failure(LedgerEntryType::ConfigureAlerts, failure);
        }
        ctx.ledger
            .append_success(LedgerEntryType::ConfigureAlerts, LedgerData::json(alerts)?)?;
        Ok(EnactResult::succeeded(false))
    }

    pub fn get_pod_status(&self) -> Result<(EnactResult, Option<StatusResponse>)> {
        let ctx = &self.ctx;
        let outcome = ctx
            .executor
            .execute(CommandType::GetStatus, || ctx.driver.get_status());
        match outcome {
            OperationOutcome::Success(status) => {
                ctx.ledger
                    .append_success(LedgerEntryType::GetPodStatus, LedgerData::json(&status)?)?;
                Ok((EnactResult::succeeded(false), Some(status)))
            }
            OperationOutcome::CertainFailure(failure)
            | OperationOutcome::UncertainFailure(failure) => Ok((
                self.record_failure(LedgerEntryType::GetPodStatus, &failure)?,
                None,
            )),
        }
    }

    pub fn deactivate_pod(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let outcome = ctx
            .executor
            .run(CommandType::Deactivate, || ctx.driver.deactivate());
        if let Some(failure) = outcome.failure() {
            return self.record_failure(LedgerEntryType::DeactivatePod, failure);
        }

        ctx.ledger
            .append_success(LedgerEntryType::DeactivatePod, LedgerData::None)?;
        self.tbr.create_suspended_fake_if_not_exists()?;
        ctx.dismiss(NotificationId::PodFault);
        Ok(EnactResult::succeeded(true))
    }

    /// Replace the basal schedule, resuming delivery if the pod is suspended.
    pub fn set_basal_profile(&self, schedule: &BasalSchedule) -> Result<EnactResult> {
        let ctx = &self.ctx;
        if schedule.is_empty() {
            let comment = "Failed to set basal profile: empty profile";
            ctx.notify_urgent(NotificationId::FailedUpdateProfile, comment, true);
            ctx.ledger
                .append_failure(LedgerEntryType::SetBasalSchedule, LedgerData::text(comment))?;
            return Ok(EnactResult::rejected(comment));
        }

        // Profile switches before activation must not block activation.
        if !ctx.pod_state.is_activation_completed() {
            let comment = "pre-activation basal change moot";
            ctx.ledger
                .append_success(LedgerEntryType::SetBasalSchedule, LedgerData::text(comment))?;
            return Ok(EnactResult::succeeded(false).comment(comment));
        }

        let entry_type = if ctx.pod_state.is_suspended() {
            LedgerEntryType::ResumeDelivery
        } else {
            LedgerEntryType::SetBasalSchedule
        };
        let beeps = ctx.config.beeps.basal;
        let outcome = ctx.executor.run(CommandType::SetBasalSchedule, || {
            ctx.driver.set_basal_schedule(schedule, beeps)
        });

        if let Some(failure) = outcome.failure() {
            let note = match failure.stage {
                FailureStage::AfterDeliverySuspended => {
                    self.tbr.create_suspended_fake_if_not_exists()?;
                    "Setting the basal profile failed; delivery is suspended"
                }
                FailureStage::PrecedingUncertain => {
                    "Setting the basal profile failed; delivery might be suspended"
                }
                FailureStage::Command if outcome.is_certain_failure() => {
                    "Setting the basal profile failed"
                }
                FailureStage::Command => {
                    "Setting the basal profile might have failed; delivery might be suspended"
                }
            };
            ctx.notify_urgent(NotificationId::FailedUpdateProfile, note, true);
            return self.record_failure(entry_type, failure);
        }

        if entry_type == LedgerEntryType::ResumeDelivery {
            self.tbr.cancel_suspended_fake_if_exists()?;
        }
        ctx.ledger
            .append_success(entry_type, LedgerData::json(schedule)?)?;

        ctx.notifier.notify(Notification {
            id: NotificationId::ProfileSetOk,
            message: "Basal profile set".into(),
            urgency: Urgency::Info,
            sound: false,
        });
        ctx.dismiss(NotificationId::FailedUpdateProfile);
        ctx.dismiss(NotificationId::PodSuspended);
        ctx.dismiss(NotificationId::TimeOutOfSync);

        Ok(EnactResult::succeeded(true))
    }

    /// Forget the current pod without talking to it.
    pub fn discard_pod_state(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        ctx.pod_state.discard_state();
        ctx.ledger
            .append_success(LedgerEntryType::DiscardPod, LedgerData::None)?;
        self.tbr.create_suspended_fake_if_not_exists()?;
        ctx.dismiss(NotificationId::PodFault);
        tracing::info!("Discarded pod state");
        Ok(EnactResult::succeeded(true))
    }

    pub fn deliver_bolus(&self, request: BolusRequest) -> Result<EnactResult> {
        self.bolus.deliver_bolus(request)
    }

    pub fn cancel_bolus(&self) -> Result<EnactResult> {
        self.bolus.cancel_bolus()
    }

    pub fn recover_active_bolus(&self) -> Result<EnactResult> {
        self.bolus.recover_active_bolus()
    }

    pub fn set_temporary_basal(&self, rate: f64, duration_minutes: u32) -> Result<EnactResult> {
        self.tbr.set_temporary_basal(rate, duration_minutes)
    }

    pub fn cancel_temporary_basal(&self) -> Result<EnactResult> {
        self.tbr.cancel_temporary_basal()
    }

    pub fn acknowledge_alerts(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let outcome = ctx
            .executor
            .run(CommandType::AcknowledgeAlerts, || ctx.driver.acknowledge_alerts());
        if let Some(failure) = outcome.failure() {
            return self.record_failure(LedgerEntryType::AcknowledgeAlerts, failure);
        }
        ctx.ledger
            .append_success(LedgerEntryType::AcknowledgeAlerts, LedgerData::None)?;
        Ok(EnactResult::succeeded(true))
    }

    pub fn suspend_delivery(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let beeps = ctx.config.beeps.basal;
        let outcome = ctx
            .executor
            .run(CommandType::SuspendDelivery, || ctx.driver.suspend_delivery(beeps));
        if let Some(failure) = outcome.failure() {
            return self.record_failure(LedgerEntryType::SuspendDelivery, failure);
        }

        ctx.ledger
            .append_success(LedgerEntryType::SuspendDelivery, LedgerData::None)?;
        self.tbr.create_suspended_fake_if_not_exists()?;
        ctx.dismiss(NotificationId::FailedUpdateProfile);
        ctx.dismiss(NotificationId::TimeOutOfSync);
        Ok(EnactResult::succeeded(true))
    }

    /// Sync the pod clock with the host clock.
    pub fn set_time(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let beeps = ctx.config.beeps.basal;
        let outcome = ctx
            .executor
            .run(CommandType::SetTime, || ctx.driver.set_time(beeps));

        if let Some(failure) = outcome.failure() {
            let note = if failure.stage == FailureStage::AfterDeliverySuspended {
                self.tbr.create_suspended_fake_if_not_exists()?;
                "Setting the time failed; delivery is suspended"
            } else {
                "Setting the time failed; delivery might be suspended"
            };
            ctx.notify_urgent(NotificationId::FailedUpdateProfile, note, true);
            return self.record_failure(LedgerEntryType::SetTime, failure);
        }

        ctx.ledger
            .append_success(LedgerEntryType::SetTime, LedgerData::None)?;
        ctx.dismiss(NotificationId::FailedUpdateProfile);
        ctx.dismiss(NotificationId::PodSuspended);
        ctx.dismiss(NotificationId::TimeOutOfSync);
        Ok(EnactResult::succeeded(true))
    }

    pub fn read_pulse_log(&self) -> Result<(EnactResult, Option<PulseLog>)> {
        let ctx = &self.ctx;
        let outcome = ctx
            .executor
            .execute(CommandType::ReadPulseLog, || ctx.driver.read_pulse_log());
        match outcome {
            OperationOutcome::Success(log) => {
                ctx.ledger
                    .append_success(LedgerEntryType::ReadPulseLog, LedgerData::json(&log)?)?;
                Ok((EnactResult::succeeded(false), Some(log)))
            }
            OperationOutcome::CertainFailure(failure)
            | OperationOutcome::UncertainFailure(failure) => Ok((
                self.record_failure(LedgerEntryType::ReadPulseLog, &failure)?,
                None,
            )),
        }
    }

    fn record_failure(
        &self,
        entry_type: LedgerEntryType,
        failure: &DeviceFailure,
    ) -> Result<EnactResult> {
        self.ctx
            .ledger
            .append_failure(entry_type, LedgerData::text(failure.comment()))?;
        let certainty = crate::outcome::classify(failure).0;
        tracing::warn!(
            "{} failed{}: {}",
            entry_type.as_str(),
            if certainty == Certainty::Uncertain { " (uncertain)" } else { "" },
            failure.comment()
        );
        Ok(EnactResult::failed(failure))
    }
}
