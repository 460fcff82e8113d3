//! TBR reconciliation.
//!
//! Keeps the synchronized TBR view in line with what the pod is believed to
//! be doing. Uncertain cancels are split so only the unresolved tail stays
//! open; uncertain sets are recorded as if they succeeded. Both directions
//! over-report delivered insulin rather than under-report it.

use crate::context::PodContext;
use crate::executor::CommandType;
use crate::ledger::{LedgerData, LedgerEntryType};
use crate::notify::NotificationId;
use crate::outcome::{FailureStage, OperationOutcome};
use crate::sync::{TbrType, TemporaryBasal};
use crate::types::{round_to_step, EnactResult};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Ledger payload for TBR records
#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
struct TbrPayload {
    rate: f64,
    duration_minutes: i64,
}

pub struct TbrEngine {
    ctx: Arc<PodContext>,
    /// Serializes the check-then-create of the synthetic suspended TBR
    fake_guard: Mutex<()>,
}

impl TbrEngine {
    pub fn new(ctx: Arc<PodContext>) -> Self {
        Self {
            ctx,
            fake_guard: Mutex::new(()),
        }
    }

    /// Whether the active TBR is the synthetic "not delivering" record.
    pub fn has_suspended_fake_tbr(&self) -> Result<bool> {
        let Some(active) = self.ctx.pump_sync.expected_temporary_basal(Utc::now()) else {
            return Ok(false);
        };
        Ok(self
            .ctx
            .ledger
            .find_by_pump_id(active.pump_id)?
            .is_some_and(|record| record.entry_type == LedgerEntryType::SetFakeSuspendedTbr))
    }

    /// Install a zero-rate TBR spanning the pod service duration unless one
    /// is already active. Returns whether a new one was created.
    pub fn create_suspended_fake_if_not_exists(&self) -> Result<bool> {
        let _guard = self.fake_guard.lock().unwrap_or_else(|e| e.into_inner());
        if self.has_suspended_fake_tbr()? {
            return Ok(false);
        }

        tracing::debug!("Creating fake suspended TBR");
        let now = Utc::now();
        let pump_id = self.ctx.ledger.append(
            now,
            LedgerEntryType::SetFakeSuspendedTbr,
            LedgerData::None,
            true,
        )?;
        let minutes = self.ctx.config.reconciliation.service_duration().num_minutes();
        self.ctx.pump_sync.sync_temporary_basal(TemporaryBasal::new(
            now,
            0.0,
            minutes,
            pump_id,
            TbrType::EmulatedSuspend,
        ));
        Ok(true)
    }

    /// Stop the synthetic suspended TBR if it is the active one. Returns
    /// whether one was cancelled.
    pub fn cancel_suspended_fake_if_exists(&self) -> Result<bool> {
        let _guard = self.fake_guard.lock().unwrap_or_else(|e| e.into_inner());
        if !self.has_suspended_fake_tbr()? {
            return Ok(false);
        }

        tracing::debug!("Cancelling fake suspended TBR");
        let now = Utc::now();
        let pump_id = self.ctx.ledger.append(
            now,
            LedgerEntryType::CancelFakeSuspendedTbr,
            LedgerData::None,
            true,
        )?;
        self.ctx.pump_sync.sync_stop_temporary_basal(now, pump_id);
        Ok(true)
    }

    /// Record the running TBR as stopped at `time`.
    pub fn report_cancelled_tbr(&self, time: DateTime<Utc>) -> Result<u64> {
        tracing::debug!("Reporting TBR cancelled at {}", time);
        let pump_id = self
            .ctx
            .ledger
            .append_success(LedgerEntryType::CancelTemporaryBasalByEngine, LedgerData::None)?;
        self.ctx.pump_sync.sync_stop_temporary_basal(time, pump_id);
        Ok(pump_id)
    }

    /// Close the active TBR and reopen it for its remaining minutes.
    ///
    /// Returns the new tail, or `None` when nothing was running or the
    /// running TBR has no time left.
    pub fn split_active_tbr(&self) -> Result<Option<TemporaryBasal>> {
        let now = Utc::now();
        let Some(running) = self.ctx.pump_sync.expected_temporary_basal(now) else {
            tracing::debug!("No active TBR to split");
            return Ok(None);
        };

        let remaining =
            running.remaining_minutes(now, self.ctx.config.reconciliation.split_rounding);
        if remaining <= 0 {
            tracing::debug!("TBR {} has no minutes remaining, not splitting", running.pump_id);
            return Ok(None);
        }

        self.report_cancelled_tbr(now - Duration::seconds(1))?;

        let pump_id = self.ctx.ledger.append(
            now,
            LedgerEntryType::SplitTemporaryBasal,
            LedgerData::json(&TbrPayload {
                rate: running.rate,
                duration_minutes: remaining,
            })?,
            true,
        )?;
        let tail = TemporaryBasal::new(now, running.rate, remaining, pump_id, TbrType::Normal);
        self.ctx.pump_sync.sync_temporary_basal(tail.clone());

        tracing::info!(
            "Split TBR {} into {} ({} U/h for {} min)",
            running.pump_id,
            pump_id,
            running.rate,
            remaining
        );
        Ok(Some(tail))
    }

    pub fn set_temporary_basal(&self, rate: f64, duration_minutes: u32) -> Result<EnactResult> {
        let ctx = &self.ctx;
        if !rate.is_finite() || rate < 0.0 || duration_minutes == 0 {
            let comment =
                format!("Invalid temporary basal: {rate} U/h for {duration_minutes} min");
            ctx.ledger.append_failure(
                LedgerEntryType::SetTemporaryBasal,
                LedgerData::text(comment.clone()),
            )?;
            return Ok(EnactResult::rejected(comment));
        }

        let rate = round_to_step(rate, ctx.config.device.basal_step);
        let beeps = ctx.config.beeps.tbr;
        let payload = TbrPayload {
            rate,
            duration_minutes: i64::from(duration_minutes),
        };

        let outcome = ctx.executor.run(CommandType::SetTemporaryBasal, || {
            ctx.driver.set_temporary_basal(rate, duration_minutes, beeps)
        });

        let failure = match outcome {
            OperationOutcome::Success(()) => {
                let now = Utc::now();
                let pump_id = ctx.ledger.append(
                    now,
                    LedgerEntryType::SetTemporaryBasal,
                    LedgerData::json(&payload)?,
                    true,
                )?;
                self.install(now, payload, pump_id);
                ctx.dismiss(NotificationId::TbrAlerts);
                return Ok(EnactResult::succeeded(true).temp_basal(rate, duration_minutes));
            }
            OperationOutcome::CertainFailure(failure) => {
                ctx.ledger.append_failure(
                    LedgerEntryType::SetTemporaryBasal,
                    LedgerData::text(failure.comment()),
                )?;
                return Ok(EnactResult::failed(&failure));
            }
            OperationOutcome::UncertainFailure(failure) => failure,
        };

        let pump_id = ctx.ledger.append_failure(
            LedgerEntryType::SetTemporaryBasal,
            LedgerData::text(failure.comment()),
        )?;
        let sound = ctx.config.notifications.uncertain_tbr_sound;
        match failure.stage {
            FailureStage::AfterDeliverySuspended => {}
            FailureStage::PrecedingUncertain => {
                ctx.notify_urgent(
                    NotificationId::TbrAlerts,
                    "Setting the temporary basal failed; the previous TBR might have been cancelled",
                    sound,
                );
                self.split_active_tbr()?;
            }
            FailureStage::Command => {
                ctx.notify_urgent(
                    NotificationId::TbrAlerts,
                    "Setting the temporary basal might have failed; assuming it is running",
                    sound,
                );
                // A status read showing no TBR corrects this later; the
                // opposite assumption cannot be corrected.
                self.install(Utc::now(), payload, pump_id);
            }
        }
        Ok(EnactResult::failed(&failure))
    }

    pub fn cancel_temporary_basal(&self) -> Result<EnactResult> {
        let ctx = &self.ctx;
        let beeps = ctx.config.beeps.tbr;
        let outcome = ctx.executor.run(CommandType::CancelTemporaryBasal, || {
            ctx.driver.cancel_temporary_basal(beeps)
        });

        match outcome {
            OperationOutcome::Success(()) => {
                let now = Utc::now();
                let pump_id = ctx.ledger.append(
                    now,
                    LedgerEntryType::CancelTemporaryBasal,
                    LedgerData::None,
                    true,
                )?;
                ctx.pump_sync.sync_stop_temporary_basal(now, pump_id);
                ctx.dismiss(NotificationId::TbrAlerts);
                Ok(EnactResult::succeeded(true))
            }
            OperationOutcome::CertainFailure(failure) => {
                ctx.notify_urgent(
                    NotificationId::TbrAlerts,
                    "Cancelling the temporary basal failed; the TBR is still running",
                    ctx.config.notifications.uncertain_tbr_sound,
                );
                ctx.ledger.append_failure(
                    LedgerEntryType::CancelTemporaryBasal,
                    LedgerData::text(failure.comment()),
                )?;
                Ok(EnactResult::failed(&failure))
            }
            OperationOutcome::UncertainFailure(failure) => {
                self.split_active_tbr()?;
                ctx.ledger.append_failure(
                    LedgerEntryType::CancelTemporaryBasal,
                    LedgerData::text(failure.comment()),
                )?;
                Ok(EnactResult::failed(&failure))
            }
        }
    }

    fn install(&self, start: DateTime<Utc>, payload: TbrPayload, pump_id: u64) {
        self.ctx.pump_sync.sync_temporary_basal(TemporaryBasal::new(
            start,
            payload.rate,
            payload.duration_minutes,
            pump_id,
            TbrType::Normal,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_rig::Rig;
    use crate::ledger::LedgerEntryType::*;
    use crate::ledger::LedgerStore;
    use crate::outcome::{DeviceFailure, FailureKind};
    use crate::sync::PumpSync;

    fn running_tbr(rig: &Rig, elapsed: Duration, rate: f64, minutes: i64) -> u64 {
        let pump_id = rig
            .ctx
            .ledger
            .append_success(SetTemporaryBasal, LedgerData::None)
            .unwrap();
        rig.sync.sync_temporary_basal(TemporaryBasal::new(
            Utc::now() - elapsed,
            rate,
            minutes,
            pump_id,
            TbrType::Normal,
        ));
        pump_id
    }

    #[test]
    fn test_fake_tbr_created_once() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());

        assert!(engine.create_suspended_fake_if_not_exists().unwrap());
        assert!(!engine.create_suspended_fake_if_not_exists().unwrap());

        assert_eq!(rig.entry_types(), vec![SetFakeSuspendedTbr]);
        let active = rig.sync.active_temporary_basals(Utc::now());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rate, 0.0);
        assert_eq!(active[0].tbr_type, TbrType::EmulatedSuspend);
        assert_eq!(active[0].duration_minutes, 80 * 60);
        assert!(engine.has_suspended_fake_tbr().unwrap());
    }

    #[test]
    fn test_fake_tbr_replaces_real_one() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        running_tbr(&rig, Duration::minutes(5), 1.5, 30);

        assert!(!engine.has_suspended_fake_tbr().unwrap());
        assert!(engine.create_suspended_fake_if_not_exists().unwrap());
        assert_eq!(rig.sync.active_temporary_basals(Utc::now()).len(), 1);
    }

    #[test]
    fn test_cancel_fake_only_when_present() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());

        assert!(!engine.cancel_suspended_fake_if_exists().unwrap());
        engine.create_suspended_fake_if_not_exists().unwrap();
        assert!(engine.cancel_suspended_fake_if_exists().unwrap());

        assert_eq!(rig.entry_types(), vec![SetFakeSuspendedTbr, CancelFakeSuspendedTbr]);
        assert!(rig.sync.expected_temporary_basal(Utc::now()).is_none());
    }

    #[test]
    fn test_concurrent_fake_creation_yields_one_record() {
        let rig = Rig::new();
        let engine = Arc::new(TbrEngine::new(rig.ctx.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || engine.create_suspended_fake_if_not_exists().unwrap())
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c)
            .count();

        assert_eq!(created, 1);
        assert_eq!(rig.entry_types(), vec![SetFakeSuspendedTbr]);
    }

    #[test]
    fn test_split_keeps_rate_for_remaining_minutes() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        running_tbr(&rig, Duration::minutes(12), 1.2, 30);

        let tail = engine.split_active_tbr().unwrap().unwrap();
        assert_eq!(tail.rate, 1.2);
        assert_eq!(tail.duration_minutes, 18);

        assert_eq!(
            rig.entry_types(),
            vec![SetTemporaryBasal, CancelTemporaryBasalByEngine, SplitTemporaryBasal]
        );
        let active = rig.sync.active_temporary_basals(Utc::now());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pump_id, tail.pump_id);
    }

    #[test]
    fn test_no_split_without_remaining_time() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        assert!(engine.split_active_tbr().unwrap().is_none());

        running_tbr(&rig, Duration::minutes(30), 1.0, 30);
        assert!(engine.split_active_tbr().unwrap().is_none());
        assert_eq!(rig.entry_types(), vec![SetTemporaryBasal]);
    }

    #[test]
    fn test_set_success_installs_tbr() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());

        let result = engine.set_temporary_basal(0.52, 30).unwrap();
        assert!(result.success && result.enacted);
        assert_eq!(result.absolute_rate, Some(0.5));
        assert_eq!(result.duration_minutes, Some(30));

        let active = rig.sync.expected_temporary_basal(Utc::now()).unwrap();
        assert_eq!((active.rate, active.duration_minutes), (0.5, 30));
        assert!(rig.notifier.dismissed(NotificationId::TbrAlerts));
    }

    #[test]
    fn test_invalid_tbr_request_is_rejected() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());

        for (rate, minutes) in [(f64::NAN, 30), (-0.5, 30), (f64::INFINITY, 30), (1.0, 0)] {
            let result = engine.set_temporary_basal(rate, minutes).unwrap();
            assert!(!result.success);
            assert!(!result.enacted);
        }

        assert_eq!(rig.driver.call_count(CommandType::SetTemporaryBasal), 0);
        let records = rig.ledger.records().unwrap();
        assert_eq!(records.len(), 4);
        assert!(records
            .iter()
            .all(|r| r.entry_type == SetTemporaryBasal && !r.success));
        assert!(rig.sync.expected_temporary_basal(Utc::now()).is_none());
    }

    #[test]
    fn test_zero_rate_tbr_is_allowed() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        assert!(engine.set_temporary_basal(0.0, 30).unwrap().success);
    }

    #[test]
    fn test_uncertain_set_assumes_success() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        rig.driver.fail_next(
            CommandType::SetTemporaryBasal,
            DeviceFailure::new(FailureKind::TransportTimeout, "no reply"),
        );

        let result = engine.set_temporary_basal(2.0, 60).unwrap();
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(FailureKind::TransportTimeout));

        let records = rig.ledger.records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        let active = rig.sync.expected_temporary_basal(Utc::now()).unwrap();
        assert_eq!(active.pump_id, records[0].pump_id);
        assert_eq!(active.rate, 2.0);
        assert!(rig.notifier.notified(NotificationId::TbrAlerts));
    }

    #[test]
    fn test_certain_set_failure_installs_nothing() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        rig.driver.fail_next(
            CommandType::SetTemporaryBasal,
            DeviceFailure::new(FailureKind::NonceError, "nonce"),
        );

        engine.set_temporary_basal(2.0, 60).unwrap();
        assert_eq!(rig.entry_types(), vec![SetTemporaryBasal]);
        assert!(rig.sync.expected_temporary_basal(Utc::now()).is_none());
        assert!(rig.notifier.events().is_empty());
    }

    #[test]
    fn test_set_after_delivery_suspended_only_records() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        running_tbr(&rig, Duration::minutes(5), 1.0, 30);
        rig.driver.fail_next(
            CommandType::SetTemporaryBasal,
            DeviceFailure::new(FailureKind::TransportTimeout, "lost")
                .with_stage(FailureStage::AfterDeliverySuspended),
        );

        engine.set_temporary_basal(2.0, 60).unwrap();
        assert_eq!(rig.entry_types(), vec![SetTemporaryBasal, SetTemporaryBasal]);
        assert_eq!(rig.sync.expected_temporary_basal(Utc::now()).unwrap().rate, 1.0);
    }

    #[test]
    fn test_set_with_uncertain_preceding_cancel_splits() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        running_tbr(&rig, Duration::minutes(10), 1.0, 30);
        rig.driver.fail_next(
            CommandType::SetTemporaryBasal,
            DeviceFailure::new(FailureKind::NonceError, "cancel lost")
                .with_stage(FailureStage::PrecedingUncertain),
        );

        engine.set_temporary_basal(2.0, 60).unwrap();
        assert_eq!(
            rig.entry_types(),
            vec![
                SetTemporaryBasal,
                SetTemporaryBasal,
                CancelTemporaryBasalByEngine,
                SplitTemporaryBasal
            ]
        );
        let active = rig.sync.expected_temporary_basal(Utc::now()).unwrap();
        assert_eq!((active.rate, active.duration_minutes), (1.0, 20));
        assert!(rig.notifier.notified(NotificationId::TbrAlerts));
    }

    #[test]
    fn test_cancel_success_stops_tbr() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        running_tbr(&rig, Duration::minutes(3), 1.0, 30);

        let result = engine.cancel_temporary_basal().unwrap();
        assert!(result.success && result.enacted);
        assert!(rig.sync.expected_temporary_basal(Utc::now()).is_none());
        assert_eq!(rig.entry_types(), vec![SetTemporaryBasal, CancelTemporaryBasal]);
    }

    #[test]
    fn test_certain_cancel_failure_leaves_view() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        let original = running_tbr(&rig, Duration::minutes(3), 1.0, 30);
        rig.driver.fail_next(
            CommandType::CancelTemporaryBasal,
            DeviceFailure::new(FailureKind::DecodingError, "garbled"),
        );

        let result = engine.cancel_temporary_basal().unwrap();
        assert!(!result.success);
        assert_eq!(
            rig.sync.expected_temporary_basal(Utc::now()).unwrap().pump_id,
            original
        );
        assert!(rig.notifier.notified(NotificationId::TbrAlerts));
        assert_eq!(rig.entry_types(), vec![SetTemporaryBasal, CancelTemporaryBasal]);
    }

    #[test]
    fn test_uncertain_cancel_splits_then_records() {
        let rig = Rig::new();
        let engine = TbrEngine::new(rig.ctx.clone());
        running_tbr(&rig, Duration::minutes(12), 0.8, 30);
        rig.driver.fail_next(
            CommandType::CancelTemporaryBasal,
            DeviceFailure::new(FailureKind::TransportInterrupted, "radio"),
        );

        engine.cancel_temporary_basal().unwrap();
        assert_eq!(
            rig.entry_types(),
            vec![
                SetTemporaryBasal,
                CancelTemporaryBasalByEngine,
                SplitTemporaryBasal,
                CancelTemporaryBasal
            ]
        );
        let active = rig.sync.active_temporary_basals(Utc::now());
        assert_eq!(active.len(), 1);
        assert_eq!((active[0].rate, active[0].duration_minutes), (0.8, 18));
    }
}
