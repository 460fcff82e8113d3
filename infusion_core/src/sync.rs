//! Synchronized pump-state view.
//!
//! The view is owned by the host application (treatments database, uploader);
//! this module defines the interface the core writes through and an
//! in-memory implementation that enforces the one-active-TBR invariant and
//! can be snapshotted to disk.

use crate::recovery::write_atomic;
use crate::types::{BolusRecord, CarbsRecord, TherapyEventType};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Why a TBR record exists
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TbrType {
    Normal,
    /// Zero-rate record standing in for "pod not delivering basal"
    EmulatedSuspend,
}

/// Rounding applied to the remaining minutes of a split TBR
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitRounding {
    #[default]
    Up,
    Nearest,
}

/// A temporary basal as seen by the synchronized view
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TemporaryBasal {
    /// Units per hour
    pub rate: f64,
    pub duration_minutes: i64,
    pub start_time: DateTime<Utc>,
    /// Ledger record that created this TBR
    pub pump_id: u64,
    pub tbr_type: TbrType,
    /// Set when the TBR was stopped before its planned end
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_pump_id: Option<u64>,
}

impl TemporaryBasal {
    pub fn new(
        start_time: DateTime<Utc>,
        rate: f64,
        duration_minutes: i64,
        pump_id: u64,
        tbr_type: TbrType,
    ) -> Self {
        Self {
            rate,
            duration_minutes,
            start_time,
            pump_id,
            tbr_type,
            end_time: None,
            end_pump_id: None,
        }
    }

    /// Start plus duration, saturating at the latest representable time.
    pub fn planned_end(&self) -> DateTime<Utc> {
        Duration::try_minutes(self.duration_minutes)
            .and_then(|d| self.start_time.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Actual end: the stop time if stopped, otherwise the planned end.
    pub fn effective_end(&self) -> DateTime<Utc> {
        match self.end_time {
            Some(end) if end < self.planned_end() => end,
            _ => self.planned_end(),
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.effective_end()
    }

    /// Minutes left until the planned end, per the rounding policy.
    pub fn remaining_minutes(&self, now: DateTime<Utc>, rounding: SplitRounding) -> i64 {
        let remaining_ms = (self.planned_end() - now).num_milliseconds();
        let minutes = remaining_ms as f64 / 60_000.0;
        match rounding {
            SplitRounding::Up => minutes.ceil() as i64,
            SplitRounding::Nearest => minutes.round() as i64,
        }
    }
}

/// Writer interface to the synchronized pump-state view
pub trait PumpSync: Send + Sync {
    /// The TBR the view believes is running at `now`
    fn expected_temporary_basal(&self, now: DateTime<Utc>) -> Option<TemporaryBasal>;
    /// Install a TBR; returns false when a TBR with the same pump id exists.
    fn sync_temporary_basal(&self, tbr: TemporaryBasal) -> bool;
    /// Stop the TBR running at `time`; returns false when none was running.
    fn sync_stop_temporary_basal(&self, time: DateTime<Utc>, pump_id: u64) -> bool;
    fn sync_bolus(&self, bolus: BolusRecord) -> bool;
    fn sync_carbs(&self, carbs: CarbsRecord);
    fn insert_therapy_event(&self, time: DateTime<Utc>, event: TherapyEventType, pump_serial: &str);
    /// A new pod was connected; the view should stop attributing old records
    fn connect_new_pump(&self);
}

/// Therapy event as stored in the snapshot
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TherapyEvent {
    pub time: DateTime<Utc>,
    pub event: TherapyEventType,
    pub pump_serial: String,
}

/// Serializable contents of [`MemoryPumpSync`]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PumpSyncSnapshot {
    #[serde(default)]
    pub temporary_basals: Vec<TemporaryBasal>,
    #[serde(default)]
    pub boluses: Vec<BolusRecord>,
    #[serde(default)]
    pub carbs: Vec<CarbsRecord>,
    #[serde(default)]
    pub therapy_events: Vec<TherapyEvent>,
    #[serde(default)]
    pub pump_connections: u32,
}

/// In-memory synchronized view
///
/// Installing a TBR closes whichever TBR is active at the new start time, so
/// at most one TBR is ever active.
#[derive(Debug, Default)]
pub struct MemoryPumpSync {
    inner: Mutex<PumpSyncSnapshot>,
}

impl MemoryPumpSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: PumpSyncSnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> PumpSyncSnapshot {
        self.lock().clone()
    }

    /// TBRs active at `now`; never more than one.
    pub fn active_temporary_basals(&self, now: DateTime<Utc>) -> Vec<TemporaryBasal> {
        self.lock()
            .temporary_basals
            .iter()
            .filter(|t| t.is_active_at(now))
            .cloned()
            .collect()
    }

    /// Load a snapshot from disk
    ///
    /// Missing or unreadable files yield an empty view with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No pump state file found, starting with an empty view");
            return Ok(Self::new());
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Unable to open pump state {:?}: {}. Using empty view.", path, e);
                return Ok(Self::new());
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!("Unable to lock pump state {:?}: {}. Using empty view.", path, e);
            return Ok(Self::new());
        }

        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        file.unlock()?;
        if let Err(e) = read {
            tracing::warn!("Failed to read pump state {:?}: {}. Using empty view.", path, e);
            return Ok(Self::new());
        }

        match serde_json::from_str::<PumpSyncSnapshot>(&contents) {
            Ok(snapshot) => {
                tracing::debug!("Loaded pump state from {:?}", path);
                Ok(Self::from_snapshot(snapshot))
            }
            Err(e) => {
                tracing::warn!("Failed to parse pump state {:?}: {}. Using empty view.", path, e);
                Ok(Self::new())
            }
        }
    }

    /// Save the snapshot atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string(&self.snapshot())?;
        write_atomic(path, contents.as_bytes())?;
        tracing::debug!("Saved pump state to {:?}", path);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PumpSyncSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PumpSync for MemoryPumpSync {
    fn expected_temporary_basal(&self, now: DateTime<Utc>) -> Option<TemporaryBasal> {
        self.lock()
            .temporary_basals
            .iter()
            .rev()
            .find(|t| t.is_active_at(now))
            .cloned()
    }

    fn sync_temporary_basal(&self, tbr: TemporaryBasal) -> bool {
        let mut state = self.lock();
        if state.temporary_basals.iter().any(|t| t.pump_id == tbr.pump_id) {
            tracing::debug!("TBR with pump id {} already synced", tbr.pump_id);
            return false;
        }

        let start = tbr.start_time;
        for running in state
            .temporary_basals
            .iter_mut()
            .filter(|t| t.is_active_at(start))
        {
            tracing::debug!(
                "Closing TBR {} at {} for incoming TBR {}",
                running.pump_id,
                start,
                tbr.pump_id
            );
            running.end_time = Some(start);
            running.end_pump_id = Some(tbr.pump_id);
        }

        state.temporary_basals.push(tbr);
        true
    }

    fn sync_stop_temporary_basal(&self, time: DateTime<Utc>, pump_id: u64) -> bool {
        let mut state = self.lock();
        match state
            .temporary_basals
            .iter_mut()
            .rev()
            .find(|t| t.is_active_at(time))
        {
            Some(running) => {
                running.end_time = Some(time);
                running.end_pump_id = Some(pump_id);
                true
            }
            None => {
                tracing::debug!("No TBR running at {} to stop", time);
                false
            }
        }
    }

    fn sync_bolus(&self, bolus: BolusRecord) -> bool {
        let mut state = self.lock();
        if state.boluses.iter().any(|b| b.pump_id == bolus.pump_id) {
            return false;
        }
        state.boluses.push(bolus);
        true
    }

    fn sync_carbs(&self, carbs: CarbsRecord) {
        self.lock().carbs.push(carbs);
    }

    fn insert_therapy_event(&self, time: DateTime<Utc>, event: TherapyEventType, pump_serial: &str) {
        let mut state = self.lock();
        let exists = state
            .therapy_events
            .iter()
            .any(|e| e.time == time && e.event == event);
        if !exists {
            state.therapy_events.push(TherapyEvent {
                time,
                event,
                pump_serial: pump_serial.to_string(),
            });
        }
    }

    fn connect_new_pump(&self) {
        self.lock().pump_connections += 1;
    }
}
