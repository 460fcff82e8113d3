//! Append-only audit ledger of pod operations.
//!
//! Every attempted pod interaction produces exactly one [`LedgerRecord`].
//! Records are never mutated; the `pump_id` assigned on append is the
//! correlation key used to trace synchronized-state entries (TBRs, boluses)
//! back to the operation that created them.
//!
//! The file-backed store appends JSON lines under an exclusive `fs2` lock,
//! the same way sessions were appended to the WAL.

use crate::pod::PodStateView;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Kind of operation a ledger record describes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    InitializePod,
    InsertCannula,
    ConfigureAlerts,
    GetPodStatus,
    DeactivatePod,
    DiscardPod,
    SetBasalSchedule,
    ResumeDelivery,
    SetBolus,
    RecoverActiveBolus,
    CancelBolus,
    SetTemporaryBasal,
    CancelTemporaryBasal,
    CancelTemporaryBasalByEngine,
    SplitTemporaryBasal,
    SetFakeSuspendedTbr,
    CancelFakeSuspendedTbr,
    AcknowledgeAlerts,
    SuspendDelivery,
    SetTime,
    ReadPulseLog,
}

impl LedgerEntryType {
    /// Stable name as written to the ledger file.
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerEntryType::InitializePod => "INITIALIZE_POD",
            LedgerEntryType::InsertCannula => "INSERT_CANNULA",
            LedgerEntryType::ConfigureAlerts => "CONFIGURE_ALERTS",
            LedgerEntryType::GetPodStatus => "GET_POD_STATUS",
            LedgerEntryType::DeactivatePod => "DEACTIVATE_POD",
            LedgerEntryType::DiscardPod => "DISCARD_POD",
            LedgerEntryType::SetBasalSchedule => "SET_BASAL_SCHEDULE",
            LedgerEntryType::ResumeDelivery => "RESUME_DELIVERY",
            LedgerEntryType::SetBolus => "SET_BOLUS",
            LedgerEntryType::RecoverActiveBolus => "RECOVER_ACTIVE_BOLUS",
            LedgerEntryType::CancelBolus => "CANCEL_BOLUS",
            LedgerEntryType::SetTemporaryBasal => "SET_TEMPORARY_BASAL",
            LedgerEntryType::CancelTemporaryBasal => "CANCEL_TEMPORARY_BASAL",
            LedgerEntryType::CancelTemporaryBasalByEngine => "CANCEL_TEMPORARY_BASAL_BY_ENGINE",
            LedgerEntryType::SplitTemporaryBasal => "SPLIT_TEMPORARY_BASAL",
            LedgerEntryType::SetFakeSuspendedTbr => "SET_FAKE_SUSPENDED_TBR",
            LedgerEntryType::CancelFakeSuspendedTbr => "CANCEL_FAKE_SUSPENDED_TBR",
            LedgerEntryType::AcknowledgeAlerts => "ACKNOWLEDGE_ALERTS",
            LedgerEntryType::SuspendDelivery => "SUSPEND_DELIVERY",
            LedgerEntryType::SetTime => "SET_TIME",
            LedgerEntryType::ReadPulseLog => "READ_PULSE_LOG",
        }
    }
}

/// Immutable ledger record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerRecord {
    pub pump_id: u64,
    pub request_time: DateTime<Utc>,
    pub entry_type: LedgerEntryType,
    pub success: bool,
    /// Textual or JSON-serialized payload
    pub data: Option<String>,
    pub device_serial: String,
}

/// A record before the store has assigned its id
#[derive(Clone, Debug, PartialEq)]
pub struct NewLedgerRecord {
    pub request_time: DateTime<Utc>,
    pub entry_type: LedgerEntryType,
    pub success: bool,
    pub data: Option<String>,
    pub device_serial: String,
}

impl NewLedgerRecord {
    fn with_id(self, pump_id: u64) -> LedgerRecord {
        LedgerRecord {
            pump_id,
            request_time: self.request_time,
            entry_type: self.entry_type,
            success: self.success,
            data: self.data,
            device_serial: self.device_serial,
        }
    }
}

/// Payload attached to a ledger record
#[derive(Clone, Debug, PartialEq)]
pub enum LedgerData {
    None,
    Text(String),
    Json(serde_json::Value),
}

impl LedgerData {
    /// Serialize any value as the record payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(LedgerData::Json(serde_json::to_value(value)?))
    }

    pub fn text(value: impl Into<String>) -> Self {
        LedgerData::Text(value.into())
    }

    fn into_payload(self) -> Result<Option<String>> {
        match self {
            LedgerData::None => Ok(None),
            LedgerData::Text(text) => Ok(Some(text)),
            LedgerData::Json(value) => Ok(Some(serde_json::to_string(&value)?)),
        }
    }
}

impl From<Option<String>> for LedgerData {
    fn from(value: Option<String>) -> Self {
        value.map_or(LedgerData::None, LedgerData::Text)
    }
}

/// Persistence collaborator for ledger records
///
/// The store assigns ids; it does not deduplicate.
pub trait LedgerStore: Send + Sync {
    fn append(&self, record: NewLedgerRecord) -> Result<LedgerRecord>;
    fn find_by_pump_id(&self, pump_id: u64) -> Result<Option<LedgerRecord>>;
    fn records(&self) -> Result<Vec<LedgerRecord>>;
}

/// JSONL-based ledger with file locking
pub struct JsonlLedger {
    path: PathBuf,
}

impl JsonlLedger {
    /// Create a ledger backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl LedgerStore for JsonlLedger {
    fn append(&self, record: NewLedgerRecord) -> Result<LedgerRecord> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        // Ids are assigned under the lock so concurrent writers never reuse one.
        // Unreadable lines still consume an id.
        let scan = scan_lines(&file)?;
        let next_id = scan
            .records
            .iter()
            .map(|r| r.pump_id)
            .max()
            .unwrap_or(0)
            .max(scan.line_count)
            + 1;
        let record = record.with_id(next_id);

        let torn_tail = !ends_with_newline(&file)?;
        let mut writer = std::io::BufWriter::new(&file);
        if torn_tail {
            tracing::warn!("Ledger {:?} ends in a partial line; terminating it", self.path);
            writer.write_all(b"\n")?;
        }
        let line = serde_json::to_string(&record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);
        file.sync_data()?;

        file.unlock()?;

        tracing::debug!(
            "Appended {} record {} to ledger",
            record.entry_type.as_str(),
            record.pump_id
        );
        Ok(record)
    }

    fn find_by_pump_id(&self, pump_id: u64) -> Result<Option<LedgerRecord>> {
        Ok(self.records()?.into_iter().find(|r| r.pump_id == pump_id))
    }

    fn records(&self) -> Result<Vec<LedgerRecord>> {
        read_records(&self.path)
    }
}

/// Read all records from a ledger file
pub fn read_records(path: &Path) -> Result<Vec<LedgerRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;
    let records = scan_records(&file);
    file.unlock()?;

    let records = records?;
    tracing::debug!("Read {} records from ledger", records.len());
    Ok(records)
}

fn scan_records(file: &File) -> Result<Vec<LedgerRecord>> {
    Ok(scan_lines(file)?.records)
}

/// Parsed records plus the number of non-empty lines, readable or not
struct LedgerScan {
    records: Vec<LedgerRecord>,
    line_count: u64,
}

fn scan_lines(file: &File) -> Result<LedgerScan> {
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut line_count = 0;

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        line_count += 1;

        match serde_json::from_str::<LedgerRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("Failed to parse ledger record at line {}: {}", line_num + 1, e);
            }
        }
    }

    Ok(LedgerScan {
        records,
        line_count,
    })
}

/// Whether the file is empty or its last byte is a newline.
fn ends_with_newline(mut file: &File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// In-memory ledger store
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<LedgerRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    fn append(&self, record: NewLedgerRecord) -> Result<LedgerRecord> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Ledger("ledger lock poisoned".into()))?;
        let next_id = records.last().map_or(1, |r| r.pump_id + 1);
        let record = record.with_id(next_id);
        records.push(record.clone());
        Ok(record)
    }

    fn find_by_pump_id(&self, pump_id: u64) -> Result<Option<LedgerRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Ledger("ledger lock poisoned".into()))?;
        Ok(records.iter().find(|r| r.pump_id == pump_id).cloned())
    }

    fn records(&self) -> Result<Vec<LedgerRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Ledger("ledger lock poisoned".into()))?;
        Ok(records.clone())
    }
}

/// Ledger front used by the pod operations
///
/// Stamps each record with the current pod serial and hands back the
/// assigned pump id.
#[derive(Clone)]
pub struct AuditLedger {
    store: Arc<dyn LedgerStore>,
    pod_state: Arc<dyn PodStateView>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, pod_state: Arc<dyn PodStateView>) -> Self {
        Self { store, pod_state }
    }

    /// Append one record and return its pump id.
    pub fn append(
        &self,
        request_time: DateTime<Utc>,
        entry_type: LedgerEntryType,
        data: LedgerData,
        success: bool,
    ) -> Result<u64> {
        let device_serial = self
            .pod_state
            .address()
            .map_or_else(|| "None".to_string(), |a| a.to_string());
        let record = self.store.append(NewLedgerRecord {
            request_time,
            entry_type,
            success,
            data: data.into_payload()?,
            device_serial,
        })?;
        Ok(record.pump_id)
    }

    pub fn append_success(&self, entry_type: LedgerEntryType, data: LedgerData) -> Result<u64> {
        self.append(Utc::now(), entry_type, data, true)
    }

    pub fn append_failure(&self, entry_type: LedgerEntryType, data: LedgerData) -> Result<u64> {
        self.append(Utc::now(), entry_type, data, false)
    }

    pub fn find_by_pump_id(&self, pump_id: u64) -> Result<Option<LedgerRecord>> {
        self.store.find_by_pump_id(pump_id)
    }

    pub fn records(&self) -> Result<Vec<LedgerRecord>> {
        self.store.records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::SharedPodState;

    fn new_record(entry_type: LedgerEntryType) -> NewLedgerRecord {
        NewLedgerRecord {
            request_time: Utc::now(),
            entry_type,
            success: true,
            data: None,
            device_serial: "None".into(),
        }
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = JsonlLedger::new(temp_dir.path().join("ledger.jsonl"));

        let first = ledger.append(new_record(LedgerEntryType::GetPodStatus)).unwrap();
        let second = ledger.append(new_record(LedgerEntryType::SetTime)).unwrap();

        assert_eq!(first.pump_id, 1);
        assert_eq!(second.pump_id, 2);
        assert_eq!(ledger.records().unwrap().len(), 2);
    }

    #[test]
    fn test_find_by_pump_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = JsonlLedger::new(temp_dir.path().join("ledger.jsonl"));

        ledger.append(new_record(LedgerEntryType::GetPodStatus)).unwrap();
        let fake = ledger.append(new_record(LedgerEntryType::SetFakeSuspendedTbr)).unwrap();

        let found = ledger.find_by_pump_id(fake.pump_id).unwrap().unwrap();
        assert_eq!(found.entry_type, LedgerEntryType::SetFakeSuspendedTbr);
        assert!(ledger.find_by_pump_id(99).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ledger.jsonl");
        let ledger = JsonlLedger::new(&path);
        ledger.append(new_record(LedgerEntryType::SetTime)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ not json").unwrap();
        drop(file);

        // The unreadable line keeps its slot; its id is not handed out again.
        let next = ledger.append(new_record(LedgerEntryType::SetTime)).unwrap();
        assert_eq!(next.pump_id, 3);
        assert_eq!(read_records(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_torn_tail_does_not_swallow_next_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ledger.jsonl");
        let ledger = JsonlLedger::new(&path);
        ledger.append(new_record(LedgerEntryType::SetTime)).unwrap();

        // Crash in the middle of writing record 2
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"pump_id\":2,\"request_ti").unwrap();
        drop(file);

        let bolus = ledger.append(new_record(LedgerEntryType::SetBolus)).unwrap();
        assert_eq!(bolus.pump_id, 3);
        let found = ledger.find_by_pump_id(bolus.pump_id).unwrap().unwrap();
        assert_eq!(found.entry_type, LedgerEntryType::SetBolus);

        let next = ledger.append(new_record(LedgerEntryType::SetTime)).unwrap();
        assert_eq!(next.pump_id, 4);

        let ids: Vec<u64> = read_records(&path)
            .unwrap()
            .iter()
            .map(|r| r.pump_id)
            .collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn test_read_missing_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let records = read_records(&temp_dir.path().join("missing.jsonl")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_entry_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&LedgerEntryType::CancelTemporaryBasalByEngine).unwrap();
        assert_eq!(json, "\"CANCEL_TEMPORARY_BASAL_BY_ENGINE\"");
        assert_eq!(
            LedgerEntryType::InsertCannula.as_str(),
            "INSERT_CANNULA"
        );
    }

    #[test]
    fn test_audit_ledger_serializes_payload_and_serial() {
        let pod_state = Arc::new(SharedPodState::activated(0x1f00_0001));
        let ledger = AuditLedger::new(Arc::new(MemoryLedger::new()), pod_state.clone());

        let id = ledger
            .append_success(
                LedgerEntryType::SetTemporaryBasal,
                LedgerData::json(&serde_json::json!({ "rate": 0.5, "minutes": 30 })).unwrap(),
            )
            .unwrap();
        let text_id = ledger
            .append_failure(LedgerEntryType::SetTime, LedgerData::text("nonce out of sync"))
            .unwrap();

        let record = ledger.find_by_pump_id(id).unwrap().unwrap();
        assert!(record.success);
        assert_eq!(record.device_serial, (0x1f00_0001u32).to_string());
        assert!(record.data.unwrap().contains("\"rate\":0.5"));

        let text = ledger.find_by_pump_id(text_id).unwrap().unwrap();
        assert!(!text.success);
        assert_eq!(text.data.as_deref(), Some("nonce out of sync"));

        pod_state.discard_state();
        let after = ledger
            .append_success(LedgerEntryType::DiscardPod, LedgerData::None)
            .unwrap();
        assert_eq!(ledger.find_by_pump_id(after).unwrap().unwrap().device_serial, "None");
    }
}
