//! CSV export of the audit ledger.
//!
//! Exports are incremental: records already present in the CSV (by pump id)
//! are skipped, so the same file can be refreshed repeatedly.

use crate::ledger::LedgerRecord;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CsvRow {
    pump_id: u64,
    request_time: String,
    entry_type: String,
    success: bool,
    device_serial: String,
    data: Option<String>,
}

impl From<&LedgerRecord> for CsvRow {
    fn from(record: &LedgerRecord) -> Self {
        CsvRow {
            pump_id: record.pump_id,
            request_time: record.request_time.to_rfc3339(),
            entry_type: record.entry_type.as_str().to_string(),
            success: record.success,
            device_serial: record.device_serial.clone(),
            data: record.data.clone(),
        }
    }
}

/// Append ledger records not yet in `csv_path`, returning how many were
/// written. The file is synced before returning.
pub fn export_csv(records: &[LedgerRecord], csv_path: &Path) -> Result<usize> {
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let last_exported = last_exported_id(csv_path)?;
    let pending: Vec<&LedgerRecord> = records
        .iter()
        .filter(|r| last_exported.map_or(true, |last| r.pump_id > last))
        .collect();

    if pending.is_empty() {
        tracing::info!("No new ledger records to export");
        return Ok(0);
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);
    for record in &pending {
        writer.serialize(CsvRow::from(*record))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} ledger records to {:?}", pending.len(), csv_path);
    Ok(pending.len())
}

fn last_exported_id(csv_path: &Path) -> Result<Option<u64>> {
    if !csv_path.exists() {
        return Ok(None);
    }

    let mut reader = csv::Reader::from_reader(File::open(csv_path)?);
    let mut last = None;
    for row in reader.deserialize::<CsvRow>() {
        match row {
            Ok(row) => last = last.max(Some(row.pump_id)),
            Err(e) => tracing::warn!("Skipping unreadable row in {:?}: {}", csv_path, e),
        }
    }
    Ok(last)
}
