//! End-to-end tests for the podctl binary.
//!
//! Each test runs against its own temporary data directory so the ledger,
//! pump-state snapshot and recovery slot never leak between tests.

use assert_cmd::Command;
use predicates::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::thread;
use tempfile::TempDir;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("podctl"))
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn ledger_lines(data_dir: &Path) -> Vec<serde_json::Value> {
    let contents = fs::read_to_string(data_dir.join("ledger.jsonl")).unwrap_or_default();
    contents
        .lines()
        .map(|line| serde_json::from_str(line).expect("ledger line is JSON"))
        .collect()
}

fn entry_types(data_dir: &Path) -> Vec<String> {
    ledger_lines(data_dir)
        .iter()
        .map(|v| v["entry_type"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn test_help_output() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Insulin pod command and reconciliation tool",
        ))
        .stdout(predicate::str::contains("tbr"))
        .stdout(predicate::str::contains("bolus"))
        .stdout(predicate::str::contains("ledger"));
}

#[test]
fn test_set_tbr_records_and_tracks() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["tbr", "set", "--rate", "0.5", "--minutes", "30", "--data-dir"])
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Set temporary basal"))
        .stdout(predicate::str::contains("Active TBR: 0.5 U/h for 30 min"));

    assert_eq!(entry_types(data_dir), vec!["SET_TEMPORARY_BASAL"]);
    let record = &ledger_lines(data_dir)[0];
    assert_eq!(record["success"], true);
    assert_eq!(record["pump_id"], 1);
    assert!(data_dir.join("pump_state.json").exists());
}

#[test]
fn test_certain_tbr_failure_leaves_no_tbr() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["tbr", "set", "--rate", "1.2", "--minutes", "60", "--fail", "certain"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✗ Set temporary basal failed"))
        .stdout(predicate::str::contains("No active TBR"));

    let lines = ledger_lines(data_dir);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["success"], false);
}

#[test]
fn test_uncertain_tbr_failure_assumes_running() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["tbr", "set", "--rate", "1.2", "--minutes", "60", "--fail", "uncertain"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✗ Set temporary basal failed"))
        .stdout(predicate::str::contains("Active TBR: 1.2 U/h for 60 min"))
        .stdout(predicate::str::contains("! [TbrAlerts]"));
}

#[test]
fn test_uncertain_cancel_splits_tbr() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["tbr", "set", "--rate", "0.5", "--minutes", "30"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();

    cli()
        .args(["tbr", "cancel", "--fail", "uncertain"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✗ Cancel temporary basal failed"))
        .stdout(predicate::str::contains("Active TBR: 0.5 U/h for"));

    assert_eq!(
        entry_types(data_dir),
        vec![
            "SET_TEMPORARY_BASAL",
            "CANCEL_TEMPORARY_BASAL_BY_ENGINE",
            "SPLIT_TEMPORARY_BASAL",
            "CANCEL_TEMPORARY_BASAL",
        ]
    );
    let lines = ledger_lines(data_dir);
    assert_eq!(lines[3]["success"], false);
}

#[test]
fn test_cancel_tbr_clears_view() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["tbr", "set", "--rate", "2.0", "--minutes", "90"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();

    cli()
        .args(["tbr", "cancel"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Cancel temporary basal"))
        .stdout(predicate::str::contains("No active TBR"));
}

#[test]
fn test_suspend_fake_is_created_once() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["tbr", "suspend-fake"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Recorded suspended delivery"))
        .stdout(predicate::str::contains("EmulatedSuspend"));

    cli()
        .args(["tbr", "suspend-fake"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("already recorded"));

    let fakes = entry_types(data_dir)
        .iter()
        .filter(|t| *t == "SET_FAKE_SUSPENDED_TBR")
        .count();
    assert_eq!(fakes, 1);

    cli()
        .args(["tbr", "resume-fake"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Cleared suspended delivery"))
        .stdout(predicate::str::contains("No active TBR"));
}

#[test]
fn test_bolus_reports_actual_delivery() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["bolus", "--units", "2.0", "--delivered", "1.9"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Bolus"))
        .stdout(predicate::str::contains("Delivered: 1.90 U"));

    assert_eq!(entry_types(data_dir), vec!["SET_BOLUS"]);
    assert!(!data_dir.join("recovery/active_bolus.json").exists());
}

#[test]
fn test_uncertain_bolus_counts_full_amount() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["bolus", "--units", "2.0", "--fail", "uncertain"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✗ Bolus failed"))
        .stdout(predicate::str::contains("Delivered: 2.00 U"))
        .stdout(predicate::str::contains("! [UncertainBolus]"));

    let lines = ledger_lines(data_dir);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["success"], false);
}

#[test]
fn test_invalid_bolus_size_is_rejected() {
    let temp_dir = setup_test_dir();

    cli()
        .args(["bolus", "--units", "0"])
        .arg("--data-dir")
        .arg(temp_dir.path())
        .assert()
        .failure();

    assert!(!temp_dir.path().join("ledger.jsonl").exists());
}

#[test]
fn test_recover_interrupted_bolus() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    let recovery_dir = data_dir.join("recovery");
    fs::create_dir_all(&recovery_dir).unwrap();
    let slot = serde_json::json!({
        "request": {
            "id": "7d3c2d9e-5b1a-4f6e-9c2b-1a2b3c4d5e6f",
            "units": 1.5,
            "bolus_type": "normal",
        },
        "start_time": "2026-03-01T08:00:00Z",
        "pump_serial": "521893207",
    });
    fs::write(recovery_dir.join("active_bolus.json"), slot.to_string()).unwrap();

    cli()
        .arg("recover")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "✓ Recovered interrupted bolus of 1.50 U",
        ));

    assert_eq!(entry_types(data_dir), vec!["RECOVER_ACTIVE_BOLUS"]);
    assert!(!recovery_dir.join("active_bolus.json").exists());

    cli()
        .arg("recover")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("No interrupted bolus found."));
}

#[test]
fn test_recover_corrupt_slot() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    let recovery_dir = data_dir.join("recovery");
    fs::create_dir_all(&recovery_dir).unwrap();
    fs::write(recovery_dir.join("active_bolus.json"), "{ not json").unwrap();

    cli()
        .arg("recover")
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✗ Recover bolus failed"));

    assert!(!recovery_dir.join("active_bolus.json").exists());
}

#[test]
fn test_ledger_show_and_export() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    cli()
        .args(["ledger", "show"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Ledger is empty."));

    cli()
        .args(["tbr", "set", "--rate", "0.8", "--minutes", "30"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();
    cli()
        .args(["bolus", "--units", "1.0", "--smb"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();

    cli()
        .args(["ledger", "show", "--limit", "1"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("SET_BOLUS"))
        .stdout(predicate::str::contains("SET_TEMPORARY_BASAL").not());

    let csv_path = data_dir.join("export/ledger.csv");
    cli()
        .args(["ledger", "export", "--csv"])
        .arg(&csv_path)
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Exported 2 records to CSV"));

    cli()
        .args(["ledger", "export", "--csv"])
        .arg(&csv_path)
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("✓ Exported 0 records to CSV"));

    let csv = fs::read_to_string(&csv_path).unwrap();
    assert_eq!(csv.lines().count(), 3);
}

#[test]
fn test_corrupted_pump_state_is_ignored() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    fs::write(data_dir.join("pump_state.json"), "{ invalid json }}}}").unwrap();

    cli()
        .args(["tbr", "set", "--rate", "0.5", "--minutes", "30"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Active TBR: 0.5 U/h for 30 min"));

    let state = fs::read_to_string(data_dir.join("pump_state.json")).unwrap();
    serde_json::from_str::<serde_json::Value>(&state).expect("snapshot rewritten as JSON");
}

#[test]
fn test_corrupted_ledger_lines_are_skipped() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path();

    fs::write(data_dir.join("ledger.jsonl"), "{ invalid json }\n").unwrap();

    cli()
        .args(["bolus", "--units", "0.5"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success();

    cli()
        .args(["ledger", "show"])
        .arg("--data-dir")
        .arg(data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("SET_BOLUS"));
}

#[test]
fn test_concurrent_processes_get_unique_pump_ids() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let data_dir = data_dir.clone();
            thread::spawn(move || {
                cli()
                    .args(["bolus", "--units", "0.1", "--smb"])
                    .arg("--data-dir")
                    .arg(&data_dir)
                    .assert()
                    .success();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let ids: HashSet<u64> = ledger_lines(&data_dir)
        .iter()
        .map(|v| v["pump_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids.len(), 5);
}
