use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use infusion_core::ledger::read_records;
use infusion_core::notify::{NotifierEvent, RecordingNotifier};
use infusion_core::pod::SharedPodState;
use infusion_core::recovery::FileDurableStore;
use infusion_core::sync::{MemoryPumpSync, PumpSync};
use infusion_core::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Address of the simulated pod
const SIMULATED_POD_ADDRESS: u32 = 0x1f0b_3557;

#[derive(Parser)]
#[command(name = "podctl")]
#[command(about = "Insulin pod command and reconciliation tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Set or cancel temporary basal rates
    Tbr {
        #[command(subcommand)]
        action: TbrCommand,
    },

    /// Deliver a bolus and wait for it to finish
    Bolus {
        /// Units to deliver
        #[arg(long)]
        units: f64,

        /// Deliver as an automated SMB
        #[arg(long)]
        smb: bool,

        /// Units the simulated pod reports delivered
        #[arg(long)]
        delivered: Option<f64>,

        /// Make the bolus start fail
        #[arg(long, value_enum)]
        fail: Option<FailMode>,
    },

    /// Record a bolus interrupted by a crash
    Recover,

    /// Inspect the audit ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
}

#[derive(Subcommand)]
enum TbrCommand {
    /// Start a temporary basal
    Set {
        /// Rate in U/h
        #[arg(long)]
        rate: f64,

        /// Duration in minutes
        #[arg(long)]
        minutes: u32,

        #[arg(long, value_enum)]
        fail: Option<FailMode>,
    },

    /// Cancel the running temporary basal
    Cancel {
        #[arg(long, value_enum)]
        fail: Option<FailMode>,
    },

    /// Record that the pod is not delivering basal
    SuspendFake,

    /// Clear the synthetic suspended TBR
    ResumeFake,
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Print the most recent records
    Show {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Append new records to a CSV file
    Export {
        /// CSV path (defaults to ledger.csv in the data directory)
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

/// Failure injected into the simulated pod
#[derive(Clone, Copy, Debug, ValueEnum)]
enum FailMode {
    /// The pod provably did not act
    Certain,
    /// The link dropped after the command was sent
    Uncertain,
    /// The step before the command failed uncertainly
    Preceding,
}

impl FailMode {
    fn failure(self) -> DeviceFailure {
        match self {
            FailMode::Certain => DeviceFailure::new(FailureKind::NonceError, "simulated nonce error"),
            FailMode::Uncertain => {
                DeviceFailure::new(FailureKind::TransportTimeout, "simulated lost reply")
            }
            FailMode::Preceding => {
                DeviceFailure::new(FailureKind::TransportTimeout, "simulated lost cancel")
                    .with_stage(FailureStage::PrecedingUncertain)
            }
        }
    }
}

/// Everything one invocation works against
struct Session {
    manager: PodManager,
    driver: Arc<ScriptedDriver>,
    pump_sync: Arc<MemoryPumpSync>,
    notifier: Arc<RecordingNotifier>,
    state_path: PathBuf,
}

impl Session {
    fn open(data_dir: &Path, config: &Config) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let state_path = data_dir.join("pump_state.json");

        let pod_state = Arc::new(SharedPodState::activated(SIMULATED_POD_ADDRESS));
        let driver = Arc::new(ScriptedDriver::new(pod_state.clone()));
        let pump_sync = Arc::new(MemoryPumpSync::load(&state_path)?);
        let notifier = Arc::new(RecordingNotifier::new());

        let ctx = PodContext::new(
            driver.clone(),
            Arc::new(JsonlLedger::new(data_dir.join("ledger.jsonl"))),
            pump_sync.clone(),
            Arc::new(FileDurableStore::new(data_dir.join("recovery"))),
            notifier.clone(),
            pod_state,
            config.clone(),
        );

        Ok(Self {
            manager: PodManager::new(ctx),
            driver,
            pump_sync,
            notifier,
            state_path,
        })
    }

    fn close(self) -> Result<()> {
        for event in self.notifier.events() {
            match event {
                NotifierEvent::Notified(n) => println!("! [{:?}] {}", n.id, n.message),
                NotifierEvent::PodFault(code) => println!("! Pod fault {:?}", code),
                NotifierEvent::Dismissed(_) | NotifierEvent::Progress { .. } => {}
            }
        }
        self.pump_sync.save(&self.state_path)
    }

    fn print_active_tbr(&self) {
        match self.pump_sync.expected_temporary_basal(Utc::now()) {
            Some(tbr) => println!(
                "  Active TBR: {} U/h for {} min ({:?}, pump id {})",
                tbr.rate, tbr.duration_minutes, tbr.tbr_type, tbr.pump_id
            ),
            None => println!("  No active TBR"),
        }
    }
}

fn main() -> Result<()> {
    infusion_core::logging::init_with_level("warn");

    let cli = Cli::parse();

    let config = Config::load()?;
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    tracing::debug!("Using data directory {:?}", data_dir);

    match cli.command {
        Commands::Tbr { action } => cmd_tbr(&data_dir, &config, action),
        Commands::Bolus {
            units,
            smb,
            delivered,
            fail,
        } => cmd_bolus(&data_dir, &config, units, smb, delivered, fail),
        Commands::Recover => cmd_recover(&data_dir, &config),
        Commands::Ledger { action } => cmd_ledger(&data_dir, action),
    }
}

fn cmd_tbr(data_dir: &Path, config: &Config, action: TbrCommand) -> Result<()> {
    let session = Session::open(data_dir, config)?;
    let tbr = session.manager.tbr();

    match action {
        TbrCommand::Set {
            rate,
            minutes,
            fail,
        } => {
            if let Some(mode) = fail {
                session
                    .driver
                    .fail_next(CommandType::SetTemporaryBasal, mode.failure());
            }
            let result = session.manager.set_temporary_basal(rate, minutes)?;
            print_result("Set temporary basal", &result);
        }
        TbrCommand::Cancel { fail } => {
            if let Some(mode) = fail {
                session
                    .driver
                    .fail_next(CommandType::CancelTemporaryBasal, mode.failure());
            }
            let result = session.manager.cancel_temporary_basal()?;
            print_result("Cancel temporary basal", &result);
        }
        TbrCommand::SuspendFake => {
            if tbr.create_suspended_fake_if_not_exists()? {
                println!("✓ Recorded suspended delivery");
            } else {
                println!("Suspended delivery already recorded");
            }
        }
        TbrCommand::ResumeFake => {
            if tbr.cancel_suspended_fake_if_exists()? {
                println!("✓ Cleared suspended delivery");
            } else {
                println!("No suspended delivery recorded");
            }
        }
    }

    session.print_active_tbr();
    session.close()
}

fn cmd_bolus(
    data_dir: &Path,
    config: &Config,
    units: f64,
    smb: bool,
    delivered: Option<f64>,
    fail: Option<FailMode>,
) -> Result<()> {
    if !units.is_finite() || units <= 0.0 {
        return Err(Error::Other(format!("invalid bolus size: {units}")));
    }

    let session = Session::open(data_dir, config)?;
    if let Some(delivered) = delivered {
        session.driver.set_delivered_fraction(delivered / units);
    }
    if let Some(mode) = fail {
        session.driver.fail_next(CommandType::BolusStart, mode.failure());
    }

    let bolus_type = if smb { BolusType::Smb } else { BolusType::Normal };
    let result = session
        .manager
        .deliver_bolus(BolusRequest::new(units, bolus_type))?;
    print_result("Bolus", &result);
    if let Some(delivered) = result.bolus_delivered {
        println!("  Delivered: {:.2} U", delivered);
    }

    session.close()
}

fn cmd_recover(data_dir: &Path, config: &Config) -> Result<()> {
    let session = Session::open(data_dir, config)?;
    let result = session.manager.recover_active_bolus()?;

    match result.bolus_delivered {
        Some(units) => println!("✓ Recovered interrupted bolus of {:.2} U", units),
        None if result.success => println!("No interrupted bolus found."),
        None => print_result("Recover bolus", &result),
    }

    session.close()
}

fn cmd_ledger(data_dir: &Path, action: LedgerCommand) -> Result<()> {
    let ledger_path = data_dir.join("ledger.jsonl");
    let records = read_records(&ledger_path)?;

    match action {
        LedgerCommand::Show { limit } => {
            if records.is_empty() {
                println!("Ledger is empty.");
                return Ok(());
            }
            let skip = records.len().saturating_sub(limit);
            for record in &records[skip..] {
                println!(
                    "{:>5}  {}  {:<34} {:<6} {}",
                    record.pump_id,
                    record.request_time.format("%Y-%m-%d %H:%M:%S"),
                    record.entry_type.as_str(),
                    if record.success { "ok" } else { "FAILED" },
                    record.data.as_deref().unwrap_or("")
                );
            }
        }
        LedgerCommand::Export { csv } => {
            let csv_path = csv.unwrap_or_else(|| data_dir.join("ledger.csv"));
            let count = infusion_core::export::export_csv(&records, &csv_path)?;
            println!("✓ Exported {} records to CSV", count);
            println!("  CSV: {}", csv_path.display());
        }
    }

    Ok(())
}

fn print_result(label: &str, result: &EnactResult) {
    if result.success {
        println!("✓ {}", label);
    } else {
        println!(
            "✗ {} failed: {}",
            label,
            result.comment.as_deref().unwrap_or("unknown error")
        );
    }
}
