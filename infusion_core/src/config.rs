//! Configuration file support for podctl.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/podctl/config.toml`.
//! Every field has a default, so a partial file is valid.

use crate::sync::SplitRounding;
use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub beeps: BeepConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    #[serde(default)]
    pub device: DeviceConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Confirmation beeps per command family
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeepConfig {
    #[serde(default = "default_true")]
    pub basal: bool,
    #[serde(default = "default_true")]
    pub bolus: bool,
    #[serde(default)]
    pub smb: bool,
    #[serde(default)]
    pub tbr: bool,
}

impl Default for BeepConfig {
    fn default() -> Self {
        Self {
            basal: true,
            bolus: true,
            smb: false,
            tbr: false,
        }
    }
}

/// Sound for notifications about uncertain outcomes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub uncertain_tbr_sound: bool,
    #[serde(default = "default_true")]
    pub uncertain_smb_sound: bool,
    #[serde(default = "default_true")]
    pub uncertain_bolus_sound: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            uncertain_tbr_sound: true,
            uncertain_smb_sound: true,
            uncertain_bolus_sound: true,
        }
    }
}

/// Reconciliation policy constants
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default)]
    pub split_rounding: SplitRounding,

    /// Span of a synthetic suspended TBR
    #[serde(default = "default_service_duration_hours")]
    pub service_duration_hours: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            split_rounding: SplitRounding::default(),
            service_duration_hours: default_service_duration_hours(),
        }
    }
}

impl ReconciliationConfig {
    /// Span of the synthetic suspended TBR, clamped to the accepted range.
    pub fn service_duration(&self) -> Duration {
        let hours = self
            .service_duration_hours
            .clamp(1, MAX_SERVICE_DURATION_HOURS);
        Duration::try_hours(hours)
            .unwrap_or_else(|| Duration::hours(default_service_duration_hours()))
    }
}

/// Pod delivery granularity and activation alerts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_step")]
    pub basal_step: f64,
    #[serde(default = "default_step")]
    pub bolus_step: f64,
    #[serde(default = "default_expiration_reminder_hours")]
    pub expiration_reminder_hours: Option<u32>,
    #[serde(default = "default_low_reservoir_units")]
    pub low_reservoir_units: Option<f64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            basal_step: default_step(),
            bolus_step: default_step(),
            expiration_reminder_hours: default_expiration_reminder_hours(),
            low_reservoir_units: default_low_reservoir_units(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("podctl")
}

fn default_true() -> bool {
    true
}

/// Upper bound for `service_duration_hours` (30 days)
pub const MAX_SERVICE_DURATION_HOURS: i64 = 24 * 30;

fn default_service_duration_hours() -> i64 {
    80
}

fn default_step() -> f64 {
    0.05
}

fn default_expiration_reminder_hours() -> Option<u32> {
    Some(7)
}

fn default_low_reservoir_units() -> Option<f64> {
    Some(10.0)
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(std::env::temp_dir);
        base.join("podctl").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let hours = self.reconciliation.service_duration_hours;
        if !(1..=MAX_SERVICE_DURATION_HOURS).contains(&hours) {
            return Err(Error::Config(format!(
                "reconciliation.service_duration_hours must be between 1 and {}, got {}",
                MAX_SERVICE_DURATION_HOURS, hours
            )));
        }
        for (name, step) in [
            ("basal_step", self.device.basal_step),
            ("bolus_step", self.device.bolus_step),
        ] {
            if !(step > 0.0) || !step.is_finite() {
                return Err(Error::Config(format!(
                    "device.{name} must be a positive number, got {step}"
                )));
            }
        }
        Ok(())
    }
}
