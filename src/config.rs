//! Application configuration.
//!
//! Settings load from (in order of precedence):
//! 1. Environment variables prefixed with `PLATEFLOW_` (sections separated
//!    by a double underscore, e.g. `PLATEFLOW_SCHEDULER__POLL_INTERVAL=50ms`)
//! 2. A TOML configuration file (default: `plateflow.toml`)
//! 3. Built-in defaults
//!
//! After loading, configuration is validated; semantic problems surface as
//! `Configuration` errors before any hardware is touched.

use crate::error::{AppResult, PlateFlowError};
use crate::labware::{LabwareFormat, StandardLabwareDatabase};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub scheduler: SchedulerSettings,
    /// Additional labware known to this deployment, referenced by
    /// work-order `labware_id` values.
    #[serde(default)]
    pub labware: Vec<LabwareDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name used in logs.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Interval at which the run loop re-checks for hand-off capacity and
    /// control commands.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long to wait for a plate-movement job to complete.
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
    /// How long to keep retrying a hand-off slot claim.
    #[serde(with = "humantime_serde")]
    pub claim_timeout: Duration,
    /// Capacity of the scheduler command channel.
    pub command_channel_capacity: usize,
    /// Capacity of the scheduler event broadcast channel.
    pub event_channel_capacity: usize,
    /// Deck hand-off positions on the simulated transfer station.
    pub deck_positions: usize,
    /// Disposable tips available to the simulated tip-box manager.
    pub tip_supply: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabwareDefinition {
    pub name: String,
    pub wells: usize,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "plateflow".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            job_timeout: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(10),
            command_channel_capacity: 16,
            event_channel_capacity: 64,
            deck_positions: 4,
            tip_supply: 960,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            scheduler: SchedulerSettings::default(),
            labware: Vec::new(),
        }
    }
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Settings {
    /// Load settings from the given file (or `plateflow.toml`), environment
    /// overrides applied on top, then validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let file = path.unwrap_or_else(|| Path::new("plateflow.toml"));
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("PLATEFLOW_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(PlateFlowError::Configuration(format!(
                "invalid log level '{}'",
                self.application.log_level
            )));
        }
        if self.scheduler.poll_interval.is_zero() {
            return Err(PlateFlowError::Configuration(
                "scheduler poll_interval must be non-zero".to_string(),
            ));
        }
        if self.scheduler.deck_positions == 0 {
            return Err(PlateFlowError::Configuration(
                "scheduler deck_positions must be at least 1".to_string(),
            ));
        }
        for definition in &self.labware {
            LabwareFormat::for_well_count(definition.wells).map_err(|_| {
                PlateFlowError::Configuration(format!(
                    "labware '{}' has unsupported well count {}",
                    definition.name, definition.wells
                ))
            })?;
        }
        Ok(())
    }

    /// Labware database seeded with the standard formats plus the
    /// deployment's configured labware.
    pub fn labware_database(&self) -> AppResult<StandardLabwareDatabase> {
        let mut database = StandardLabwareDatabase::new();
        for definition in &self.labware {
            database.register(definition.name.clone(), definition.wells)?;
        }
        Ok(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::LabwareDatabase;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.scheduler.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(PlateFlowError::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_labware_rejected() {
        let mut settings = Settings::default();
        settings.labware.push(LabwareDefinition {
            name: "odd".to_string(),
            wells: 100,
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_labware_database_includes_configured_entries() {
        let mut settings = Settings::default();
        settings.labware.push(LabwareDefinition {
            name: "greiner_384_square".to_string(),
            wells: 384,
        });
        let database = settings.labware_database().unwrap();
        assert_eq!(
            database.labware("greiner_384_square").unwrap().format,
            LabwareFormat::STANDARD_384
        );
    }
}
