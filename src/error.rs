//! Custom error types for the application.
//!
//! This module defines the primary error type, `PlateFlowError`, for the
//! entire crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of plate-transfer
//! orchestration, from configuration and I/O problems to work-order specific
//! conditions such as well-name validation and allocator exhaustion.
//!
//! Recoverable conditions (capacity exhaustion, reservation conflicts) are
//! reported as ordinary return values; nothing in this crate is silently
//! retried. Retry policy belongs to the orchestration layer.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PlateFlowError>;

#[derive(Error, Debug)]
pub enum PlateFlowError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid well name '{0}'")]
    InvalidWell(String),

    #[error("Unsupported well count: {0}")]
    InvalidWellCount(usize),

    #[error("Unknown labware '{0}'")]
    LabwareUnknown(String),

    #[error("Plate with barcode {0} does not exist")]
    PlateNotFound(String),

    #[error("All destination plates are full")]
    CapacityExceeded,

    #[error("Scheduler is not configured: {0} has not been set")]
    NotConfigured(&'static str),

    #[error("Scheduler is {0} and cannot accept this operation")]
    InvalidSchedulerState(&'static str),

    #[error("Work order parse error: {0}")]
    Parse(String),
}

impl From<quick_xml::Error> for PlateFlowError {
    fn from(err: quick_xml::Error) -> Self {
        PlateFlowError::Parse(err.to_string())
    }
}
