//! `digiweight-types` – shared data model for the digiweight bridge.
//!
//! Everything that crosses a crate or process boundary lives here:
//!
//! - [`Command`] – the closed set of actuator commands and their one-line
//!   JSON wire form.
//! - [`DeviceState`] – the latest raw telemetry reported by the device,
//!   keyed by [`TelemetryKey`].
//! - [`ProcessedTelemetry`] – the derived record consumers receive.
//! - [`CalibrationSet`] and [`GyroOffset`] – sensor-processing inputs.

pub mod calibration;
pub mod command;
pub mod telemetry;

pub use calibration::{CalibrationSet, GyroOffset, Vector3};
pub use command::{Command, ForceProfile, Toggle};
pub use telemetry::{DeviceState, ProcessedTelemetry, TelemetryKey, TelemetryValue};

use thiserror::Error;

/// Errors raised while building, encoding or decoding a [`Command`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("invalid {field} '{value}', expected one of {expected}")]
    InvalidKind {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("{command} {field} must be finite, got {value}")]
    NonFinite {
        command: &'static str,
        field: &'static str,
        value: f64,
    },

    #[error("command encode error: {0}")]
    Encode(String),

    #[error("command decode error: {0}")]
    Decode(String),
}
