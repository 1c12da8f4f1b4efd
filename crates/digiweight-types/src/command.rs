//! Operator commands forwarded to the actuator.
//!
//! Each [`Command`] variant is serialised as a single-line JSON object whose
//! `command` field carries the variant tag, e.g.
//!
//! ```json
//! {"command":"SET_PULSE","type":"on","duration":50,"strength":80,"frequency":10}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CommandError;

/// On/off switch used by most command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toggle {
    Off,
    On,
}

impl FromStr for Toggle {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Toggle::Off),
            "on" => Ok(Toggle::On),
            other => Err(CommandError::InvalidKind {
                field: "type",
                value: other.to_string(),
                expected: "off|on",
            }),
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Toggle::Off => write!(f, "off"),
            Toggle::On => write!(f, "on"),
        }
    }
}

/// Force profile applied by `SET_FORCE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForceProfile {
    Off,
    Constant,
    Linear,
}

impl FromStr for ForceProfile {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(ForceProfile::Off),
            "constant" => Ok(ForceProfile::Constant),
            "linear" => Ok(ForceProfile::Linear),
            other => Err(CommandError::InvalidKind {
                field: "type",
                value: other.to_string(),
                expected: "off|constant|linear",
            }),
        }
    }
}

impl fmt::Display for ForceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForceProfile::Off => write!(f, "off"),
            ForceProfile::Constant => write!(f, "constant"),
            ForceProfile::Linear => write!(f, "linear"),
        }
    }
}

/// A single actuator command.
///
/// The set of variants is closed: the bridge rejects any JSON body that does
/// not deserialise into one of them, so a malformed command never reaches the
/// serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Vibration pulse.
    SetPulse {
        #[serde(rename = "type")]
        kind: Toggle,
        duration: i64,
        strength: i64,
        frequency: i64,
    },
    /// Evenly spaced detents along the travel.
    SetDetents {
        #[serde(rename = "type")]
        kind: Toggle,
        strength: i64,
        start_position: f64,
        step_position: f64,
        total_steps: i64,
    },
    /// Position-dependent resisting force.
    SetForce {
        #[serde(rename = "type")]
        kind: ForceProfile,
        strength: i64,
        start_strength: i64,
        start_position: f64,
        saturation_position: f64,
    },
    /// Switch the device operating mode.
    SetMode {
        #[serde(rename = "type")]
        kind: Toggle,
    },
    /// Rowing-machine emulation.
    SetRow {
        #[serde(rename = "type")]
        kind: Toggle,
        damping: i64,
        gear_ratio: i64,
        inertia: i64,
    },
}

impl Command {
    /// The wire tag of this command, e.g. `"SET_PULSE"`.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetPulse { .. } => "SET_PULSE",
            Command::SetDetents { .. } => "SET_DETENTS",
            Command::SetForce { .. } => "SET_FORCE",
            Command::SetMode { .. } => "SET_MODE",
            Command::SetRow { .. } => "SET_ROW",
        }
    }

    /// Reject NaN and infinite positions, which JSON would carry as `null`.
    pub fn validate(&self) -> Result<(), CommandError> {
        let positions: Vec<(&'static str, f64)> = match self {
            Command::SetDetents {
                start_position,
                step_position,
                ..
            } => vec![("start_position", *start_position), ("step_position", *step_position)],
            Command::SetForce {
                start_position,
                saturation_position,
                ..
            } => vec![
                ("start_position", *start_position),
                ("saturation_position", *saturation_position),
            ],
            Command::SetPulse { .. } | Command::SetMode { .. } | Command::SetRow { .. } => Vec::new(),
        };
        match positions.into_iter().find(|(_, value)| !value.is_finite()) {
            Some((field, value)) => Err(CommandError::NonFinite {
                command: self.name(),
                field,
                value,
            }),
            None => Ok(()),
        }
    }

    /// Encode as the one-line JSON form written to the device (without the
    /// trailing terminator).
    pub fn to_wire(&self) -> Result<String, CommandError> {
        self.validate()?;
        serde_json::to_string(self).map_err(|e| CommandError::Encode(e.to_string()))
    }

    /// Decode a wire line back into a [`Command`].
    pub fn from_wire(line: &str) -> Result<Self, CommandError> {
        serde_json::from_str(line.trim()).map_err(|e| CommandError::Decode(e.to_string()))
    }
}
