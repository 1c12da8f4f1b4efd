//! Raw device telemetry and the derived record handed to consumers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed set of telemetry keys the device may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryKey {
    AccelerometerX,
    AccelerometerY,
    AccelerometerZ,
    GyroX,
    GyroY,
    GyroZ,
    Force,
    Position,
    Velocity,
    VirtualVelocity,
    Status,
}

impl TelemetryKey {
    /// Every key, in wire order.
    pub const ALL: [TelemetryKey; 11] = [
        TelemetryKey::AccelerometerX,
        TelemetryKey::AccelerometerY,
        TelemetryKey::AccelerometerZ,
        TelemetryKey::GyroX,
        TelemetryKey::GyroY,
        TelemetryKey::GyroZ,
        TelemetryKey::Force,
        TelemetryKey::Position,
        TelemetryKey::Velocity,
        TelemetryKey::VirtualVelocity,
        TelemetryKey::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKey::AccelerometerX => "accelerometer_x",
            TelemetryKey::AccelerometerY => "accelerometer_y",
            TelemetryKey::AccelerometerZ => "accelerometer_z",
            TelemetryKey::GyroX => "gyro_x",
            TelemetryKey::GyroY => "gyro_y",
            TelemetryKey::GyroZ => "gyro_z",
            TelemetryKey::Force => "force",
            TelemetryKey::Position => "position",
            TelemetryKey::Velocity => "velocity",
            TelemetryKey::VirtualVelocity => "virtual_velocity",
            TelemetryKey::Status => "status",
        }
    }
}

impl FromStr for TelemetryKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TelemetryKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for TelemetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single telemetry reading: numeric when the device sent a plain
/// non-negative decimal, textual otherwise (status words, signed values).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Number(f64),
    Text(String),
}

impl TelemetryValue {
    /// Numeric view of the value. Text that parses as a float is accepted,
    /// anything else yields `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Number(n) => Some(*n),
            TelemetryValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Number(n) => write!(f, "{n}"),
            TelemetryValue::Text(s) => f.write_str(s),
        }
    }
}

/// Latest known state of the device.
///
/// Every field starts out `None` and keeps its last value until the device
/// reports it again; nothing is ever cleared, so readings go stale rather
/// than disappear while the link is down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default)]
    pub accelerometer_x: Option<TelemetryValue>,
    #[serde(default)]
    pub accelerometer_y: Option<TelemetryValue>,
    #[serde(default)]
    pub accelerometer_z: Option<TelemetryValue>,
    #[serde(default)]
    pub gyro_x: Option<TelemetryValue>,
    #[serde(default)]
    pub gyro_y: Option<TelemetryValue>,
    #[serde(default)]
    pub gyro_z: Option<TelemetryValue>,
    #[serde(default)]
    pub force: Option<TelemetryValue>,
    #[serde(default)]
    pub position: Option<TelemetryValue>,
    #[serde(default)]
    pub velocity: Option<TelemetryValue>,
    #[serde(default)]
    pub virtual_velocity: Option<TelemetryValue>,
    #[serde(default)]
    pub status: Option<TelemetryValue>,
}

impl DeviceState {
    pub fn get(&self, key: TelemetryKey) -> Option<&TelemetryValue> {
        self.slot(key).as_ref()
    }

    pub fn set(&mut self, key: TelemetryKey, value: TelemetryValue) {
        *self.slot_mut(key) = Some(value);
    }

    /// Numeric reading for `key`, defaulting to `0.0` when unset or
    /// non-numeric.
    pub fn number_or_zero(&self, key: TelemetryKey) -> f64 {
        self.get(key).and_then(TelemetryValue::as_f64).unwrap_or(0.0)
    }

    fn slot(&self, key: TelemetryKey) -> &Option<TelemetryValue> {
        match key {
            TelemetryKey::AccelerometerX => &self.accelerometer_x,
            TelemetryKey::AccelerometerY => &self.accelerometer_y,
            TelemetryKey::AccelerometerZ => &self.accelerometer_z,
            TelemetryKey::GyroX => &self.gyro_x,
            TelemetryKey::GyroY => &self.gyro_y,
            TelemetryKey::GyroZ => &self.gyro_z,
            TelemetryKey::Force => &self.force,
            TelemetryKey::Position => &self.position,
            TelemetryKey::Velocity => &self.velocity,
            TelemetryKey::VirtualVelocity => &self.virtual_velocity,
            TelemetryKey::Status => &self.status,
        }
    }

    fn slot_mut(&mut self, key: TelemetryKey) -> &mut Option<TelemetryValue> {
        match key {
            TelemetryKey::AccelerometerX => &mut self.accelerometer_x,
            TelemetryKey::AccelerometerY => &mut self.accelerometer_y,
            TelemetryKey::AccelerometerZ => &mut self.accelerometer_z,
            TelemetryKey::GyroX => &mut self.gyro_x,
            TelemetryKey::GyroY => &mut self.gyro_y,
            TelemetryKey::GyroZ => &mut self.gyro_z,
            TelemetryKey::Force => &mut self.force,
            TelemetryKey::Position => &mut self.position,
            TelemetryKey::Velocity => &mut self.velocity,
            TelemetryKey::VirtualVelocity => &mut self.virtual_velocity,
            TelemetryKey::Status => &mut self.status,
        }
    }
}

/// Derived telemetry delivered to consumers after every fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTelemetry {
    /// Forward/backward lean in degrees.
    pub lean_angle_up: f64,
    /// Sideways lean in degrees.
    pub lean_angle_left: f64,
    pub force: f64,
    pub position: f64,
    pub velocity: f64,
    /// Scaled virtual velocity, capped at 100.
    pub virtual_velocity: f64,
    pub status: String,
    /// Offset-corrected gyro magnitude. Computed but not part of the
    /// serialised record.
    #[serde(skip)]
    pub angular_velocity: f64,
}
