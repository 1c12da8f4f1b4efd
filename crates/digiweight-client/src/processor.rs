//! [`SensorProcessor`] – raw [`DeviceState`] in, [`ProcessedTelemetry`] out.

use digiweight_types::{
    CalibrationSet, DeviceState, GyroOffset, ProcessedTelemetry, TelemetryKey, TelemetryValue,
    Vector3,
};

/// Raw virtual velocity is scaled by this factor...
pub const VIRTUAL_VELOCITY_SCALE: f64 = 20.0;
/// ...and capped here.  There is no lower bound.
pub const VIRTUAL_VELOCITY_MAX: f64 = 100.0;

/// Reported when the device has not sent a status yet.
pub const UNKNOWN_STATUS: &str = "unknown";

#[derive(Debug, Clone, Default)]
pub struct SensorProcessor {
    gyro_offset: GyroOffset,
    calibration: CalibrationSet,
}

impl SensorProcessor {
    pub fn new(gyro_offset: GyroOffset, calibration: CalibrationSet) -> Self {
        Self {
            gyro_offset,
            calibration,
        }
    }

    pub fn calibration(&self) -> &CalibrationSet {
        &self.calibration
    }

    pub fn process(&self, raw: &DeviceState) -> ProcessedTelemetry {
        let accel = Vector3::new(
            raw.number_or_zero(TelemetryKey::AccelerometerX),
            raw.number_or_zero(TelemetryKey::AccelerometerY),
            raw.number_or_zero(TelemetryKey::AccelerometerZ),
        );
        let gyro = Vector3::new(
            raw.number_or_zero(TelemetryKey::GyroX) - self.gyro_offset.x,
            raw.number_or_zero(TelemetryKey::GyroY) - self.gyro_offset.y,
            raw.number_or_zero(TelemetryKey::GyroZ) - self.gyro_offset.z,
        );

        let flat = self
            .calibration
            .flat
            .as_ref()
            .filter(|_| self.calibration.is_complete());
        let (lean_angle_up, lean_angle_left) = match flat {
            Some(flat) => {
                // Only the flat pose enters the angle, so both axes agree.
                let angle = angle_from_flat(flat, &accel);
                (angle, angle)
            }
            None => fallback_lean(&accel),
        };

        let virtual_velocity = (raw.number_or_zero(TelemetryKey::VirtualVelocity)
            * VIRTUAL_VELOCITY_SCALE)
            .min(VIRTUAL_VELOCITY_MAX);

        ProcessedTelemetry {
            lean_angle_up,
            lean_angle_left,
            force: raw.number_or_zero(TelemetryKey::Force),
            position: raw.number_or_zero(TelemetryKey::Position),
            velocity: raw.number_or_zero(TelemetryKey::Velocity),
            virtual_velocity,
            status: status_text(raw.get(TelemetryKey::Status)),
            angular_velocity: gyro.length(),
        }
    }
}

/// Degrees between the flat pose and the current reading; `0` if either is
/// the zero vector.
fn angle_from_flat(flat: &Vector3, current: &Vector3) -> f64 {
    match (flat.normalized(), current.normalized()) {
        (Some(flat), Some(current)) => flat.dot(&current).clamp(-1.0, 1.0).acos().to_degrees(),
        _ => 0.0,
    }
}

fn fallback_lean(accel: &Vector3) -> (f64, f64) {
    let up = accel.y.atan2(accel.x).to_degrees();
    let left = -(accel.x.atan2(accel.z).to_degrees() - 90.0);
    (up, left)
}

fn status_text(value: Option<&TelemetryValue>) -> String {
    match value {
        Some(TelemetryValue::Text(text)) => text.clone(),
        Some(TelemetryValue::Number(n)) => n.to_string(),
        None => UNKNOWN_STATUS.to_string(),
    }
}
