//! Orientation calibration and gyro bias.

use serde::{Deserialize, Serialize};

/// A raw 3-axis accelerometer reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn dot(&self, other: &Vector3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Unit vector in the same direction, or `None` for the zero vector.
    pub fn normalized(&self) -> Option<Vector3> {
        let len = self.length();
        if len == 0.0 || !len.is_finite() {
            return None;
        }
        Some(Vector3::new(self.x / len, self.y / len, self.z / len))
    }
}

/// Accelerometer readings captured with the device held at five known poses.
///
/// All five must be present for the calibrated lean computation to be used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    #[serde(default)]
    pub flat: Option<Vector3>,
    #[serde(default)]
    pub up: Option<Vector3>,
    #[serde(default)]
    pub down: Option<Vector3>,
    #[serde(default)]
    pub left: Option<Vector3>,
    #[serde(default)]
    pub right: Option<Vector3>,
}

impl CalibrationSet {
    pub fn is_complete(&self) -> bool {
        self.flat.is_some()
            && self.up.is_some()
            && self.down.is_some()
            && self.left.is_some()
            && self.right.is_some()
    }
}

/// Constant biases subtracted from the raw gyro axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GyroOffset {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for GyroOffset {
    fn default() -> Self {
        Self {
            x: 540.0,
            y: -575.0,
            z: -420.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_calibration_is_incomplete() {
        let mut cal = CalibrationSet {
            flat: Some(Vector3::new(0.0, 0.0, 1.0)),
            up: Some(Vector3::new(1.0, 0.0, 0.0)),
            down: Some(Vector3::new(-1.0, 0.0, 0.0)),
            left: Some(Vector3::new(0.0, 1.0, 0.0)),
            right: None,
        };
        assert!(!cal.is_complete());
        cal.right = Some(Vector3::new(0.0, -1.0, 0.0));
        assert!(cal.is_complete());
    }

    #[test]
    fn zero_vector_has_no_direction() {
        assert!(Vector3::default().normalized().is_none());
        let n = Vector3::new(3.0, 0.0, 4.0).normalized().unwrap();
        assert!((n.length() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn default_gyro_offset_matches_factory_bias() {
        let off = GyroOffset::default();
        assert_eq!((off.x, off.y, off.z), (540.0, -575.0, -420.0));
    }
}
