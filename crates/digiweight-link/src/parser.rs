//! Telemetry line parser.
//!
//! The device emits lines of the form
//!
//! ```text
//! DATA:accelerometer_x:512|accelerometer_y:3.5|status:ok
//! ```
//!
//! Lines without the `DATA:` prefix (acks, boot chatter) are not telemetry
//! and are skipped.  A telemetry line is parsed completely before anything is
//! applied, so a malformed pair anywhere in the line discards the whole line.

use digiweight_types::{TelemetryKey, TelemetryValue};
use thiserror::Error;

/// Prefix marking a telemetry line.
pub const DATA_PREFIX: &str = "DATA:";

/// Separator between `key:value` pairs.
pub const PAIR_SEPARATOR: char = '|';

/// A telemetry line that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("malformed pair '{pair}' (expected key:value)")]
    MalformedPair { pair: String },
}

/// Field updates carried by one telemetry line.
pub type TelemetryUpdate = Vec<(TelemetryKey, TelemetryValue)>;

/// Parse one line.
///
/// Returns `Ok(None)` for non-telemetry lines and `Ok(Some(updates))` for a
/// well-formed telemetry line; unrecognised keys are dropped from `updates`.
///
/// # Errors
///
/// [`ParseError::MalformedPair`] when any pair does not split into exactly a
/// key and a value.
pub fn parse_line(line: &str) -> Result<Option<TelemetryUpdate>, ParseError> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };

    let mut updates = Vec::new();
    for pair in payload.split(PAIR_SEPARATOR) {
        let mut parts = pair.split(':');
        let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ParseError::MalformedPair {
                pair: pair.to_string(),
            });
        };
        if let Ok(key) = key.parse::<TelemetryKey>() {
            updates.push((key, coerce_value(value)));
        }
    }
    Ok(Some(updates))
}

/// Numeric when `raw` is a plain non-negative decimal, text otherwise.
pub fn coerce_value(raw: &str) -> TelemetryValue {
    if is_plain_decimal(raw) {
        if let Ok(n) = raw.parse::<f64>() {
            return TelemetryValue::Number(n);
        }
    }
    TelemetryValue::Text(raw.to_string())
}

/// Digits with at most one `.`, and at least one digit.
fn is_plain_decimal(raw: &str) -> bool {
    let mut dots = 0;
    let mut digits = 0;
    for c in raw.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    digits > 0 && dots <= 1
}
