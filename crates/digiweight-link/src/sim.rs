//! In-process device simulator for offline runs and tests without hardware.
//!
//! [`SimDevice`] stands in for the actuator behind a [`PortConnector`]:
//!
//! * every command line written to it is recorded and answered with an ack
//!   line (`ack:set_pulse`, `ack:set_mode`, … or `ack:unknown`);
//! * lines queued with [`SimDevice::push_line`] are returned by reads in
//!   order;
//! * optional periodic telemetry can be switched on with
//!   [`SimDevice::with_telemetry`];
//! * faults are injectable: a failing read, failing writes, and the device
//!   vanishing from discovery.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use digiweight_link::{LinkConfig, SerialLinkManager, SimDevice};
//!
//! let device = SimDevice::new();
//! let link = SerialLinkManager::open(
//!     Arc::new(device.connector("USB Serial Device")),
//!     LinkConfig::default(),
//! )
//! .expect("simulated device is discoverable");
//!
//! link.write_line(br#"{"command":"SET_MODE","type":"on"}"#).unwrap();
//! assert_eq!(link.read_line().unwrap().as_deref(), Some("ack:set_mode"));
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::manager::LinkError;
use crate::port::{LinkPort, PortConnector};

/// Telemetry line emitted by the simulator when periodic telemetry is on.
pub const SIM_TELEMETRY_LINE: &str = "DATA:accelerometer_x:1.0|accelerometer_y:2.0|accelerometer_z:3.0|\
gyro_x:0.1|gyro_y:0.2|gyro_z:0.3|force:9.81|position:5.0|velocity:0.5|status:ok";

/// Default period of simulated telemetry.
pub const SIM_TELEMETRY_PERIOD: Duration = Duration::from_millis(100);

#[derive(Default)]
struct SimState {
    discoverable: bool,
    pending: VecDeque<String>,
    written: Vec<Vec<u8>>,
    fail_next_read: bool,
    fail_writes: bool,
    connections: usize,
    reads: usize,
    telemetry_period: Option<Duration>,
    last_emit: Option<Instant>,
}

/// Handle to a simulated device. Clone it cheaply – all clones control the
/// same device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// A discoverable device that only speaks when spoken to.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                discoverable: true,
                ..SimState::default()
            })),
        }
    }

    /// A discoverable device that also emits [`SIM_TELEMETRY_LINE`] every
    /// `period`.
    pub fn with_telemetry(period: Duration) -> Self {
        let device = Self::new();
        device.lock().telemetry_period = Some(period);
        device
    }

    /// Connector that finds this device when the discovery hint is a
    /// substring of `description`.
    pub fn connector(&self, description: impl Into<String>) -> SimConnector {
        SimConnector {
            device: self.clone(),
            description: description.into(),
        }
    }

    /// Queue a line for the next read.
    pub fn push_line(&self, line: impl Into<String>) {
        self.lock().pending.push_back(line.into());
    }

    /// Make the next read fail with an I/O error.
    pub fn inject_read_error(&self) {
        self.lock().fail_next_read = true;
    }

    /// Make every write fail until switched off again.
    pub fn set_write_failure(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Show or hide the device from discovery.
    pub fn set_discoverable(&self, discoverable: bool) {
        self.lock().discoverable = discoverable;
    }

    /// Lines written to the device, terminators stripped.
    pub fn written(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .map(|raw| String::from_utf8_lossy(raw).trim_end().to_string())
            .collect()
    }

    /// Raw byte frames written to the device.
    pub fn raw_written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Number of successful connects so far.
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Number of read attempts so far.
    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Ack line the simulator answers a written command line with.
pub fn ack_for(line: &str) -> String {
    let name = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("command").and_then(|c| c.as_str()).map(str::to_ascii_lowercase));
    match name {
        Some(name) if name.starts_with("set_") => format!("ack:{name}"),
        _ => "ack:unknown".to_string(),
    }
}

/// [`PortConnector`] for a [`SimDevice`].
pub struct SimConnector {
    device: SimDevice,
    description: String,
}

impl PortConnector for SimConnector {
    fn connect(&self, hint: &str) -> Result<Box<dyn LinkPort>, LinkError> {
        let mut state = self.device.lock();
        if !state.discoverable || !self.description.contains(hint) {
            return Err(LinkError::NotFound {
                hint: hint.to_string(),
            });
        }
        state.connections += 1;
        Ok(Box::new(SimPort {
            device: self.device.clone(),
        }))
    }
}

struct SimPort {
    device: SimDevice,
}

impl LinkPort for SimPort {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut state = self.device.lock();
        state.reads += 1;

        if state.fail_next_read {
            state.fail_next_read = false;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated device unplugged"));
        }

        if let Some(period) = state.telemetry_period {
            let due = state.last_emit.is_none_or(|at| at.elapsed() >= period);
            if due {
                state.last_emit = Some(Instant::now());
                state.pending.push_back(SIM_TELEMETRY_LINE.to_string());
            }
        }

        Ok(state.pending.pop_front())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.device.lock();
        if state.fail_writes {
            return Err(io::Error::other("simulated write failure"));
        }
        state.written.push(bytes.to_vec());
        let text = String::from_utf8_lossy(bytes);
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            state.pending.push_back(ack_for(line));
        }
        Ok(())
    }
}
