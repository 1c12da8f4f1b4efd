//! [`SerialLinkManager`] – sole owner of the serial handle.
//!
//! Every read and write goes through one mutex so a command write can never
//! interleave with a partially read telemetry line.  The mutex is held only
//! around raw I/O; reconnect back-off sleeps happen with it released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::port::{LinkPort, PortConnector};

/// Granularity of shutdown checks while waiting between reconnect attempts.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(20);

/// Errors raised by the serial link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// No port description matched the configured hint.
    #[error("no serial device matching '{hint}' found")]
    NotFound { hint: String },

    /// The link is between a failure and a successful reconnect.
    #[error("serial link is not connected")]
    NotConnected,

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Link tuning.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Substring matched against port descriptions during discovery.
    pub device_hint: String,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Sleep between reader polls.
    pub poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_hint: "USB Serial Device".to_string(),
            reconnect_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Owns the (possibly absent) open port and drives reconnection.
pub struct SerialLinkManager {
    connector: Arc<dyn PortConnector>,
    config: LinkConfig,
    port: Mutex<Option<Box<dyn LinkPort>>>,
}

impl SerialLinkManager {
    /// Discover and open the device.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotFound`] when no port matches
    /// [`LinkConfig::device_hint`]; this is fatal to server start.
    pub fn open(connector: Arc<dyn PortConnector>, config: LinkConfig) -> Result<Self, LinkError> {
        info!(hint = %config.device_hint, "searching for device");
        let port = connector.connect(&config.device_hint)?;
        Ok(Self {
            connector,
            config,
            port: Mutex::new(Some(port)),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// `true` while a port is held.
    pub fn is_open(&self) -> bool {
        self.lock_port().is_some()
    }

    /// Non-blocking read of one line.
    ///
    /// Returns `Ok(None)` when nothing is waiting or the link is currently
    /// disconnected.  On an I/O fault the handle is closed and dropped before
    /// the error is returned; the caller is expected to [`reconnect`].
    ///
    /// [`reconnect`]: Self::reconnect
    pub fn read_line(&self) -> Result<Option<String>, LinkError> {
        let mut guard = self.lock_port();
        let Some(port) = guard.as_mut() else {
            return Ok(None);
        };
        match port.read_line() {
            Ok(line) => Ok(line),
            Err(e) => {
                *guard = None;
                Err(LinkError::Io(e))
            }
        }
    }

    /// Write `payload` followed by the line terminator.
    ///
    /// A write fault is reported to the caller but leaves the port in place;
    /// only the reader decides the link is dead.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotConnected`] while disconnected, [`LinkError::Io`] on a
    /// failed write.
    pub fn write_line(&self, payload: &[u8]) -> Result<(), LinkError> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.extend_from_slice(payload);
        frame.push(b'\n');

        let mut guard = self.lock_port();
        let port = guard.as_mut().ok_or(LinkError::NotConnected)?;
        port.write_all(&frame)?;
        Ok(())
    }

    /// Retry discovery and open every [`LinkConfig::reconnect_interval`]
    /// until it succeeds or `shutdown` is raised.
    ///
    /// Returns `true` once reconnected, `false` if shutdown won.
    pub fn reconnect(&self, shutdown: &AtomicBool) -> bool {
        info!(hint = %self.config.device_hint, "attempting to reconnect to device");
        let mut attempts: u32 = 0;
        while !shutdown.load(Ordering::Acquire) {
            attempts += 1;
            match self.connector.connect(&self.config.device_hint) {
                Ok(port) => {
                    *self.lock_port() = Some(port);
                    info!(attempts, "reconnected to device");
                    return true;
                }
                Err(e) => debug!(attempts, error = %e, "reconnect attempt failed"),
            }
            sleep_unless(self.config.reconnect_interval, shutdown);
        }
        false
    }

    /// Drop the handle.  Subsequent reads return `Ok(None)`.
    pub fn close(&self) {
        if self.lock_port().take().is_some() {
            info!("serial link closed");
        }
    }

    fn lock_port(&self) -> MutexGuard<'_, Option<Box<dyn LinkPort>>> {
        self.port.lock().unwrap_or_else(|poisoned| {
            error!("serial link mutex poisoned; recovering");
            PoisonError::into_inner(poisoned)
        })
    }
}

/// Sleep for `total`, returning early once `shutdown` is raised.
pub(crate) fn sleep_unless(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_CHECK));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn fast_config() -> LinkConfig {
        LinkConfig {
            device_hint: "USB Serial Device".to_string(),
            reconnect_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn open_fails_when_nothing_matches() {
        let device = SimDevice::new();
        let connector = Arc::new(device.connector("Some Other Gadget"));
        let result = SerialLinkManager::open(connector, fast_config());
        assert!(matches!(result, Err(LinkError::NotFound { .. })));
    }

    #[test]
    fn open_fails_when_device_absent() {
        let device = SimDevice::new();
        device.set_discoverable(false);
        let result = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config());
        assert!(matches!(result, Err(LinkError::NotFound { .. })));
    }

    #[test]
    fn read_returns_empty_when_idle() {
        let device = SimDevice::new();
        let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap();
        assert!(link.is_open());
        assert_eq!(link.read_line().unwrap(), None);

        device.push_line("DATA:force:1.0");
        assert_eq!(link.read_line().unwrap().as_deref(), Some("DATA:force:1.0"));
    }

    #[test]
    fn read_error_closes_handle_and_reads_go_empty() {
        let device = SimDevice::new();
        let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap();

        device.inject_read_error();
        assert!(matches!(link.read_line(), Err(LinkError::Io(_))));
        assert!(!link.is_open());

        device.push_line("DATA:force:2.0");
        assert_eq!(link.read_line().unwrap(), None);
    }

    #[test]
    fn write_appends_terminator() {
        let device = SimDevice::new();
        let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap();
        link.write_line(br#"{"command":"SET_MODE","type":"on"}"#).unwrap();
        assert_eq!(device.written(), vec![r#"{"command":"SET_MODE","type":"on"}"#.to_string()]);
        assert_eq!(device.raw_written().last().map(|b| *b.last().unwrap()), Some(b'\n'));
    }

    #[test]
    fn write_while_disconnected_is_not_connected() {
        let device = SimDevice::new();
        let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap();
        link.close();
        assert!(matches!(link.write_line(b"x"), Err(LinkError::NotConnected)));
    }

    #[test]
    fn write_fault_keeps_link_open() {
        let device = SimDevice::new();
        let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap();
        device.set_write_failure(true);
        assert!(matches!(link.write_line(b"x"), Err(LinkError::Io(_))));
        assert!(link.is_open());
    }

    #[test]
    fn reconnect_waits_for_device() {
        let device = SimDevice::new();
        let link = Arc::new(
            SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap(),
        );
        link.close();
        device.set_discoverable(false);

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let link = Arc::clone(&link);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || link.reconnect(&shutdown))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!link.is_open());
        device.set_discoverable(true);

        assert!(handle.join().unwrap());
        assert!(link.is_open());
        assert_eq!(device.connections(), 2);
    }

    #[test]
    fn reconnect_gives_up_on_shutdown() {
        let device = SimDevice::new();
        let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap();
        link.close();
        device.set_discoverable(false);

        let shutdown = AtomicBool::new(true);
        assert!(!link.reconnect(&shutdown));
        assert!(!link.is_open());
    }
}
