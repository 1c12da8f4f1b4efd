//! [`TelemetryReader`] – the background loop feeding the [`StateStore`].
//!
//! Polls the link, applies every telemetry line, and on a link fault hands
//! control to [`SerialLinkManager::reconnect`] until the device is back.
//! Parse failures are logged and dropped; nothing here is fatal.  Lines
//! without the `DATA:` prefix are device replies and go to the
//! [`AckMailbox`] when one is attached.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::ack::AckMailbox;
use crate::manager::{SerialLinkManager, sleep_unless};
use crate::parser::DATA_PREFIX;
use crate::state::StateStore;

/// Upper bound on lines drained per poll so a chatty device cannot starve
/// command writers of the link mutex.
const MAX_LINES_PER_POLL: usize = 64;

pub struct TelemetryReader {
    link: Arc<SerialLinkManager>,
    store: StateStore,
    acks: Option<AckMailbox>,
}

impl TelemetryReader {
    pub fn new(link: Arc<SerialLinkManager>, store: StateStore) -> Self {
        Self {
            link,
            store,
            acks: None,
        }
    }

    /// Park device replies in `acks` instead of dropping them.
    pub fn with_acks(mut self, acks: AckMailbox) -> Self {
        self.acks = Some(acks);
        self
    }

    /// Run the loop on a dedicated thread until `shutdown` is raised.
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("digiweight-reader".to_string())
            .spawn(move || self.run(&shutdown))
    }

    /// Blocking loop body; returns once `shutdown` is raised.
    pub fn run(&self, shutdown: &AtomicBool) {
        info!("telemetry reader started");
        let poll_interval = self.link.config().poll_interval;

        while !shutdown.load(Ordering::Acquire) {
            // Another caller may have hit the fault and dropped the handle.
            if !self.link.is_open() && !self.link.reconnect(shutdown) {
                break;
            }
            if !self.drain(shutdown) {
                break;
            }
            sleep_unless(poll_interval, shutdown);
        }

        info!("telemetry reader stopped");
    }

    /// Read everything currently waiting.  Returns `false` when a reconnect
    /// was abandoned because of shutdown.
    fn drain(&self, shutdown: &AtomicBool) -> bool {
        for _ in 0..MAX_LINES_PER_POLL {
            match self.link.read_line() {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => return true,
                Err(e) => {
                    error!(error = %e, "serial link failed");
                    return self.link.reconnect(shutdown);
                }
            }
        }
        true
    }

    fn handle_line(&self, line: &str) {
        if !line.starts_with(DATA_PREFIX) {
            match &self.acks {
                Some(acks) => acks.push(line.to_string()),
                None => debug!(line, "dropping device reply"),
            }
            return;
        }
        match self.store.ingest_line(line) {
            Ok(0) => debug!(line, "telemetry line with no known keys"),
            Ok(fields) => debug!(fields, "telemetry applied"),
            Err(e) => warn!(line, error = %e, "dropping malformed telemetry line"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::LinkConfig;
    use crate::sim::SimDevice;
    use digiweight_types::TelemetryValue;
    use std::time::{Duration, Instant};

    fn fast_config() -> LinkConfig {
        LinkConfig {
            device_hint: "USB Serial Device".to_string(),
            reconnect_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(2),
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn start(device: &SimDevice) -> (Arc<SerialLinkManager>, StateStore, Arc<AtomicBool>, JoinHandle<()>) {
        let link = Arc::new(
            SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap(),
        );
        let store = StateStore::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = TelemetryReader::new(Arc::clone(&link), store.clone())
            .spawn(Arc::clone(&shutdown))
            .unwrap();
        (link, store, shutdown, handle)
    }

    #[test]
    fn applies_incoming_telemetry() {
        let device = SimDevice::new();
        let (_link, store, shutdown, handle) = start(&device);

        device.push_line("DATA:force:9.81|status:ok");
        assert!(wait_until(Duration::from_secs(2), || {
            store.snapshot().force == Some(TelemetryValue::Number(9.81))
        }));

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn malformed_line_does_not_stop_reader() {
        let device = SimDevice::new();
        let (_link, store, shutdown, handle) = start(&device);

        device.push_line("DATA:force");
        device.push_line("DATA:position:4");
        assert!(wait_until(Duration::from_secs(2), || {
            store.snapshot().position == Some(TelemetryValue::Number(4.0))
        }));
        assert_eq!(store.snapshot().force, None);

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn replies_are_parked_in_mailbox() {
        let device = SimDevice::new();
        let link = Arc::new(
            SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), fast_config()).unwrap(),
        );
        let acks = AckMailbox::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = TelemetryReader::new(Arc::clone(&link), StateStore::new())
            .with_acks(acks.clone())
            .spawn(Arc::clone(&shutdown))
            .unwrap();

        link.write_line(br#"{"command":"SET_MODE","type":"on"}"#).unwrap();
        assert!(wait_until(Duration::from_secs(2), || !acks.is_empty()));
        assert_eq!(acks.pop().as_deref(), Some("ack:set_mode"));

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn reconnects_after_handle_dropped_elsewhere() {
        let device = SimDevice::new();
        let (link, _store, shutdown, handle) = start(&device);

        link.close();
        assert!(wait_until(Duration::from_secs(2), || link.is_open()));
        assert_eq!(device.connections(), 2);

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn reconnects_and_resumes_after_link_error() {
        let device = SimDevice::new();
        let (link, store, shutdown, handle) = start(&device);

        device.push_line("DATA:force:1");
        assert!(wait_until(Duration::from_secs(2), || store.snapshot().force.is_some()));

        // Unplug: the next read fails and the device disappears from discovery.
        device.set_discoverable(false);
        device.inject_read_error();
        assert!(wait_until(Duration::from_secs(2), || !link.is_open()));

        // Stale value is retained while disconnected.
        assert_eq!(store.snapshot().force, Some(TelemetryValue::Number(1.0)));

        device.set_discoverable(true);
        assert!(wait_until(Duration::from_secs(2), || link.is_open()));

        device.push_line("DATA:force:2");
        assert!(wait_until(Duration::from_secs(2), || {
            store.snapshot().force == Some(TelemetryValue::Number(2.0))
        }));
        assert_eq!(device.connections(), 2);

        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_interrupts_reconnect_loop() {
        let device = SimDevice::new();
        let (link, _store, shutdown, handle) = start(&device);

        device.set_discoverable(false);
        device.inject_read_error();
        assert!(wait_until(Duration::from_secs(2), || !link.is_open()));

        let started = Instant::now();
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
