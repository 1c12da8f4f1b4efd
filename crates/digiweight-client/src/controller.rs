//! [`Controller`] – the public client API.
//!
//! Setters and telemetry fetches return as soon as the work is queued.
//! Processed telemetry arrives on an internal channel polled with
//! [`Controller::try_recv_telemetry`].  Only the status and ack checks
//! block, and only up to [`ControllerConfig::status_timeout`].
//!
//! ```rust,no_run
//! use digiweight_client::{Controller, ControllerConfig};
//! use digiweight_types::Toggle;
//!
//! let controller = Controller::connect("http://127.0.0.1:8000", ControllerConfig::default())?;
//! println!("bridge is {}", controller.get_status_sync()?);
//!
//! controller.set_mode(Toggle::On)?;
//! controller.fetch_telemetry_async()?;
//! // ... later, from the same or another thread:
//! if let Some(sample) = controller.try_recv_telemetry() {
//!     println!("lean {:.1}°", sample.lean_angle_up);
//! }
//! controller.cleanup();
//! # Ok::<(), digiweight_client::ClientError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use digiweight_types::{CalibrationSet, Command, ForceProfile, GyroOffset, ProcessedTelemetry, Toggle};
use futures_util::future::BoxFuture;
use tracing::{debug, info};

use crate::ClientError;
use crate::engine::{TaskEngine, TaskId, TaskKind};
use crate::processor::SensorProcessor;
use crate::transport::{BridgeTransport, HttpTransport};

/// Bound on [`Controller::get_status_sync`] and [`Controller::read_ack_sync`].
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub status_timeout: Duration,
    pub gyro_offset: GyroOffset,
    pub calibration: CalibrationSet,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            gyro_offset: GyroOffset::default(),
            calibration: CalibrationSet::default(),
        }
    }
}

pub struct Controller {
    engine: TaskEngine,
    transport: Arc<dyn BridgeTransport>,
    processor: Arc<SensorProcessor>,
    /// Set from enqueue until the fetch item finishes or is dropped.
    fetch_outstanding: Arc<AtomicBool>,
    telemetry_tx: Sender<ProcessedTelemetry>,
    telemetry_rx: Mutex<Receiver<ProcessedTelemetry>>,
    status_timeout: Duration,
}

impl Controller {
    /// Controller for the bridge at `api_url` over HTTP.
    pub fn connect(api_url: impl Into<String>, config: ControllerConfig) -> Result<Self, ClientError> {
        Self::with_transport(Arc::new(HttpTransport::new(api_url)), config)
    }

    /// Controller over any transport.  Starts the task engine thread.
    pub fn with_transport(
        transport: Arc<dyn BridgeTransport>,
        config: ControllerConfig,
    ) -> Result<Self, ClientError> {
        let (telemetry_tx, telemetry_rx) = mpsc::channel();
        Ok(Self {
            engine: TaskEngine::start()?,
            transport,
            processor: Arc::new(SensorProcessor::new(config.gyro_offset, config.calibration)),
            fetch_outstanding: Arc::new(AtomicBool::new(false)),
            telemetry_tx,
            telemetry_rx: Mutex::new(telemetry_rx),
            status_timeout: config.status_timeout,
        })
    }

    // ── Setters ─────────────────────────────────────────────────────────────

    pub fn set_pulse(
        &self,
        kind: Toggle,
        duration: i64,
        strength: i64,
        frequency: i64,
    ) -> Result<TaskId, ClientError> {
        self.send_command(Command::SetPulse {
            kind,
            duration,
            strength,
            frequency,
        })
    }

    pub fn set_detents(
        &self,
        kind: Toggle,
        strength: i64,
        start_position: f64,
        step_position: f64,
        total_steps: i64,
    ) -> Result<TaskId, ClientError> {
        self.send_command(Command::SetDetents {
            kind,
            strength,
            start_position,
            step_position,
            total_steps,
        })
    }

    pub fn set_force(
        &self,
        kind: ForceProfile,
        strength: i64,
        start_strength: i64,
        start_position: f64,
        saturation_position: f64,
    ) -> Result<TaskId, ClientError> {
        self.send_command(Command::SetForce {
            kind,
            strength,
            start_strength,
            start_position,
            saturation_position,
        })
    }

    pub fn set_mode(&self, kind: Toggle) -> Result<TaskId, ClientError> {
        self.send_command(Command::SetMode { kind })
    }

    pub fn set_row(
        &self,
        kind: Toggle,
        damping: i64,
        gear_ratio: i64,
        inertia: i64,
    ) -> Result<TaskId, ClientError> {
        self.send_command(Command::SetRow {
            kind,
            damping,
            gear_ratio,
            inertia,
        })
    }

    /// Queue `command` for delivery.  Fire-and-forget: a delivery failure is
    /// logged by the engine, not reported here.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidCommand`] for a NaN or infinite position,
    /// before anything is queued.
    pub fn send_command(&self, command: Command) -> Result<TaskId, ClientError> {
        command.validate()?;
        let transport = Arc::clone(&self.transport);
        let name = command.name();
        let id = self.engine.enqueue(
            TaskKind::SendCommand,
            Box::pin(async move {
                transport.send_command(&command).await?;
                debug!(command = name, "command delivered");
                Ok::<(), ClientError>(())
            }),
        )?;
        debug!(task = %id, command = name, "command queued");
        Ok(id)
    }

    // ── Telemetry ───────────────────────────────────────────────────────────

    /// Queue a fetch whose processed result lands on the telemetry channel.
    ///
    /// Returns `Ok(None)` without queuing anything while a previous fetch is
    /// still queued or running.
    pub fn fetch_telemetry_async(&self) -> Result<Option<TaskId>, ClientError> {
        if self
            .fetch_outstanding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("fetch already outstanding, skipping");
            return Ok(None);
        }
        let outstanding = OutstandingGuard(Arc::clone(&self.fetch_outstanding));

        let transport = Arc::clone(&self.transport);
        let processor = Arc::clone(&self.processor);
        let tx = self.telemetry_tx.clone();
        let id = self.engine.enqueue(
            TaskKind::Fetch,
            Box::pin(async move {
                let _outstanding = outstanding;
                let raw = transport.data().await?;
                // The receiver lives as long as the controller.
                let _ = tx.send(processor.process(&raw));
                Ok::<(), ClientError>(())
            }),
        )?;
        Ok(Some(id))
    }

    /// Next processed sample, if one is waiting.
    pub fn try_recv_telemetry(&self) -> Option<ProcessedTelemetry> {
        self.telemetry_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    /// `true` while a fetch is executing.
    pub fn is_busy(&self) -> bool {
        self.engine.is_busy()
    }

    /// Commands and fetches queued but not started.
    pub fn pending(&self) -> usize {
        self.engine.pending()
    }

    /// Block until everything queued so far has run, or `timeout` passes.
    pub fn flush(&self, timeout: Duration) -> Result<(), ClientError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.engine.enqueue(
            TaskKind::Flush,
            Box::pin(async move {
                let _ = tx.send(());
                Ok::<(), ClientError>(())
            }),
        )?;
        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::EngineStopped),
        }
    }

    // ── Synchronous checks ──────────────────────────────────────────────────

    /// Ask the bridge for its status, blocking the caller for at most the
    /// configured timeout.  Must not be called from inside queued work.
    pub fn get_status_sync(&self) -> Result<String, ClientError> {
        let transport = Arc::clone(&self.transport);
        self.block_on_engine(Box::pin(async move { transport.status().await }))
    }

    /// One `/ack` read, bounded like [`get_status_sync`](Self::get_status_sync).
    pub fn read_ack_sync(&self) -> Result<Option<String>, ClientError> {
        let transport = Arc::clone(&self.transport);
        self.block_on_engine(Box::pin(async move { transport.ack().await }))
    }

    fn block_on_engine<T>(&self, work: BoxFuture<'static, Result<T, ClientError>>) -> Result<T, ClientError>
    where
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let timeout = self.status_timeout;
        self.engine.spawn_detached(async move {
            let result = match tokio::time::timeout(timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout),
            };
            let _ = tx.send(result);
        })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::EngineStopped),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Stop the engine, dropping queued and in-flight work.  Idempotent.
    pub fn cleanup(&self) {
        if self.engine.is_stopped() {
            return;
        }
        self.engine.shutdown();
        info!("controller stopped");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct OutstandingGuard(Arc<AtomicBool>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
