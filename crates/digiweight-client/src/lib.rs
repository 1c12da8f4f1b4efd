//! `digiweight-client` – non-blocking access to a running bridge.
//!
//! The [`Controller`] is what applications hold.  Its setters and telemetry
//! fetches are queued onto a [`TaskEngine`], a background thread that runs
//! one item at a time in submission order, so the caller's thread (a game
//! loop, say) never waits on the network.  Raw telemetry is turned into a
//! [`ProcessedTelemetry`](digiweight_types::ProcessedTelemetry) by the
//! [`SensorProcessor`] before it is handed back.

pub mod controller;
pub mod engine;
pub mod processor;
pub mod transport;

pub use controller::{Controller, ControllerConfig, DEFAULT_STATUS_TIMEOUT};
pub use engine::{QUEUE_WARN_DEPTH, TaskEngine, TaskId, TaskKind, TaskWork};
pub use processor::SensorProcessor;
pub use transport::{BridgeTransport, HttpTransport};

use digiweight_types::CommandError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The HTTP request to the bridge failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge answered with a non-success status.
    #[error("bridge returned status {0}")]
    Status(u16),

    /// The bridge replied with a body of the wrong shape.
    #[error("unexpected response: {0}")]
    BadResponse(String),

    #[error(transparent)]
    InvalidCommand(#[from] CommandError),

    /// Work was submitted after [`TaskEngine::shutdown`].
    #[error("task engine is stopped")]
    EngineStopped,

    #[error("timed out waiting for the bridge")]
    Timeout,

    /// The engine's runtime or thread could not be created.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}
