//! `digiweight-link` – the serial side of the bridge.
//!
//! - [`SerialLinkManager`] owns the single handle to the device, serialises
//!   reads against writes, and reconnects after faults.
//! - [`parse_line`] turns a `DATA:` line into field updates.
//! - [`StateStore`] holds the latest [`DeviceState`](digiweight_types::DeviceState)
//!   behind a lock so whole lines apply atomically.
//! - [`TelemetryReader`] is the background loop tying the three together.
//! - [`AckMailbox`] parks device replies the reader saw first.
//! - [`SimDevice`] replaces the hardware in offline mode and in tests.

pub mod ack;
pub mod manager;
pub mod parser;
pub mod port;
pub mod reader;
pub mod sim;
pub mod state;

pub use ack::{ACK_CAPACITY, AckMailbox};
pub use manager::{LinkConfig, LinkError, SerialLinkManager};
pub use parser::{DATA_PREFIX, ParseError, TelemetryUpdate, parse_line};
pub use port::{DEFAULT_BAUD_RATE, LinkPort, PortConnector, SerialConnector};
pub use reader::TelemetryReader;
pub use sim::{SIM_TELEMETRY_LINE, SIM_TELEMETRY_PERIOD, SimConnector, SimDevice};
pub use state::StateStore;
