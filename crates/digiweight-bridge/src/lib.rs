//! `digiweight-bridge` – local network service in front of the serial link.
//!
//! [`BridgeServer`] exposes four JSON endpoints over HTTP/1.1:
//!
//! | Endpoint | Effect |
//! |---|---|
//! | `GET /status` | liveness, `running` or `running in offline mode` |
//! | `GET /data` | copy of the latest device state |
//! | `POST /send_command` | validate a command and write it to the device |
//! | `GET /ack` | one pending device reply, or 404 |
//!
//! While serving it also runs the telemetry reader thread and stops it on
//! shutdown.

pub mod http;
pub mod server;

pub use server::{BridgeServer, DEFAULT_ADDR, OFFLINE_STATUS, ONLINE_STATUS};

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("telemetry reader thread panicked")]
    ReaderPanicked,
}
