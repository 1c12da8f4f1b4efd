//! [`StateStore`] – the lock-guarded Device State Record.
//!
//! The telemetry reader is the only writer; the bridge server only ever
//! takes copies.  A line's updates are applied under a single write-lock
//! acquisition so readers never see half a line.

use std::sync::{Arc, PoisonError, RwLock};

use digiweight_types::DeviceState;

use crate::parser::{self, ParseError, TelemetryUpdate};

/// Shared handle to the latest device state. Clone it cheaply – all clones
/// share the same record.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<DeviceState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current record; the lock is released before returning.
    pub fn snapshot(&self) -> DeviceState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply every update in one critical section.
    pub fn apply(&self, updates: &TelemetryUpdate) {
        if updates.is_empty() {
            return;
        }
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in updates {
            state.set(*key, value.clone());
        }
    }

    /// Parse `line` and apply it.
    ///
    /// Returns the number of fields updated (`0` for non-telemetry lines).
    /// On a parse error nothing is applied.
    pub fn ingest_line(&self, line: &str) -> Result<usize, ParseError> {
        match parser::parse_line(line)? {
            Some(updates) => {
                self.apply(&updates);
                Ok(updates.len())
            }
            None => Ok(0),
        }
    }
}
