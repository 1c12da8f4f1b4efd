//! [`AckMailbox`] – holds device replies the telemetry reader pulled off the
//! link before anyone asked for them.
//!
//! The reader and the `/ack` handler both read from the same serial handle,
//! so a reply may land with either.  Non-telemetry lines the reader sees are
//! parked here; the oldest is evicted once the mailbox is full.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Replies retained before the oldest is dropped.
pub const ACK_CAPACITY: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct AckMailbox {
    inner: Arc<Mutex<VecDeque<String>>>,
}

impl AckMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        let mut queue = self.lock();
        if queue.len() == ACK_CAPACITY {
            if let Some(dropped) = queue.pop_front() {
                debug!(line = %dropped, "ack mailbox full, dropping oldest reply");
            }
        }
        queue.push_back(line);
    }

    /// Oldest parked reply, if any.
    pub fn pop(&self) -> Option<String> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mailbox = AckMailbox::new();
        mailbox.push("ack:set_mode".into());
        mailbox.push("ack:set_row".into());
        assert_eq!(mailbox.pop().as_deref(), Some("ack:set_mode"));
        assert_eq!(mailbox.pop().as_deref(), Some("ack:set_row"));
        assert_eq!(mailbox.pop(), None);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mailbox = AckMailbox::new();
        for i in 0..ACK_CAPACITY + 3 {
            mailbox.push(format!("ack:{i}"));
        }
        assert_eq!(mailbox.len(), ACK_CAPACITY);
        assert_eq!(mailbox.pop().as_deref(), Some("ack:3"));
    }
}
