//! Port abstraction and the `serialport`-backed implementation.
//!
//! The [`SerialLinkManager`][crate::manager::SerialLinkManager] never touches
//! a concrete serial handle.  It talks to a [`LinkPort`] obtained from a
//! [`PortConnector`], so the real USB device and the in-process
//! [`SimDevice`][crate::sim::SimDevice] are interchangeable.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, info, warn};

use crate::manager::LinkError;

/// Default baud rate of the actuator's USB-serial bridge.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Receive buffer cap; a peer that never sends a terminator is discarded
/// rather than growing the buffer without bound.
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// An open, line-oriented connection to the device.
pub trait LinkPort: Send {
    /// Return the next complete line if one is already waiting.
    ///
    /// Never blocks waiting for data: `Ok(None)` means nothing complete has
    /// arrived yet.  Any `Err` means the link is no longer usable.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Write `bytes` verbatim and flush.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Discovers a device by description and opens it.
pub trait PortConnector: Send + Sync {
    /// Open the first port whose description contains `hint`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotFound`] when no port matches, or the
    /// underlying open error when a match exists but cannot be opened.
    fn connect(&self, hint: &str) -> Result<Box<dyn LinkPort>, LinkError>;
}

// ────────────────────────────────────────────────────────────────────────────
// serialport-backed connector
// ────────────────────────────────────────────────────────────────────────────

/// Connector that scans the host's serial ports.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            timeout: Duration::from_millis(10),
        }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl PortConnector for SerialConnector {
    fn connect(&self, hint: &str) -> Result<Box<dyn LinkPort>, LinkError> {
        let ports = serialport::available_ports()?;
        debug!(count = ports.len(), "scanning serial ports");

        for info in ports {
            let description = describe_port(&info);
            debug!(port = %info.port_name, description = %description, "checking port");
            if !description.contains(hint) {
                continue;
            }
            let port = serialport::new(&info.port_name, self.baud_rate)
                .timeout(self.timeout)
                .open()?;
            info!(port = %info.port_name, baud = self.baud_rate, "device found");
            return Ok(Box::new(SerialPortLink::new(port)));
        }

        Err(LinkError::NotFound {
            hint: hint.to_string(),
        })
    }
}

/// Human-readable description used for hint matching: USB product and
/// manufacturer strings (when known) followed by the port name.
pub(crate) fn describe_port(info: &SerialPortInfo) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let SerialPortType::UsbPort(usb) = &info.port_type {
        if let Some(product) = usb.product.as_deref() {
            parts.push(product);
        }
        if let Some(manufacturer) = usb.manufacturer.as_deref() {
            parts.push(manufacturer);
        }
    }
    parts.push(&info.port_name);
    parts.join(" ")
}

/// A [`LinkPort`] over a real serial handle.
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
    rx_buffer: Vec<u8>,
}

impl SerialPortLink {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            rx_buffer: Vec::with_capacity(512),
        }
    }
}

impl LinkPort for SerialPortLink {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = take_line(&mut self.rx_buffer) {
            return Ok(Some(line));
        }

        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(None);
        }

        let mut buf = vec![0u8; available.min(4096)];
        let n = match self.port.read(&mut buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial device reported data but returned none",
                ));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e),
        };
        self.rx_buffer.extend_from_slice(&buf[..n]);

        if self.rx_buffer.len() > MAX_PENDING_BYTES && !self.rx_buffer.contains(&b'\n') {
            warn!(bytes = self.rx_buffer.len(), "discarding unterminated serial input");
            self.rx_buffer.clear();
        }

        Ok(take_line(&mut self.rx_buffer))
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

/// Pop the first complete, non-blank line out of `buffer`.
pub(crate) fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    #[test]
    fn take_line_waits_for_terminator() {
        let mut buf = b"DATA:force:1".to_vec();
        assert_eq!(take_line(&mut buf), None);
        buf.extend_from_slice(b".5\r\nDATA:pos");
        assert_eq!(take_line(&mut buf).as_deref(), Some("DATA:force:1.5"));
        assert_eq!(buf, b"DATA:pos".to_vec());
    }

    #[test]
    fn take_line_skips_blank_lines() {
        let mut buf = b"\r\n\n  \nack:ok\n".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some("ack:ok"));
        assert!(buf.is_empty());
    }

    #[test]
    fn take_line_replaces_invalid_utf8() {
        let mut buf = vec![b'a', 0xFF, b'b', b'\n'];
        let line = take_line(&mut buf).unwrap();
        assert!(line.starts_with('a') && line.ends_with('b'));
    }

    #[test]
    fn usb_description_includes_product_and_name() {
        let info = SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x303a,
                pid: 0x1001,
                serial_number: None,
                manufacturer: Some("Espressif".to_string()),
                product: Some("USB Serial Device".to_string()),
            }),
        };
        let description = describe_port(&info);
        assert!(description.contains("USB Serial Device"));
        assert!(description.contains("Espressif"));
        assert!(description.ends_with("/dev/ttyACM0"));
    }

    #[test]
    fn non_usb_description_is_port_name() {
        let info = SerialPortInfo {
            port_name: "COM1".to_string(),
            port_type: SerialPortType::Unknown,
        };
        assert_eq!(describe_port(&info), "COM1");
    }
}
