//! Serial port back-end for WaveShark Communicators
//!
//! This module provides async line I/O with Communicators using
//! tokio-serial, and port enumeration using serialport.

use crate::config::{SerialConfig, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS};
use crate::error::{GatewayError, Result};
use crate::interface::{LineBuffer, LineTransport, PortDescriptor, PortProvider};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{FlowControl, SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, trace, warn};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial line transport for one Communicator
pub struct SerialLineTransport {
    /// Serial stream
    stream: SerialStream,

    /// Bytes read but not yet returned as lines
    buffer: LineBuffer,

    /// Default read timeout
    read_timeout: Duration,

    /// Transport name for logging
    name: String,
}

impl SerialLineTransport {
    /// Open `port` at `baud_rate` with flow control off and RTS/DTR deasserted
    pub fn open(port: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        debug!(port = %port, baud = baud_rate, "Opening serial port");

        let mut stream = tokio_serial::new(port, baud_rate)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open_native_async()
            .map_err(|e| GatewayError::PortOpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        // Asserted control lines reset ESP32-style boards
        if let Err(e) = stream.write_request_to_send(false) {
            debug!(port = %port, error = %e, "Could not deassert RTS");
        }
        if let Err(e) = stream.write_data_terminal_ready(false) {
            debug!(port = %port, error = %e, "Could not deassert DTR");
        }

        Ok(Self {
            stream,
            buffer: LineBuffer::new(),
            read_timeout,
            name: format!("serial:{}", port),
        })
    }
}

#[async_trait]
impl LineTransport for SerialLineTransport {
    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.map_err(|e| {
            warn!(transport = %self.name, error = %e, "Serial write error");
            GatewayError::WriteError(e.to_string())
        })?;

        self.stream
            .flush()
            .await
            .map_err(|e| GatewayError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    async fn read_line_within(&mut self, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            if let Some(line) = self.buffer.take_line() {
                return line;
            }

            match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Err(_) => {
                    trace!(transport = %self.name, pending = self.buffer.len(), "Read timed out");
                    return String::new();
                }
                Ok(Ok(0)) => {
                    debug!(transport = %self.name, "Serial port returned EOF");
                    return String::new();
                }
                Ok(Ok(n)) => {
                    trace!(bytes = n, "Read from serial port");
                    self.buffer.extend(&buf[..n]);
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return String::new();
                }
                Ok(Err(e)) => {
                    debug!(transport = %self.name, error = %e, "Serial read error");
                    return String::new();
                }
            }
        }
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialLineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLineTransport")
            .field("name", &self.name)
            .field("read_timeout", &self.read_timeout)
            .field("buffer_len", &self.buffer.len())
            .finish()
    }
}

/// Enumerates and opens the computer's serial ports
#[derive(Debug, Clone)]
pub struct SerialPortProvider {
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialPortProvider {
    /// Create a provider with default settings
    pub fn new() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }

    /// Create from serial configuration
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            read_timeout: config.read_timeout,
        }
    }
}

impl Default for SerialPortProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortProvider for SerialPortProvider {
    fn available_ports(&self) -> Result<Vec<PortDescriptor>> {
        let ports = serialport::available_ports()?;

        let mut descriptors: Vec<PortDescriptor> = ports
            .into_iter()
            .map(|port| PortDescriptor::new(port.port_name, describe(&port.port_type)))
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));

        info!(count = descriptors.len(), "Enumerated serial ports");
        Ok(descriptors)
    }

    async fn open(&self, port: &str) -> Result<Box<dyn LineTransport>> {
        let transport = SerialLineTransport::open(port, self.baud_rate, self.read_timeout)?;
        Ok(Box::new(transport))
    }
}

/// Build a human-readable descriptor from the port's hardware information
fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb_info) => {
            let mut parts = Vec::new();
            if let Some(product) = &usb_info.product {
                parts.push(product.clone());
            }
            if let Some(manufacturer) = &usb_info.manufacturer {
                parts.push(manufacturer.clone());
            }
            parts.push(format!("VID:PID={:04X}:{:04X}", usb_info.vid, usb_info.pid));
            parts.join(" ")
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "Unknown".to_string(),
    }
}
