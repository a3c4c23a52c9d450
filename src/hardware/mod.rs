//! Device discovery seam and transport openers
//!
//! Platform concerns (Bluetooth SPP socket opening, permission prompts,
//! paired-device enumeration) live outside the core. This module defines
//! the seam they plug into: a [DeviceRef] naming something connectable and
//! a [TransportOpener] turning it into a byte channel.

pub mod simulation;

use serial_rs::{FlowControl, SerialPortSettings};

use crate::transport::{PromptTransport, SerialPortTransport, TransportResult};

/// Service UUID of the Bluetooth SPP profile ELM327 adapters expose
pub const SPP_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

/// A connectable adapter as presented by the platform layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    /// Display name, e.g. `OBDII` or `/dev/rfcomm0`
    pub name: String,
    /// Path or address the opener understands
    pub path: String,
}

impl DeviceRef {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Enumerates devices the platform already knows about (paired Bluetooth
/// adapters, present serial nodes). Supplied by the embedder.
pub trait DeviceScanner: Send + Sync {
    fn list_devices(&self) -> Vec<DeviceRef>;
}

/// Opens the byte channel behind a [DeviceRef].
///
/// Injected into [crate::adapter::AdapterController::connect] so the core
/// never touches platform socket APIs directly.
pub trait TransportOpener: Send + Sync {
    fn open(&self, device: &DeviceRef) -> TransportResult<Box<dyn PromptTransport>>;
}

/// Opener for serial device nodes (USB adapters, rfcomm-bound Bluetooth)
pub struct SerialPortOpener {
    baud: u32,
}

impl SerialPortOpener {
    /// ELM327 clones almost universally run 38400 baud
    pub fn new() -> Self {
        Self { baud: 38_400 }
    }

    pub fn with_baud(baud: u32) -> Self {
        Self { baud }
    }
}

impl Default for SerialPortOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportOpener for SerialPortOpener {
    fn open(&self, device: &DeviceRef) -> TransportResult<Box<dyn PromptTransport>> {
        let port = serial_rs::new_from_path(
            device.path.as_str(),
            Some(
                SerialPortSettings::default()
                    .baud(self.baud)
                    .read_timeout(Some(10))
                    .write_timeout(Some(100))
                    .set_flow_control(FlowControl::None)
                    .set_blocking(false),
            ),
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{e:?}")))?;
        Ok(Box::new(SerialPortTransport::new(port)))
    }
}
