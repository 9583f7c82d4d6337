//! Port abstraction for the serial link to the bootloader.
//!
//! The protocol layer is I/O-agnostic: it only needs to write bytes, read an
//! exact number of bytes within a bounded time, and clear stale input. The
//! `Port` trait captures that contract; `NativePort` implements it over the
//! `serialport` crate, and tests substitute an in-memory mock.

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Default read timeout. Erasing a large memory area can take several
    /// seconds, so callers flashing big images may want more.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte-stream transport to a device in bootloader mode.
///
/// Reads must respect the configured timeout: when the requested bytes do
/// not arrive in time, the read fails with a timeout error instead of
/// blocking forever. The bootloader protocol is strictly lockstep, so a
/// single owner drives the port for the whole session.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Discard any buffered input/output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;
}

#[cfg(feature = "native")]
pub use native::NativePort;
