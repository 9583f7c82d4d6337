//! Error types for picflash.

use crate::protocol::{CommandCode, ResponseCode};
use crate::session::SessionState;
use std::io;
use thiserror::Error;

/// Result type for picflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for picflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port read/write, read timeout).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The device echoed a different command than the one most recently sent.
    #[error("command echo mismatch: sent {sent:?}, device answered {received:#04x}")]
    CommandMismatch {
        /// Command the host sent.
        sent: CommandCode,
        /// Command byte echoed by the device.
        received: u8,
    },

    /// The device stopped sending mid-frame.
    #[error("truncated {command:?} response: {expected} more bytes expected")]
    TruncatedResponse {
        /// Command whose response was cut short.
        command: CommandCode,
        /// Number of bytes still owed by the device.
        expected: usize,
    },

    /// Response length does not match the shape implied by the command.
    #[error("bad {command:?} response length: expected {expected} bytes, got {got}")]
    ResponseLength {
        /// Command that selects the response shape.
        command: CommandCode,
        /// Length the shape requires.
        expected: usize,
        /// Length actually received.
        got: usize,
    },

    /// Status byte is not a known response code.
    #[error("unknown response code {0:#04x}")]
    UnknownResponseCode(u8),

    /// The device rejected a command.
    #[error("device rejected {command:?} at {address:#010x}: {code:?}")]
    Rejected {
        /// Rejected command.
        command: CommandCode,
        /// Failure code reported by the device.
        code: ResponseCode,
        /// Address the command targeted.
        address: u32,
    },

    /// An application was still detected after erasing flash.
    #[error("existing application could not be erased (unlock sequence may be incorrect)")]
    EraseConfirmation,

    /// Checksum reported by the device differs from the one computed locally.
    #[error("checksum mismatch at {address:#010x}: local {local:#06x}, device {device:#06x}")]
    ChecksumMismatch {
        /// Start address of the checksummed range.
        address: u32,
        /// Checksum computed by the host.
        local: u16,
        /// Checksum reported by the device.
        device: u16,
    },

    /// No bootable application was detected after flashing.
    #[error("flashing completed but no bootable application was detected")]
    VerifyFailed,

    /// Firmware segment lies outside the device's program memory range.
    #[error(
        "segment {start:#010x}:{end:#010x} outside program memory \
         {range_start:#010x}:{range_end:#010x}"
    )]
    SegmentOutOfRange {
        /// First address of the offending segment.
        start: u32,
        /// One past the last address of the offending segment.
        end: u32,
        /// Low end of the program memory range.
        range_start: u32,
        /// High end of the program memory range (exclusive).
        range_end: u32,
    },

    /// No firmware data within the program memory range.
    #[error("image contains no data within the program memory range")]
    EmptyImage,

    /// Erase range is not a whole number of erase pages.
    #[error("erase range {start:#010x}:{end:#010x} is not a multiple of erase size {erase_size}")]
    MisalignedEraseRange {
        /// Low end of the requested range.
        start: u32,
        /// High end of the requested range (exclusive).
        end: u32,
        /// Erase page size in bytes.
        erase_size: u16,
    },

    /// Operation attempted in the wrong session state.
    #[error("cannot {operation} in {state:?} state")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
