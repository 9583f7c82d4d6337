//! # picflash
//!
//! A library for flashing firmware to 16-bit Microchip MCUs and DSCs from
//! the PIC24 and dsPIC33 families, which are running the serial bootloader
//! generated by the MPLAB Code Configurator tool.
//!
//! This crate provides the core functionality for talking to the bootloader
//! over a serial port, including:
//!
//! - the bootloader packet protocol (framing, command/response pairing,
//!   typed payload decoding)
//! - bootloader attribute discovery (memory range, block sizes, version,
//!   checksum support)
//! - splitting firmware segments into aligned, padded write chunks
//! - the flashing state machine: erase, erase confirmation, chunked writes,
//!   optional per-chunk checksum verification, self-verify and reset
//!
//! The protocol layer is I/O-agnostic: anything implementing [`Port`] can
//! carry a session. On native platforms [`NativePort`] wraps the
//! `serialport` crate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use picflash::{FlashOptions, FlashSession, NativePort, Segment, SerialConfig};
//!
//! fn main() -> picflash::Result<()> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 460800))?;
//!     let mut session = FlashSession::discover(port)?;
//!     println!("Bootloader version {:#06x}", session.attrs().version);
//!
//!     let firmware = vec![Segment::new(0x2000, std::fs::read("app.bin")?)];
//!     let options = FlashOptions {
//!         verify_checksum: true,
//!         reset_after: true,
//!     };
//!     session.flash(&firmware, &options, |done, total| {
//!         println!("{done}/{total} bytes");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    image::{Chunk, Segment, chunked},
    port::{Port, SerialConfig},
    protocol::{CommandCode, ResponseCode, ResponsePacket},
    session::{BootAttrs, FlashOptions, FlashSession, SessionState, get_boot_attrs},
};
