//! MCC 16-bit bootloader protocol commands and packets.
//!
//! This module implements the wire format spoken by the bootloader that
//! Microchip's MPLAB Code Configurator generates for PIC24 and dsPIC33
//! devices. The field widths and numeric codes are a hardware contract and
//! are pinned against recorded bootloader traffic, not derived.
//!
//! ## Frame Format
//!
//! Every packet in both directions starts with the same 11-byte header:
//!
//! ```text
//! +---------+-------------+-----------------+---------+
//! | Command | Data length | Unlock sequence | Address |
//! +---------+-------------+-----------------+---------+
//! | 1 byte  | 2 bytes     | 4 bytes         | 4 bytes |
//! +---------+-------------+-----------------+---------+
//! ```
//!
//! All multi-byte fields are little-endian. Responses echo the command byte
//! of the request they answer. Every response except `READ_VERSION` carries
//! a status byte after the header; on failure the frame ends there, on
//! success it is followed by the command-specific payload. The response
//! shape is therefore a function of the command that was sent, not of the
//! bytes themselves.

pub mod checksum;

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Key that unlocks flash for `WRITE_FLASH` and `ERASE_FLASH`.
///
/// Write operations fail silently if this key is wrong; the erase
/// confirmation and checksum steps exist to catch that.
pub const UNLOCK_SEQUENCE: u32 = 0x00AA0055;

/// Size of the common packet header in bytes.
pub const HEADER_SIZE: usize = 11;

/// Size of a `READ_VERSION` response in bytes (no status byte).
pub const VERSION_RESPONSE_SIZE: usize = 37;

/// Size of a generic response (header plus status byte).
pub const GENERIC_RESPONSE_SIZE: usize = 12;

/// Size of a successful `GET_MEMORY_ADDRESS_RANGE` response.
pub const MEMORY_RANGE_RESPONSE_SIZE: usize = 20;

/// Size of a successful `CALC_CHECKSUM` response.
pub const CHECKSUM_RESPONSE_SIZE: usize = 14;

/// Fill byte for write-block alignment padding.
pub const PAD_BYTE: u8 = 0x00;

/// First bootloader version (major.minor packed as hi.lo byte) that
/// supports the `CALC_CHECKSUM` command.
pub const CHECKSUM_MIN_VERSION: u16 = 0x0102;

/// Commands understood by the MCC 16-bit bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Read bootloader version and device parameters (0x00).
    ReadVersion = 0x00,
    /// Read flash memory (0x01). Accepted by the device but unused here.
    ReadFlash = 0x01,
    /// Write a block of data to flash (0x02).
    WriteFlash = 0x02,
    /// Erase a number of flash pages (0x03).
    EraseFlash = 0x03,
    /// Calculate a checksum over an address range (0x08).
    CalcChecksum = 0x08,
    /// Reset the device (0x09).
    ResetDevice = 0x09,
    /// Check whether a bootable application is installed (0x0A).
    SelfVerify = 0x0A,
    /// Get the program memory address range (0x0B).
    GetMemoryAddressRange = 0x0B,
}

impl CommandCode {
    /// Size in bytes of a successful response to this command.
    ///
    /// Failure responses always stop after the status byte, regardless of
    /// command.
    pub fn response_size(self) -> usize {
        match self {
            Self::ReadVersion => VERSION_RESPONSE_SIZE,
            Self::GetMemoryAddressRange => MEMORY_RANGE_RESPONSE_SIZE,
            Self::CalcChecksum => CHECKSUM_RESPONSE_SIZE,
            _ => GENERIC_RESPONSE_SIZE,
        }
    }
}

/// Status codes reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    /// Command executed successfully (0x01).
    Success = 0x01,
    /// The bootloader did not recognize the command (0xFF).
    UnsupportedCommand = 0xFF,
    /// Operation attempted outside the program memory range (0xFE).
    BadAddress = 0xFE,
    /// Command packet plus data exceeded the permitted length (0xFD).
    BadLength = 0xFD,
    /// No application detected in the program memory range (0xFC).
    VerifyFail = 0xFC,
}

impl TryFrom<u8> for ResponseCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Success),
            0xFF => Ok(Self::UnsupportedCommand),
            0xFE => Ok(Self::BadAddress),
            0xFD => Ok(Self::BadLength),
            0xFC => Ok(Self::VerifyFail),
            other => Err(Error::UnknownResponseCode(other)),
        }
    }
}

/// Command packet sent to the bootloader.
///
/// The meaning of `data_length` depends on the command: number of data bytes
/// following the packet for `WRITE_FLASH`, number of pages for `ERASE_FLASH`,
/// number of bytes to checksum for `CALC_CHECKSUM`. Other commands ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Command to execute.
    pub command: CommandCode,
    /// Command-specific length field.
    pub data_length: u16,
    /// Flash unlock key, required for write and erase.
    pub unlock_sequence: u32,
    /// Address at which to perform the command.
    pub address: u32,
}

impl Command {
    /// Create a command packet with all non-command fields zeroed.
    pub fn new(command: CommandCode) -> Self {
        Self {
            command,
            data_length: 0,
            unlock_sequence: 0,
            address: 0,
        }
    }

    /// Pack the header into its 11-byte wire form.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.push(self.command as u8);
        buf.write_u16::<LittleEndian>(self.data_length).unwrap();
        buf.write_u32::<LittleEndian>(self.unlock_sequence).unwrap();
        buf.write_u32::<LittleEndian>(self.address).unwrap();
        buf
    }

    /// Build the complete frame: header followed by the data payload.
    ///
    /// Only `WRITE_FLASH` carries data; for every other command `data` is
    /// empty.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = self.to_bytes();
        buf.extend_from_slice(data);
        buf
    }
}

/// Raw packet header, as echoed back by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Echoed command byte.
    pub command: u8,
    /// Echoed length field.
    pub data_length: u16,
    /// Echoed unlock field.
    pub unlock_sequence: u32,
    /// Echoed address field.
    pub address: u32,
}

impl Header {
    /// Parse the 11-byte header from the start of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "header needs {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }

        let mut rdr = Cursor::new(buf);
        let command = rdr.read_u8()?;
        let data_length = rdr.read_u16::<LittleEndian>()?;
        let unlock_sequence = rdr.read_u32::<LittleEndian>()?;
        let address = rdr.read_u32::<LittleEndian>()?;

        Ok(Self {
            command,
            data_length,
            unlock_sequence,
            address,
        })
    }
}

/// Response to a `READ_VERSION` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Bootloader version, major.minor packed as hi.lo byte.
    pub version: u16,
    /// Maximum packet size the bootloader accepts, header plus data.
    pub max_packet_length: u16,
    /// Device-specific identifier.
    pub device_id: u16,
    /// Flash page size in bytes; erase lengths are given in pages.
    pub erase_size: u16,
    /// Write block size in bytes; writes must align with a block.
    pub write_size: u16,
}

impl Version {
    /// Whether this bootloader version supports `CALC_CHECKSUM`.
    pub fn has_checksum(&self) -> bool {
        self.version >= CHECKSUM_MIN_VERSION
    }
}

/// Response to any command without a dedicated payload, and to any failed
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generic {
    /// Command this packet answers.
    pub command: CommandCode,
    /// Outcome reported by the device.
    pub status: ResponseCode,
}

/// Payload of a successful `GET_MEMORY_ADDRESS_RANGE` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// Low end of the flashable address space.
    pub program_start: u32,
    /// High end of the flashable address space, as reported by the device.
    ///
    /// The reported bound is inclusive and excludes the final byte of the
    /// last 24-bit instruction; see `get_boot_attrs` for the half-open range
    /// exposed to callers.
    pub program_end: u32,
}

/// Payload of a successful `CALC_CHECKSUM` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    /// Checksum of `data_length` bytes starting at `address`.
    pub checksum: u16,
}

/// A decoded response packet.
///
/// The variant is selected by the command that produced the response, since
/// the wire format does not self-describe which payload follows the header.
/// Failed commands decode to [`ResponsePacket::Generic`] whatever their
/// context, because the device truncates failure responses after the status
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePacket {
    /// `READ_VERSION` payload.
    Version(Version),
    /// Status-only response.
    Generic(Generic),
    /// `GET_MEMORY_ADDRESS_RANGE` payload.
    MemoryRange(MemoryRange),
    /// `CALC_CHECKSUM` payload.
    Checksum(Checksum),
}

impl ResponsePacket {
    /// Decode a complete response frame received in answer to `context`.
    ///
    /// Fails with a framing error if the echoed command does not match
    /// `context`, if the status byte is unknown, or if the frame length does
    /// not match the shape implied by `context` and the status.
    pub fn decode(context: CommandCode, buf: &[u8]) -> Result<Self> {
        let header = Header::from_bytes(buf)?;

        if header.command != context as u8 {
            return Err(Error::CommandMismatch {
                sent: context,
                received: header.command,
            });
        }

        // READ_VERSION responses carry no status byte.
        if context == CommandCode::ReadVersion {
            return Self::decode_version(buf);
        }

        if buf.len() < GENERIC_RESPONSE_SIZE {
            return Err(Error::ResponseLength {
                command: context,
                expected: GENERIC_RESPONSE_SIZE,
                got: buf.len(),
            });
        }

        let status = ResponseCode::try_from(buf[HEADER_SIZE])?;

        // Failure responses stop after the status byte.
        if status != ResponseCode::Success {
            expect_len(context, buf, GENERIC_RESPONSE_SIZE)?;
            return Ok(Self::Generic(Generic {
                command: context,
                status,
            }));
        }

        let mut rdr = Cursor::new(&buf[GENERIC_RESPONSE_SIZE..]);

        match context {
            CommandCode::GetMemoryAddressRange => {
                expect_len(context, buf, MEMORY_RANGE_RESPONSE_SIZE)?;
                Ok(Self::MemoryRange(MemoryRange {
                    program_start: rdr.read_u32::<LittleEndian>()?,
                    program_end: rdr.read_u32::<LittleEndian>()?,
                }))
            }
            CommandCode::CalcChecksum => {
                expect_len(context, buf, CHECKSUM_RESPONSE_SIZE)?;
                Ok(Self::Checksum(Checksum {
                    checksum: rdr.read_u16::<LittleEndian>()?,
                }))
            }
            _ => {
                expect_len(context, buf, GENERIC_RESPONSE_SIZE)?;
                Ok(Self::Generic(Generic {
                    command: context,
                    status,
                }))
            }
        }
    }

    fn decode_version(buf: &[u8]) -> Result<Self> {
        expect_len(CommandCode::ReadVersion, buf, VERSION_RESPONSE_SIZE)?;

        let mut rdr = Cursor::new(&buf[HEADER_SIZE..]);
        let version = rdr.read_u16::<LittleEndian>()?;
        let max_packet_length = rdr.read_u16::<LittleEndian>()?;
        rdr.set_position(rdr.position() + 2);
        let device_id = rdr.read_u16::<LittleEndian>()?;
        rdr.set_position(rdr.position() + 2);
        let erase_size = rdr.read_u16::<LittleEndian>()?;
        let write_size = rdr.read_u16::<LittleEndian>()?;

        Ok(Self::Version(Version {
            version,
            max_packet_length,
            device_id,
            erase_size,
            write_size,
        }))
    }
}

fn expect_len(command: CommandCode, buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(Error::ResponseLength {
            command,
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}
