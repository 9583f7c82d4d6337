//! Bootloader attribute discovery and the flashing state machine.
//!
//! A [`FlashSession`] owns the port for the duration of one flashing
//! operation and drives the bootloader through a fixed sequence: discover
//! attributes, erase, confirm the erase, write chunks (optionally verifying
//! each with a device-side checksum), self-verify, and optionally reset.
//!
//! The protocol is strictly lockstep: every command is answered by exactly
//! one response before the next command is sent. Two documented device
//! quirks are handled as explicit branches:
//!
//! - **Erase confirmation is inverted.** `SELF_VERIFY` right after
//!   `ERASE_FLASH` must answer `VERIFY_FAIL` (no application present). A
//!   plain success here means the erase did not take.
//! - **Checksum ranges at the top of program memory.** The bootloader may
//!   answer `BAD_ADDRESS` to a `CALC_CHECKSUM` request that touches the top
//!   of the program memory range. For the final chunk this is logged and
//!   tolerated; anywhere else it is fatal.

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::image::{Chunk, Segment, chunked};
use crate::port::Port;
use crate::protocol::checksum::local_checksum;
use crate::protocol::{
    Command, CommandCode, GENERIC_RESPONSE_SIZE, HEADER_SIZE, Header, ResponseCode,
    ResponsePacket, UNLOCK_SEQUENCE,
};

/// Bootloader attributes, read once per session.
///
/// Assembled from the `READ_VERSION` and `GET_MEMORY_ADDRESS_RANGE`
/// responses and immutable for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootAttrs {
    /// Bootloader version, major.minor packed as hi.lo byte.
    pub version: u16,
    /// Maximum packet size the bootloader accepts, header plus data.
    pub max_packet_length: u16,
    /// Device-specific identifier.
    pub device_id: u16,
    /// Flash page size in bytes.
    pub erase_size: u16,
    /// Write block size in bytes.
    pub write_size: u16,
    /// Half-open range of flashable program memory addresses.
    pub memory_range: (u32, u32),
    /// Whether the bootloader supports `CALC_CHECKSUM`.
    pub has_checksum: bool,
}

/// Where a session is in the flashing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attributes discovered; flash not yet erased.
    Ready,
    /// `ERASE_FLASH` acknowledged; erase not yet confirmed.
    Erased,
    /// Erase confirmed empty; writes may proceed.
    EraseConfirmed,
    /// All planned chunks written; awaiting final verification.
    Verifying,
    /// Final self-verify passed; an application is installed.
    Flashed,
    /// Device reset issued; the session is over.
    Done,
}

/// Configuration flags for the high-level flash operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashOptions {
    /// Verify each chunk with `CALC_CHECKSUM` after writing it.
    pub verify_checksum: bool,
    /// Send `RESET_DEVICE` after a successful final verify.
    pub reset_after: bool,
}

/// One flashing session against a device in bootloader mode.
///
/// Generic over the port type `P`; the session owns the port exclusively
/// until [`FlashSession::into_port`] gives it back.
#[derive(Debug)]
pub struct FlashSession<P: Port> {
    port: P,
    attrs: BootAttrs,
    state: SessionState,
    bytes_written: usize,
}

impl<P: Port> FlashSession<P> {
    /// Run attribute discovery on `port` and open a session.
    pub fn discover(mut port: P) -> Result<Self> {
        let attrs = get_boot_attrs(&mut port)?;
        Ok(Self {
            port,
            attrs,
            state: SessionState::Ready,
            bytes_written: 0,
        })
    }

    /// The attributes discovered at session start.
    pub fn attrs(&self) -> &BootAttrs {
        &self.attrs
    }

    /// Current state of the flashing sequence.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Cumulative bytes written by this session, padding included.
    ///
    /// On a fatal error this marks the exact point where the session
    /// stopped.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Flash `segments`, start to finish.
    ///
    /// Erases the full program memory range, confirms the erase, writes
    /// every chunk in ascending address order, verifies the result, and
    /// optionally resets the device. `progress` is called after each chunk
    /// with `(bytes_done, bytes_total)`; it is advisory only.
    pub fn flash<F>(&mut self, segments: &[Segment], options: &FlashOptions, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        self.require_state(SessionState::Ready, "flash")?;

        let (total_bytes, chunks) = chunked(segments, &self.attrs)?;
        info!(
            "Flashing {} bytes in {} chunks",
            total_bytes,
            chunks.len()
        );

        let verify_checksum = if options.verify_checksum && !self.attrs.has_checksum {
            warn!("Bootloader does not support checksumming; skipping verification");
            false
        } else {
            options.verify_checksum
        };

        self.erase()?;
        self.confirm_erase()?;

        let last = chunks.len() - 1;

        for (i, chunk) in chunks.iter().enumerate() {
            self.write_chunk(chunk)?;

            if verify_checksum {
                match self.checksum_chunk(chunk) {
                    // The bootloader rejects checksum ranges touching the top
                    // of program memory; tolerated for the final chunk only.
                    Err(Error::Rejected {
                        code: ResponseCode::BadAddress,
                        ..
                    }) if i == last => {
                        warn!(
                            "Device rejected checksum range at {:#010x}; \
                             skipping verification of the final chunk",
                            chunk.address
                        );
                    }
                    result => result?,
                }
            }

            progress(self.bytes_written, total_bytes);
        }

        self.verify()?;

        if options.reset_after {
            self.reset()?;
        }

        Ok(())
    }

    /// Erase the entire program memory range.
    pub fn erase(&mut self) -> Result<()> {
        self.erase_range(self.attrs.memory_range)
    }

    /// Erase a half-open address range, which must be a whole number of
    /// erase pages.
    ///
    /// A wrong unlock sequence makes the erase fail silently; follow up
    /// with [`FlashSession::confirm_erase`] before writing.
    pub fn erase_range(&mut self, range: (u32, u32)) -> Result<()> {
        self.require_state(SessionState::Ready, "erase")?;

        let (start, end) = range;
        let erase_size = u32::from(self.attrs.erase_size);

        if end < start || (end - start) % erase_size != 0 {
            return Err(Error::MisalignedEraseRange {
                start,
                end,
                erase_size: self.attrs.erase_size,
            });
        }

        let pages = (end - start) / erase_size;
        let data_length = u16::try_from(pages).map_err(|_| {
            Error::Protocol(format!("erase range spans {pages} pages, too many for one command"))
        })?;

        info!("Erasing {start:#010x}:{end:#010x} ({pages} pages)");
        let command = Command {
            command: CommandCode::EraseFlash,
            data_length,
            unlock_sequence: UNLOCK_SEQUENCE,
            address: start,
        };
        self.expect_success(&command, &[])?;

        self.state = SessionState::Erased;
        Ok(())
    }

    /// Confirm that the erase took, using the inverted `SELF_VERIFY` check.
    ///
    /// `VERIFY_FAIL` is the nominal answer here: no application is present,
    /// so the erase succeeded. A success response means an application is
    /// still installed and the session is dead.
    pub fn confirm_erase(&mut self) -> Result<()> {
        self.require_state(SessionState::Erased, "confirm erase")?;

        if self.self_verify()? {
            debug!("An application was detected; flash erase failed");
            return Err(Error::EraseConfirmation);
        }

        debug!("No application detected; flash erase successful");
        self.state = SessionState::EraseConfirmed;
        Ok(())
    }

    /// Write one chunk to flash.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.require_state(SessionState::EraseConfirmed, "write")?;

        debug!(
            "Writing {} bytes to {:#010x}",
            chunk.data.len(),
            chunk.address
        );

        let data_length = u16::try_from(chunk.data.len())
            .map_err(|_| Error::Protocol(format!("chunk of {} bytes too large", chunk.data.len())))?;
        let command = Command {
            command: CommandCode::WriteFlash,
            data_length,
            unlock_sequence: UNLOCK_SEQUENCE,
            address: chunk.address,
        };
        self.expect_success(&command, &chunk.data)?;

        self.bytes_written += chunk.data.len();
        Ok(())
    }

    /// Compare the device's checksum of a chunk's address range against the
    /// locally computed one.
    pub fn checksum_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.require_state(SessionState::EraseConfirmed, "checksum")?;

        let local = local_checksum(&chunk.data);
        let data_length = u16::try_from(chunk.data.len())
            .map_err(|_| Error::Protocol(format!("chunk of {} bytes too large", chunk.data.len())))?;
        let mut command = Command::new(CommandCode::CalcChecksum);
        command.data_length = data_length;
        command.address = chunk.address;

        match send_and_receive(&mut self.port, &command, &[])? {
            ResponsePacket::Checksum(response) if response.checksum == local => {
                trace!("Checksum OK at {:#010x}: {local:#06x}", chunk.address);
                Ok(())
            }
            ResponsePacket::Checksum(response) => {
                debug!("Checksum mismatch; unlock sequence may be incorrect");
                Err(Error::ChecksumMismatch {
                    address: chunk.address,
                    local,
                    device: response.checksum,
                })
            }
            ResponsePacket::Generic(generic) => Err(Error::Rejected {
                command: CommandCode::CalcChecksum,
                code: generic.status,
                address: chunk.address,
            }),
            other => unexpected(&other),
        }
    }

    /// Ask the device whether a bootable application is installed.
    pub fn self_verify(&mut self) -> Result<bool> {
        let command = Command::new(CommandCode::SelfVerify);

        match send_and_receive(&mut self.port, &command, &[])? {
            ResponsePacket::Generic(generic) => match generic.status {
                ResponseCode::Success => Ok(true),
                ResponseCode::VerifyFail => Ok(false),
                code => Err(Error::Rejected {
                    command: CommandCode::SelfVerify,
                    code,
                    address: 0,
                }),
            },
            other => unexpected(&other),
        }
    }

    /// Run the final verification: the device must now detect an
    /// application.
    pub fn verify(&mut self) -> Result<()> {
        self.require_state(SessionState::EraseConfirmed, "verify")?;
        self.state = SessionState::Verifying;

        if !self.self_verify()? {
            return Err(Error::VerifyFailed);
        }

        info!("Self verify OK");
        self.state = SessionState::Flashed;
        Ok(())
    }

    /// Reset the device.
    ///
    /// The device reboots immediately after acknowledging; only the generic
    /// acknowledgement is read. Permitted from any state and ends the
    /// session.
    pub fn reset(&mut self) -> Result<()> {
        let command = Command::new(CommandCode::ResetDevice);
        self.expect_success(&command, &[])?;

        self.state = SessionState::Done;
        info!("Device reset");
        Ok(())
    }

    fn require_state(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn expect_success(&mut self, command: &Command, data: &[u8]) -> Result<()> {
        match send_and_receive(&mut self.port, command, data)? {
            ResponsePacket::Generic(generic) if generic.status == ResponseCode::Success => Ok(()),
            ResponsePacket::Generic(generic) => Err(Error::Rejected {
                command: command.command,
                code: generic.status,
                address: command.address,
            }),
            other => unexpected(&other),
        }
    }
}

/// Read the bootloader's attributes.
///
/// Sends `READ_VERSION` followed by `GET_MEMORY_ADDRESS_RANGE` and
/// assembles the result into one record. Idempotent and side-effect-free on
/// the device; fails on the first bad exchange without exposing a partial
/// result.
pub fn get_boot_attrs<P: Port>(port: &mut P) -> Result<BootAttrs> {
    let version = read_version(port)?;

    if version.write_size == 0 {
        return Err(Error::Protocol("device reports zero write block size".into()));
    }
    if usize::from(version.max_packet_length) < HEADER_SIZE + usize::from(version.write_size) {
        return Err(Error::Protocol(format!(
            "write block of {} bytes does not fit in max packet length {}",
            version.write_size, version.max_packet_length
        )));
    }

    let memory_range = get_memory_address_range(port)?;

    if !version.has_checksum() {
        debug!("Bootloader predates CALC_CHECKSUM support");
    }

    debug!("Got bootloader attributes:");
    debug!("Version:           {:#06x}", version.version);
    debug!("Max packet length: {}", version.max_packet_length);
    debug!("Erase size:        {}", version.erase_size);
    debug!("Write size:        {}", version.write_size);

    Ok(BootAttrs {
        version: version.version,
        max_packet_length: version.max_packet_length,
        device_id: version.device_id,
        erase_size: version.erase_size,
        write_size: version.write_size,
        memory_range,
        has_checksum: version.has_checksum(),
    })
}

fn read_version<P: Port>(port: &mut P) -> Result<crate::protocol::Version> {
    let command = Command::new(CommandCode::ReadVersion);

    match send_and_receive(port, &command, &[])? {
        ResponsePacket::Version(version) => Ok(version),
        other => unexpected(&other),
    }
}

fn get_memory_address_range<P: Port>(port: &mut P) -> Result<(u32, u32)> {
    let command = Command::new(CommandCode::GetMemoryAddressRange);

    match send_and_receive(port, &command, &[])? {
        ResponsePacket::MemoryRange(range) => {
            if range.program_end < range.program_start {
                return Err(Error::Protocol(format!(
                    "device reports inverted memory range {:#010x}:{:#010x}",
                    range.program_start, range.program_end
                )));
            }
            debug!(
                "Got program memory range: {:#010x}:{:#010x}",
                range.program_start, range.program_end
            );
            // The reported upper bound is inclusive and omits the final byte
            // of the last 24-bit instruction; +2 yields the half-open range
            // of writable addresses.
            let end = range.program_end.checked_add(2).ok_or_else(|| {
                Error::Protocol(format!(
                    "program memory end {:#010x} overflows the address space",
                    range.program_end
                ))
            })?;
            Ok((range.program_start, end))
        }
        ResponsePacket::Generic(generic) => Err(Error::Rejected {
            command: CommandCode::GetMemoryAddressRange,
            code: generic.status,
            address: 0,
        }),
        other => unexpected(&other),
    }
}

fn send_and_receive<P: Port>(port: &mut P, command: &Command, data: &[u8]) -> Result<ResponsePacket> {
    let frame = command.encode(data);

    if data.is_empty() {
        trace!("TX: {}", hex_bytes(&frame));
    } else {
        trace!(
            "TX: {} plus {} data bytes",
            hex_bytes(&frame[..HEADER_SIZE]),
            data.len()
        );
    }

    port.write_all(&frame)?;
    port.flush()?;

    read_response(port, command.command)
}

/// Read one response frame in answer to `context`.
///
/// The frame length depends on whether the command failed, so the frame is
/// read in stages: header, status byte, then the success-only remainder.
/// A timeout on the header is a transport failure; a short read after a
/// valid header is a framing failure, since the stream is desynchronized.
fn read_response<P: Port>(port: &mut P, context: CommandCode) -> Result<ResponsePacket> {
    let mut buf = vec![0u8; HEADER_SIZE];
    port.read_exact(&mut buf)?;
    trace!("RX: {}", hex_bytes(&buf));

    let header = Header::from_bytes(&buf)?;
    if header.command != context as u8 {
        return Err(Error::CommandMismatch {
            sent: context,
            received: header.command,
        });
    }

    let full_size = context.response_size();

    // READ_VERSION responses carry no status byte.
    if context == CommandCode::ReadVersion {
        read_remainder(port, &mut buf, full_size, context)?;
        return ResponsePacket::decode(context, &buf);
    }

    read_remainder(port, &mut buf, GENERIC_RESPONSE_SIZE, context)?;

    // Failure responses stop after the status byte.
    if ResponseCode::try_from(buf[HEADER_SIZE])? == ResponseCode::Success {
        read_remainder(port, &mut buf, full_size, context)?;
    }

    ResponsePacket::decode(context, &buf)
}

fn read_remainder<P: Port>(
    port: &mut P,
    buf: &mut Vec<u8>,
    target: usize,
    context: CommandCode,
) -> Result<()> {
    if target <= buf.len() {
        return Ok(());
    }

    let mut rest = vec![0u8; target - buf.len()];
    port.read_exact(&mut rest).map_err(|_| Error::TruncatedResponse {
        command: context,
        expected: rest.len(),
    })?;
    trace!("RX: {}", hex_bytes(&rest));

    buf.extend_from_slice(&rest);
    Ok(())
}

fn unexpected<T>(packet: &ResponsePacket) -> Result<T> {
    Err(Error::Protocol(format!(
        "unexpected response packet: {packet:?}"
    )))
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::time::Duration;

    /// Mock serial port with separate read/write buffers.
    ///
    /// Responses are scripted up front; because the protocol is lockstep,
    /// concatenating them in exchange order is enough. An exhausted read
    /// buffer behaves like a read timeout.
    #[derive(Debug)]
    struct MockPort {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
    }

    impl MockPort {
        fn new(responses: &[Vec<u8>]) -> Self {
            Self {
                read_buf: responses.iter().flatten().copied().collect(),
                write_buf: Vec::new(),
            }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.read_buf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(100)
        }
        fn clear_buffers(&mut self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "mock"
        }
    }

    // --- scripted response builders ---

    fn version_response(erase_size: u16, write_size: u16) -> Vec<u8> {
        let mut buf = Command::new(CommandCode::ReadVersion).to_bytes();
        buf.extend_from_slice(&0x0102u16.to_le_bytes());
        buf.extend_from_slice(&256u16.to_le_bytes());
        buf.extend_from_slice(&[0; 2]);
        buf.extend_from_slice(&0x3456u16.to_le_bytes());
        buf.extend_from_slice(&[0; 2]);
        buf.extend_from_slice(&erase_size.to_le_bytes());
        buf.extend_from_slice(&write_size.to_le_bytes());
        buf.extend_from_slice(&[0; 12]);
        buf
    }

    fn generic_response(command: CommandCode, status: ResponseCode) -> Vec<u8> {
        let mut buf = Command::new(command).to_bytes();
        buf.push(status as u8);
        buf
    }

    fn memory_range_response(start: u32, reported_end: u32) -> Vec<u8> {
        let mut buf = Command::new(CommandCode::GetMemoryAddressRange).to_bytes();
        buf.push(ResponseCode::Success as u8);
        buf.extend_from_slice(&start.to_le_bytes());
        buf.extend_from_slice(&reported_end.to_le_bytes());
        buf
    }

    fn checksum_response(value: u16) -> Vec<u8> {
        let mut buf = Command::new(CommandCode::CalcChecksum).to_bytes();
        buf.push(ResponseCode::Success as u8);
        buf.extend_from_slice(&value.to_le_bytes());
        buf
    }

    /// Discovery responses for a device with `{range [0x1000, 0x2000),
    /// write 8, erase 0x1000, checksum capable}`. The device reports the
    /// range end as 0x1FFE; discovery exposes 0x2000.
    fn discovery_responses() -> Vec<Vec<u8>> {
        vec![
            version_response(0x1000, 8),
            memory_range_response(0x1000, 0x1FFE),
        ]
    }

    fn test_attrs() -> BootAttrs {
        BootAttrs {
            version: 0x0102,
            max_packet_length: 256,
            device_id: 0x3456,
            erase_size: 0x1000,
            write_size: 8,
            memory_range: (0x1000, 0x2000),
            has_checksum: true,
        }
    }

    /// Parse the command stream a session wrote to the mock port.
    fn sent_commands(written: &[u8]) -> Vec<(u8, u16, u32)> {
        let mut commands = Vec::new();
        let mut offset = 0;

        while offset < written.len() {
            let header = Header::from_bytes(&written[offset..offset + HEADER_SIZE]).unwrap();
            commands.push((header.command, header.data_length, header.address));
            offset += HEADER_SIZE;
            if header.command == CommandCode::WriteFlash as u8 {
                offset += usize::from(header.data_length);
            }
        }

        commands
    }

    // --- discovery ---

    #[test]
    fn test_discover_assembles_attrs() {
        let port = MockPort::new(&discovery_responses());
        let session = FlashSession::discover(port).unwrap();

        assert_eq!(*session.attrs(), test_attrs());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.bytes_written(), 0);
    }

    #[test]
    fn test_discover_times_out_on_silent_device() {
        let port = MockPort::new(&[]);
        let err = FlashSession::discover(port).unwrap_err();

        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_truncated_response_is_framing_error() {
        // Valid header, then the device goes quiet mid-frame.
        let mut partial = version_response(0x1000, 8);
        partial.truncate(20);

        let port = MockPort::new(&[partial]);
        let err = FlashSession::discover(port).unwrap_err();

        assert!(matches!(
            err,
            Error::TruncatedResponse {
                command: CommandCode::ReadVersion,
                ..
            }
        ));
    }

    #[test]
    fn test_echoed_command_mismatch() {
        let port = MockPort::new(&[generic_response(
            CommandCode::SelfVerify,
            ResponseCode::Success,
        )]);
        let err = FlashSession::discover(port).unwrap_err();

        assert!(matches!(
            err,
            Error::CommandMismatch {
                sent: CommandCode::ReadVersion,
                received: 0x0A,
            }
        ));
    }

    #[test]
    fn test_discover_rejects_oversized_write_block() {
        let mut version = Command::new(CommandCode::ReadVersion).to_bytes();
        version.extend_from_slice(&0x0102u16.to_le_bytes());
        version.extend_from_slice(&16u16.to_le_bytes()); // max packet length
        version.extend_from_slice(&[0; 2]);
        version.extend_from_slice(&0x3456u16.to_le_bytes());
        version.extend_from_slice(&[0; 2]);
        version.extend_from_slice(&0x1000u16.to_le_bytes());
        version.extend_from_slice(&64u16.to_le_bytes()); // write size
        version.extend_from_slice(&[0; 12]);

        let port = MockPort::new(&[version]);
        let err = FlashSession::discover(port).unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
    }

    // --- erase confirmation inversion ---

    #[test]
    fn test_erase_confirmed_by_verify_fail() {
        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));

        let port = MockPort::new(&responses);
        let mut session = FlashSession::discover(port).unwrap();

        session.erase().unwrap();
        assert_eq!(session.state(), SessionState::Erased);

        session.confirm_erase().unwrap();
        assert_eq!(session.state(), SessionState::EraseConfirmed);
    }

    #[test]
    fn test_erase_confirmation_fails_on_success_answer() {
        // SELF_VERIFY succeeding right after an erase means an application
        // is still present: the erase silently failed.
        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::Success));

        let port = MockPort::new(&responses);
        let mut session = FlashSession::discover(port).unwrap();

        session.erase().unwrap();
        let err = session.confirm_erase().unwrap_err();

        assert!(matches!(err, Error::EraseConfirmation));
        assert_eq!(session.state(), SessionState::Erased);
    }

    #[test]
    fn test_erase_range_must_be_page_aligned() {
        let port = MockPort::new(&discovery_responses());
        let mut session = FlashSession::discover(port).unwrap();

        let err = session.erase_range((0x1000, 0x1800)).unwrap_err();
        assert!(matches!(err, Error::MisalignedEraseRange { .. }));
    }

    // --- state discipline ---

    #[test]
    fn test_write_requires_confirmed_erase() {
        let port = MockPort::new(&discovery_responses());
        let mut session = FlashSession::discover(port).unwrap();

        let chunk = Chunk {
            address: 0x1000,
            data: vec![0; 8],
        };
        let err = session.write_chunk(&chunk).unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidState {
                operation: "write",
                state: SessionState::Ready,
            }
        ));
    }

    // --- full flash runs ---

    fn flash_responses(chunks: &[Chunk], options: &FlashOptions) -> Vec<Vec<u8>> {
        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));

        for chunk in chunks {
            responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::Success));
            if options.verify_checksum {
                responses.push(checksum_response(local_checksum(&chunk.data)));
            }
        }

        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::Success));
        if options.reset_after {
            responses.push(generic_response(CommandCode::ResetDevice, ResponseCode::Success));
        }
        responses
    }

    #[test]
    fn test_full_flash_run() {
        let segments = [
            Segment::new(0x1000, (0..16).collect()),
            Segment::new(0x1800, vec![0xAB; 8]),
        ];
        let options = FlashOptions {
            verify_checksum: true,
            reset_after: false,
        };
        let (total, chunks) = chunked(&segments, &test_attrs()).unwrap();

        let port = MockPort::new(&flash_responses(&chunks, &options));
        let mut session = FlashSession::discover(port).unwrap();

        let mut reports = Vec::new();
        session
            .flash(&segments, &options, |done, total| reports.push((done, total)))
            .unwrap();

        assert_eq!(session.state(), SessionState::Flashed);
        assert_eq!(session.bytes_written(), total);
        assert_eq!(reports.len(), chunks.len());
        assert_eq!(*reports.last().unwrap(), (total, total));
        assert!(reports.windows(2).all(|w| w[0].0 < w[1].0));

        let sent = sent_commands(&session.into_port().write_buf);

        // One erase over the whole range.
        let erases: Vec<_> = sent
            .iter()
            .filter(|(c, _, _)| *c == CommandCode::EraseFlash as u8)
            .collect();
        assert_eq!(erases.len(), 1);
        assert_eq!(erases[0].2, 0x1000);
        assert_eq!(erases[0].1, 1); // (0x2000 - 0x1000) / 0x1000 pages

        // Every chunk written in ascending order, checksummed right after.
        let writes: Vec<u32> = sent
            .iter()
            .filter(|(c, _, _)| *c == CommandCode::WriteFlash as u8)
            .map(|(_, _, addr)| *addr)
            .collect();
        assert_eq!(writes, vec![0x1000, 0x1008, 0x1800]);

        let checksums: Vec<u32> = sent
            .iter()
            .filter(|(c, _, _)| *c == CommandCode::CalcChecksum as u8)
            .map(|(_, _, addr)| *addr)
            .collect();
        assert_eq!(checksums, writes);
    }

    #[test]
    fn test_flash_with_reset_ends_done() {
        let segments = [Segment::new(0x1000, vec![0x5A; 8])];
        let options = FlashOptions {
            verify_checksum: false,
            reset_after: true,
        };
        let (_, chunks) = chunked(&segments, &test_attrs()).unwrap();

        let port = MockPort::new(&flash_responses(&chunks, &options));
        let mut session = FlashSession::discover(port).unwrap();

        session.flash(&segments, &options, |_, _| {}).unwrap();
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn test_write_rejection_aborts_with_context() {
        let segments = [Segment::new(0x1000, vec![0x11; 16])];
        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));
        responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::BadLength));

        let port = MockPort::new(&responses);
        let mut session = FlashSession::discover(port).unwrap();

        let err = session
            .flash(&segments, &FlashOptions::default(), |_, _| {})
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Rejected {
                command: CommandCode::WriteFlash,
                code: ResponseCode::BadLength,
                address: 0x1008,
            }
        ));
        // First chunk made it; the session stopped at the second.
        assert_eq!(session.bytes_written(), 8);
    }

    // --- checksum quirks ---

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let segments = [Segment::new(0x1000, vec![0x77; 8])];
        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));
        responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::Success));
        responses.push(checksum_response(0xDEAD));

        let port = MockPort::new(&responses);
        let mut session = FlashSession::discover(port).unwrap();

        let options = FlashOptions {
            verify_checksum: true,
            reset_after: false,
        };
        let err = session.flash(&segments, &options, |_, _| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                address: 0x1000,
                device: 0xDEAD,
                ..
            }
        ));
    }

    #[test]
    fn test_bad_address_checksum_on_final_chunk_continues() {
        // Chunks at 0x1000 and 0x1FF8; the final one touches the top of
        // program memory, where the bootloader mis-validates checksum
        // ranges.
        let segments = [
            Segment::new(0x1000, vec![0x11; 8]),
            Segment::new(0x1FF8, vec![0x22; 8]),
        ];
        let (_, chunks) = chunked(&segments, &test_attrs()).unwrap();

        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));
        responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::Success));
        responses.push(checksum_response(local_checksum(&chunks[0].data)));
        responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::CalcChecksum, ResponseCode::BadAddress));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::Success));

        let port = MockPort::new(&responses);
        let mut session = FlashSession::discover(port).unwrap();

        let options = FlashOptions {
            verify_checksum: true,
            reset_after: false,
        };
        session.flash(&segments, &options, |_, _| {}).unwrap();

        assert_eq!(session.state(), SessionState::Flashed);
        assert_eq!(session.bytes_written(), 16);
    }

    #[test]
    fn test_bad_address_checksum_on_earlier_chunk_aborts() {
        let segments = [
            Segment::new(0x1000, vec![0x11; 8]),
            Segment::new(0x1FF8, vec![0x22; 8]),
        ];

        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));
        responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::CalcChecksum, ResponseCode::BadAddress));

        let port = MockPort::new(&responses);
        let mut session = FlashSession::discover(port).unwrap();

        let options = FlashOptions {
            verify_checksum: true,
            reset_after: false,
        };
        let err = session.flash(&segments, &options, |_, _| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::Rejected {
                command: CommandCode::CalcChecksum,
                code: ResponseCode::BadAddress,
                address: 0x1000,
            }
        ));
        assert_eq!(session.state(), SessionState::EraseConfirmed);
    }

    // --- final verification ---

    #[test]
    fn test_verify_failure_after_writes() {
        let segments = [Segment::new(0x1000, vec![0x33; 8])];
        let mut responses = discovery_responses();
        responses.push(generic_response(CommandCode::EraseFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));
        responses.push(generic_response(CommandCode::WriteFlash, ResponseCode::Success));
        responses.push(generic_response(CommandCode::SelfVerify, ResponseCode::VerifyFail));

        let port = MockPort::new(&responses);
        let mut session = FlashSession::discover(port).unwrap();

        let err = session
            .flash(&segments, &FlashOptions::default(), |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::VerifyFailed));
        assert_eq!(session.state(), SessionState::Verifying);
    }
}
