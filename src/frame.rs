//! Raw CA message frames.
//!
//! A [`Frame`] is a run of bytes exactly as it travels on the wire: a 16-byte
//! standard header or a 24-byte extended header, followed by the payload. The
//! header fields are read on demand, straight out of the byte buffer. Nothing
//! at this layer fails on malformed input; a frame may hold a partial header or
//! several concatenated messages while it moves through the
//! [`PacketSplitter`](crate::splitter::PacketSplitter), so callers must check
//! [`Frame::has_complete_header`] before trusting any field.
//!
//! Standard header layout (all fields big-endian):
//!
//! ```text
//! 0       2             4           6            8             12            16
//! | cmd   | payload size | data type | data count | parameter 1 | parameter 2 |
//! ```
//!
//! The extended form marks payload size `0xFFFF` and data count `0`, and appends
//! the real 32-bit payload size and data count after the parameters.

use std::{fmt, net::SocketAddr};

/// Size of a standard message header
pub const HEADER_SIZE: usize = 16;
/// Size of an extended (large payload) message header
pub const EXTENDED_HEADER_SIZE: usize = 24;
/// Largest element count that is written into a standard header
pub const MAX_STANDARD_COUNT: u32 = 16000;
/// Largest payload that is written into a standard header
pub const MAX_STANDARD_PAYLOAD: usize = 16000;

const EXTENDED_MARKER: u16 = 0xFFFF;

/// Every command code defined by the CA protocol
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Version = 0x00,
    EventAdd = 0x01,
    EventCancel = 0x02,
    Read = 0x03,
    Write = 0x04,
    Search = 0x06,
    EventsOff = 0x08,
    EventsOn = 0x09,
    Error = 0x0B,
    ClearChannel = 0x0C,
    RsrvIsUp = 0x0D,
    NotFound = 0x0E,
    ReadNotify = 0x0F,
    RepeaterConfirm = 0x11,
    CreateChannel = 0x12,
    WriteNotify = 0x13,
    ClientName = 0x14,
    HostName = 0x15,
    AccessRights = 0x16,
    Echo = 0x17,
    RepeaterRegister = 0x18,
    CreateChannelFailure = 0x1A,
    ServerDisconnect = 0x1B,
}

impl TryFrom<u16> for Command {
    type Error = u16;
    fn try_from(value: u16) -> Result<Self, u16> {
        Ok(match value {
            0x00 => Self::Version,
            0x01 => Self::EventAdd,
            0x02 => Self::EventCancel,
            0x03 => Self::Read,
            0x04 => Self::Write,
            0x06 => Self::Search,
            0x08 => Self::EventsOff,
            0x09 => Self::EventsOn,
            0x0B => Self::Error,
            0x0C => Self::ClearChannel,
            0x0D => Self::RsrvIsUp,
            0x0E => Self::NotFound,
            0x0F => Self::ReadNotify,
            0x11 => Self::RepeaterConfirm,
            0x12 => Self::CreateChannel,
            0x13 => Self::WriteNotify,
            0x14 => Self::ClientName,
            0x15 => Self::HostName,
            0x16 => Self::AccessRights,
            0x17 => Self::Echo,
            0x18 => Self::RepeaterRegister,
            0x1A => Self::CreateChannelFailure,
            0x1B => Self::ServerDisconnect,
            unknown => return Err(unknown),
        })
    }
}

impl From<Command> for u16 {
    fn from(value: Command) -> Self {
        value as u16
    }
}

/// A buffer of wire bytes, optionally tagged with the peer it came from
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    sender: Option<SocketAddr>,
}

impl Frame {
    /// Allocate a frame with a zeroed header and zeroed payload of `payload_size` bytes
    ///
    /// Payloads larger than [`MAX_STANDARD_PAYLOAD`] get an extended header
    /// straight away.
    pub fn create(payload_size: usize) -> Frame {
        let mut frame = if payload_size > MAX_STANDARD_PAYLOAD {
            let mut data = vec![0u8; EXTENDED_HEADER_SIZE + payload_size];
            data[2..4].copy_from_slice(&EXTENDED_MARKER.to_be_bytes());
            Frame { data, sender: None }
        } else {
            Frame {
                data: vec![0u8; HEADER_SIZE + payload_size],
                sender: None,
            }
        };
        frame.write_payload_size(payload_size);
        frame
    }

    /// Build a complete message, padding the payload out to a multiple of 8 bytes
    pub fn new(
        command: impl Into<u16>,
        data_type: u16,
        data_count: u32,
        parameter_1: u32,
        parameter_2: u32,
        payload: &[u8],
    ) -> Frame {
        let padded_size = payload.len().div_ceil(8) * 8;
        let mut frame = Frame::create(padded_size);
        frame.set_command(command.into());
        frame.set_data_type(data_type);
        frame.set_parameter_1(parameter_1);
        frame.set_parameter_2(parameter_2);
        frame.set_data_count(data_count);
        frame.payload_mut()[..payload.len()].copy_from_slice(payload);
        frame
    }

    /// Build a message whose header is never extended
    ///
    /// For commands that reuse the count field for something other than an
    /// element count, such as the server port of a beacon.
    pub fn new_standard(
        command: impl Into<u16>,
        data_type: u16,
        count_field: u16,
        parameter_1: u32,
        parameter_2: u32,
        payload: &[u8],
    ) -> Frame {
        let padded_size = payload.len().div_ceil(8) * 8;
        let mut frame = Frame::create(padded_size.min(MAX_STANDARD_PAYLOAD));
        frame.set_command(command.into());
        frame.set_data_type(data_type);
        frame.write_u16(6, count_field);
        frame.set_parameter_1(parameter_1);
        frame.set_parameter_2(parameter_2);
        let copied = payload.len().min(frame.payload_size());
        frame.payload_mut()[..copied].copy_from_slice(&payload[..copied]);
        frame
    }

    /// Build a complete message that always uses the extended header
    pub fn new_extended(
        command: impl Into<u16>,
        data_type: u16,
        data_count: u32,
        parameter_1: u32,
        parameter_2: u32,
        payload: &[u8],
    ) -> Frame {
        let padded_size = payload.len().div_ceil(8) * 8;
        let mut data = vec![0u8; EXTENDED_HEADER_SIZE + padded_size];
        data[0..2].copy_from_slice(&command.into().to_be_bytes());
        data[2..4].copy_from_slice(&EXTENDED_MARKER.to_be_bytes());
        data[4..6].copy_from_slice(&data_type.to_be_bytes());
        data[8..12].copy_from_slice(&parameter_1.to_be_bytes());
        data[12..16].copy_from_slice(&parameter_2.to_be_bytes());
        data[16..20].copy_from_slice(&(padded_size as u32).to_be_bytes());
        data[20..24].copy_from_slice(&data_count.to_be_bytes());
        data[EXTENDED_HEADER_SIZE..EXTENDED_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        Frame { data, sender: None }
    }

    /// Wrap raw bytes received from a socket
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Frame {
        Frame {
            data: data.into(),
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: SocketAddr) -> Frame {
        self.sender = Some(sender);
        self
    }

    /// The peer that sent this frame, for frames that came off a UDP socket
    pub fn sender(&self) -> Option<SocketAddr> {
        self.sender
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn read_u16(&self, offset: usize) -> u16 {
        self.data
            .get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or(0)
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.data
            .get(offset..offset + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0)
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        if let Some(slot) = self.data.get_mut(offset..offset + 2) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        if let Some(slot) = self.data.get_mut(offset..offset + 4) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
    }

    /// Does the header use the 24-byte extended form?
    pub fn is_extended(&self) -> bool {
        self.data.len() >= 8 && self.read_u16(2) == EXTENDED_MARKER && self.read_u16(6) == 0
    }

    pub fn header_size(&self) -> usize {
        if self.is_extended() {
            EXTENDED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Are there enough bytes to read every header field?
    pub fn has_complete_header(&self) -> bool {
        self.data.len() >= HEADER_SIZE && self.data.len() >= self.header_size()
    }

    pub fn command(&self) -> u16 {
        self.read_u16(0)
    }

    pub fn payload_size(&self) -> usize {
        if self.is_extended() {
            self.read_u32(16) as usize
        } else {
            self.read_u16(2) as usize
        }
    }

    pub fn data_type(&self) -> u16 {
        self.read_u16(4)
    }

    pub fn data_count(&self) -> u32 {
        if self.is_extended() {
            self.read_u32(20)
        } else {
            self.read_u16(6) as u32
        }
    }

    pub fn parameter_1(&self) -> u32 {
        self.read_u32(8)
    }

    pub fn parameter_2(&self) -> u32 {
        self.read_u32(12)
    }

    /// Total number of bytes the header declares for this message
    pub fn message_size(&self) -> usize {
        self.header_size() + self.payload_size()
    }

    pub fn set_command(&mut self, command: u16) {
        self.write_u16(0, command);
    }

    pub fn set_data_type(&mut self, data_type: u16) {
        self.write_u16(4, data_type);
    }

    pub fn set_parameter_1(&mut self, value: u32) {
        self.write_u32(8, value);
    }

    pub fn set_parameter_2(&mut self, value: u32) {
        self.write_u32(12, value);
    }

    fn write_payload_size(&mut self, payload_size: usize) {
        if self.is_extended() {
            self.write_u32(16, payload_size as u32);
        } else {
            self.write_u16(2, payload_size as u16);
        }
    }

    /// Set the element count, converting a standard header to the extended form if needed
    ///
    /// Promotion inserts the 8 extra header bytes in front of the payload; the
    /// command, data type, parameters and payload bytes are carried over unchanged.
    pub fn set_data_count(&mut self, count: u32) {
        if self.is_extended() {
            self.write_u32(20, count);
            return;
        }
        if count <= MAX_STANDARD_COUNT {
            self.write_u16(6, count as u16);
            return;
        }
        let payload_size = self.payload_size() as u32;
        let split = HEADER_SIZE.min(self.data.len());
        let mut extension = [0u8; 8];
        extension[0..4].copy_from_slice(&payload_size.to_be_bytes());
        extension[4..8].copy_from_slice(&count.to_be_bytes());
        self.data.splice(split..split, extension);
        self.write_u16(2, EXTENDED_MARKER);
        self.write_u16(6, 0);
    }

    /// The payload bytes present in this frame, up to the declared payload size
    pub fn payload(&self) -> &[u8] {
        let start = self.header_size().min(self.data.len());
        let end = self.message_size().min(self.data.len());
        &self.data[start..end.max(start)]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_size().min(self.data.len());
        let end = self.message_size().min(self.data.len());
        &mut self.data[start..end.max(start)]
    }

    /// Concatenate the bytes of `other` after ours, keeping our sender tag
    pub fn merge_with(&self, other: &Frame) -> Frame {
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Frame {
            data,
            sender: self.sender.or(other.sender),
        }
    }

    /// Everything from byte `skip` onwards
    pub fn take_suffix(&self, skip: usize) -> Frame {
        Frame {
            data: self.data.get(skip..).unwrap_or_default().to_vec(),
            sender: self.sender,
        }
    }

    /// The first `length` bytes
    pub fn take_prefix(&self, length: usize) -> Frame {
        Frame {
            data: self.data[..length.min(self.data.len())].to_vec(),
            sender: self.sender,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_complete_header() {
            return write!(f, "Frame(partial, {} bytes)", self.data.len());
        }
        f.debug_struct("Frame")
            .field("command", &self.command())
            .field("payload_size", &self.payload_size())
            .field("data_type", &self.data_type())
            .field("data_count", &self.data_count())
            .field("parameter_1", &self.parameter_1())
            .field("parameter_2", &self.parameter_2())
            .field("extended", &self.is_extended())
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_frame_fields() {
        let frame = Frame::new(Command::ReadNotify, 20, 1, 7, 9, b"abc");
        assert!(!frame.is_extended());
        assert!(frame.has_complete_header());
        assert_eq!(frame.len(), 24);
        let parsed = Frame::from_bytes(frame.as_bytes().to_vec());
        assert_eq!(parsed.command(), 0x0F);
        assert_eq!(parsed.payload_size(), 8);
        assert_eq!(parsed.data_type(), 20);
        assert_eq!(parsed.data_count(), 1);
        assert_eq!(parsed.parameter_1(), 7);
        assert_eq!(parsed.parameter_2(), 9);
        assert_eq!(&parsed.payload()[..3], b"abc");
        assert_eq!(parsed.message_size(), 24);
        assert_eq!(parsed, frame);
    }

    #[test]
    fn extended_frame_fields() {
        let payload: Vec<u8> = (0..64u8).collect();
        let frame = Frame::new_extended(Command::EventAdd, 6, 8, 0xDEAD, 0xBEEF, &payload);
        let parsed = Frame::from_bytes(frame.clone().into_bytes());
        assert!(parsed.is_extended());
        assert_eq!(parsed.header_size(), EXTENDED_HEADER_SIZE);
        assert_eq!(parsed.command(), 1);
        assert_eq!(parsed.data_type(), 6);
        assert_eq!(parsed.data_count(), 8);
        assert_eq!(parsed.parameter_1(), 0xDEAD);
        assert_eq!(parsed.parameter_2(), 0xBEEF);
        assert_eq!(parsed.payload(), payload.as_slice());
        assert_eq!(parsed.message_size(), EXTENDED_HEADER_SIZE + 64);
    }

    #[test]
    fn large_payload_creates_extended() {
        let frame = Frame::create(MAX_STANDARD_PAYLOAD + 8);
        assert!(frame.is_extended());
        assert_eq!(frame.payload_size(), MAX_STANDARD_PAYLOAD + 8);
        assert_eq!(frame.len(), EXTENDED_HEADER_SIZE + MAX_STANDARD_PAYLOAD + 8);
        assert!(!Frame::create(8).is_extended());
    }

    #[test]
    fn standard_frames_keep_large_count_fields() {
        let frame = Frame::new_standard(Command::RsrvIsUp, 13, 60000, 7, 0, &[]);
        assert!(!frame.is_extended());
        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(frame.data_count(), 60000);
        assert_eq!(frame.parameter_1(), 7);
    }

    #[test]
    fn promoting_count_preserves_payload_and_parameters() {
        let payload: Vec<u8> = (0..32u8).collect();
        let mut frame = Frame::new(Command::ReadNotify, 6, 1, 0x01020304, 0x05060708, &payload);
        let before = frame.clone();
        frame.set_data_count(16001);
        assert!(frame.is_extended());
        assert_eq!(frame.len(), before.len() + 8);
        assert_eq!(frame.data_count(), 16001);
        assert_eq!(frame.command(), before.command());
        assert_eq!(frame.data_type(), before.data_type());
        assert_eq!(frame.parameter_1(), 0x01020304);
        assert_eq!(frame.parameter_2(), 0x05060708);
        assert_eq!(frame.payload_size(), before.payload_size());
        assert_eq!(frame.payload(), before.payload());
        // Staying within the standard range does not promote
        let mut small = before.clone();
        small.set_data_count(MAX_STANDARD_COUNT);
        assert!(!small.is_extended());
        assert_eq!(small.data_count(), MAX_STANDARD_COUNT);
    }

    #[test]
    fn partial_frames_do_not_panic() {
        let frame = Frame::from_bytes(vec![0x00, 0x0F, 0x00]);
        assert!(!frame.has_complete_header());
        assert_eq!(frame.parameter_2(), 0);
        assert!(frame.payload().is_empty());
        let extended_start = Frame::from_bytes(vec![
            0, 1, 0xFF, 0xFF, 0, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ]);
        assert!(extended_start.is_extended());
        assert!(!extended_start.has_complete_header());
    }

    #[test]
    fn merge_and_split() {
        let first = Frame::from_bytes(vec![1, 2, 3]);
        let second = Frame::from_bytes(vec![4, 5]);
        let merged = first.merge_with(&second);
        assert_eq!(merged.as_bytes(), &[1, 2, 3, 4, 5]);
        assert_eq!(merged.take_suffix(3).as_bytes(), &[4, 5]);
        assert_eq!(merged.take_prefix(2).as_bytes(), &[1, 2]);
        assert!(merged.take_suffix(10).is_empty());
    }

    #[test]
    fn command_codes() {
        assert_eq!(Command::try_from(0x1B), Ok(Command::ServerDisconnect));
        assert_eq!(Command::try_from(0x05), Err(0x05));
        assert_eq!(u16::from(Command::Echo), 0x17);
    }
}
