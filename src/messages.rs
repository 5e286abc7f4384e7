//! Typed CA messages, one struct per protocol command.
//!
//! Every message converts from a [`Frame`] (checking the command code) and
//! back into one with [`CAMessage::to_frame`]. Some commands share a code but
//! carry different fields depending on direction, e.g. `SEARCH` requests and
//! replies. [`Message`] therefore holds everything a server can receive, and
//! [`ClientMessage`] everything a client can receive.

use std::{
    fmt,
    io,
    net::Ipv4Addr,
};

use nom::{
    IResult, Parser,
    bytes::complete::take,
    error::{Error, ErrorKind},
    number::complete::{be_f32, be_u16, be_u32},
};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    dbr::{DbrBasicType, DbrType},
    frame::{Command, EXTENDED_HEADER_SIZE, Frame, HEADER_SIZE},
    splitter::PacketSplitter,
};

/// Minor protocol version spoken by this crate
pub const EPICS_VERSION: u16 = 13;
/// Oldest minor protocol version we can talk to
pub const MINIMUM_COMPATIBLE_VERSION: u16 = 11;

const SEARCH_DO_REPLY: u16 = 10;
const SEARCH_DONT_REPLY: u16 = 5;

/// A basic trait to tie a message struct to its wire representation.
///
/// Conversion from a [`Frame`] is the fallible direction; building a frame
/// never fails. Parsing straight from bytes and writing to a stream are
/// derived from those two.
pub trait CAMessage: TryFrom<Frame, Error = MessageError> {
    fn to_frame(&self) -> Frame;

    fn write<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.to_frame().as_bytes())
    }

    fn parse(input: &[u8]) -> IResult<&[u8], Self>
    where
        Self: Sized,
    {
        let (rest, frame) = parse_frame(input)?;
        let message = Self::try_from(frame)
            .map_err(|_| nom::Err::Error(Error::new(input, ErrorKind::Verify)))?;
        Ok((rest, message))
    }
}

pub trait AsBytes {
    fn as_bytes(&self) -> Vec<u8>;
}
impl<T> AsBytes for T
where
    T: CAMessage,
{
    fn as_bytes(&self) -> Vec<u8> {
        self.to_frame().into_bytes()
    }
}

/// Cut one complete message off the front of `input`
pub fn parse_frame(input: &[u8]) -> IResult<&[u8], Frame> {
    let (_, (_, short_size, _, short_count)) = (be_u16, be_u16, be_u16, be_u16).parse(input)?;
    let (header_size, payload_size) = if short_size == 0xFFFF && short_count == 0 {
        let (_, (_, size)) = (take(HEADER_SIZE), be_u32).parse(input)?;
        (EXTENDED_HEADER_SIZE, size as usize)
    } else {
        (HEADER_SIZE, short_size as usize)
    };
    let (rest, bytes) = take(header_size + payload_size).parse(input)?;
    Ok((rest, Frame::from_bytes(bytes.to_vec())))
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u16),
    #[error("Message command ID {0} does not match expected {1}")]
    IncorrectCommandId(u16, u16),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
    #[error("Message header is incomplete")]
    Incomplete,
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

fn expect_command(frame: &Frame, command: Command) -> Result<(), MessageError> {
    if !frame.has_complete_header() {
        return Err(MessageError::Incomplete);
    }
    if frame.command() != command as u16 {
        return Err(MessageError::IncorrectCommandId(
            frame.command(),
            command as u16,
        ));
    }
    Ok(())
}

/// Read a null-terminated string out of a byte slice
fn null_terminated_string(input: &[u8]) -> String {
    let strlen = input.iter().position(|&c| c == 0x00).unwrap_or(input.len());
    String::from_utf8_lossy(&input[..strlen]).into_owned()
}

/// String bytes with the terminating null
fn terminated_bytes(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn basic_data_type(frame: &Frame) -> Result<DbrBasicType, MessageError> {
    frame
        .data_type()
        .try_into()
        .map_err(|_| {
            MessageError::InvalidField("data_type".to_owned(), frame.data_type().to_string())
        })
}

fn dbr_data_type(frame: &Frame) -> Result<DbrType, MessageError> {
    frame
        .data_type()
        .try_into()
        .map_err(|_| {
            MessageError::InvalidField("data_type".to_owned(), frame.data_type().to_string())
        })
}

/// Message CA_PROTO_RSRV_IS_UP.
///
/// Beacon sent by a server when it becomes available. Beacons are also
/// sent out periodically to announce the server is still alive. Another
/// function of beacons is to allow detection of changes in network
/// topology. Sent over UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsrvIsUp {
    pub server_port: u16,
    pub beacon_id: u32,
    pub server_ip: Option<Ipv4Addr>,
    pub protocol_version: u16,
}

impl Default for RsrvIsUp {
    fn default() -> Self {
        RsrvIsUp {
            server_port: 0,
            beacon_id: 0,
            server_ip: None,
            protocol_version: EPICS_VERSION,
        }
    }
}

impl TryFrom<Frame> for RsrvIsUp {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::RsrvIsUp)?;
        Ok(RsrvIsUp {
            server_port: value.data_count() as u16,
            beacon_id: value.parameter_1(),
            server_ip: match value.parameter_2() {
                0u32 => None,
                ip => Some(Ipv4Addr::from(ip)),
            },
            protocol_version: value.data_type(),
        })
    }
}

impl CAMessage for RsrvIsUp {
    fn to_frame(&self) -> Frame {
        Frame::new_standard(
            Command::RsrvIsUp,
            self.protocol_version,
            self.server_port,
            self.beacon_id,
            self.server_ip.map(|ip| ip.to_bits()).unwrap_or(0),
            &[],
        )
    }
}

/// Message CA_PROTO_VERSION.
///
/// Exchanges client and server protocol versions and desired circuit
/// priority. MUST be the first message sent, by both client and server,
/// when a new TCP (Virtual Circuit) connection is established. It is
/// also sent as the first message in UDP search messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}
impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: EPICS_VERSION,
        }
    }
}
impl Version {
    pub fn is_compatible(&self) -> bool {
        self.protocol_version >= MINIMUM_COMPATIBLE_VERSION
    }
}
impl TryFrom<Frame> for Version {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::Version)?;
        Ok(Version {
            priority: value.data_type(),
            protocol_version: value.data_count() as u16,
        })
    }
}
impl CAMessage for Version {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::Version,
            self.priority,
            self.protocol_version as u32,
            0,
            0,
            &[],
        )
    }
}

/// Message CA_PROTO_SEARCH.
///
/// Searches for a given channel name. Sent over UDP or TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Indicating whether failed search response should be returned.
    pub should_reply: bool,
    pub protocol_version: u16,
}
impl Default for Search {
    fn default() -> Self {
        Search {
            search_id: 0,
            channel_name: String::new(),
            should_reply: false,
            protocol_version: EPICS_VERSION,
        }
    }
}
impl Search {
    /// Construct a search response. is_udp required because field is
    /// only present when the intended target is UDP.
    pub fn respond(
        &self,
        server_ip: Option<Ipv4Addr>,
        port_number: u16,
        is_udp: bool,
    ) -> SearchResponse {
        SearchResponse {
            port_number,
            server_ip,
            search_id: self.search_id,
            protocol_version: if is_udp { Some(EPICS_VERSION) } else { None },
        }
    }
    /// The negative answer, only meaningful if `should_reply` was set
    pub fn not_found(&self) -> NotFound {
        NotFound {
            search_id: self.search_id,
            protocol_version: EPICS_VERSION,
        }
    }
}
impl TryFrom<Frame> for Search {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::Search)?;
        Ok(Search {
            should_reply: value.data_type() == SEARCH_DO_REPLY,
            protocol_version: value.data_count() as u16,
            search_id: value.parameter_1(),
            channel_name: null_terminated_string(value.payload()),
        })
    }
}
impl CAMessage for Search {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::Search,
            if self.should_reply {
                SEARCH_DO_REPLY
            } else {
                SEARCH_DONT_REPLY
            },
            self.protocol_version as u32,
            self.search_id,
            self.search_id,
            &terminated_bytes(&self.channel_name),
        )
    }
}

/// Reply to CA_PROTO_SEARCH from a server hosting the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub port_number: u16,
    pub search_id: u32,
    /// Server to connect to, if different from the message sender
    pub server_ip: Option<Ipv4Addr>,
    /// Protocol version only present if this is being sent as UDP
    pub protocol_version: Option<u16>,
}

impl TryFrom<Frame> for SearchResponse {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::Search)?;
        let protocol_version = match value.payload() {
            [] => None,
            payload => Some(be_u16::<_, nom::error::Error<&[u8]>>(payload)?.1),
        };
        Ok(SearchResponse {
            port_number: value.data_type(),
            server_ip: match value.parameter_1() {
                0xFFFFFFFFu32 => None,
                i => Some(Ipv4Addr::from(i)),
            },
            search_id: value.parameter_2(),
            protocol_version,
        })
    }
}

impl CAMessage for SearchResponse {
    fn to_frame(&self) -> Frame {
        let payload = match self.protocol_version {
            None => Vec::new(),
            Some(v) => v.to_be_bytes().to_vec(),
        };
        Frame::new(
            Command::Search,
            self.port_number,
            0,
            match self.server_ip {
                None => 0xFFFFFFFFu32,
                Some(ip) => ip.to_bits(),
            },
            self.search_id,
            &payload,
        )
    }
}

/// Message CA_PROTO_NOT_FOUND.
///
/// Sent in response to a search that asked for a reply, when the server
/// does not host the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    pub search_id: u32,
    pub protocol_version: u16,
}
impl TryFrom<Frame> for NotFound {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::NotFound)?;
        Ok(NotFound {
            search_id: value.parameter_1(),
            protocol_version: value.data_count() as u16,
        })
    }
}
impl CAMessage for NotFound {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::NotFound,
            SEARCH_DO_REPLY,
            self.protocol_version as u32,
            self.search_id,
            self.search_id,
            &[],
        )
    }
}

/// Message CA_PROTO_CREATE_CHAN.
///
/// Requests creation of channel. Server will allocate required
/// resources and return initialized SID. Sent over TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

impl Default for CreateChannel {
    fn default() -> Self {
        CreateChannel {
            client_id: 0,
            protocol_version: EPICS_VERSION as u32,
            channel_name: String::new(),
        }
    }
}

impl TryFrom<Frame> for CreateChannel {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::CreateChannel)?;
        Ok(CreateChannel {
            client_id: value.parameter_1(),
            protocol_version: value.parameter_2(),
            channel_name: null_terminated_string(value.payload()),
        })
    }
}
impl CAMessage for CreateChannel {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::CreateChannel,
            0,
            0,
            self.client_id,
            self.protocol_version,
            &terminated_bytes(&self.channel_name),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub data_type: DbrBasicType,
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

impl TryFrom<Frame> for CreateChannelResponse {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::CreateChannel)?;
        Ok(CreateChannelResponse {
            data_type: basic_data_type(&value)?,
            data_count: value.data_count(),
            client_id: value.parameter_1(),
            server_id: value.parameter_2(),
        })
    }
}

impl CAMessage for CreateChannelResponse {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::CreateChannel,
            self.data_type as u16,
            self.data_count,
            self.client_id,
            self.server_id,
            &[],
        )
    }
}

/// Message CA_PROTO_CREATE_CH_FAIL.
///
/// The server refused to create the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}
impl TryFrom<Frame> for CreateChannelFailure {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::CreateChannelFailure)?;
        Ok(CreateChannelFailure {
            client_id: value.parameter_1(),
        })
    }
}
impl CAMessage for CreateChannelFailure {
    fn to_frame(&self) -> Frame {
        Frame::new(Command::CreateChannelFailure, 0, 0, self.client_id, 0, &[])
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Access::None => "None",
                Access::Read => "Read",
                Access::Write => "Write",
                Access::ReadWrite => "ReadWrite",
            }
        )
    }
}

impl TryFrom<u32> for Access {
    type Error = MessageError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Access::None),
            1 => Ok(Access::Read),
            2 => Ok(Access::Write),
            3 => Ok(Access::ReadWrite),
            _ => Err(MessageError::InvalidField(
                "AccessRight".to_owned(),
                format!("{}", value),
            )),
        }
    }
}

/// Message CA_PROTO_ACCESS_RIGHTS
///
/// Notifies of access rights for a channel. This value is determined
/// based on host and client name and may change during runtime. Client
/// cannot change access rights nor can it explicitly query its value,
/// so last received value must be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRights {
    pub client_id: u32,
    pub access_rights: Access,
}

impl TryFrom<Frame> for AccessRights {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::AccessRights)?;
        Ok(Self {
            client_id: value.parameter_1(),
            access_rights: value.parameter_2().try_into()?,
        })
    }
}

impl CAMessage for AccessRights {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::AccessRights,
            0,
            0,
            self.client_id,
            self.access_rights as u32,
            &[],
        )
    }
}

/// Message CA_PROTO_READ_NOTIFY.
///
/// Read a value from a channel. The data count may be zero, asking the
/// server for however many elements the channel currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadNotify {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}

impl ReadNotify {
    pub fn respond(&self, data_count: usize, data: Vec<u8>) -> ReadNotifyResponse {
        ReadNotifyResponse {
            data_type: self.data_type,
            data_count: data_count as u32,
            status_code: ErrorCondition::Normal.status_code(),
            client_ioid: self.client_ioid,
            data,
        }
    }
}

impl TryFrom<Frame> for ReadNotify {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::ReadNotify)?;
        Ok(ReadNotify {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            server_id: value.parameter_1(),
            client_ioid: value.parameter_2(),
        })
    }
}
impl CAMessage for ReadNotify {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::ReadNotify,
            self.data_type.into(),
            self.data_count,
            self.server_id,
            self.client_ioid,
            &[],
        )
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ReadNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for ReadNotifyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadNotifyResponse")
            .field("data_type", &self.data_type)
            .field("data_count", &self.data_count)
            .field("status_code", &self.status_code)
            .field("client_ioid", &self.client_ioid)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl TryFrom<Frame> for ReadNotifyResponse {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::ReadNotify)?;
        Ok(ReadNotifyResponse {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            status_code: value.parameter_1(),
            client_ioid: value.parameter_2(),
            data: value.payload().to_vec(),
        })
    }
}
impl CAMessage for ReadNotifyResponse {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::ReadNotify,
            self.data_type.into(),
            self.data_count,
            self.status_code,
            self.client_ioid,
            &self.data,
        )
    }
}

/// Message CA_PROTO_READ.
///
/// Deprecated since protocol 4.3; servers answer it with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}
impl TryFrom<Frame> for Read {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::Read)?;
        Ok(Read {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            server_id: value.parameter_1(),
            client_ioid: value.parameter_2(),
        })
    }
}
impl CAMessage for Read {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::Read,
            self.data_type.into(),
            self.data_count,
            self.server_id,
            self.client_ioid,
            &[],
        )
    }
}

/// Message CA_PROTO_WRITE.
///
/// Writes a value without asking for any confirmation.
#[derive(Clone, PartialEq, Eq)]
pub struct Write {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Write")
            .field("data_type", &self.data_type)
            .field("data_count", &self.data_count)
            .field("server_id", &self.server_id)
            .field("client_ioid", &self.client_ioid)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl TryFrom<Frame> for Write {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::Write)?;
        Ok(Write {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            server_id: value.parameter_1(),
            client_ioid: value.parameter_2(),
            data: value.payload().to_vec(),
        })
    }
}
impl CAMessage for Write {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::Write,
            self.data_type.into(),
            self.data_count,
            self.server_id,
            self.client_ioid,
            &self.data,
        )
    }
}

/// Message CA_PROTO_WRITE_NOTIFY.
///
/// Writes a value, and asks the server to confirm once it has been processed.
#[derive(Clone, PartialEq, Eq)]
pub struct WriteNotify {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for WriteNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteNotify")
            .field("data_type", &self.data_type)
            .field("data_count", &self.data_count)
            .field("server_id", &self.server_id)
            .field("client_ioid", &self.client_ioid)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl WriteNotify {
    pub fn respond(&self, result: Result<(), ErrorCondition>) -> WriteNotifyResponse {
        WriteNotifyResponse {
            data_type: self.data_type,
            data_count: self.data_count,
            status_code: result.err().unwrap_or(ErrorCondition::Normal).status_code(),
            client_ioid: self.client_ioid,
        }
    }
}

impl TryFrom<Frame> for WriteNotify {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::WriteNotify)?;
        Ok(WriteNotify {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            server_id: value.parameter_1(),
            client_ioid: value.parameter_2(),
            data: value.payload().to_vec(),
        })
    }
}
impl CAMessage for WriteNotify {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::WriteNotify,
            self.data_type.into(),
            self.data_count,
            self.server_id,
            self.client_ioid,
            &self.data,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub client_ioid: u32,
}
impl TryFrom<Frame> for WriteNotifyResponse {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::WriteNotify)?;
        Ok(WriteNotifyResponse {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            status_code: value.parameter_1(),
            client_ioid: value.parameter_2(),
        })
    }
}
impl CAMessage for WriteNotifyResponse {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::WriteNotify,
            self.data_type.into(),
            self.data_count,
            self.status_code,
            self.client_ioid,
            &[],
        )
    }
}

/// Which kinds of change a monitor wants to hear about
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl MonitorMask {
    pub const VALUE: MonitorMask = MonitorMask {
        value: true,
        log: false,
        alarm: false,
        property: false,
    };
    pub const LOG: MonitorMask = MonitorMask {
        value: false,
        log: true,
        alarm: false,
        property: false,
    };
    pub const ALARM: MonitorMask = MonitorMask {
        value: false,
        log: false,
        alarm: true,
        property: false,
    };
    pub const PROPERTY: MonitorMask = MonitorMask {
        value: false,
        log: false,
        alarm: false,
        property: true,
    };

    /// Do the two masks share any bit?
    pub fn intersects(&self, other: &MonitorMask) -> bool {
        u16::from(*self) & u16::from(*other) != 0
    }

    pub fn union(&self, other: &MonitorMask) -> MonitorMask {
        MonitorMask::from(u16::from(*self) | u16::from(*other))
    }

    pub fn is_empty(&self) -> bool {
        u16::from(*self) == 0
    }
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

impl From<MonitorMask> for u16 {
    fn from(value: MonitorMask) -> Self {
        (value.value as u16)
            | ((value.log as u16) << 1)
            | ((value.alarm as u16) << 2)
            | ((value.property as u16) << 3)
    }
}

impl From<u16> for MonitorMask {
    fn from(value: u16) -> Self {
        MonitorMask {
            value: value & 0x01 != 0,
            log: value & 0x02 != 0,
            alarm: value & 0x04 != 0,
            property: value & 0x08 != 0,
        }
    }
}

/// Message CA_PROTO_EVENT_ADD.
///
/// Creates a subscription on a channel. The server answers with an
/// immediate update, then one more every time the mask matches a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAdd {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}

impl EventAdd {
    pub fn respond(&self, data_count: usize, data: Vec<u8>) -> EventAddResponse {
        EventAddResponse {
            data_type: self.data_type,
            data_count: data_count as u32,
            status_code: ErrorCondition::Normal.status_code(),
            subscription_id: self.subscription_id,
            data,
        }
    }
}

impl TryFrom<Frame> for EventAdd {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::EventAdd)?;
        // low, high and timeout are unused by every server in practice
        let parsed: IResult<&[u8], (f32, f32, f32, u16)> =
            (be_f32, be_f32, be_f32, be_u16).parse(value.payload());
        let (_, (_low, _high, _timeout, mask)) = parsed?;
        Ok(EventAdd {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            server_id: value.parameter_1(),
            subscription_id: value.parameter_2(),
            mask: mask.into(),
        })
    }
}
impl CAMessage for EventAdd {
    fn to_frame(&self) -> Frame {
        let mut payload = vec![0u8; 12];
        payload.extend(u16::from(self.mask).to_be_bytes());
        Frame::new(
            Command::EventAdd,
            self.data_type.into(),
            self.data_count,
            self.server_id,
            self.subscription_id,
            &payload,
        )
    }
}

/// A subscription update. An empty payload confirms the subscription was cancelled.
#[derive(Clone, PartialEq, Eq)]
pub struct EventAddResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    pub status_code: u32,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for EventAddResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventAddResponse")
            .field("data_type", &self.data_type)
            .field("data_count", &self.data_count)
            .field("status_code", &self.status_code)
            .field("subscription_id", &self.subscription_id)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl EventAddResponse {
    /// Build the request that cancels this subscription
    pub fn cancel(&self, server_id: u32) -> EventCancel {
        EventCancel {
            data_type: self.data_type,
            data_count: self.data_count,
            server_id,
            subscription_id: self.subscription_id,
        }
    }
}

impl TryFrom<Frame> for EventAddResponse {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::EventAdd)?;
        Ok(EventAddResponse {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            status_code: value.parameter_1(),
            subscription_id: value.parameter_2(),
            data: value.payload().to_vec(),
        })
    }
}
impl CAMessage for EventAddResponse {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::EventAdd,
            self.data_type.into(),
            self.data_count,
            self.status_code,
            self.subscription_id,
            &self.data,
        )
    }
}

/// Message CA_PROTO_EVENT_CANCEL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCancel {
    pub data_type: DbrType,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}
impl EventCancel {
    /// The final, empty, update that confirms the cancellation
    pub fn respond(&self) -> EventAddResponse {
        EventAddResponse {
            data_type: self.data_type,
            data_count: self.data_count,
            status_code: ErrorCondition::Normal.status_code(),
            subscription_id: self.subscription_id,
            data: Vec::new(),
        }
    }
}
impl TryFrom<Frame> for EventCancel {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::EventCancel)?;
        Ok(EventCancel {
            data_type: dbr_data_type(&value)?,
            data_count: value.data_count(),
            server_id: value.parameter_1(),
            subscription_id: value.parameter_2(),
        })
    }
}
impl CAMessage for EventCancel {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::EventCancel,
            self.data_type.into(),
            self.data_count,
            self.server_id,
            self.subscription_id,
            &[],
        )
    }
}

/// Message CA_PROTO_EVENTS_OFF. Pauses subscription updates on the circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsOff;
impl TryFrom<Frame> for EventsOff {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::EventsOff)?;
        Ok(EventsOff)
    }
}
impl CAMessage for EventsOff {
    fn to_frame(&self) -> Frame {
        Frame::new(Command::EventsOff, 0, 0, 0, 0, &[])
    }
}

/// Message CA_PROTO_EVENTS_ON. Resumes subscription updates on the circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsOn;
impl TryFrom<Frame> for EventsOn {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::EventsOn)?;
        Ok(EventsOn)
    }
}
impl CAMessage for EventsOn {
    fn to_frame(&self) -> Frame {
        Frame::new(Command::EventsOn, 0, 0, 0, 0, &[])
    }
}

/// Message CA_PROTO_CLEAR_CHANNEL.
///
/// Sent by the client to release a channel, and echoed back by the server
/// once it has done so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}
impl TryFrom<Frame> for ClearChannel {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::ClearChannel)?;
        Ok(ClearChannel {
            server_id: value.parameter_1(),
            client_id: value.parameter_2(),
        })
    }
}
impl CAMessage for ClearChannel {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::ClearChannel,
            0,
            0,
            self.server_id,
            self.client_id,
            &[],
        )
    }
}

/// Message CA_PROTO_SERVER_DISCONN.
///
/// The server has dropped a channel. Channels are matched on the server id
/// they were given at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDisconnect {
    pub server_id: u32,
}
impl TryFrom<Frame> for ServerDisconnect {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::ServerDisconnect)?;
        Ok(Self {
            server_id: value.parameter_1(),
        })
    }
}
impl CAMessage for ServerDisconnect {
    fn to_frame(&self) -> Frame {
        Frame::new(Command::ServerDisconnect, 0, 0, self.server_id, 0, &[])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Echo;

impl TryFrom<Frame> for Echo {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::Echo)?;
        Ok(Echo)
    }
}

impl CAMessage for Echo {
    fn to_frame(&self) -> Frame {
        Frame::new(Command::Echo, 0, 0, 0, 0, &[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientName {
    pub name: String,
}

impl TryFrom<Frame> for ClientName {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::ClientName)?;
        Ok(Self {
            name: null_terminated_string(value.payload()),
        })
    }
}

impl CAMessage for ClientName {
    fn to_frame(&self) -> Frame {
        Frame::new(Command::ClientName, 0, 0, 0, 0, &terminated_bytes(&self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostName {
    pub name: String,
}
impl TryFrom<Frame> for HostName {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::HostName)?;
        Ok(Self {
            name: null_terminated_string(value.payload()),
        })
    }
}
impl CAMessage for HostName {
    fn to_frame(&self) -> Frame {
        Frame::new(Command::HostName, 0, 0, 0, 0, &terminated_bytes(&self.name))
    }
}

/// Message CA_REPEATER_REGISTER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeaterRegister {
    pub client_ip: Ipv4Addr,
}
impl TryFrom<Frame> for RepeaterRegister {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::RepeaterRegister)?;
        Ok(Self {
            client_ip: Ipv4Addr::from(value.parameter_2()),
        })
    }
}
impl CAMessage for RepeaterRegister {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::RepeaterRegister,
            0,
            0,
            0,
            self.client_ip.to_bits(),
            &[],
        )
    }
}

/// Message CA_REPEATER_CONFIRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeaterConfirm {
    pub repeater_ip: Ipv4Addr,
}
impl TryFrom<Frame> for RepeaterConfirm {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::RepeaterConfirm)?;
        Ok(Self {
            repeater_ip: Ipv4Addr::from(value.parameter_2()),
        })
    }
}
impl CAMessage for RepeaterConfirm {
    fn to_frame(&self) -> Frame {
        Frame::new(
            Command::RepeaterConfirm,
            0,
            0,
            0,
            self.repeater_ip.to_bits(),
            &[],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

/// The ECA_* conditions that CA reports back to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    DblClFail = 18,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadStr = 23,
    Disconn = 24,
    EvDisallow = 26,
    BadMonId = 30,
    BadMask = 41,
    IoDone = 42,
    IoInProgress = 43,
    BadSyncGrp = 44,
    PutCbInProg = 45,
    NoRdAccess = 46,
    NoWtAccess = 47,
    Anachronism = 48,
    NoSearchAddr = 49,
    NoConvert = 50,
    BadChId = 51,
    BadFuncPtr = 52,
    IsAttached = 53,
    UnavailInServ = 54,
    ChanDestroy = 55,
    BadPriority = 56,
    NotThreaded = 57,
    Array16kClient = 58,
    ConnSeqTmo = 59,
    UnrespTmo = 60,
}

impl ErrorCondition {
    const ALL: [ErrorCondition; 34] = [
        Self::Normal,
        Self::AllocMem,
        Self::TooLarge,
        Self::Timeout,
        Self::BadType,
        Self::Internal,
        Self::DblClFail,
        Self::GetFail,
        Self::PutFail,
        Self::BadCount,
        Self::BadStr,
        Self::Disconn,
        Self::EvDisallow,
        Self::BadMonId,
        Self::BadMask,
        Self::IoDone,
        Self::IoInProgress,
        Self::BadSyncGrp,
        Self::PutCbInProg,
        Self::NoRdAccess,
        Self::NoWtAccess,
        Self::Anachronism,
        Self::NoSearchAddr,
        Self::NoConvert,
        Self::BadChId,
        Self::BadFuncPtr,
        Self::IsAttached,
        Self::UnavailInServ,
        Self::ChanDestroy,
        Self::BadPriority,
        Self::NotThreaded,
        Self::Array16kClient,
        Self::ConnSeqTmo,
        Self::UnrespTmo,
    ];

    pub fn get_severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::AllocMem => ErrorSeverity::Warning,
            Self::TooLarge => ErrorSeverity::Warning,
            Self::Timeout => ErrorSeverity::Warning,
            Self::BadType => ErrorSeverity::Error,
            Self::Internal => ErrorSeverity::Severe,
            Self::DblClFail => ErrorSeverity::Warning,
            Self::GetFail => ErrorSeverity::Warning,
            Self::PutFail => ErrorSeverity::Warning,
            Self::BadCount => ErrorSeverity::Warning,
            Self::BadStr => ErrorSeverity::Error,
            Self::Disconn => ErrorSeverity::Warning,
            Self::EvDisallow => ErrorSeverity::Error,
            Self::BadMonId => ErrorSeverity::Error,
            Self::BadMask => ErrorSeverity::Error,
            Self::IoDone => ErrorSeverity::Info,
            Self::IoInProgress => ErrorSeverity::Info,
            Self::BadSyncGrp => ErrorSeverity::Error,
            Self::PutCbInProg => ErrorSeverity::Error,
            Self::NoRdAccess => ErrorSeverity::Warning,
            Self::NoWtAccess => ErrorSeverity::Warning,
            Self::Anachronism => ErrorSeverity::Error,
            Self::NoSearchAddr => ErrorSeverity::Warning,
            Self::NoConvert => ErrorSeverity::Warning,
            Self::BadChId => ErrorSeverity::Error,
            Self::BadFuncPtr => ErrorSeverity::Error,
            Self::IsAttached => ErrorSeverity::Warning,
            Self::UnavailInServ => ErrorSeverity::Warning,
            Self::ChanDestroy => ErrorSeverity::Warning,
            Self::BadPriority => ErrorSeverity::Error,
            Self::NotThreaded => ErrorSeverity::Error,
            Self::Array16kClient => ErrorSeverity::Warning,
            Self::ConnSeqTmo => ErrorSeverity::Warning,
            Self::UnrespTmo => ErrorSeverity::Warning,
        }
    }

    /// The status code as it travels on the wire: condition, then three bits of severity
    pub fn status_code(&self) -> u32 {
        ((*self as u32) << 3) | self.get_severity() as u32
    }

    /// Recover a condition from a wire status code. The severity bits are ignored.
    pub fn from_status_code(code: u32) -> Option<ErrorCondition> {
        let condition = code >> 3;
        Self::ALL.into_iter().find(|c| *c as u32 == condition)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.get_severity(), ErrorSeverity::Success | ErrorSeverity::Info)
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}",         match self {
            Self::Normal => "Normal successful completion",
            Self::AllocMem => "Unable to allocate additional dynamic memory",
            Self::TooLarge => "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
            Self::Timeout => "User specified timeout on IO operation expired",
            Self::BadType => "The data type specified is invalid",
            Self::Internal => "Channel Access Internal Failure",
            Self::DblClFail => "The requested local DB operation failed",
            Self::GetFail => "Channel read request failed",
            Self::PutFail => "Channel write request failed",
            Self::BadCount => "Invalid element count requested",
            Self::BadStr => "Invalid string",
            Self::Disconn => "Virtual circuit disconnect",
            Self::EvDisallow => "Request inappropriate within subscription (monitor) update callback",
            Self::BadMonId => "Bad event subscription (monitor) identifier",
            Self::BadMask => "Invalid event selection mask",
            Self::IoDone => "IO operations have completed",
            Self::IoInProgress => "IO operations are in progress",
            Self::BadSyncGrp => "Invalid synchronous group identifier",
            Self::PutCbInProg => "Put callback timed out",
            Self::NoRdAccess => "Read access denied",
            Self::NoWtAccess => "Write access denied",
            Self::Anachronism => "Requested feature is no longer supported",
            Self::NoSearchAddr => "Empty PV search address list",
            Self::NoConvert => "No reasonable data conversion between client and server types",
            Self::BadChId => "Invalid channel identifier",
            Self::BadFuncPtr => "Invalid function pointer",
            Self::IsAttached => "Thread is already attached to a client context",
            Self::UnavailInServ => "Not supported by attached service",
            Self::ChanDestroy => "User destroyed channel",
            Self::BadPriority => "Invalid channel priority",
            Self::NotThreaded => "Preemptive callback not enabled - additional threads may not join context",
            Self::Array16kClient => "Client's protocol revision does not support transfers exceeding 16k bytes",
            Self::ConnSeqTmo => "Virtual circuit connection sequence aborted",
            Self::UnrespTmo => "Virtual circuit unresponsive",
        })
    }
}

impl std::error::Error for ErrorCondition {}

/// Message CA_PROTO_ERROR.
///
/// Reports that a request failed. The payload carries a copy of the header
/// of the request that failed, followed by a human readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ECAError {
    pub error_message: String,
    pub client_id: u32,
    pub condition: ErrorCondition,
    /// Header of the request this error refers to
    pub original_request: Frame,
}

impl ECAError {
    pub fn new(condition: ErrorCondition, client_id: u32, original_request: &Frame) -> Self {
        ECAError {
            error_message: condition.to_string(),
            client_id,
            condition,
            original_request: original_request.take_prefix(original_request.header_size()),
        }
    }
}

impl TryFrom<Frame> for ECAError {
    type Error = MessageError;
    fn try_from(value: Frame) -> Result<Self, Self::Error> {
        expect_command(&value, Command::Error)?;
        let condition = ErrorCondition::from_status_code(value.parameter_2()).ok_or_else(|| {
            MessageError::InvalidField("status".to_owned(), value.parameter_2().to_string())
        })?;
        let payload = value.payload();
        let header = Frame::from_bytes(payload.to_vec());
        if !header.has_complete_header() {
            return Err(MessageError::Incomplete);
        }
        let header_size = header.header_size();
        Ok(ECAError {
            error_message: null_terminated_string(&payload[header_size..]),
            client_id: value.parameter_1(),
            condition,
            original_request: header.take_prefix(header_size),
        })
    }
}

impl CAMessage for ECAError {
    fn to_frame(&self) -> Frame {
        let mut payload = self.original_request.as_bytes().to_vec();
        payload.extend(terminated_bytes(&self.error_message));
        Frame::new(
            Command::Error,
            0,
            0,
            self.client_id,
            self.condition.status_code(),
            &payload,
        )
    }
}

/// Messages that a server can receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(Version),
    Search(Search),
    CreateChannel(CreateChannel),
    ReadNotify(ReadNotify),
    Read(Read),
    Write(Write),
    WriteNotify(WriteNotify),
    EventAdd(EventAdd),
    EventCancel(EventCancel),
    EventsOff(EventsOff),
    EventsOn(EventsOn),
    ClearChannel(ClearChannel),
    ClientName(ClientName),
    HostName(HostName),
    RepeaterRegister(RepeaterRegister),
    Echo,
}

/// Messages that a client can receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Version(Version),
    RsrvIsUp(RsrvIsUp),
    SearchResponse(SearchResponse),
    NotFound(NotFound),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ReadNotifyResponse(ReadNotifyResponse),
    WriteNotifyResponse(WriteNotifyResponse),
    EventAddResponse(EventAddResponse),
    ClearChannel(ClearChannel),
    ServerDisconnect(ServerDisconnect),
    ECAError(ECAError),
    RepeaterConfirm(RepeaterConfirm),
    Echo,
}

macro_rules! impl_message_from {
    ($enum:ident, $($variant:ident),+) => {
        $(
            impl From<$variant> for $enum {
                fn from(value: $variant) -> Self {
                    $enum::$variant(value)
                }
            }
        )+
    };
}

impl_message_from!(
    Message,
    Version,
    Search,
    CreateChannel,
    ReadNotify,
    Read,
    Write,
    WriteNotify,
    EventAdd,
    EventCancel,
    EventsOff,
    EventsOn,
    ClearChannel,
    ClientName,
    HostName,
    RepeaterRegister
);

impl_message_from!(
    ClientMessage,
    Version,
    RsrvIsUp,
    SearchResponse,
    NotFound,
    CreateChannelResponse,
    CreateChannelFailure,
    AccessRights,
    ReadNotifyResponse,
    WriteNotifyResponse,
    EventAddResponse,
    ClearChannel,
    ServerDisconnect,
    ECAError,
    RepeaterConfirm
);

impl From<Echo> for Message {
    fn from(_: Echo) -> Self {
        Message::Echo
    }
}
impl From<Echo> for ClientMessage {
    fn from(_: Echo) -> Self {
        ClientMessage::Echo
    }
}

async fn write_frames<M, W>(messages: &[M], writer: &mut W) -> io::Result<()>
where
    M: CAMessage,
    W: AsyncWrite + Unpin,
{
    let buffer: Vec<u8> = messages.iter().flat_map(|m| m.as_bytes()).collect();
    writer.write_all(&buffer).await
}

impl Message {
    /// Write a batch of messages to a stream as a single write
    pub async fn write_all_messages<W: AsyncWrite + Unpin>(
        messages: &[Self],
        writer: &mut W,
    ) -> io::Result<()> {
        write_frames(messages, writer).await
    }

    /// Parse every message in a datagram sent to a server
    ///
    /// Messages with a command a server never receives are skipped.
    pub fn parse_many_server_messages(input: &[u8]) -> Result<Vec<Message>, MessageError> {
        parse_datagram(Frame::from_bytes(input))
    }

    /// Parse a datagram that was received as a (sender-tagged) frame
    pub fn from_datagram(datagram: Frame) -> Result<Vec<Message>, MessageError> {
        parse_datagram(datagram)
    }
}

impl ClientMessage {
    pub async fn write_all_messages<W: AsyncWrite + Unpin>(
        messages: &[Self],
        writer: &mut W,
    ) -> io::Result<()> {
        write_frames(messages, writer).await
    }

    /// Parse every message in a datagram sent to a client
    pub fn parse_many_client_messages(input: &[u8]) -> Result<Vec<ClientMessage>, MessageError> {
        parse_datagram(Frame::from_bytes(input))
    }

    /// Parse a datagram that was received as a (sender-tagged) frame
    pub fn from_datagram(datagram: Frame) -> Result<Vec<ClientMessage>, MessageError> {
        parse_datagram(datagram)
    }
}

fn parse_datagram<M: CAMessage>(datagram: Frame) -> Result<Vec<M>, MessageError> {
    let frames = PacketSplitter::split_datagram(datagram);
    if frames.is_empty() {
        return Err(MessageError::Incomplete);
    }
    let mut messages = Vec::with_capacity(frames.len());
    for frame in frames {
        match M::try_from(frame) {
            Ok(message) => messages.push(message),
            Err(MessageError::UnknownCommandId(id)) => {
                debug!("Skipping datagram message with unexpected command {id}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(messages)
}

impl TryFrom<Frame> for Message {
    type Error = MessageError;
    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        if !frame.has_complete_header() {
            return Err(MessageError::Incomplete);
        }
        let command =
            Command::try_from(frame.command()).map_err(MessageError::UnknownCommandId)?;
        Ok(match command {
            Command::Version => Self::Version(frame.try_into()?),
            Command::Search => Self::Search(frame.try_into()?),
            Command::CreateChannel => Self::CreateChannel(frame.try_into()?),
            Command::ReadNotify => Self::ReadNotify(frame.try_into()?),
            Command::Read => Self::Read(frame.try_into()?),
            Command::Write => Self::Write(frame.try_into()?),
            Command::WriteNotify => Self::WriteNotify(frame.try_into()?),
            Command::EventAdd => Self::EventAdd(frame.try_into()?),
            Command::EventCancel => Self::EventCancel(frame.try_into()?),
            Command::EventsOff => Self::EventsOff(EventsOff),
            Command::EventsOn => Self::EventsOn(EventsOn),
            Command::ClearChannel => Self::ClearChannel(frame.try_into()?),
            Command::ClientName => Self::ClientName(frame.try_into()?),
            Command::HostName => Self::HostName(frame.try_into()?),
            Command::RepeaterRegister => Self::RepeaterRegister(frame.try_into()?),
            Command::Echo => Self::Echo,
            other => Err(MessageError::UnknownCommandId(other as u16))?,
        })
    }
}

impl CAMessage for Message {
    fn to_frame(&self) -> Frame {
        match self {
            Self::Version(msg) => msg.to_frame(),
            Self::Search(msg) => msg.to_frame(),
            Self::CreateChannel(msg) => msg.to_frame(),
            Self::ReadNotify(msg) => msg.to_frame(),
            Self::Read(msg) => msg.to_frame(),
            Self::Write(msg) => msg.to_frame(),
            Self::WriteNotify(msg) => msg.to_frame(),
            Self::EventAdd(msg) => msg.to_frame(),
            Self::EventCancel(msg) => msg.to_frame(),
            Self::EventsOff(msg) => msg.to_frame(),
            Self::EventsOn(msg) => msg.to_frame(),
            Self::ClearChannel(msg) => msg.to_frame(),
            Self::ClientName(msg) => msg.to_frame(),
            Self::HostName(msg) => msg.to_frame(),
            Self::RepeaterRegister(msg) => msg.to_frame(),
            Self::Echo => Echo.to_frame(),
        }
    }
}

impl TryFrom<Frame> for ClientMessage {
    type Error = MessageError;
    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        if !frame.has_complete_header() {
            return Err(MessageError::Incomplete);
        }
        let command =
            Command::try_from(frame.command()).map_err(MessageError::UnknownCommandId)?;
        Ok(match command {
            Command::Version => Self::Version(frame.try_into()?),
            Command::RsrvIsUp => Self::RsrvIsUp(frame.try_into()?),
            Command::Search => Self::SearchResponse(frame.try_into()?),
            Command::NotFound => Self::NotFound(frame.try_into()?),
            Command::CreateChannel => Self::CreateChannelResponse(frame.try_into()?),
            Command::CreateChannelFailure => Self::CreateChannelFailure(frame.try_into()?),
            Command::AccessRights => Self::AccessRights(frame.try_into()?),
            Command::ReadNotify => Self::ReadNotifyResponse(frame.try_into()?),
            Command::WriteNotify => Self::WriteNotifyResponse(frame.try_into()?),
            Command::EventAdd => Self::EventAddResponse(frame.try_into()?),
            Command::ClearChannel => Self::ClearChannel(frame.try_into()?),
            Command::ServerDisconnect => Self::ServerDisconnect(frame.try_into()?),
            Command::Error => Self::ECAError(frame.try_into()?),
            Command::RepeaterConfirm => Self::RepeaterConfirm(frame.try_into()?),
            Command::Echo => Self::Echo,
            other => Err(MessageError::UnknownCommandId(other as u16))?,
        })
    }
}

impl CAMessage for ClientMessage {
    fn to_frame(&self) -> Frame {
        match self {
            Self::Version(msg) => msg.to_frame(),
            Self::RsrvIsUp(msg) => msg.to_frame(),
            Self::SearchResponse(msg) => msg.to_frame(),
            Self::NotFound(msg) => msg.to_frame(),
            Self::CreateChannelResponse(msg) => msg.to_frame(),
            Self::CreateChannelFailure(msg) => msg.to_frame(),
            Self::AccessRights(msg) => msg.to_frame(),
            Self::ReadNotifyResponse(msg) => msg.to_frame(),
            Self::WriteNotifyResponse(msg) => msg.to_frame(),
            Self::EventAddResponse(msg) => msg.to_frame(),
            Self::ClearChannel(msg) => msg.to_frame(),
            Self::ServerDisconnect(msg) => msg.to_frame(),
            Self::ECAError(msg) => msg.to_frame(),
            Self::RepeaterConfirm(msg) => msg.to_frame(),
            Self::Echo => Echo.to_frame(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::{DbrBasicType, DbrCategory};
    use std::io::{Cursor, Seek};

    #[test]
    fn parse_beacon() {
        let raw_beacon = b"\x00\x0d\x00\x00\x00\x0d\x92\x32\x00\x06\xde\xde\xac\x17\x7c\xcf";
        let (_, beacon) = RsrvIsUp::parse(raw_beacon).unwrap();
        assert_eq!(beacon.server_port, 37426);
        assert_eq!(beacon.beacon_id, 450270);
        assert_eq!(
            beacon.server_ip,
            Some("172.23.124.207".parse::<Ipv4Addr>().unwrap())
        );

        // Now try converting it back
        let mut writer = Cursor::new(Vec::new());
        beacon.write(&mut writer).unwrap();
        assert_eq!(writer.stream_position().unwrap(), 16);
        assert_eq!(writer.into_inner(), raw_beacon);
    }

    #[test]
    fn beacons_on_high_ports() {
        let beacon = RsrvIsUp {
            server_port: 37426,
            beacon_id: 3,
            ..Default::default()
        };
        let bytes = beacon.as_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[2..8], &[0x00, 0x00, 0x00, 0x0d, 0x92, 0x32]);
        let (_, parsed) = RsrvIsUp::parse(&bytes).unwrap();
        assert_eq!(parsed, beacon);
    }

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let (_, ver) = Version::parse(raw).unwrap();
        assert_eq!(ver.priority, 1);
        assert!(ver.is_compatible());
        assert_eq!(ver.as_bytes(), raw);
    }

    #[test]
    fn parse_search() {
        let raw = b"\x00\x06\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00\x00\x00\x01ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA\x00";
        let (rest, search) = Search::parse(raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(search.channel_name, "ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA");
        assert!(!search.should_reply);
        assert_eq!(search.search_id, 1);
        assert_eq!(search.as_bytes(), raw);
        // Check parsing something that isn't a search
        let raw = b"\x00\x00\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00";
        assert!(Search::parse(raw).is_err());

        let raw = [
            0x0u8, 0x0, 0x0, 0x0, 0x0, 0x1, 0x0, 0xd, 0x0, 0x0, 0x0, 0x5, 0x0, 0x0, 0x0, 0x0,
            0x0u8, 0x6, 0x0, 0x8, 0x0, 0x5, 0x0, 0xd, 0x0, 0x0, 0x0, 0x1, 0x0, 0x0, 0x0, 0x1, 0x73,
            0x6f, 0x6d, 0x65, 0x0, 0x0, 0x0, 0x0,
        ];
        let messages = Message::parse_many_server_messages(&raw).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::Version(_)));
        let Message::Search(search) = &messages[1] else {
            panic!("Expected search");
        };
        assert_eq!(search.channel_name, "some");
    }

    #[test]
    fn search_response_carries_version() {
        let search = Search {
            search_id: 77,
            channel_name: "X".to_string(),
            should_reply: true,
            ..Default::default()
        };
        let response = search.respond(None, 6464, true);
        let bytes = response.as_bytes();
        assert_eq!(bytes.len(), 24);
        let messages = ClientMessage::parse_many_client_messages(&bytes).unwrap();
        assert_eq!(messages, vec![ClientMessage::SearchResponse(response)]);

        let not_found = Frame::from_bytes(search.not_found().as_bytes());
        assert_eq!(not_found.command(), Command::NotFound as u16);
        assert_eq!(not_found.parameter_1(), 77);
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(ErrorCondition::Normal.status_code(), 1);
        assert_eq!(ErrorCondition::Timeout.status_code(), 80);
        assert_eq!(ErrorCondition::NoWtAccess.status_code(), 376);
        for condition in ErrorCondition::ALL {
            assert_eq!(
                ErrorCondition::from_status_code(condition.status_code()),
                Some(condition)
            );
        }
        assert_eq!(ErrorCondition::from_status_code(7 << 3), None);
    }

    #[test]
    fn error_message_keeps_original_header() {
        let request = ReadNotify {
            data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Time),
            data_count: 1,
            server_id: 3,
            client_ioid: 99,
        }
        .to_frame();
        let error = ECAError::new(ErrorCondition::NoRdAccess, 12, &request);
        let parsed = ECAError::try_from(error.to_frame()).unwrap();
        assert_eq!(parsed.condition, ErrorCondition::NoRdAccess);
        assert_eq!(parsed.client_id, 12);
        assert_eq!(parsed.original_request.command(), Command::ReadNotify as u16);
        assert_eq!(parsed.original_request.parameter_2(), 99);
        assert_eq!(parsed.error_message, "Read access denied");
    }

    #[test]
    fn event_add_mask() {
        let event = EventAdd {
            data_type: DbrType::new(DbrBasicType::Long, DbrCategory::Time),
            data_count: 0,
            server_id: 5,
            subscription_id: 6,
            mask: MonitorMask::VALUE.union(&MonitorMask::ALARM),
        };
        let frame = event.to_frame();
        assert_eq!(frame.payload_size(), 16);
        assert_eq!(&frame.payload()[12..14], &[0, 5]);
        assert_eq!(Message::try_from(frame).unwrap(), Message::EventAdd(event));
        assert!(MonitorMask::default().intersects(&MonitorMask::ALARM));
        assert!(!MonitorMask::default().intersects(&MonitorMask::LOG));
    }

    #[test]
    fn unknown_commands_are_skipped_in_datagrams() {
        let mut bytes = Version::default().as_bytes();
        bytes.extend(Frame::new(0x33u16, 0, 0, 0, 0, &[]).into_bytes());
        bytes.extend(
            Search {
                search_id: 2,
                channel_name: "A".to_string(),
                ..Default::default()
            }
            .as_bytes(),
        );
        let messages = Message::parse_many_server_messages(&bytes).unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn direction_decides_meaning() {
        let create = CreateChannel {
            client_id: 4,
            channel_name: "PV".to_string(),
            ..Default::default()
        }
        .to_frame();
        assert!(matches!(
            Message::try_from(create.clone()),
            Ok(Message::CreateChannel(_))
        ));
        // A request carries data type 0, which reads as a string channel
        assert!(matches!(
            ClientMessage::try_from(create),
            Ok(ClientMessage::CreateChannelResponse(CreateChannelResponse {
                data_type: DbrBasicType::String,
                ..
            }))
        ));
    }
}
