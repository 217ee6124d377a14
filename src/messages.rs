//! Interaction message schemas.
//!
//! Payload layouts for the four messages the invoke interaction exchanges,
//! plus the per-element framing constants the reply filler sizes messages with.
//! Every constant is derived from the element sizes of the schema below, so a
//! schema change moves the arithmetic with it.
//!
//! ```text
//! InvokeRequest  { [0] suppress, [1] timed, [2] [ CommandDataIB, .. ], [3] more?, [0xFF] rev }
//! InvokeResponse { [0] suppress, [1] [ InvokeResponseIB, .. ], [2] more?, [0xFF] rev }
//! StatusResponse { [0] status, [0xFF] rev }
//! TimedRequest   { [0] timeout ms, [0xFF] rev }
//! ```

mod ib;

pub use ib::{CommandDataIb, CommandStatusIb, InvokeResponseIb};
pub(crate) use ib::{for_each_member, write_path};

use crate::error::CodecError;
use crate::status::Status;
use crate::tlv::{
    bool_len, container_len, header_len, uint_len, ContainerType, Tag, TlvReader, TlvWriter,
    END_OF_CONTAINER_LEN,
};
use bytes::Bytes;
use std::fmt;

/// Interaction model revision written into every message.
pub const INTERACTION_MODEL_REVISION: u8 = 11;

const REVISION_TAG: Tag = Tag::Context(0xFF);

/// Encoded CommandPathIB (context-tagged list of endpoint, cluster, command).
pub const COMMAND_PATH_IB_LEN: usize = container_len(
    Tag::Context(0),
    uint_len(Tag::Context(0), 2) + uint_len(Tag::Context(1), 4) + uint_len(Tag::Context(2), 4),
);

/// Extra bytes a reply or request command pays for carrying a ref.
pub const COMMAND_REF_OVERHEAD: usize = uint_len(Tag::Context(2), 2);

/// Extra bytes a StatusIB pays for a cluster-specific status.
pub const CLUSTER_STATUS_OVERHEAD: usize = uint_len(Tag::Context(1), 1);

/// Encoded StatusIB without cluster status.
pub const STATUS_IB_LEN: usize = container_len(Tag::Context(1), uint_len(Tag::Context(0), 1));

/// Encoded status reply (InvokeResponseIB wrapping a CommandStatusIB), without ref.
pub const STATUS_REPLY_OVERHEAD: usize = container_len(
    Tag::Anonymous,
    container_len(Tag::Context(1), COMMAND_PATH_IB_LEN + STATUS_IB_LEN),
);

/// Encoded data reply framing (InvokeResponseIB wrapping a CommandDataIB), without
/// ref and without the field members themselves.
pub const DATA_REPLY_OVERHEAD: usize = container_len(
    Tag::Anonymous,
    container_len(Tag::Context(0), COMMAND_PATH_IB_LEN + container_len(Tag::Context(1), 0)),
);

/// Encoded request command framing (anonymous CommandDataIB), without ref and fields.
pub const REQUEST_COMMAND_OVERHEAD: usize =
    container_len(Tag::Anonymous, COMMAND_PATH_IB_LEN + container_len(Tag::Context(1), 0));

/// Response message bytes before the first reply.
pub const RESPONSE_HEADER_LEN: usize =
    header_len(Tag::Anonymous) + bool_len(Tag::Context(0)) + header_len(Tag::Context(1));

/// Request message bytes before the first command.
pub const REQUEST_HEADER_LEN: usize = header_len(Tag::Anonymous)
    + bool_len(Tag::Context(0))
    + bool_len(Tag::Context(1))
    + header_len(Tag::Context(2));

/// Bytes held back for closing a message: array end, more-chunks flag, revision,
/// message end.
pub const MESSAGE_TRAILER_RESERVE: usize = END_OF_CONTAINER_LEN
    + bool_len(Tag::Context(3))
    + uint_len(REVISION_TAG, 1)
    + END_OF_CONTAINER_LEN;

/// Smallest message size in which the largest status reply still fits.
pub const MIN_MESSAGE_SIZE: usize = RESPONSE_HEADER_LEN
    + MESSAGE_TRAILER_RESERVE
    + STATUS_REPLY_OVERHEAD
    + COMMAND_REF_OVERHEAD
    + CLUSTER_STATUS_OVERHEAD;

/// Interaction message opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Status report; also acknowledges a chunk.
    StatusResponse = 0x01,
    /// Read interaction request.
    ReadRequest = 0x02,
    /// Subscribe interaction request.
    SubscribeRequest = 0x03,
    /// Subscribe interaction response.
    SubscribeResponse = 0x04,
    /// Attribute or event report.
    ReportData = 0x05,
    /// Write interaction request.
    WriteRequest = 0x06,
    /// Write interaction response.
    WriteResponse = 0x07,
    /// Batch of commands to invoke.
    InvokeRequest = 0x08,
    /// Replies to an invoke request.
    InvokeResponse = 0x09,
    /// Opens a timed window for the following invoke.
    TimedRequest = 0x0A,
}

impl MessageType {
    /// Wire opcode.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match code {
            0x01 => StatusResponse,
            0x02 => ReadRequest,
            0x03 => SubscribeRequest,
            0x04 => SubscribeResponse,
            0x05 => ReportData,
            0x06 => WriteRequest,
            0x07 => WriteResponse,
            0x08 => InvokeRequest,
            0x09 => InvokeResponse,
            0x0A => TimedRequest,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) fn write_request_header(
    w: &mut TlvWriter,
    suppress_response: bool,
    timed_request: bool,
) -> Result<(), CodecError> {
    w.start_container(Tag::Anonymous, ContainerType::Structure)?;
    w.put_bool(Tag::Context(0), suppress_response)?;
    w.put_bool(Tag::Context(1), timed_request)?;
    w.start_container(Tag::Context(2), ContainerType::Array)
}

pub(crate) fn write_response_header(
    w: &mut TlvWriter,
    suppress_response: bool,
) -> Result<(), CodecError> {
    w.start_container(Tag::Anonymous, ContainerType::Structure)?;
    w.put_bool(Tag::Context(0), suppress_response)?;
    w.start_container(Tag::Context(1), ContainerType::Array)
}

/// Close the reply/command array and the message. `more_tag` is the context tag
/// of the more-chunks flag, which is written only when set.
pub(crate) fn write_trailer(
    w: &mut TlvWriter,
    more_tag: u8,
    more_chunks: bool,
) -> Result<(), CodecError> {
    w.end_container()?;
    if more_chunks {
        w.put_bool(Tag::Context(more_tag), true)?;
    }
    w.put_u8(REVISION_TAG, INTERACTION_MODEL_REVISION)?;
    w.end_container()
}

fn open_message<'a>(payload: &'a [u8]) -> Result<TlvReader<'a>, CodecError> {
    let mut r = TlvReader::new(payload);
    r.expect_next()?.expect_container(ContainerType::Structure)?;
    Ok(r)
}

fn close_message(r: &TlvReader<'_>) -> Result<(), CodecError> {
    match r.remaining() {
        0 => Ok(()),
        n => Err(CodecError::TrailingBytes(n)),
    }
}

/// Invoke request payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeRequestMessage {
    /// Peer must not send an invoke response.
    pub suppress_response: bool,
    /// Sent inside a timed transaction.
    pub timed_request: bool,
    /// Commands of this chunk, in batch order.
    pub invoke_requests: Vec<CommandDataIb>,
    /// Further request chunks follow.
    pub more_chunked_messages: bool,
}

impl InvokeRequestMessage {
    /// Encode without a size bound.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = TlvWriter::unbounded();
        write_request_header(&mut w, self.suppress_response, self.timed_request)?;
        for cmd in &self.invoke_requests {
            cmd.write(&mut w, Tag::Anonymous)?;
        }
        write_trailer(&mut w, 3, self.more_chunked_messages)?;
        w.finish()
    }

    /// Decode a payload. Field bytes are shared with `payload`.
    pub fn decode(payload: &Bytes) -> Result<Self, CodecError> {
        let mut r = open_message(payload)?;
        let mut msg = Self::default();
        let (mut suppress, mut timed, mut commands) = (None, None, None);
        for_each_member(&mut r, |r, el| {
            match el.context_tag() {
                Some(0) => suppress = Some(el.bool()?),
                Some(1) => timed = Some(el.bool()?),
                Some(2) => {
                    el.expect_container(ContainerType::Array)?;
                    let mut list = Vec::new();
                    for_each_member(r, |r, el| {
                        el.expect_container(ContainerType::Structure)?;
                        list.push(CommandDataIb::read(r, payload)?);
                        Ok(())
                    })?;
                    commands = Some(list);
                }
                Some(3) => msg.more_chunked_messages = el.bool()?,
                _ => r.skip_element(&el)?,
            }
            Ok(())
        })?;
        close_message(&r)?;
        msg.suppress_response = suppress.ok_or(CodecError::MissingField("suppress response"))?;
        msg.timed_request = timed.ok_or(CodecError::MissingField("timed request"))?;
        msg.invoke_requests = commands.ok_or(CodecError::MissingField("invoke requests"))?;
        Ok(msg)
    }
}

/// Invoke response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeResponseMessage {
    /// Echo of the request flag; always false on the wire in practice.
    pub suppress_response: bool,
    /// Replies of this chunk.
    pub invoke_responses: Vec<InvokeResponseIb>,
    /// Further response chunks follow.
    pub more_chunked_messages: bool,
}

impl InvokeResponseMessage {
    /// Encode without a size bound.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = TlvWriter::unbounded();
        write_response_header(&mut w, self.suppress_response)?;
        for reply in &self.invoke_responses {
            reply.write(&mut w)?;
        }
        write_trailer(&mut w, 2, self.more_chunked_messages)?;
        w.finish()
    }

    /// Decode a payload. Field bytes are shared with `payload`.
    pub fn decode(payload: &Bytes) -> Result<Self, CodecError> {
        let mut r = open_message(payload)?;
        let mut msg = Self::default();
        let mut replies = None;
        for_each_member(&mut r, |r, el| {
            match el.context_tag() {
                Some(0) => msg.suppress_response = el.bool()?,
                Some(1) => {
                    el.expect_container(ContainerType::Array)?;
                    let mut list = Vec::new();
                    for_each_member(r, |r, el| {
                        el.expect_container(ContainerType::Structure)?;
                        list.push(InvokeResponseIb::read(r, payload)?);
                        Ok(())
                    })?;
                    replies = Some(list);
                }
                Some(2) => msg.more_chunked_messages = el.bool()?,
                _ => r.skip_element(&el)?,
            }
            Ok(())
        })?;
        close_message(&r)?;
        msg.invoke_responses = replies.ok_or(CodecError::MissingField("invoke responses"))?;
        Ok(msg)
    }
}

/// Status response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponseMessage {
    /// Reported status.
    pub status: Status,
}

impl StatusResponseMessage {
    /// Status response carrying `status`.
    pub fn new(status: Status) -> Self {
        Self { status }
    }

    /// Encode.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = TlvWriter::new(
            1 + uint_len(Tag::Context(0), 1) + uint_len(REVISION_TAG, 1) + END_OF_CONTAINER_LEN,
        );
        w.start_container(Tag::Anonymous, ContainerType::Structure)?;
        w.put_u8(Tag::Context(0), self.status.code())?;
        w.put_u8(REVISION_TAG, INTERACTION_MODEL_REVISION)?;
        w.end_container()?;
        w.finish()
    }

    /// Decode.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = open_message(payload)?;
        let mut status = None;
        for_each_member(&mut r, |r, el| {
            match el.context_tag() {
                Some(0) => status = Some(Status::try_from(el.u8("status")?)?),
                _ => r.skip_element(&el)?,
            }
            Ok(())
        })?;
        close_message(&r)?;
        Ok(Self { status: status.ok_or(CodecError::MissingField("status"))? })
    }
}

/// Timed request payload: opens a timed transaction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedRequestMessage {
    /// Window length in milliseconds.
    pub timeout_ms: u16,
}

impl TimedRequestMessage {
    /// Encode.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = TlvWriter::new(
            1 + uint_len(Tag::Context(0), 2) + uint_len(REVISION_TAG, 1) + END_OF_CONTAINER_LEN,
        );
        w.start_container(Tag::Anonymous, ContainerType::Structure)?;
        w.put_u16(Tag::Context(0), self.timeout_ms)?;
        w.put_u8(REVISION_TAG, INTERACTION_MODEL_REVISION)?;
        w.end_container()?;
        w.finish()
    }

    /// Decode.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = open_message(payload)?;
        let mut timeout_ms = None;
        for_each_member(&mut r, |r, el| {
            match el.context_tag() {
                Some(0) => timeout_ms = Some(el.u16("timeout")?),
                _ => r.skip_element(&el)?,
            }
            Ok(())
        })?;
        close_message(&r)?;
        Ok(Self { timeout_ms: timeout_ms.ok_or(CodecError::MissingField("timeout"))? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ConcreteCommandPath;
    use crate::status::StatusIb;
    use crate::tlv::CommandFields;

    const PATH: ConcreteCommandPath = ConcreteCommandPath::new(1, 0x6, 0x2);

    #[test]
    fn overhead_constants_match_schema() {
        assert_eq!(COMMAND_PATH_IB_LEN, 19);
        assert_eq!(STATUS_REPLY_OVERHEAD, 30);
        assert_eq!(DATA_REPLY_OVERHEAD, 27);
        assert_eq!(REQUEST_COMMAND_OVERHEAD, 24);
        assert_eq!(MESSAGE_TRAILER_RESERVE, 7);
        assert_eq!(MIN_MESSAGE_SIZE, 49);
    }

    #[test]
    fn status_reply_size_matches_constant() {
        let plain = InvokeResponseIb::Status(CommandStatusIb {
            path: PATH,
            status: StatusIb::success(),
            command_ref: None,
        });
        let mut w = TlvWriter::unbounded();
        plain.write(&mut w).unwrap();
        assert_eq!(w.len(), STATUS_REPLY_OVERHEAD);

        let full = InvokeResponseIb::Status(CommandStatusIb {
            path: PATH,
            status: StatusIb::cluster_specific(Status::Failure, 3),
            command_ref: Some(9),
        });
        let mut w = TlvWriter::unbounded();
        full.write(&mut w).unwrap();
        assert_eq!(
            w.len(),
            STATUS_REPLY_OVERHEAD + COMMAND_REF_OVERHEAD + CLUSTER_STATUS_OVERHEAD
        );
    }

    #[test]
    fn data_reply_size_matches_constant() {
        let fields = CommandFields::encode(|w| w.put_u32(Tag::Context(0), 77)).unwrap();
        let reply = InvokeResponseIb::Command(CommandDataIb {
            path: PATH,
            fields: fields.clone(),
            command_ref: None,
        });
        let mut w = TlvWriter::unbounded();
        reply.write(&mut w).unwrap();
        assert_eq!(w.len(), DATA_REPLY_OVERHEAD + fields.len());
    }

    #[test]
    fn empty_response_message_is_header_plus_trailer() {
        let bytes = InvokeResponseMessage::default().encode().unwrap();
        // more-chunks flag is omitted when false
        assert_eq!(
            bytes.len(),
            RESPONSE_HEADER_LEN + MESSAGE_TRAILER_RESERVE - bool_len(Tag::Context(2))
        );
        let chunked = InvokeResponseMessage { more_chunked_messages: true, ..Default::default() };
        assert_eq!(chunked.encode().unwrap().len(), RESPONSE_HEADER_LEN + MESSAGE_TRAILER_RESERVE);
    }

    #[test]
    fn request_keeps_command_order_and_refs() {
        let msg = InvokeRequestMessage {
            suppress_response: false,
            timed_request: true,
            invoke_requests: vec![
                CommandDataIb { path: PATH, fields: CommandFields::empty(), command_ref: Some(40) },
                CommandDataIb { path: PATH, fields: CommandFields::empty(), command_ref: Some(2) },
            ],
            more_chunked_messages: true,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(InvokeRequestMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn request_without_commands_array_is_rejected() {
        let mut w = TlvWriter::unbounded();
        w.start_container(Tag::Anonymous, ContainerType::Structure).unwrap();
        w.put_bool(Tag::Context(0), false).unwrap();
        w.put_bool(Tag::Context(1), false).unwrap();
        w.end_container().unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(
            InvokeRequestMessage::decode(&bytes),
            Err(CodecError::MissingField("invoke requests"))
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut raw = StatusResponseMessage::new(Status::Success).encode().unwrap().to_vec();
        raw.push(0x18);
        assert_eq!(StatusResponseMessage::decode(&raw), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn status_response_with_unknown_code() {
        let raw = [0x15, 0x24, 0x00, 0x42, 0x18];
        assert_eq!(StatusResponseMessage::decode(&raw), Err(CodecError::UnknownStatus(0x42)));
    }

    #[test]
    fn timed_request_decodes() {
        let bytes = TimedRequestMessage { timeout_ms: 500 }.encode().unwrap();
        assert_eq!(TimedRequestMessage::decode(&bytes).unwrap().timeout_ms, 500);
    }

    #[test]
    fn message_type_codes() {
        assert_eq!(MessageType::try_from(0x09), Ok(MessageType::InvokeResponse));
        assert_eq!(MessageType::try_from(0x33), Err(CodecError::UnknownMessageType(0x33)));
        assert_eq!(MessageType::TimedRequest.code(), 0x0A);
    }
}
