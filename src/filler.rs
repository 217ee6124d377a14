//! Reply buffer filler.
//!
//! Serializes replies (or, on the request side, commands) into a message of
//! fixed capacity. A reply that does not fit leaves the message byte-for-byte as
//! it was before the attempt; the caller then closes the current message with
//! "more chunks follow" and retries in a fresh one.
//!
//! The trailer (array end, more-chunks flag, revision, message end) is reserved
//! up front in [`begin_message`](ReplyBufferFiller::begin_message), so closing a
//! message can never fail for lack of space.
//!
//! ```
//! use invoke_interaction::filler::{MessageKind, ReplyBufferFiller, ReplyPayload};
//! use invoke_interaction::{ConcreteCommandPath, Status, StatusIb};
//!
//! let mut filler = ReplyBufferFiller::new(MessageKind::Response { suppress_response: false });
//! filler.begin_message(128).unwrap();
//! let path = ConcreteCommandPath::new(1, 6, 2);
//! filler
//!     .try_add(&path, None, &ReplyPayload::Status(StatusIb::new(Status::Success)))
//!     .unwrap();
//! let message = filler.finalize_message(false).unwrap();
//! assert_eq!(message.count, 1);
//! assert!(!message.more_chunks);
//! ```

use crate::error::{CodecError, InvokeError};
use crate::messages::{
    write_path, write_request_header, write_response_header, write_trailer, CommandDataIb,
    CommandStatusIb, InvokeResponseIb, MESSAGE_TRAILER_RESERVE,
};
use crate::path::{CommandId, CommandRef, ConcreteCommandPath};
use crate::status::StatusIb;
use crate::tlv::{CommandFields, ContainerType, Tag, TlvWriter};
use bytes::Bytes;

/// Which message the filler builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// InvokeRequest chunks of commands.
    Request {
        /// Peer must not answer.
        suppress_response: bool,
        /// Sent in a timed transaction.
        timed_request: bool,
    },
    /// InvokeResponse chunks of replies.
    Response {
        /// Echoed suppress flag.
        suppress_response: bool,
    },
}

impl MessageKind {
    fn more_chunks_tag(self) -> u8 {
        match self {
            MessageKind::Request { .. } => 3,
            MessageKind::Response { .. } => 2,
        }
    }
}

/// What one entry carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    /// Status reply (response messages).
    Status(StatusIb),
    /// Data reply (response messages); the path's command id is replaced by `response_id`.
    Data {
        /// Response command id.
        response_id: CommandId,
        /// Response fields.
        fields: CommandFields,
    },
    /// Request command (request messages).
    Command(CommandFields),
}

/// Failure to place one entry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FillError {
    /// Not enough room in the current message; the message is unchanged.
    #[error("entry needs {needed} bytes, {available} free")]
    DoesNotFit {
        /// Bytes the failing write needed.
        needed: usize,
        /// Free bytes at the time of the failing write.
        available: usize,
        /// Capacity of the message being filled.
        capacity: usize,
    },
    /// The entry does not fit even into an empty message.
    #[error("entry does not fit into an empty {capacity}-byte message")]
    Oversize {
        /// Message capacity.
        capacity: usize,
    },
    /// No message is open.
    #[error("no message in progress")]
    NoMessage,
    /// Encoding failed for a reason other than space; the message is unchanged.
    #[error("encode failed: {0}")]
    Encode(CodecError),
}

impl FillError {
    fn from_codec(err: CodecError, capacity: usize) -> Self {
        match err {
            CodecError::BufferTooSmall { needed, available } => {
                Self::DoesNotFit { needed, available, capacity }
            }
            other => Self::Encode(other),
        }
    }
}

impl From<FillError> for InvokeError {
    fn from(err: FillError) -> Self {
        match err {
            FillError::DoesNotFit { capacity, .. } | FillError::Oversize { capacity } => {
                InvokeError::BufferTooSmall { capacity }
            }
            FillError::NoMessage => InvokeError::IncorrectState("no message in progress"),
            FillError::Encode(e) => InvokeError::Codec(e),
        }
    }
}

/// Successful placement of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Added {
    /// Position of the entry in the current message.
    pub index: usize,
    /// Encoded size of the entry.
    pub encoded_len: usize,
}

/// A closed message ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedMessage {
    /// Encoded message payload.
    pub payload: Bytes,
    /// Number of entries in the message.
    pub count: usize,
    /// Whether the message announces a continuation.
    pub more_chunks: bool,
}

/// Capacity-bounded, transactional message builder.
#[derive(Debug)]
pub struct ReplyBufferFiller {
    kind: MessageKind,
    capacity: usize,
    writer: Option<TlvWriter>,
    count: usize,
}

impl ReplyBufferFiller {
    /// Filler for `kind` messages. Call [`begin_message`](Self::begin_message) before adding.
    pub fn new(kind: MessageKind) -> Self {
        Self { kind, capacity: 0, writer: None, count: 0 }
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Open a message of at most `capacity` bytes, discarding any unfinished one.
    pub fn begin_message(&mut self, capacity: usize) -> Result<(), CodecError> {
        let mut w = TlvWriter::new(capacity);
        w.reserve(MESSAGE_TRAILER_RESERVE)?;
        match self.kind {
            MessageKind::Request { suppress_response, timed_request } => {
                write_request_header(&mut w, suppress_response, timed_request)?
            }
            MessageKind::Response { suppress_response } => {
                write_response_header(&mut w, suppress_response)?
            }
        }
        self.capacity = capacity;
        self.writer = Some(w);
        self.count = 0;
        Ok(())
    }

    /// Whether a message is open.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Entries in the open message.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Capacity of the open (or last) message.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free bytes in the open message, after the trailer reservation.
    pub fn remaining_free_length(&self) -> usize {
        self.writer.as_ref().map_or(0, TlvWriter::remaining_free_length)
    }

    /// Place one entry, or leave the message unchanged.
    pub fn try_add(
        &mut self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
        payload: &ReplyPayload,
    ) -> Result<Added, FillError> {
        let kind = self.kind;
        self.transact(|w| match (kind, payload) {
            (MessageKind::Response { .. }, ReplyPayload::Status(status)) => {
                InvokeResponseIb::Status(CommandStatusIb {
                    path: *path,
                    status: *status,
                    command_ref,
                })
                .write(w)
            }
            (MessageKind::Response { .. }, ReplyPayload::Data { response_id, fields }) => {
                InvokeResponseIb::Command(CommandDataIb {
                    path: path.with_command(*response_id),
                    fields: fields.clone(),
                    command_ref,
                })
                .write(w)
            }
            (MessageKind::Request { .. }, ReplyPayload::Command(fields)) => {
                CommandDataIb { path: *path, fields: fields.clone(), command_ref }
                    .write(w, Tag::Anonymous)
            }
            _ => Err(CodecError::UnexpectedElement { expected: "payload matching message kind" }),
        })
    }

    /// Place a data reply whose fields are encoded in place by `encode`.
    ///
    /// If `encode` fails the partial reply is discarded and the message is left
    /// unchanged.
    pub fn try_add_with<F>(
        &mut self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
        response_id: CommandId,
        encode: F,
    ) -> Result<Added, FillError>
    where
        F: FnOnce(&mut TlvWriter) -> Result<(), CodecError>,
    {
        if !matches!(self.kind, MessageKind::Response { .. }) {
            return Err(FillError::Encode(CodecError::UnexpectedElement {
                expected: "payload matching message kind",
            }));
        }
        self.transact(|w| {
            w.start_container(Tag::Anonymous, ContainerType::Structure)?;
            w.start_container(Tag::Context(0), ContainerType::Structure)?;
            write_path(w, Tag::Context(0), &path.with_command(response_id))?;
            w.start_container(Tag::Context(1), ContainerType::Structure)?;
            let depth = w.depth();
            encode(w)?;
            if w.depth() != depth {
                return Err(CodecError::UnbalancedContainer);
            }
            w.end_container()?;
            if let Some(r) = command_ref {
                w.put_u16(Tag::Context(2), r)?;
            }
            w.end_container()?;
            w.end_container()
        })
    }

    fn transact<F>(&mut self, f: F) -> Result<Added, FillError>
    where
        F: FnOnce(&mut TlvWriter) -> Result<(), CodecError>,
    {
        let w = self.writer.as_mut().ok_or(FillError::NoMessage)?;
        let checkpoint = w.checkpoint();
        let before = w.len();
        if let Err(err) = f(w) {
            w.rollback(checkpoint);
            return Err(FillError::from_codec(err, self.capacity));
        }
        let added = Added { index: self.count, encoded_len: w.len() - before };
        self.count += 1;
        Ok(added)
    }

    /// Place one entry, closing the current message and opening a continuation
    /// when it does not fit. Returns the closed message, if one was closed.
    ///
    /// An entry that fits nowhere yields `Oversize` and leaves the open message as it was.
    pub fn add_or_continue(
        &mut self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
        payload: &ReplyPayload,
    ) -> Result<Option<FinalizedMessage>, FillError> {
        match self.try_add(path, command_ref, payload) {
            Ok(_) => Ok(None),
            Err(FillError::DoesNotFit { .. }) if self.count == 0 => {
                Err(FillError::Oversize { capacity: self.capacity })
            }
            Err(FillError::DoesNotFit { .. }) => {
                if !self.fits_in_empty(path, command_ref, payload) {
                    return Err(FillError::Oversize { capacity: self.capacity });
                }
                let closed = self.finalize_message(true).map_err(FillError::Encode)?;
                self.begin_message(self.capacity).map_err(FillError::Encode)?;
                self.try_add(path, command_ref, payload)?;
                Ok(Some(closed))
            }
            Err(other) => Err(other),
        }
    }

    fn fits_in_empty(
        &self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
        payload: &ReplyPayload,
    ) -> bool {
        let mut trial = ReplyBufferFiller::new(self.kind);
        trial.begin_message(self.capacity).is_ok()
            && trial.try_add(path, command_ref, payload).is_ok()
    }

    /// Close the open message.
    pub fn finalize_message(&mut self, more_chunks: bool) -> Result<FinalizedMessage, CodecError> {
        let mut w = self.writer.take().ok_or(CodecError::UnexpectedElement {
            expected: "open message",
        })?;
        w.unreserve(MESSAGE_TRAILER_RESERVE);
        write_trailer(&mut w, self.kind.more_chunks_tag(), more_chunks)?;
        let count = std::mem::take(&mut self.count);
        Ok(FinalizedMessage { payload: w.finish()?, count, more_chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        InvokeRequestMessage, InvokeResponseMessage, RESPONSE_HEADER_LEN, STATUS_REPLY_OVERHEAD,
    };
    use crate::status::Status;

    const PATH: ConcreteCommandPath = ConcreteCommandPath::new(1, 0x6, 0x2);

    fn response_filler(capacity: usize) -> ReplyBufferFiller {
        let mut f = ReplyBufferFiller::new(MessageKind::Response { suppress_response: false });
        f.begin_message(capacity).unwrap();
        f
    }

    fn status(s: Status) -> ReplyPayload {
        ReplyPayload::Status(StatusIb::new(s))
    }

    #[test]
    fn status_reply_uses_exact_overhead() {
        let mut f = response_filler(256);
        let before = f.remaining_free_length();
        let added = f.try_add(&PATH, None, &status(Status::Success)).unwrap();
        assert_eq!(added.encoded_len, STATUS_REPLY_OVERHEAD);
        assert_eq!(before - f.remaining_free_length(), STATUS_REPLY_OVERHEAD);
    }

    #[test]
    fn payload_sized_to_free_length_still_fails_on_framing() {
        let mut f = response_filler(128);
        let free = f.remaining_free_length();
        let fields = CommandFields::empty();
        // fields that alone would fill the free length exactly
        let raw = CommandFields::encode(|w| w.put_bytes(Tag::Context(0), &vec![0u8; free - 3]))
            .unwrap();
        assert_eq!(raw.len(), free);
        let err = f
            .try_add(&PATH, None, &ReplyPayload::Data { response_id: 3, fields: raw })
            .unwrap_err();
        assert!(matches!(err, FillError::DoesNotFit { capacity: 128, .. }));
        assert_eq!(f.remaining_free_length(), free);
        assert_eq!(f.count(), 0);
        f.try_add(&PATH, None, &ReplyPayload::Data { response_id: 3, fields }).unwrap();
    }

    #[test]
    fn does_not_fit_reports_message_capacity() {
        let mut f = response_filler(96);
        let raw = CommandFields::encode(|w| w.put_bytes(Tag::Context(0), &[1u8; 120])).unwrap();
        let err = f
            .try_add(&PATH, None, &ReplyPayload::Data { response_id: 3, fields: raw })
            .unwrap_err();
        assert_eq!(InvokeError::from(err), InvokeError::BufferTooSmall { capacity: 96 });
    }

    #[test]
    fn encode_failure_leaves_message_unchanged() {
        let mut f = response_filler(256);
        f.try_add(&PATH, Some(1), &status(Status::Success)).unwrap();
        let free = f.remaining_free_length();
        let err = f
            .try_add_with(&PATH, Some(2), 7, |w| {
                w.put_u8(Tag::Context(0), 1)?;
                Err(CodecError::ValueOutOfRange("level"))
            })
            .unwrap_err();
        assert_eq!(err, FillError::Encode(CodecError::ValueOutOfRange("level")));
        assert_eq!(f.remaining_free_length(), free);
        f.try_add(&PATH, Some(2), &status(Status::Failure)).unwrap();

        let msg = f.finalize_message(false).unwrap();
        let decoded = InvokeResponseMessage::decode(&msg.payload).unwrap();
        assert_eq!(decoded.invoke_responses.len(), 2);
        assert_eq!(decoded.invoke_responses[1].command_ref(), Some(2));
    }

    #[test]
    fn unbalanced_closure_is_rejected() {
        let mut f = response_filler(256);
        let err = f
            .try_add_with(&PATH, None, 7, |w| {
                w.start_container(Tag::Context(0), ContainerType::List)
            })
            .unwrap_err();
        assert_eq!(err, FillError::Encode(CodecError::UnbalancedContainer));
        assert_eq!(f.count(), 0);
    }

    #[test]
    fn continues_into_new_message() {
        let capacity = RESPONSE_HEADER_LEN + MESSAGE_TRAILER_RESERVE + 2 * STATUS_REPLY_OVERHEAD;
        let mut f = response_filler(capacity);
        for id in [1, 2] {
            let closed = f.add_or_continue(&PATH.with_command(id), None, &status(Status::Success));
            assert!(closed.unwrap().is_none());
        }
        let closed = f
            .add_or_continue(&PATH.with_command(3), None, &status(Status::Busy))
            .unwrap()
            .expect("first message closed");
        assert!(closed.more_chunks);
        assert_eq!(closed.count, 2);
        assert!(closed.payload.len() <= capacity);
        let first = InvokeResponseMessage::decode(&closed.payload).unwrap();
        assert!(first.more_chunked_messages);

        let last = f.finalize_message(false).unwrap();
        assert_eq!(last.count, 1);
        let second = InvokeResponseMessage::decode(&last.payload).unwrap();
        assert!(!second.more_chunked_messages);
        assert_eq!(second.invoke_responses[0].path().command_id, 3);
    }

    #[test]
    fn oversize_entry_is_reported() {
        let mut f = response_filler(64);
        let big = CommandFields::encode(|w| w.put_bytes(Tag::Context(0), &[1u8; 200])).unwrap();
        let err = f
            .add_or_continue(
                &PATH,
                None,
                &ReplyPayload::Data { response_id: 1, fields: big.clone() },
            )
            .unwrap_err();
        assert_eq!(err, FillError::Oversize { capacity: 64 });

        f.try_add(&PATH, None, &status(Status::Success)).unwrap();
        let err = f
            .add_or_continue(&PATH, None, &ReplyPayload::Data { response_id: 1, fields: big })
            .unwrap_err();
        assert_eq!(err, FillError::Oversize { capacity: 64 });
        assert_eq!(f.count(), 1);
    }

    #[test]
    fn request_messages_carry_commands() {
        let mut f = ReplyBufferFiller::new(MessageKind::Request {
            suppress_response: false,
            timed_request: true,
        });
        f.begin_message(256).unwrap();
        assert!(f.try_add(&PATH, None, &status(Status::Success)).is_err());
        let fields = CommandFields::encode(|w| w.put_u8(Tag::Context(0), 9)).unwrap();
        f.try_add(&PATH, Some(40), &ReplyPayload::Command(fields.clone())).unwrap();
        let msg = f.finalize_message(false).unwrap();
        let decoded = InvokeRequestMessage::decode(&msg.payload).unwrap();
        assert!(decoded.timed_request);
        assert_eq!(decoded.invoke_requests[0].fields, fields);
        assert_eq!(decoded.invoke_requests[0].command_ref, Some(40));
    }

    #[test]
    fn adding_without_message_fails() {
        let mut f = ReplyBufferFiller::new(MessageKind::Response { suppress_response: false });
        assert_eq!(f.try_add(&PATH, None, &status(Status::Success)), Err(FillError::NoMessage));
    }
}
