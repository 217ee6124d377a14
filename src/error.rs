//! Error types for the invoke interaction.
use crate::path::{CommandRef, ConcreteCommandPath};
use crate::status::{Status, StatusIb};
use std::time::Duration;

/// Errors produced by the TLV codec and the message schema layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The write does not fit in the remaining free length.
    #[error("buffer too small: need {needed} bytes, {available} available")]
    BufferTooSmall {
        /// Bytes the element needed.
        needed: usize,
        /// Bytes left before the capacity (minus reservations).
        available: usize,
    },
    /// The input ended in the middle of an element.
    #[error("unexpected end of input")]
    UnexpectedEnd,
    /// Unknown element type in a control byte.
    #[error("invalid element type 0x{0:02x}")]
    InvalidElementType(u8),
    /// Unsupported tag control in a control byte.
    #[error("invalid tag control 0x{0:02x}")]
    InvalidTagControl(u8),
    /// An element did not have the shape the schema expects.
    #[error("unexpected element: expected {expected}")]
    UnexpectedElement {
        /// Human-readable description of what the schema wanted.
        expected: &'static str,
    },
    /// A mandatory field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// An integer did not fit the schema type.
    #[error("value out of range for {0}")]
    ValueOutOfRange(&'static str),
    /// A string element was not valid UTF-8.
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    /// Container start/end mismatch.
    #[error("unbalanced container")]
    UnbalancedContainer,
    /// Bytes remained after the top-level element.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    /// A status code that is not part of the status taxonomy.
    #[error("unknown status code 0x{0:02x}")]
    UnknownStatus(u8),
    /// An opcode outside the interaction's message types.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
}

impl CodecError {
    /// True when the error only means "out of space".
    pub fn is_buffer_too_small(&self) -> bool {
        matches!(self, Self::BufferTooSmall { .. })
    }
}

/// Errors surfaced by the transport collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The exchange was already closed by either side.
    #[error("exchange closed")]
    Closed,
    /// The transport refused the message.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Errors produced by the command sender and handler.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The call is not valid in the driver's current state.
    #[error("incorrect state: {0}")]
    IncorrectState(&'static str),
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The command reference is already registered in this transaction.
    #[error("duplicate command ref {command_ref}")]
    DuplicateRef {
        /// Offending reference.
        command_ref: CommandRef,
    },
    /// The path repeats without refs to tell the occurrences apart.
    #[error("duplicate command path {path}")]
    DuplicatePath {
        /// Offending path.
        path: ConcreteCommandPath,
    },
    /// More paths than the invoke allows.
    #[error("capacity exceeded: at most {capacity} paths per invoke")]
    CapacityExceeded {
        /// Registry capacity.
        capacity: usize,
    },
    /// A reply could not be matched to a request command.
    #[error("no request command matches reply for {path} (ref {command_ref:?})")]
    KeyNotFound {
        /// Path carried by the reply.
        path: ConcreteCommandPath,
        /// Ref carried by the reply.
        command_ref: Option<CommandRef>,
    },
    /// The peer sent something the interaction does not allow.
    #[error("invalid action: {0}")]
    InvalidAction(&'static str),
    /// The peer answered with a non-success status.
    #[error("peer status: {0}")]
    Status(StatusIb),
    /// No response arrived in time.
    #[error("response timed out after {0:?}")]
    Timeout(Duration),
    /// The transaction ended without a response for the command.
    #[error("no response")]
    NoResponse,
    /// A single command does not fit even into an empty message.
    #[error("command does not fit into a {capacity}-byte message")]
    BufferTooSmall {
        /// Message capacity in bytes.
        capacity: usize,
    },
    /// Malformed message.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// Transport failure.
    #[error("exchange: {0}")]
    Exchange(#[from] ExchangeError),
}

impl InvokeError {
    /// Check if this error is a response timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if the caller passed something unusable (including duplicate refs/paths).
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::DuplicateRef { .. } | Self::DuplicatePath { .. }
        )
    }

    /// Check if this error came from the peer violating the protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::InvalidAction(_) | Self::KeyNotFound { .. } | Self::Codec(_))
    }

    /// Peer status carried by a `Status` error.
    pub fn status(&self) -> Option<StatusIb> {
        match self {
            Self::Status(s) => Some(*s),
            _ => None,
        }
    }

    /// Wire status a peer should see for this error.
    pub fn to_status(&self) -> Status {
        match self {
            Self::Status(s) => s.status,
            Self::InvalidAction(_)
            | Self::KeyNotFound { .. }
            | Self::Codec(_)
            | Self::DuplicateRef { .. }
            | Self::DuplicatePath { .. }
            | Self::CapacityExceeded { .. } => Status::InvalidAction,
            Self::Timeout(_) => Status::Timeout,
            Self::BufferTooSmall { .. } => Status::ResourceExhausted,
            _ => Status::Failure,
        }
    }
}

impl From<StatusIb> for InvokeError {
    fn from(status: StatusIb) -> Self {
        Self::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_cover_variants() {
        assert!(InvokeError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(InvokeError::DuplicateRef { command_ref: 4 }.is_invalid_argument());
        assert!(InvokeError::InvalidAction("x").is_protocol_error());
        assert!(!InvokeError::NoResponse.is_protocol_error());
    }

    #[test]
    fn status_mapping() {
        let unsupported = InvokeError::Status(Status::UnsupportedCommand.into());
        assert_eq!(unsupported.to_status(), Status::UnsupportedCommand);
        assert_eq!(unsupported.status(), Some(StatusIb::from(Status::UnsupportedCommand)));
        assert_eq!(
            InvokeError::Codec(CodecError::UnexpectedEnd).to_status(),
            Status::InvalidAction
        );
        assert_eq!(InvokeError::NoResponse.to_status(), Status::Failure);
    }

    #[test]
    fn display_includes_context() {
        let err = InvokeError::CapacityExceeded { capacity: 3 };
        assert!(err.to_string().contains('3'));
        let err = CodecError::BufferTooSmall { needed: 10, available: 4 };
        assert!(err.to_string().contains("10"));
        assert!(err.is_buffer_too_small());
    }
}
