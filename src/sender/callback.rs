use crate::error::InvokeError;
use crate::path::{CommandId, CommandRef, ConcreteCommandPath};
use crate::status::StatusIb;
use crate::tlv::CommandFields;

/// Data carried by a data reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Response command id.
    pub response_id: CommandId,
    /// Encoded response fields.
    pub fields: CommandFields,
}

/// Callbacks for a sender carrying exactly one command.
///
/// A non-success status from the peer arrives as `on_error(InvokeError::Status(..))`.
pub trait Callback: Send {
    /// Successful reply: a bare success status (`data == None`) or a data reply.
    fn on_response(
        &mut self,
        path: &ConcreteCommandPath,
        status: &StatusIb,
        data: Option<&CommandResponse>,
    );

    /// The transaction failed.
    fn on_error(&mut self, error: &InvokeError);

    /// The transaction is over. Fires once.
    fn on_done(&mut self) {}
}

/// One reply delivered to an [`ExtendableCallback`].
#[derive(Debug, Clone, Copy)]
pub struct ResponseData<'a> {
    /// Path of the request command the reply answers.
    pub path: &'a ConcreteCommandPath,
    /// Ref of the request command.
    pub command_ref: Option<CommandRef>,
    /// Status (success for data replies).
    pub status: StatusIb,
    /// Data, for data replies.
    pub data: Option<&'a CommandResponse>,
}

/// A command that ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoResponseData {
    /// Ref of the unanswered command.
    pub command_ref: CommandRef,
}

/// Callbacks for a batch-capable sender.
///
/// Every command ends in exactly one `on_response` or `on_no_response`, and
/// `on_done` fires exactly once after all of them.
pub trait ExtendableCallback: Send {
    /// One reply, status or data.
    fn on_response(&mut self, response: &ResponseData<'_>);

    /// A command got no reply before the transaction ended.
    fn on_no_response(&mut self, no_response: &NoResponseData);

    /// A transaction-level failure (protocol error, timeout, transport).
    fn on_error(&mut self, error: &InvokeError);

    /// The transaction is over.
    fn on_done(&mut self);
}

pub(crate) enum SenderCallback {
    Simple(Box<dyn Callback>),
    Extendable(Box<dyn ExtendableCallback>),
}

impl SenderCallback {
    pub(crate) fn is_extendable(&self) -> bool {
        matches!(self, SenderCallback::Extendable(_))
    }

    pub(crate) fn on_error(&mut self, error: &InvokeError) {
        match self {
            SenderCallback::Simple(cb) => cb.on_error(error),
            SenderCallback::Extendable(cb) => cb.on_error(error),
        }
    }

    pub(crate) fn on_done(&mut self) {
        match self {
            SenderCallback::Simple(cb) => cb.on_done(),
            SenderCallback::Extendable(cb) => cb.on_done(),
        }
    }
}

impl std::fmt::Debug for SenderCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderCallback::Simple(_) => f.write_str("Simple"),
            SenderCallback::Extendable(_) => f.write_str("Extendable"),
        }
    }
}
