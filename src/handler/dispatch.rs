use super::{AsyncCommandHandle, CommandHandler, Reply};
use crate::error::{CodecError, InvokeError};
use crate::path::{CommandId, CommandRef, ConcreteCommandPath};
use crate::status::{Status, StatusIb};
use crate::tlv::{CommandFields, TlvWriter};

/// One command handed to the dispatch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Target.
    pub path: ConcreteCommandPath,
    /// Ref from the request, if any.
    pub command_ref: Option<CommandRef>,
    /// Encoded request fields.
    pub fields: CommandFields,
    /// Whether the invoke arrived in a timed transaction.
    pub timed: bool,
}

/// Synchronous outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// Status reply.
    Status(StatusIb),
    /// Data reply.
    Response {
        /// Response command id.
        response_id: CommandId,
        /// Response fields.
        fields: CommandFields,
    },
}

impl From<Status> for ActionResult {
    fn from(status: Status) -> Self {
        ActionResult::Status(status.into())
    }
}

/// Business logic the handler dispatches commands to.
///
/// `invoke` either returns a result, answers through the [`InvokeContext`], or
/// takes an [`AsyncCommandHandle`] with [`InvokeContext::defer`] and answers later.
/// Returning `None` without any of these answers the command with `Failure`.
pub trait CommandDispatcher: Send + Sync {
    /// `Success` if the path names a command this node implements, otherwise the
    /// most specific of `UnsupportedEndpoint`, `UnsupportedCluster`, `UnsupportedCommand`.
    fn command_exists(&self, path: &ConcreteCommandPath) -> Status;

    /// Whether the command may only run inside a timed transaction.
    fn requires_timed_invoke(&self, _path: &ConcreteCommandPath) -> bool {
        false
    }

    /// Execute one command.
    fn invoke(&self, request: &CommandRequest, ctx: &mut InvokeContext<'_>) -> Option<ActionResult>;
}

/// Per-command view of the handler during [`CommandDispatcher::invoke`].
#[derive(Debug)]
pub struct InvokeContext<'a> {
    handler: &'a CommandHandler,
    slot: usize,
    path: ConcreteCommandPath,
}

impl<'a> InvokeContext<'a> {
    pub(crate) fn new(handler: &'a CommandHandler, slot: usize, path: ConcreteCommandPath) -> Self {
        Self { handler, slot, path }
    }

    /// Path of the command being invoked.
    pub fn path(&self) -> &ConcreteCommandPath {
        &self.path
    }

    /// Owning handler.
    pub fn handler(&self) -> &CommandHandler {
        self.handler
    }

    /// Answer with a status.
    pub fn add_status(&mut self, status: impl Into<StatusIb>) -> Result<(), InvokeError> {
        self.handler.add_reply(self.slot, Reply::Status(status.into()))
    }

    /// Answer with pre-encoded response fields.
    pub fn add_response(
        &mut self,
        response_id: CommandId,
        fields: &CommandFields,
    ) -> Result<(), InvokeError> {
        self.handler.add_reply(self.slot, Reply::Data { response_id, fields: fields.clone() })
    }

    /// Answer with response fields encoded straight into the reply message.
    ///
    /// If `encode` fails, whatever it wrote is discarded and the command is
    /// answered with `Failure` instead. `encode` may run more than once when
    /// the reply spills into a continuation message.
    pub fn add_response_with<F>(
        &mut self,
        response_id: CommandId,
        mut encode: F,
    ) -> Result<(), InvokeError>
    where
        F: FnMut(&mut TlvWriter) -> Result<(), CodecError>,
    {
        self.handler.add_reply(self.slot, Reply::Encoded { response_id, encode: &mut encode })
    }

    /// Keep the command open past the return of `invoke`.
    pub fn defer(&mut self) -> AsyncCommandHandle {
        AsyncCommandHandle::new(self.handler.clone(), self.slot, self.path)
    }
}
