use super::{CommandHandler, Reply};
use crate::error::{CodecError, InvokeError};
use crate::path::{CommandId, ConcreteCommandPath};
use crate::status::StatusIb;
use crate::tlv::{CommandFields, TlvWriter};
use std::fmt;

/// Shared back-reference to a handler for one deferred command.
///
/// The handler does not send its final response while any handle is alive.
/// Dropping the last handle of a command that was never answered answers it
/// with `Failure`; dropping the last handle of the transaction releases the
/// response, or, if the exchange has gone away, just tears down.
pub struct AsyncCommandHandle {
    handler: CommandHandler,
    slot: usize,
    path: ConcreteCommandPath,
}

impl AsyncCommandHandle {
    pub(crate) fn new(handler: CommandHandler, slot: usize, path: ConcreteCommandPath) -> Self {
        handler.retain(slot);
        Self { handler, slot, path }
    }

    /// Path of the deferred command.
    pub fn path(&self) -> &ConcreteCommandPath {
        &self.path
    }

    /// Owning handler.
    pub fn handler(&self) -> &CommandHandler {
        &self.handler
    }

    /// Answer with a status.
    pub fn add_status(&self, status: impl Into<StatusIb>) -> Result<(), InvokeError> {
        self.handler.add_reply(self.slot, Reply::Status(status.into()))
    }

    /// Answer with pre-encoded response fields.
    pub fn add_response(
        &self,
        response_id: CommandId,
        fields: &CommandFields,
    ) -> Result<(), InvokeError> {
        self.handler.add_reply(self.slot, Reply::Data { response_id, fields: fields.clone() })
    }

    /// Answer with response fields encoded in place; see
    /// [`InvokeContext::add_response_with`](super::InvokeContext::add_response_with).
    pub fn add_response_with<F>(
        &self,
        response_id: CommandId,
        mut encode: F,
    ) -> Result<(), InvokeError>
    where
        F: FnMut(&mut TlvWriter) -> Result<(), CodecError>,
    {
        self.handler.add_reply(self.slot, Reply::Encoded { response_id, encode: &mut encode })
    }
}

impl Clone for AsyncCommandHandle {
    fn clone(&self) -> Self {
        Self::new(self.handler.clone(), self.slot, self.path)
    }
}

impl Drop for AsyncCommandHandle {
    fn drop(&mut self) {
        self.handler.release(Some(self.slot));
    }
}

impl fmt::Debug for AsyncCommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCommandHandle")
            .field("slot", &self.slot)
            .field("path", &self.path)
            .finish()
    }
}
