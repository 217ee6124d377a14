//! Convenient re-exports for common invoke-interaction types.
pub use crate::{
    client::{InvokeBatch, InvokeClient, InvokeCommand, InvokeOutcome},
    config::{InvokeConfig, SenderConfig},
    handler::{
        ActionResult, AsyncCommandHandle, CommandDispatcher, CommandHandler, CommandRequest,
        InvokeContext,
    },
    sender::{Callback, CommandSender, ExtendableCallback, NoResponseData, ResponseData},
    tlv::{CommandFields, Tag},
    transport::ChannelTransport,
    CodecError, ConcreteCommandPath, InvokeError, Status, StatusIb,
};
