#![forbid(unsafe_code)]

//! # invoke-interaction
//!
//! Command invocation between two nodes: a requester batches commands into
//! invoke requests, a responder dispatches them and streams replies back in
//! chunks bounded by the transport's message size.
//!
//! ## Pieces
//!
//! - **[`CommandSender`]**: builds a batch, sends it (chunked when needed) and
//!   correlates every reply with its command by path and ref.
//! - **[`CommandHandler`]**: validates a batch as a whole, dispatches each
//!   command to a [`CommandDispatcher`], supports deferred replies through
//!   [`AsyncCommandHandle`]s.
//! - **[`ReplyBufferFiller`](filler::ReplyBufferFiller)**: capacity-bounded,
//!   all-or-nothing message builder shared by both directions.
//! - **[`tlv`]** and **[`messages`]**: the wire codec.
//! - **[`ChannelTransport`]** and **[`InvokeClient`]**: an in-process exchange
//!   and a `tower` service running batches over it.
//!
//! ## Quick Start
//!
//! ```rust
//! use invoke_interaction::prelude::*;
//! use std::sync::Arc;
//!
//! struct OnOff;
//!
//! impl CommandDispatcher for OnOff {
//!     fn command_exists(&self, path: &ConcreteCommandPath) -> Status {
//!         if path.cluster_id == 0x6 { Status::Success } else { Status::UnsupportedCluster }
//!     }
//!
//!     fn invoke(&self, _: &CommandRequest, _: &mut InvokeContext<'_>) -> Option<ActionResult> {
//!         Some(Status::Success.into())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = InvokeConfig::builder().max_paths_per_invoke(2).build().unwrap();
//!     let transport = ChannelTransport::new(Arc::new(OnOff), config.clone());
//!     let client = InvokeClient::new(transport, config);
//!
//!     let batch = InvokeBatch::new(vec![
//!         InvokeCommand::new(ConcreteCommandPath::new(1, 0x6, 0x1)),
//!         InvokeCommand::new(ConcreteCommandPath::new(1, 0x8, 0x0)),
//!     ]);
//!     let outcomes = client.invoke(batch).await.unwrap();
//!     assert_eq!(outcomes.len(), 2);
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod filler;
pub mod handler;
pub mod messages;
pub mod path;
pub mod prelude;
pub mod registry;
pub mod sender;
pub mod status;
pub mod tlv;
pub mod tracker;
pub mod transport;

// Re-exports
pub use client::{InvokeBatch, InvokeClient, InvokeCommand, InvokeOutcome};
pub use config::{ConfigError, InvokeConfig, InvokeConfigBuilder, SenderConfig};
pub use error::{CodecError, ExchangeError, InvokeError};
pub use exchange::{exchange_pair, ChannelExchange, Exchange, ExchangeEvent, ExchangeRef};
pub use handler::{
    ActionResult, AsyncCommandHandle, CommandDispatcher, CommandHandler, CommandRequest,
    HandlerPhase, InvokeContext,
};
pub use messages::MessageType;
pub use path::{ClusterId, CommandId, CommandRef, ConcreteCommandPath, EndpointId};
pub use registry::CommandPathRegistry;
pub use sender::{
    Callback, CommandResponse, CommandSender, ExtendableCallback, NoResponseData, ResponseData,
    SenderState,
};
pub use status::{Status, StatusIb};
pub use tlv::CommandFields;
pub use tracker::PendingResponseTracker;
pub use transport::{serve_exchange, ChannelTransport};
