//! Async invoke client as a `tower` service.
//!
//! Each call runs one batch through an extendable [`CommandSender`] over a fresh
//! exchange of a [`ChannelTransport`], feeding it inbound messages, closure and
//! response timeouts until it is done.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tower_service::Service;
use tracing::debug;

use crate::config::{InvokeConfig, SenderConfig};
use crate::error::InvokeError;
use crate::exchange::{ExchangeEvent, ExchangeRef};
use crate::path::{CommandRef, ConcreteCommandPath};
use crate::sender::{
    CommandResponse, CommandSender, ExtendableCallback, NoResponseData, ResponseData,
};
use crate::status::StatusIb;
use crate::tlv::CommandFields;
use crate::transport::ChannelTransport;

/// One command of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeCommand {
    /// Target.
    pub path: ConcreteCommandPath,
    /// Explicit ref; one is assigned when `None`.
    pub command_ref: Option<CommandRef>,
    /// Encoded request fields.
    pub fields: CommandFields,
}

impl InvokeCommand {
    /// Command without fields and with an assigned ref.
    pub fn new(path: ConcreteCommandPath) -> Self {
        Self { path, command_ref: None, fields: CommandFields::empty() }
    }

    /// Use `command_ref`.
    pub fn with_ref(mut self, command_ref: CommandRef) -> Self {
        self.command_ref = Some(command_ref);
        self
    }

    /// Use `fields`.
    pub fn with_fields(mut self, fields: CommandFields) -> Self {
        self.fields = fields;
        self
    }
}

/// A batch sent as one invoke transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeBatch {
    /// Commands in request order.
    pub commands: Vec<InvokeCommand>,
    /// Send inside a timed transaction.
    pub timed: bool,
    /// Ask the responder not to answer.
    pub suppress_response: bool,
}

impl InvokeBatch {
    /// Batch of `commands`, untimed, expecting responses.
    pub fn new(commands: Vec<InvokeCommand>) -> Self {
        Self { commands, ..Default::default() }
    }
}

/// What happened to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// The responder answered.
    Response {
        /// Path of the request command.
        path: ConcreteCommandPath,
        /// Ref of the request command.
        command_ref: Option<CommandRef>,
        /// Reply status.
        status: StatusIb,
        /// Data, for data replies.
        data: Option<CommandResponse>,
    },
    /// The transaction ended without an answer.
    NoResponse {
        /// Ref of the unanswered command.
        command_ref: CommandRef,
    },
}

impl InvokeOutcome {
    /// Ref of the command this outcome belongs to.
    pub fn command_ref(&self) -> Option<CommandRef> {
        match self {
            InvokeOutcome::Response { command_ref, .. } => *command_ref,
            InvokeOutcome::NoResponse { command_ref } => Some(*command_ref),
        }
    }
}

#[derive(Debug, Default)]
struct Collected {
    outcomes: Vec<InvokeOutcome>,
    error: Option<InvokeError>,
    done: bool,
}

#[derive(Debug, Clone, Default)]
struct Collector(Arc<Mutex<Collected>>);

impl Collector {
    fn with<R>(&self, f: impl FnOnce(&mut Collected) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ExtendableCallback for Collector {
    fn on_response(&mut self, r: &ResponseData<'_>) {
        let outcome = InvokeOutcome::Response {
            path: *r.path,
            command_ref: r.command_ref,
            status: r.status,
            data: r.data.cloned(),
        };
        self.with(|c| c.outcomes.push(outcome));
    }

    fn on_no_response(&mut self, n: &NoResponseData) {
        self.with(|c| c.outcomes.push(InvokeOutcome::NoResponse { command_ref: n.command_ref }));
    }

    fn on_error(&mut self, error: &InvokeError) {
        self.with(|c| {
            c.error.get_or_insert_with(|| error.clone());
        });
    }

    fn on_done(&mut self) {
        self.with(|c| c.done = true);
    }
}

/// `tower` service running invoke batches against a [`ChannelTransport`].
#[derive(Debug, Clone)]
pub struct InvokeClient {
    transport: ChannelTransport,
    config: InvokeConfig,
    sender_config: SenderConfig,
}

impl InvokeClient {
    /// Client over `transport`, using `config` for message size, timed window
    /// and response timeout.
    pub fn new(transport: ChannelTransport, config: InvokeConfig) -> Self {
        let remote_max_paths_per_invoke = transport.config().max_paths_per_invoke();
        Self { transport, config, sender_config: SenderConfig { remote_max_paths_per_invoke } }
    }

    /// Override the responder's per-invoke limit the client assumes.
    pub fn with_sender_config(mut self, sender_config: SenderConfig) -> Self {
        self.sender_config = sender_config;
        self
    }

    /// Run one batch to completion.
    pub async fn invoke(&self, batch: InvokeBatch) -> Result<Vec<InvokeOutcome>, InvokeError> {
        let collector = Collector::default();
        let mut sender = CommandSender::new_extendable(collector.clone())
            .with_config(self.config.clone())
            .with_timed_request(batch.timed)
            .with_suppress_response(batch.suppress_response);
        sender.set_config(self.sender_config)?;
        for command in &batch.commands {
            sender.add_command(command.path, command.command_ref, &command.fields)?;
        }

        let (exchange, mut events) = self.transport.open_exchange().await?;
        sender.send_request(exchange.clone() as ExchangeRef)?;
        debug!(
            target: "invoke_interaction::sender",
            exchange = exchange.id(),
            commands = batch.commands.len(),
            "batch in flight"
        );

        let timeout = self.config.response_timeout();
        while !sender.is_done() {
            match tokio::time::timeout(timeout, events.recv()).await {
                Err(_) => sender.on_response_timeout(),
                Ok(Some(ExchangeEvent::Message { message_type, payload })) => {
                    // Failures are reported through the collector.
                    let _ = sender.on_message_received(message_type, payload);
                }
                Ok(Some(ExchangeEvent::Closed)) | Ok(None) => sender.on_exchange_closed(),
            }
        }

        collector.with(|c| match c.error.take() {
            Some(err) => Err(err),
            None => Ok(std::mem::take(&mut c.outcomes)),
        })
    }
}

impl Service<InvokeBatch> for InvokeClient {
    type Response = Vec<InvokeOutcome>;
    type Error = InvokeError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, batch: InvokeBatch) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.invoke(batch).await })
    }
}
