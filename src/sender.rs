//! Request-side driver.
//!
//! A [`CommandSender`] builds one batch of commands, sends it (chunked when it
//! exceeds the message size), and correlates every reply with the command it
//! answers. It is a synchronous state machine: the owner of the exchange feeds
//! it inbound messages, timeouts and closure, and it reports through one of two
//! callback shapes chosen at construction.
//!
//! ```text
//! Idle -> AddingCommand <-> AddedCommand -> [AwaitingTimedStatus] -> [AwaitingChunkAck]*
//!      -> AwaitingResponse -> Done
//! ```

mod callback;

pub use callback::{Callback, CommandResponse, ExtendableCallback, NoResponseData, ResponseData};

use crate::config::{InvokeConfig, SenderConfig};
use crate::error::{CodecError, ExchangeError, InvokeError};
use crate::exchange::ExchangeRef;
use crate::filler::{FinalizedMessage, MessageKind, ReplyBufferFiller, ReplyPayload};
use crate::messages::{
    InvokeResponseIb, InvokeResponseMessage, MessageType, StatusResponseMessage,
    TimedRequestMessage,
};
use crate::path::{CommandRef, ConcreteCommandPath};
use crate::registry::CommandPathRegistry;
use crate::status::{Status, StatusIb};
use crate::tlv::{CommandFields, TlvWriter};
use crate::tracker::PendingResponseTracker;
use bytes::Bytes;
use callback::SenderCallback;
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// Sender lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Nothing added yet.
    Idle,
    /// A command is open for field encoding.
    AddingCommand,
    /// At least one command is complete; more may be added.
    AddedCommand,
    /// Timed request sent; waiting for the peer to accept it.
    AwaitingTimedStatus,
    /// A non-final request chunk was sent; waiting for the peer's ack.
    AwaitingChunkAck,
    /// The whole request was sent; replies are being received.
    AwaitingResponse,
    /// Terminal.
    Done,
}

#[derive(Debug)]
struct PendingCommand {
    path: ConcreteCommandPath,
    command_ref: Option<CommandRef>,
    writer: TlvWriter,
}

#[derive(Debug)]
struct QueuedCommand {
    path: ConcreteCommandPath,
    command_ref: Option<CommandRef>,
    fields: CommandFields,
}

/// Request-side invoke driver.
#[derive(Debug)]
pub struct CommandSender {
    state: SenderState,
    callback: SenderCallback,
    config: InvokeConfig,
    timed: bool,
    suppress_response: bool,
    registry: CommandPathRegistry,
    tracker: PendingResponseTracker,
    pending: Option<PendingCommand>,
    commands: Vec<QueuedCommand>,
    chunks: VecDeque<FinalizedMessage>,
    exchange: Option<ExchangeRef>,
    next_auto_ref: CommandRef,
    replied: bool,
}

impl CommandSender {
    /// Sender for a single command, reporting through a [`Callback`].
    pub fn new<C>(callback: C) -> Self
    where
        C: Callback + 'static,
    {
        Self::with_callback(SenderCallback::Simple(Box::new(callback)))
    }

    /// Batch-capable sender reporting through an [`ExtendableCallback`].
    ///
    /// Commands added without a ref get one assigned. The batch size is bounded
    /// by [`set_config`](Self::set_config).
    pub fn new_extendable<C>(callback: C) -> Self
    where
        C: ExtendableCallback + 'static,
    {
        Self::with_callback(SenderCallback::Extendable(Box::new(callback)))
    }

    fn with_callback(callback: SenderCallback) -> Self {
        let capacity = usize::from(SenderConfig::default().remote_max_paths_per_invoke);
        Self {
            state: SenderState::Idle,
            callback,
            config: InvokeConfig::default(),
            timed: false,
            suppress_response: false,
            registry: CommandPathRegistry::new(capacity),
            tracker: PendingResponseTracker::new(),
            pending: None,
            commands: Vec::new(),
            chunks: VecDeque::new(),
            exchange: None,
            next_auto_ref: 0,
            replied: false,
        }
    }

    /// Use `config` for message size, timed window and response timeout.
    pub fn with_config(mut self, config: InvokeConfig) -> Self {
        self.config = config;
        self
    }

    /// Send the batch inside a timed transaction.
    pub fn with_timed_request(mut self, timed: bool) -> Self {
        self.timed = timed;
        self
    }

    /// Ask the peer not to answer.
    pub fn with_suppress_response(mut self, suppress: bool) -> Self {
        self.suppress_response = suppress;
        self
    }

    /// Declare how many commands the peer accepts per invoke. Only valid before
    /// the first command is added.
    pub fn set_config(&mut self, config: SenderConfig) -> Result<(), InvokeError> {
        if self.state != SenderState::Idle {
            return Err(InvokeError::IncorrectState("set_config after commands were added"));
        }
        if config.remote_max_paths_per_invoke == 0 {
            return Err(InvokeError::InvalidArgument("remote_max_paths_per_invoke must be > 0"));
        }
        if !self.callback.is_extendable() && config.remote_max_paths_per_invoke > 1 {
            return Err(InvokeError::InvalidArgument(
                "batching requires an extendable callback",
            ));
        }
        self.registry = CommandPathRegistry::new(usize::from(config.remote_max_paths_per_invoke));
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Whether the transaction is over.
    pub fn is_done(&self) -> bool {
        self.state == SenderState::Done
    }

    /// Completed commands in the batch.
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Commands still waiting for a reply (extendable mode).
    pub fn pending_response_count(&self) -> usize {
        self.tracker.count()
    }

    /// Open a command for field encoding.
    pub fn prepare_command(
        &mut self,
        path: ConcreteCommandPath,
        command_ref: Option<CommandRef>,
    ) -> Result<(), InvokeError> {
        match self.state {
            SenderState::Idle | SenderState::AddedCommand => {}
            SenderState::AddingCommand => {
                return Err(InvokeError::IncorrectState("previous command not finished"))
            }
            _ => return Err(InvokeError::IncorrectState("request already sent")),
        }
        let command_ref = match command_ref {
            Some(r) => Some(r),
            None if self.callback.is_extendable() => Some(self.next_free_ref()),
            None => None,
        };
        self.registry.check(&path, command_ref)?;
        self.pending = Some(PendingCommand { path, command_ref, writer: TlvWriter::unbounded() });
        self.state = SenderState::AddingCommand;
        Ok(())
    }

    fn next_free_ref(&mut self) -> CommandRef {
        let mut candidate = self.next_auto_ref;
        while self.registry.iter().any(|(_, e)| e.command_ref == Some(candidate)) {
            candidate = candidate.wrapping_add(1);
        }
        self.next_auto_ref = candidate.wrapping_add(1);
        candidate
    }

    /// Encode members of the open command's fields structure. A failing
    /// closure leaves previously written members in place.
    pub fn write_fields<F>(&mut self, encode: F) -> Result<(), InvokeError>
    where
        F: FnOnce(&mut TlvWriter) -> Result<(), CodecError>,
    {
        let pending = match (self.state, self.pending.as_mut()) {
            (SenderState::AddingCommand, Some(p)) => p,
            _ => return Err(InvokeError::IncorrectState("no command open")),
        };
        let checkpoint = pending.writer.checkpoint();
        if let Err(err) = encode(&mut pending.writer) {
            pending.writer.rollback(checkpoint);
            return Err(err.into());
        }
        Ok(())
    }

    /// Close the open command and add it to the batch. Returns the command's ref.
    ///
    /// On error the open command is discarded and the batch is unchanged.
    pub fn finish_command(&mut self) -> Result<Option<CommandRef>, InvokeError> {
        if self.state != SenderState::AddingCommand {
            return Err(InvokeError::IncorrectState("no command open"));
        }
        let pending = self.pending.take().ok_or(InvokeError::IncorrectState("no command open"))?;
        self.state =
            if self.commands.is_empty() { SenderState::Idle } else { SenderState::AddedCommand };

        let fields = CommandFields::from_validated(pending.writer.finish()?);
        self.check_fits(&pending.path, pending.command_ref, &fields)?;
        self.registry.add(pending.path, pending.command_ref)?;
        if let (true, Some(r)) = (self.callback.is_extendable(), pending.command_ref) {
            self.tracker.add(r)?;
        }
        debug!(
            target: "invoke_interaction::sender",
            path = %pending.path,
            command_ref = ?pending.command_ref,
            "command added"
        );
        self.commands.push(QueuedCommand {
            path: pending.path,
            command_ref: pending.command_ref,
            fields,
        });
        self.state = SenderState::AddedCommand;
        Ok(pending.command_ref)
    }

    /// Add a command with pre-encoded fields.
    pub fn add_command(
        &mut self,
        path: ConcreteCommandPath,
        command_ref: Option<CommandRef>,
        fields: &CommandFields,
    ) -> Result<Option<CommandRef>, InvokeError> {
        self.prepare_command(path, command_ref)?;
        if let Err(err) = self.write_fields(|w| w.put_raw(fields.as_bytes())) {
            self.pending = None;
            self.state = if self.commands.is_empty() {
                SenderState::Idle
            } else {
                SenderState::AddedCommand
            };
            return Err(err);
        }
        self.finish_command()
    }

    fn check_fits(
        &self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
        fields: &CommandFields,
    ) -> Result<(), InvokeError> {
        let capacity = self.config.max_message_size();
        let mut trial = ReplyBufferFiller::new(self.message_kind());
        trial.begin_message(capacity)?;
        match trial.try_add(path, command_ref, &ReplyPayload::Command(fields.clone())) {
            Ok(_) => Ok(()),
            Err(_) => Err(InvokeError::BufferTooSmall { capacity }),
        }
    }

    fn message_kind(&self) -> MessageKind {
        MessageKind::Request {
            suppress_response: self.suppress_response,
            timed_request: self.timed,
        }
    }

    /// Send the batch over `exchange`.
    ///
    /// Errors here are returned, not reported through the callback; the
    /// sender is `Done` afterwards unless the error was `IncorrectState`.
    pub fn send_request(&mut self, exchange: ExchangeRef) -> Result<(), InvokeError> {
        match self.state {
            SenderState::AddedCommand => {}
            SenderState::Idle => return Err(InvokeError::IncorrectState("no commands to send")),
            SenderState::AddingCommand => {
                return Err(InvokeError::IncorrectState("command not finished"))
            }
            _ => return Err(InvokeError::IncorrectState("request already sent")),
        }
        self.exchange = Some(exchange);
        let result = self.start_transaction();
        if let Err(err) = &result {
            error!(
                target: "invoke_interaction::sender",
                error = %err,
                "failed to send invoke request"
            );
            self.state = SenderState::Done;
            self.close_exchange();
        }
        result
    }

    fn start_transaction(&mut self) -> Result<(), InvokeError> {
        self.chunks = self.build_chunks()?;
        debug!(
            target: "invoke_interaction::sender",
            commands = self.commands.len(),
            chunks = self.chunks.len(),
            timed = self.timed,
            "sending invoke request"
        );
        if self.timed {
            let timed =
                TimedRequestMessage { timeout_ms: self.config.timed_request_timeout_ms() };
            self.send(MessageType::TimedRequest, timed.encode()?)?;
            self.state = SenderState::AwaitingTimedStatus;
            return Ok(());
        }
        self.send_next_chunk()
    }

    fn build_chunks(&self) -> Result<VecDeque<FinalizedMessage>, InvokeError> {
        let mut filler = ReplyBufferFiller::new(self.message_kind());
        filler.begin_message(self.config.max_message_size())?;
        let mut chunks = VecDeque::new();
        for cmd in &self.commands {
            let payload = ReplyPayload::Command(cmd.fields.clone());
            if let Some(closed) = filler.add_or_continue(&cmd.path, cmd.command_ref, &payload)? {
                chunks.push_back(closed);
            }
        }
        chunks.push_back(filler.finalize_message(false)?);
        Ok(chunks)
    }

    fn send_next_chunk(&mut self) -> Result<(), InvokeError> {
        let chunk = self
            .chunks
            .pop_front()
            .ok_or(InvokeError::IncorrectState("no request chunk left"))?;
        let more = chunk.more_chunks;
        self.send(MessageType::InvokeRequest, chunk.payload)?;
        debug!(
            target: "invoke_interaction::sender",
            commands = chunk.count,
            more_chunks = more,
            "request chunk sent"
        );
        if more {
            self.state = SenderState::AwaitingChunkAck;
        } else if self.suppress_response {
            self.finish();
        } else {
            self.state = SenderState::AwaitingResponse;
        }
        Ok(())
    }

    fn send(&self, message_type: MessageType, payload: Bytes) -> Result<(), InvokeError> {
        let exchange = self.exchange.as_ref().ok_or(ExchangeError::Closed)?;
        exchange.send_message(message_type, payload)?;
        Ok(())
    }

    /// Feed one inbound message.
    ///
    /// Protocol violations and peer failures end the transaction through the
    /// callback and are also returned. Calling this when no message is
    /// expected returns `IncorrectState` without touching the callback.
    pub fn on_message_received(
        &mut self,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<(), InvokeError> {
        let result = match self.state {
            SenderState::AwaitingTimedStatus | SenderState::AwaitingChunkAck => {
                self.handle_ack(message_type, &payload)
            }
            SenderState::AwaitingResponse => self.handle_response(message_type, &payload),
            _ => return Err(InvokeError::IncorrectState("no message expected")),
        };
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    fn handle_ack(
        &mut self,
        message_type: MessageType,
        payload: &Bytes,
    ) -> Result<(), InvokeError> {
        if message_type != MessageType::StatusResponse {
            return Err(InvokeError::InvalidAction("expected a status response"));
        }
        let status = StatusResponseMessage::decode(payload)?.status;
        if !status.is_success() {
            return Err(InvokeError::Status(status.into()));
        }
        self.send_next_chunk()
    }

    fn handle_response(
        &mut self,
        message_type: MessageType,
        payload: &Bytes,
    ) -> Result<(), InvokeError> {
        match message_type {
            MessageType::StatusResponse => {
                let status = StatusResponseMessage::decode(payload)?.status;
                if status.is_success() {
                    Err(InvokeError::InvalidAction("success status in place of a response"))
                } else {
                    Err(InvokeError::Status(status.into()))
                }
            }
            MessageType::InvokeResponse => {
                let msg = InvokeResponseMessage::decode(payload)?;
                for reply in &msg.invoke_responses {
                    self.dispatch_reply(reply)?;
                }
                if msg.more_chunked_messages {
                    let ack = StatusResponseMessage::new(Status::Success).encode()?;
                    self.send(MessageType::StatusResponse, ack)?;
                } else {
                    self.complete();
                }
                Ok(())
            }
            other => {
                warn!(
                    target: "invoke_interaction::sender",
                    message_type = %other,
                    "unexpected message"
                );
                Err(InvokeError::InvalidAction("unexpected message type"))
            }
        }
    }

    fn dispatch_reply(&mut self, reply: &InvokeResponseIb) -> Result<(), InvokeError> {
        let (index, status, data) = match reply {
            InvokeResponseIb::Status(s) => {
                (self.registry.find(&s.path, s.command_ref), s.status, None)
            }
            InvokeResponseIb::Command(d) => (
                self.registry.find_by_cluster(&d.path, d.command_ref),
                StatusIb::success(),
                Some(CommandResponse { response_id: d.response_id(), fields: d.fields.clone() }),
            ),
        };
        let entry = index.and_then(|i| self.registry.get(i)).ok_or(InvokeError::KeyNotFound {
            path: *reply.path(),
            command_ref: reply.command_ref(),
        })?;
        match &mut self.callback {
            SenderCallback::Extendable(cb) => {
                let command_ref =
                    entry.command_ref.ok_or(InvokeError::InvalidAction("reply without ref"))?;
                if !self.tracker.received(command_ref) {
                    return Err(InvokeError::InvalidAction("second reply for command"));
                }
                cb.on_response(&ResponseData {
                    path: &entry.path,
                    command_ref: Some(command_ref),
                    status,
                    data: data.as_ref(),
                });
            }
            SenderCallback::Simple(cb) => {
                if self.replied {
                    return Err(InvokeError::InvalidAction("second reply for command"));
                }
                self.replied = true;
                if status.is_success() {
                    cb.on_response(&entry.path, &status, data.as_ref());
                } else {
                    cb.on_error(&InvokeError::Status(status));
                }
            }
        }
        Ok(())
    }

    /// The peer did not answer within the response timeout.
    pub fn on_response_timeout(&mut self) {
        if self.is_awaiting() {
            self.fail(InvokeError::Timeout(self.config.response_timeout()));
        }
    }

    /// The exchange was closed underneath the sender.
    pub fn on_exchange_closed(&mut self) {
        if self.is_awaiting() {
            debug!(target: "invoke_interaction::sender", "exchange closed before final response");
            self.exchange = None;
            self.complete();
        }
    }

    fn is_awaiting(&self) -> bool {
        matches!(
            self.state,
            SenderState::AwaitingTimedStatus
                | SenderState::AwaitingChunkAck
                | SenderState::AwaitingResponse
        )
    }

    fn complete(&mut self) {
        match &mut self.callback {
            SenderCallback::Extendable(cb) => {
                for command_ref in self.tracker.drain_as_no_response() {
                    warn!(
                        target: "invoke_interaction::sender",
                        command_ref,
                        "no response for command"
                    );
                    cb.on_no_response(&NoResponseData { command_ref });
                }
            }
            SenderCallback::Simple(cb) => {
                if !self.replied {
                    cb.on_error(&InvokeError::NoResponse);
                }
            }
        }
        self.finish();
    }

    fn fail(&mut self, err: InvokeError) {
        if self.state == SenderState::Done {
            return;
        }
        warn!(target: "invoke_interaction::sender", error = %err, "invoke transaction failed");
        if err.is_protocol_error() {
            if let (Some(exchange), Ok(payload)) =
                (&self.exchange, StatusResponseMessage::new(Status::InvalidAction).encode())
            {
                let _ = exchange.send_message(MessageType::StatusResponse, payload);
            }
        }
        self.callback.on_error(&err);
        if let SenderCallback::Extendable(cb) = &mut self.callback {
            for command_ref in self.tracker.drain_as_no_response() {
                cb.on_no_response(&NoResponseData { command_ref });
            }
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.state = SenderState::Done;
        self.callback.on_done();
        self.close_exchange();
    }

    fn close_exchange(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            exchange.close();
        }
    }
}

impl Drop for CommandSender {
    fn drop(&mut self) {
        if self.exchange.is_some() {
            debug!(
                target: "invoke_interaction::sender",
                state = ?self.state,
                "sender dropped mid-transaction"
            );
            self.close_exchange();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::messages::{CommandStatusIb, InvokeRequestMessage};
    use crate::tlv::Tag;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    const PATH: ConcreteCommandPath = ConcreteCommandPath::new(1, 0x6, 0x2);

    #[derive(Debug, Default)]
    struct Sink {
        sent: Mutex<Vec<(MessageType, Bytes)>>,
        closed: AtomicBool,
    }

    impl Exchange for Sink {
        fn send_message(&self, t: MessageType, payload: Bytes) -> Result<(), ExchangeError> {
            self.sent.lock().unwrap().push((t, payload));
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct Counts {
        responses: Vec<Option<CommandRef>>,
        no_responses: Vec<CommandRef>,
        errors: Vec<InvokeError>,
        done: usize,
    }

    struct Recorder(Arc<Mutex<Counts>>);

    impl ExtendableCallback for Recorder {
        fn on_response(&mut self, r: &ResponseData<'_>) {
            self.0.lock().unwrap().responses.push(r.command_ref);
        }
        fn on_no_response(&mut self, n: &NoResponseData) {
            self.0.lock().unwrap().no_responses.push(n.command_ref);
        }
        fn on_error(&mut self, e: &InvokeError) {
            self.0.lock().unwrap().errors.push(e.clone());
        }
        fn on_done(&mut self) {
            self.0.lock().unwrap().done += 1;
        }
    }

    fn extendable(max_paths: u16) -> (CommandSender, Arc<Mutex<Counts>>) {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let mut sender = CommandSender::new_extendable(Recorder(Arc::clone(&counts)));
        sender.set_config(SenderConfig { remote_max_paths_per_invoke: max_paths }).unwrap();
        (sender, counts)
    }

    #[test]
    fn calls_out_of_order_are_incorrect_state() {
        let (mut sender, _) = extendable(2);
        assert!(matches!(sender.finish_command(), Err(InvokeError::IncorrectState(_))));
        assert!(matches!(
            sender.send_request(Arc::new(Sink::default())),
            Err(InvokeError::IncorrectState(_))
        ));
        sender.prepare_command(PATH, None).unwrap();
        assert!(matches!(sender.prepare_command(PATH, None), Err(InvokeError::IncorrectState(_))));
    }

    #[test]
    fn refs_are_assigned_and_unique() {
        let (mut sender, _) = extendable(3);
        let a = sender.add_command(PATH, Some(0), &CommandFields::empty()).unwrap();
        let b = sender.add_command(PATH, None, &CommandFields::empty()).unwrap();
        assert_eq!(a, Some(0));
        assert_eq!(b, Some(1));
        let err = sender.add_command(PATH, Some(1), &CommandFields::empty()).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(sender.command_count(), 2);
        assert_eq!(sender.state(), SenderState::AddedCommand);
    }

    #[test]
    fn batch_larger_than_peer_limit_is_rejected() {
        let (mut sender, _) = extendable(1);
        sender.add_command(PATH, None, &CommandFields::empty()).unwrap();
        let err = sender.add_command(PATH.with_command(3), None, &CommandFields::empty());
        assert_eq!(err, Err(InvokeError::CapacityExceeded { capacity: 1 }));
    }

    #[test]
    fn simple_sender_cannot_batch() {
        struct Nop;
        impl Callback for Nop {
            fn on_response(
                &mut self,
                _: &ConcreteCommandPath,
                _: &StatusIb,
                _: Option<&CommandResponse>,
            ) {
            }
            fn on_error(&mut self, _: &InvokeError) {}
        }
        let mut sender = CommandSender::new(Nop);
        assert!(sender.set_config(SenderConfig { remote_max_paths_per_invoke: 2 }).is_err());
    }

    #[test]
    fn failed_field_encoding_keeps_earlier_members() {
        let (mut sender, _) = extendable(1);
        sender.prepare_command(PATH, None).unwrap();
        sender.write_fields(|w| w.put_u8(Tag::Context(0), 1)).unwrap();
        let err = sender.write_fields(|w| {
            w.put_u8(Tag::Context(1), 2)?;
            Err(CodecError::ValueOutOfRange("x"))
        });
        assert!(err.is_err());
        sender.finish_command().unwrap();
        let sink = Arc::new(Sink::default());
        sender.send_request(sink.clone()).unwrap();
        let sent = sink.sent.lock().unwrap();
        let req = InvokeRequestMessage::decode(&sent[0].1).unwrap();
        assert_eq!(req.invoke_requests[0].fields.len(), 3);
    }

    #[test]
    fn large_batch_is_chunked_and_waits_for_acks() {
        let config = InvokeConfig::builder().max_message_size(128).build().unwrap();
        let counts = Arc::new(Mutex::new(Counts::default()));
        let mut sender =
            CommandSender::new_extendable(Recorder(Arc::clone(&counts))).with_config(config);
        sender.set_config(SenderConfig { remote_max_paths_per_invoke: 8 }).unwrap();
        let fields = CommandFields::encode(|w| w.put_bytes(Tag::Context(0), &[7u8; 40])).unwrap();
        for r in 0..4 {
            sender.add_command(PATH, Some(r), &fields).unwrap();
        }
        let sink = Arc::new(Sink::default());
        sender.send_request(sink.clone()).unwrap();
        assert_eq!(sender.state(), SenderState::AwaitingChunkAck);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        let ack = StatusResponseMessage::new(Status::Success).encode().unwrap();
        while sender.state() == SenderState::AwaitingChunkAck {
            sender.on_message_received(MessageType::StatusResponse, ack.clone()).unwrap();
        }
        assert_eq!(sender.state(), SenderState::AwaitingResponse);

        let sent = sink.sent.lock().unwrap();
        let refs: Vec<_> = sent
            .iter()
            .flat_map(|(_, p)| InvokeRequestMessage::decode(p).unwrap().invoke_requests)
            .map(|c| c.command_ref)
            .collect();
        assert_eq!(refs, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert!(sent.iter().all(|(_, p)| p.len() <= 128));
    }

    #[test]
    fn status_reply_with_unknown_ref_is_protocol_error() {
        let (mut sender, counts) = extendable(1);
        sender.add_command(PATH, Some(5), &CommandFields::empty()).unwrap();
        let sink = Arc::new(Sink::default());
        sender.send_request(sink.clone()).unwrap();

        let reply = InvokeResponseMessage {
            invoke_responses: vec![InvokeResponseIb::Status(CommandStatusIb {
                path: PATH,
                status: StatusIb::success(),
                command_ref: Some(6),
            })],
            ..Default::default()
        };
        let err = sender
            .on_message_received(MessageType::InvokeResponse, reply.encode().unwrap())
            .unwrap_err();
        assert!(matches!(err, InvokeError::KeyNotFound { .. }));

        let c = counts.lock().unwrap();
        assert_eq!(c.errors.len(), 1);
        assert_eq!(c.no_responses, vec![5]);
        assert_eq!(c.done, 1);
        let sent = sink.sent.lock().unwrap();
        let (t, last) = sent.last().unwrap();
        assert_eq!(*t, MessageType::StatusResponse);
        assert_eq!(StatusResponseMessage::decode(last).unwrap().status, Status::InvalidAction);
        assert!(sink.is_closed());
    }

    #[test]
    fn timeout_reports_error_then_no_response() {
        let (mut sender, counts) = extendable(1);
        sender.add_command(PATH, None, &CommandFields::empty()).unwrap();
        sender.send_request(Arc::new(Sink::default())).unwrap();
        sender.on_response_timeout();
        sender.on_response_timeout();
        let c = counts.lock().unwrap();
        assert!(c.errors[0].is_timeout());
        assert_eq!(c.no_responses, vec![0]);
        assert_eq!(c.done, 1);
    }

    #[test]
    fn drop_closes_exchange_without_callbacks() {
        let (mut sender, counts) = extendable(1);
        sender.add_command(PATH, None, &CommandFields::empty()).unwrap();
        let sink = Arc::new(Sink::default());
        sender.send_request(sink.clone()).unwrap();
        drop(sender);
        assert!(sink.is_closed());
        assert_eq!(counts.lock().unwrap().done, 0);
    }
}
