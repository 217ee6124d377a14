//! Response-side driver.
//!
//! A [`CommandHandler`] accepts one invoke transaction: it accumulates request
//! chunks, validates the whole batch before running any of it, dispatches each
//! command to a [`CommandDispatcher`], and streams replies back in chunks that
//! never exceed the configured message size.
//!
//! Commands may complete after `invoke` returns through an
//! [`AsyncCommandHandle`]. The final response goes out once every command has
//! been answered and every handle has been dropped.
//!
//! ```text
//! Idle -> [Accumulating]* -> Dispatching -> [AwaitingAsync] -> Finalizing -> Sent
//!                         \-> Aborted                 (exchange gone) -> Closed
//! ```
//!
//! The handler is cheap to clone; clones share the transaction. Its lock is
//! never held while calling the dispatcher or the exchange.

mod async_handle;
mod dispatch;

pub use async_handle::AsyncCommandHandle;
pub use dispatch::{ActionResult, CommandDispatcher, CommandRequest, InvokeContext};

use crate::config::InvokeConfig;
use crate::error::{CodecError, InvokeError};
use crate::exchange::ExchangeRef;
use crate::filler::{FillError, FinalizedMessage, MessageKind, ReplyBufferFiller, ReplyPayload};
use crate::messages::{
    CommandDataIb, InvokeRequestMessage, MessageType, StatusResponseMessage, TimedRequestMessage,
};
use crate::path::{CommandId, CommandRef, ConcreteCommandPath};
use crate::registry::CommandPathRegistry;
use crate::status::{Status, StatusIb};
use crate::tlv::{CommandFields, TlvWriter};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Handler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    /// No request seen.
    Idle,
    /// Non-final request chunks received.
    Accumulating,
    /// Commands are being dispatched.
    Dispatching,
    /// Dispatch returned; deferred commands are outstanding.
    AwaitingAsync,
    /// Final response queued; waiting for chunk acknowledgements.
    Finalizing,
    /// Final response sent (or suppressed).
    Sent,
    /// Transaction rejected or aborted.
    Aborted,
    /// The exchange closed before the response was sent.
    Closed,
}

impl HandlerPhase {
    fn is_terminal(self) -> bool {
        matches!(self, HandlerPhase::Sent | HandlerPhase::Aborted | HandlerPhase::Closed)
    }
}

pub(crate) enum Reply<'f> {
    Status(StatusIb),
    Data { response_id: CommandId, fields: CommandFields },
    Encoded {
        response_id: CommandId,
        encode: &'f mut dyn FnMut(&mut TlvWriter) -> Result<(), CodecError>,
    },
}

#[derive(Debug)]
struct Slot {
    path: ConcreteCommandPath,
    command_ref: Option<CommandRef>,
    answered: bool,
    handles: usize,
}

#[derive(Debug)]
struct HandlerState {
    phase: HandlerPhase,
    responder: Option<ExchangeRef>,
    suppress_response: bool,
    timed: bool,
    timed_deadline: Option<Instant>,
    requests: Vec<CommandDataIb>,
    slots: Vec<Slot>,
    filler: ReplyBufferFiller,
    outbox: VecDeque<FinalizedMessage>,
    awaiting_ack: bool,
    holds: usize,
}

struct Shared {
    dispatcher: Arc<dyn CommandDispatcher>,
    config: InvokeConfig,
    state: Mutex<HandlerState>,
}

/// Messages produced under the lock, sent after it is released.
#[derive(Default)]
struct Outgoing {
    exchange: Option<ExchangeRef>,
    messages: Vec<(MessageType, Bytes)>,
}

impl Outgoing {
    fn push(&mut self, exchange: &Option<ExchangeRef>, message_type: MessageType, payload: Bytes) {
        if let Some(exchange) = exchange {
            self.exchange.get_or_insert_with(|| Arc::clone(exchange));
            self.messages.push((message_type, payload));
        }
    }

    fn push_status(&mut self, exchange: &Option<ExchangeRef>, status: Status) {
        match StatusResponseMessage::new(status).encode() {
            Ok(payload) => self.push(exchange, MessageType::StatusResponse, payload),
            Err(err) => error!(
                target: "invoke_interaction::handler",
                error = %err,
                "cannot encode status response"
            ),
        }
    }
}

enum Admission {
    MoreChunks,
    Dispatch(Vec<CommandRequest>),
}

/// Response-side invoke driver for one transaction.
#[derive(Clone)]
pub struct CommandHandler {
    shared: Arc<Shared>,
}

impl fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandler").field("phase", &self.phase()).finish()
    }
}

impl CommandHandler {
    /// Handler dispatching to `dispatcher`.
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>, config: InvokeConfig) -> Self {
        let filler = ReplyBufferFiller::new(MessageKind::Response { suppress_response: false });
        let state = HandlerState {
            phase: HandlerPhase::Idle,
            responder: None,
            suppress_response: false,
            timed: false,
            timed_deadline: None,
            requests: Vec::new(),
            slots: Vec::new(),
            filler,
            outbox: VecDeque::new(),
            awaiting_ack: false,
            holds: 0,
        };
        Self { shared: Arc::new(Shared { dispatcher, config, state: Mutex::new(state) }) }
    }

    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase.
    pub fn phase(&self) -> HandlerPhase {
        self.lock().phase
    }

    /// Whether the transaction is over and nothing more will be sent.
    pub fn is_finished(&self) -> bool {
        self.lock().phase.is_terminal()
    }

    /// Handles still alive for this transaction.
    pub fn outstanding_handles(&self) -> usize {
        self.lock().slots.iter().map(|s| s.handles).sum()
    }

    /// Route one inbound message from `exchange`.
    pub fn on_message_received(
        &self,
        exchange: ExchangeRef,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<(), InvokeError> {
        match message_type {
            MessageType::TimedRequest => self.on_timed_request(exchange, &payload),
            MessageType::InvokeRequest => {
                let timed = self.take_timed_window(&exchange)?;
                match self.on_invoke_request(Some(exchange), payload, timed) {
                    Status::Success => Ok(()),
                    status => Err(InvokeError::Status(status.into())),
                }
            }
            MessageType::StatusResponse => self.on_status_response(exchange, &payload),
            other => {
                warn!(
                    target: "invoke_interaction::handler",
                    message_type = %other,
                    "unexpected message"
                );
                let mut out = Outgoing::default();
                {
                    let mut st = self.lock();
                    st.responder.get_or_insert(exchange);
                    out.push_status(&st.responder, Status::InvalidAction);
                    Self::abort(&mut st);
                }
                self.transmit(out);
                Err(InvokeError::InvalidAction("unexpected message type"))
            }
        }
    }

    fn on_timed_request(&self, exchange: ExchangeRef, payload: &[u8]) -> Result<(), InvokeError> {
        let mut out = Outgoing::default();
        let result = {
            let mut st = self.lock();
            st.responder.get_or_insert(exchange);
            let decoded = TimedRequestMessage::decode(payload);
            match decoded {
                Ok(timed) if st.phase == HandlerPhase::Idle && st.timed_deadline.is_none() => {
                    let window = Duration::from_millis(u64::from(timed.timeout_ms));
                    st.timed_deadline = Some(Instant::now() + window);
                    debug!(
                        target: "invoke_interaction::handler",
                        timeout_ms = timed.timeout_ms,
                        "timed window opened"
                    );
                    out.push_status(&st.responder, Status::Success);
                    Ok(())
                }
                Ok(_) => {
                    out.push_status(&st.responder, Status::InvalidAction);
                    Self::abort(&mut st);
                    Err(InvokeError::InvalidAction("timed request in the middle of a transaction"))
                }
                Err(err) => {
                    out.push_status(&st.responder, Status::InvalidAction);
                    Self::abort(&mut st);
                    Err(err.into())
                }
            }
        };
        self.transmit(out);
        result
    }

    /// Whether the next invoke belongs to a timed transaction. An expired window
    /// answers `Timeout` and aborts.
    fn take_timed_window(&self, exchange: &ExchangeRef) -> Result<bool, InvokeError> {
        let mut out = Outgoing::default();
        let result = {
            let mut st = self.lock();
            if st.phase == HandlerPhase::Accumulating {
                Ok(st.timed)
            } else {
                match st.timed_deadline.take() {
                    None => Ok(false),
                    Some(deadline) if Instant::now() <= deadline => Ok(true),
                    Some(deadline) => {
                        warn!(
                            target: "invoke_interaction::handler",
                            "invoke arrived after timed window closed"
                        );
                        st.responder.get_or_insert_with(|| Arc::clone(exchange));
                        out.push_status(&st.responder, Status::Timeout);
                        Self::abort(&mut st);
                        let late = Instant::now().saturating_duration_since(deadline);
                        Err(InvokeError::Timeout(late))
                    }
                }
            }
        };
        self.transmit(out);
        result
    }

    /// Accept one InvokeRequest chunk.
    ///
    /// Returns `Success` when the chunk was accepted (and, for the final chunk,
    /// the batch dispatched), or the status the whole batch was rejected with.
    /// A rejected batch dispatches no command.
    pub fn on_invoke_request(
        &self,
        responder: Option<ExchangeRef>,
        payload: Bytes,
        is_timed_transaction: bool,
    ) -> Status {
        let mut out = Outgoing::default();
        let admitted = {
            let mut st = self.lock();
            self.admit(&mut st, responder, &payload, is_timed_transaction, &mut out)
        };
        self.transmit(out);
        match admitted {
            Ok(Admission::MoreChunks) => Status::Success,
            Ok(Admission::Dispatch(requests)) => {
                for (slot, request) in requests.iter().enumerate() {
                    self.dispatch_one(slot, request);
                }
                self.release(None);
                Status::Success
            }
            Err(status) => status,
        }
    }

    fn admit(
        &self,
        st: &mut HandlerState,
        responder: Option<ExchangeRef>,
        payload: &Bytes,
        is_timed: bool,
        out: &mut Outgoing,
    ) -> Result<Admission, Status> {
        match st.phase {
            HandlerPhase::Idle => st.responder = responder.or_else(|| st.responder.take()),
            HandlerPhase::Accumulating => {}
            phase => {
                warn!(
                    target: "invoke_interaction::handler",
                    ?phase,
                    "invoke request outside of a fresh transaction"
                );
                return Err(Self::reject(st, Status::InvalidAction, out));
            }
        }
        let msg = match InvokeRequestMessage::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(
                    target: "invoke_interaction::handler",
                    error = %err,
                    "malformed invoke request"
                );
                return Err(Self::reject(st, Status::InvalidAction, out));
            }
        };
        if msg.timed_request != is_timed {
            warn!(
                target: "invoke_interaction::handler",
                flag = msg.timed_request,
                timed_transaction = is_timed,
                "timed flag mismatch"
            );
            return Err(Self::reject(st, Status::TimedRequestMismatch, out));
        }
        if st.phase == HandlerPhase::Accumulating && msg.suppress_response != st.suppress_response {
            return Err(Self::reject(st, Status::InvalidAction, out));
        }
        st.suppress_response = msg.suppress_response;
        st.timed = is_timed;
        st.requests.extend(msg.invoke_requests);

        let max_paths = usize::from(self.shared.config.max_paths_per_invoke());
        if st.requests.len() > max_paths {
            warn!(
                target: "invoke_interaction::handler",
                commands = st.requests.len(),
                max_paths,
                "batch exceeds paths per invoke"
            );
            return Err(Self::reject(st, Status::InvalidAction, out));
        }
        if msg.more_chunked_messages {
            st.phase = HandlerPhase::Accumulating;
            debug!(
                target: "invoke_interaction::handler",
                commands = st.requests.len(),
                "request chunk accumulated"
            );
            out.push_status(&st.responder, Status::Success);
            return Ok(Admission::MoreChunks);
        }
        if st.requests.is_empty() {
            return Err(Self::reject(st, Status::InvalidAction, out));
        }

        let mut registry = CommandPathRegistry::new(max_paths);
        let conflict =
            st.requests.iter().find_map(|r| registry.add(r.path, r.command_ref).err());
        if let Some(err) = conflict {
            warn!(target: "invoke_interaction::handler", error = %err, "ambiguous batch rejected");
            return Err(Self::reject(st, Status::InvalidAction, out));
        }
        if let Err(err) = st.filler.begin_message(self.shared.config.max_message_size()) {
            error!(
                target: "invoke_interaction::handler",
                error = %err,
                "cannot open response message"
            );
            return Err(Self::reject(st, Status::Failure, out));
        }
        let requests: Vec<CommandRequest> = std::mem::take(&mut st.requests)
            .into_iter()
            .map(|c| CommandRequest {
                path: c.path,
                command_ref: c.command_ref,
                fields: c.fields,
                timed: is_timed,
            })
            .collect();
        st.slots = requests
            .iter()
            .map(|r| Slot { path: r.path, command_ref: r.command_ref, answered: false, handles: 0 })
            .collect();
        st.phase = HandlerPhase::Dispatching;
        st.holds = 1;
        debug!(
            target: "invoke_interaction::handler",
            commands = requests.len(),
            "dispatching batch"
        );
        Ok(Admission::Dispatch(requests))
    }

    fn reject(st: &mut HandlerState, status: Status, out: &mut Outgoing) -> Status {
        out.push_status(&st.responder, status);
        st.requests.clear();
        Self::abort(st);
        status
    }

    fn abort(st: &mut HandlerState) {
        st.phase = HandlerPhase::Aborted;
        st.outbox.clear();
        st.awaiting_ack = false;
    }

    fn dispatch_one(&self, slot: usize, request: &CommandRequest) {
        let dispatcher = &self.shared.dispatcher;
        let exists = dispatcher.command_exists(&request.path);
        if !exists.is_success() {
            debug!(
                target: "invoke_interaction::handler",
                path = %request.path,
                status = %exists,
                "command not supported"
            );
            self.add_reply_logged(slot, Reply::Status(exists.into()));
            return;
        }
        if !request.timed && dispatcher.requires_timed_invoke(&request.path) {
            self.add_reply_logged(slot, Reply::Status(Status::NeedsTimedInteraction.into()));
            return;
        }
        let mut ctx = InvokeContext::new(self, slot, request.path);
        match dispatcher.invoke(request, &mut ctx) {
            Some(ActionResult::Status(status)) => {
                self.add_reply_logged(slot, Reply::Status(status))
            }
            Some(ActionResult::Response { response_id, fields }) => {
                self.add_reply_logged(slot, Reply::Data { response_id, fields })
            }
            None => self.answer_if_abandoned(slot),
        }
    }

    fn add_reply_logged(&self, slot: usize, reply: Reply<'_>) {
        if let Err(err) = self.add_reply(slot, reply) {
            warn!(target: "invoke_interaction::handler", slot, error = %err, "reply dropped");
        }
    }

    fn answer_if_abandoned(&self, slot: usize) {
        let mut out = Outgoing::default();
        {
            let mut st = self.lock();
            let abandoned = st.slots.get(slot).is_some_and(|s| !s.answered && s.handles == 0);
            if abandoned {
                warn!(
                    target: "invoke_interaction::handler",
                    slot,
                    "command left unanswered; replying Failure"
                );
                let failure = Reply::Status(Status::Failure.into());
                let _ = self.place_reply(&mut st, slot, failure, &mut out);
            }
        }
        self.transmit(out);
    }

    pub(crate) fn add_reply(&self, slot: usize, reply: Reply<'_>) -> Result<(), InvokeError> {
        let mut out = Outgoing::default();
        let result = {
            let mut st = self.lock();
            self.place_reply(&mut st, slot, reply, &mut out)
        };
        self.transmit(out);
        result
    }

    fn place_reply(
        &self,
        st: &mut HandlerState,
        slot: usize,
        reply: Reply<'_>,
        out: &mut Outgoing,
    ) -> Result<(), InvokeError> {
        let entry = st.slots.get_mut(slot).ok_or(InvokeError::InvalidArgument("unknown command"))?;
        if entry.answered {
            return Err(InvokeError::IncorrectState("command already answered"));
        }
        entry.answered = true;
        let (path, command_ref) = (entry.path, entry.command_ref);
        if st.responder.is_none()
            || st.suppress_response
            || st.phase.is_terminal()
            || !st.filler.is_open()
        {
            return Ok(());
        }
        place(&mut st.filler, &mut st.outbox, &path, command_ref, reply)?;
        Self::flush(st, out);
        Ok(())
    }

    /// Send the next queued chunk unless one is awaiting acknowledgement.
    fn flush(st: &mut HandlerState, out: &mut Outgoing) {
        if st.awaiting_ack || st.responder.is_none() {
            return;
        }
        if let Some(chunk) = st.outbox.pop_front() {
            debug!(
                target: "invoke_interaction::handler",
                replies = chunk.count,
                more_chunks = chunk.more_chunks,
                "response chunk sent"
            );
            out.push(&st.responder, MessageType::InvokeResponse, chunk.payload);
            if chunk.more_chunks {
                st.awaiting_ack = true;
            } else {
                st.phase = HandlerPhase::Sent;
            }
        }
    }

    pub(crate) fn retain(&self, slot: usize) {
        let mut st = self.lock();
        if let Some(entry) = st.slots.get_mut(slot) {
            entry.handles += 1;
            st.holds += 1;
        }
    }

    /// Drop one hold: a handle for `slot`, or the dispatch guard when `None`.
    pub(crate) fn release(&self, slot: Option<usize>) {
        let mut out = Outgoing::default();
        {
            let mut st = self.lock();
            if let Some(slot) = slot {
                let abandoned = match st.slots.get_mut(slot) {
                    Some(entry) => {
                        entry.handles = entry.handles.saturating_sub(1);
                        entry.handles == 0 && !entry.answered
                    }
                    None => false,
                };
                if abandoned {
                    warn!(
                        target: "invoke_interaction::handler",
                        slot,
                        "last handle dropped without reply; replying Failure"
                    );
                    let failure = Reply::Status(Status::Failure.into());
                    let _ = self.place_reply(&mut st, slot, failure, &mut out);
                }
            }
            st.holds = st.holds.saturating_sub(1);
            let (phase, holds) = (st.phase, st.holds);
            match phase {
                HandlerPhase::Dispatching | HandlerPhase::AwaitingAsync if holds == 0 => {
                    self.finalize(&mut st, &mut out)
                }
                HandlerPhase::Dispatching if slot.is_none() => {
                    debug!(
                        target: "invoke_interaction::handler",
                        holds,
                        "awaiting deferred commands"
                    );
                    st.phase = HandlerPhase::AwaitingAsync;
                }
                _ => {}
            }
        }
        self.transmit(out);
    }

    fn finalize(&self, st: &mut HandlerState, out: &mut Outgoing) {
        let unanswered: Vec<usize> =
            st.slots.iter().enumerate().filter(|(_, s)| !s.answered).map(|(i, _)| i).collect();
        for slot in unanswered {
            let _ = self.place_reply(st, slot, Reply::Status(Status::Failure.into()), out);
        }
        if st.responder.is_none() {
            debug!(target: "invoke_interaction::handler", "no responder; transaction torn down");
            st.phase = HandlerPhase::Closed;
            return;
        }
        if st.suppress_response {
            debug!(target: "invoke_interaction::handler", "response suppressed");
            st.phase = HandlerPhase::Sent;
            return;
        }
        match st.filler.finalize_message(false) {
            Ok(last) => st.outbox.push_back(last),
            Err(err) => {
                error!(
                    target: "invoke_interaction::handler",
                    error = %err,
                    "cannot close response message"
                );
                Self::abort(st);
                return;
            }
        }
        st.phase = HandlerPhase::Finalizing;
        Self::flush(st, out);
    }

    fn on_status_response(&self, exchange: ExchangeRef, payload: &[u8]) -> Result<(), InvokeError> {
        let mut out = Outgoing::default();
        let result = {
            let mut st = self.lock();
            if st.phase == HandlerPhase::Idle {
                st.responder.get_or_insert(exchange);
            }
            if !st.awaiting_ack {
                warn!(
                    target: "invoke_interaction::handler",
                    "status response without pending chunk"
                );
                out.push_status(&st.responder, Status::InvalidAction);
                Self::abort(&mut st);
                Err(InvokeError::InvalidAction("unexpected status response"))
            } else {
                match StatusResponseMessage::decode(payload) {
                    Ok(msg) if msg.status.is_success() => {
                        st.awaiting_ack = false;
                        Self::flush(&mut st, &mut out);
                        Ok(())
                    }
                    Ok(msg) => {
                        warn!(
                            target: "invoke_interaction::handler",
                            status = %msg.status,
                            "peer aborted chunked response"
                        );
                        Self::abort(&mut st);
                        Err(InvokeError::Status(msg.status.into()))
                    }
                    Err(err) => {
                        out.push_status(&st.responder, Status::InvalidAction);
                        Self::abort(&mut st);
                        Err(err.into())
                    }
                }
            }
        };
        self.transmit(out);
        result
    }

    /// The exchange went away. Outstanding handles stay valid; releasing them
    /// later sends nothing.
    pub fn on_exchange_closed(&self) {
        let mut st = self.lock();
        debug!(target: "invoke_interaction::handler", phase = ?st.phase, "exchange closed");
        st.responder = None;
        st.outbox.clear();
        st.awaiting_ack = false;
        let in_flight = matches!(st.phase, HandlerPhase::Dispatching | HandlerPhase::AwaitingAsync);
        if !in_flight && !st.phase.is_terminal() {
            st.phase = HandlerPhase::Closed;
        }
    }

    /// Answer the first unanswered command on `path` with a status.
    ///
    /// Without an attached responder this is a no-op.
    pub fn add_status(
        &self,
        path: &ConcreteCommandPath,
        status: impl Into<StatusIb>,
    ) -> Result<(), InvokeError> {
        match self.slot_for(path)? {
            Some(slot) => self.add_reply(slot, Reply::Status(status.into())),
            None => Ok(()),
        }
    }

    /// Answer the first unanswered command on `path` with response data.
    ///
    /// Without an attached responder this is a no-op.
    pub fn add_response_data(
        &self,
        path: &ConcreteCommandPath,
        response_id: CommandId,
        fields: &CommandFields,
    ) -> Result<(), InvokeError> {
        match self.slot_for(path)? {
            Some(slot) => self.add_reply(slot, Reply::Data { response_id, fields: fields.clone() }),
            None => Ok(()),
        }
    }

    fn slot_for(&self, path: &ConcreteCommandPath) -> Result<Option<usize>, InvokeError> {
        let st = self.lock();
        if st.responder.is_none() {
            return Ok(None);
        }
        st.slots
            .iter()
            .position(|s| s.path == *path && !s.answered)
            .map(Some)
            .ok_or(InvokeError::KeyNotFound { path: *path, command_ref: None })
    }

    fn transmit(&self, out: Outgoing) {
        let Some(exchange) = out.exchange else { return };
        for (message_type, payload) in out.messages {
            if let Err(err) = exchange.send_message(message_type, payload) {
                error!(
                    target: "invoke_interaction::handler",
                    error = %err,
                    %message_type,
                    "send failed"
                );
                Self::abort(&mut self.lock());
                return;
            }
        }
    }
}

fn place(
    filler: &mut ReplyBufferFiller,
    outbox: &mut VecDeque<FinalizedMessage>,
    path: &ConcreteCommandPath,
    command_ref: Option<CommandRef>,
    mut reply: Reply<'_>,
) -> Result<(), InvokeError> {
    let mut result = try_place(filler, path, command_ref, &mut reply);
    if matches!(result, Err(FillError::DoesNotFit { .. })) && filler.count() > 0 {
        // Only start a continuation for a reply an empty message can hold.
        let capacity = filler.capacity();
        let mut empty = ReplyBufferFiller::new(filler.kind());
        empty.begin_message(capacity)?;
        result = try_place(&mut empty, path, command_ref, &mut reply);
        if result.is_ok() {
            outbox.push_back(filler.finalize_message(true)?);
            filler.begin_message(capacity)?;
            result = try_place(filler, path, command_ref, &mut reply);
        }
    }
    let fallback = match result {
        Ok(_) => return Ok(()),
        Err(FillError::DoesNotFit { .. }) | Err(FillError::Oversize { .. }) => {
            Status::ResourceExhausted
        }
        Err(FillError::Encode(err)) => {
            warn!(
                target: "invoke_interaction::handler",
                path = %path,
                error = %err,
                "response encoding failed"
            );
            Status::Failure
        }
        Err(FillError::NoMessage) => {
            return Err(InvokeError::IncorrectState("no response message open"))
        }
    };
    if let Reply::Status(_) = reply {
        return Err(InvokeError::BufferTooSmall { capacity: filler.capacity() });
    }
    warn!(
        target: "invoke_interaction::handler",
        path = %path,
        status = %fallback,
        "reply replaced"
    );
    place(filler, outbox, path, command_ref, Reply::Status(fallback.into()))
}

fn try_place(
    filler: &mut ReplyBufferFiller,
    path: &ConcreteCommandPath,
    command_ref: Option<CommandRef>,
    reply: &mut Reply<'_>,
) -> Result<crate::filler::Added, FillError> {
    match reply {
        Reply::Status(status) => filler.try_add(path, command_ref, &ReplyPayload::Status(*status)),
        Reply::Data { response_id, fields } => filler.try_add(
            path,
            command_ref,
            &ReplyPayload::Data { response_id: *response_id, fields: fields.clone() },
        ),
        Reply::Encoded { response_id, encode } => {
            filler.try_add_with(path, command_ref, *response_id, |w| (**encode)(w))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::exchange::Exchange;
    use crate::messages::{InvokeResponseIb, InvokeResponseMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PATH: ConcreteCommandPath = ConcreteCommandPath::new(1, 0x6, 0x2);

    #[derive(Debug, Default)]
    struct Sink {
        sent: Mutex<Vec<(MessageType, Bytes)>>,
    }

    impl Exchange for Sink {
        fn send_message(&self, t: MessageType, payload: Bytes) -> Result<(), ExchangeError> {
            self.sent.lock().unwrap().push((t, payload));
            Ok(())
        }
        fn close(&self) {}
        fn is_closed(&self) -> bool {
            false
        }
    }

    impl Sink {
        fn responses(&self) -> Vec<InvokeResponseMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| *t == MessageType::InvokeResponse)
                .map(|(_, p)| InvokeResponseMessage::decode(p).unwrap())
                .collect()
        }
    }

    /// Answers every command with `Success`; counts invocations.
    #[derive(Default)]
    struct Echo {
        invoked: AtomicUsize,
    }

    impl CommandDispatcher for Echo {
        fn command_exists(&self, path: &ConcreteCommandPath) -> Status {
            if path.cluster_id == 0x6 {
                Status::Success
            } else {
                Status::UnsupportedCluster
            }
        }
        fn invoke(&self, _: &CommandRequest, _: &mut InvokeContext<'_>) -> Option<ActionResult> {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            Some(Status::Success.into())
        }
    }

    fn request(refs: &[(ConcreteCommandPath, Option<CommandRef>)]) -> Bytes {
        InvokeRequestMessage {
            invoke_requests: refs
                .iter()
                .map(|(path, r)| CommandDataIb {
                    path: *path,
                    fields: CommandFields::empty(),
                    command_ref: *r,
                })
                .collect(),
            ..Default::default()
        }
        .encode()
        .unwrap()
    }

    fn handler(dispatcher: Arc<dyn CommandDispatcher>, max_paths: u16) -> CommandHandler {
        let config = InvokeConfig::builder().max_paths_per_invoke(max_paths).build().unwrap();
        CommandHandler::new(dispatcher, config)
    }

    #[test]
    fn duplicate_refs_reject_whole_batch() {
        let echo = Arc::new(Echo::default());
        let h = handler(echo.clone(), 4);
        let sink = Arc::new(Sink::default());
        let status = h.on_invoke_request(
            Some(sink.clone()),
            request(&[(PATH, Some(1)), (PATH.with_command(3), Some(1))]),
            false,
        );
        assert_eq!(status, Status::InvalidAction);
        assert_eq!(echo.invoked.load(Ordering::SeqCst), 0);
        assert_eq!(h.phase(), HandlerPhase::Aborted);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, MessageType::StatusResponse);
    }

    #[test]
    fn timed_flag_mismatch() {
        let echo = Arc::new(Echo::default());
        let h = handler(echo.clone(), 1);
        let status = h.on_invoke_request(None, request(&[(PATH, None)]), true);
        assert_eq!(status, Status::TimedRequestMismatch);
        assert_eq!(echo.invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsupported_cluster_is_per_command() {
        let echo = Arc::new(Echo::default());
        let h = handler(echo.clone(), 2);
        let sink = Arc::new(Sink::default());
        let other = ConcreteCommandPath::new(1, 0x8, 0x0);
        let batch = request(&[(PATH, Some(1)), (other, Some(2))]);
        let status = h.on_invoke_request(Some(sink.clone()), batch, false);
        assert_eq!(status, Status::Success);
        assert_eq!(echo.invoked.load(Ordering::SeqCst), 1);
        assert_eq!(h.phase(), HandlerPhase::Sent);
        let responses = sink.responses();
        let statuses: Vec<_> = responses[0]
            .invoke_responses
            .iter()
            .map(|r| match r {
                InvokeResponseIb::Status(s) => s.status.status,
                InvokeResponseIb::Command(_) => Status::Success,
            })
            .collect();
        assert_eq!(statuses, vec![Status::Success, Status::UnsupportedCluster]);
    }

    #[test]
    fn standalone_replies_are_noops() {
        let h = handler(Arc::new(Echo::default()), 1);
        assert!(h.add_status(&PATH, Status::Success).is_ok());
        assert!(h.add_response_data(&PATH, 1, &CommandFields::empty()).is_ok());
        assert_eq!(h.on_invoke_request(None, request(&[(PATH, None)]), false), Status::Success);
        assert_eq!(h.phase(), HandlerPhase::Closed);
    }

    #[test]
    fn unexpected_status_response_aborts() {
        let h = handler(Arc::new(Echo::default()), 1);
        let sink: ExchangeRef = Arc::new(Sink::default());
        let ack = StatusResponseMessage::new(Status::Success).encode().unwrap();
        let err = h.on_message_received(sink, MessageType::StatusResponse, ack).unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(h.phase(), HandlerPhase::Aborted);
    }
}
