use bytes::Bytes;
use invoke_interaction::messages::{InvokeResponseMessage, StatusResponseMessage};
use invoke_interaction::{
    ActionResult, AsyncCommandHandle, Callback, CommandDispatcher, CommandHandler,
    CommandRequest, CommandResponse, CommandSender, ConcreteCommandPath, Exchange, ExchangeError,
    ExchangeRef, ExtendableCallback, InvokeContext, InvokeError, MessageType, NoResponseData,
    ResponseData, Status, StatusIb,
};
use invoke_interaction::CommandRef;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ENDPOINT: u16 = 1;
pub const ON_OFF: u32 = 0x6;
pub const LEVEL: u32 = 0x8;

pub fn on_off(command_id: u32) -> ConcreteCommandPath {
    ConcreteCommandPath::new(ENDPOINT, ON_OFF, command_id)
}

/// Exchange recording every message sent on it.
#[derive(Debug, Default)]
pub struct RecordingExchange {
    sent: Mutex<Vec<(MessageType, Bytes)>>,
    cursor: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handle(self: &Arc<Self>) -> ExchangeRef {
        self.clone()
    }

    pub fn sent(&self) -> Vec<(MessageType, Bytes)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_types(&self) -> Vec<MessageType> {
        self.sent().into_iter().map(|(t, _)| t).collect()
    }

    /// Messages sent since the last call.
    pub fn take_new(&self) -> Vec<(MessageType, Bytes)> {
        let sent = self.sent.lock().unwrap();
        let from = self.cursor.swap(sent.len(), Ordering::SeqCst);
        sent[from..].to_vec()
    }

    pub fn responses(&self) -> Vec<InvokeResponseMessage> {
        self.sent()
            .iter()
            .filter(|(t, _)| *t == MessageType::InvokeResponse)
            .map(|(_, p)| InvokeResponseMessage::decode(p).unwrap())
            .collect()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.sent()
            .iter()
            .filter(|(t, _)| *t == MessageType::StatusResponse)
            .map(|(_, p)| StatusResponseMessage::decode(p).unwrap().status)
            .collect()
    }
}

impl Exchange for RecordingExchange {
    fn send_message(&self, message_type: MessageType, payload: Bytes) -> Result<(), ExchangeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Closed);
        }
        self.sent.lock().unwrap().push((message_type, payload));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Response {
        path: ConcreteCommandPath,
        command_ref: Option<CommandRef>,
        status: StatusIb,
        data: Option<CommandResponse>,
    },
    NoResponse(CommandRef),
    Error(InvokeError),
    Done,
}

/// Callback recording events in order; usable in both callback shapes.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<Event> {
        self.events().into_iter().filter(|e| matches!(e, Event::Response { .. })).collect()
    }

    pub fn no_responses(&self) -> Vec<CommandRef> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::NoResponse(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<InvokeError> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }

    pub fn done_count(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::Done).count()
    }

    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

impl ExtendableCallback for Recorder {
    fn on_response(&mut self, r: &ResponseData<'_>) {
        self.push(Event::Response {
            path: *r.path,
            command_ref: r.command_ref,
            status: r.status,
            data: r.data.cloned(),
        });
    }

    fn on_no_response(&mut self, n: &NoResponseData) {
        self.push(Event::NoResponse(n.command_ref));
    }

    fn on_error(&mut self, error: &InvokeError) {
        self.push(Event::Error(error.clone()));
    }

    fn on_done(&mut self) {
        self.push(Event::Done);
    }
}

/// Same recorder behind the single-command callback shape.
#[derive(Debug, Clone, Default)]
pub struct SimpleRecorder(pub Recorder);

impl Callback for SimpleRecorder {
    fn on_response(
        &mut self,
        path: &ConcreteCommandPath,
        status: &StatusIb,
        data: Option<&CommandResponse>,
    ) {
        self.0.push(Event::Response {
            path: *path,
            command_ref: None,
            status: *status,
            data: data.cloned(),
        });
    }

    fn on_error(&mut self, error: &InvokeError) {
        self.0.push(Event::Error(error.clone()));
    }

    fn on_done(&mut self) {
        self.0.push(Event::Done);
    }
}

type Behavior =
    dyn Fn(&CommandRequest, &mut InvokeContext<'_>, &MockContext) -> Behaved + Send + Sync;
type Behaved = Option<ActionResult>;

/// Shared state a test inspects after dispatch.
#[derive(Debug, Default)]
pub struct MockContext {
    pub invoked: AtomicUsize,
    pub deferred: Mutex<Vec<AsyncCommandHandle>>,
}

impl MockContext {
    pub fn invoked(&self) -> usize {
        self.invoked.load(Ordering::SeqCst)
    }

    pub fn take_deferred(&self) -> Vec<AsyncCommandHandle> {
        std::mem::take(&mut *self.deferred.lock().unwrap())
    }
}

fn succeed(_: &CommandRequest, _: &mut InvokeContext<'_>, _: &MockContext) -> Option<ActionResult> {
    Some(Status::Success.into())
}

/// Dispatch target with a fixed command table and a per-test behavior.
pub struct MockDispatcher {
    pub ctx: Arc<MockContext>,
    commands: HashSet<(u32, u32)>,
    timed_only: HashSet<u32>,
    behavior: Box<Behavior>,
}

impl MockDispatcher {
    /// Implements on-off commands 0..=2 on endpoint 1, answering `Success`.
    pub fn new() -> Self {
        Self {
            ctx: Arc::new(MockContext::default()),
            commands: [(ON_OFF, 0), (ON_OFF, 1), (ON_OFF, 2)].into_iter().collect(),
            timed_only: HashSet::new(),
            behavior: Box::new(succeed),
        }
    }

    pub fn with_behavior<F>(mut self, behavior: F) -> Self
    where
        F: Fn(&CommandRequest, &mut InvokeContext<'_>, &MockContext) -> Option<ActionResult>
            + Send
            + Sync
            + 'static,
    {
        self.behavior = Box::new(behavior);
        self
    }

    pub fn with_timed_only(mut self, command_id: u32) -> Self {
        self.timed_only.insert(command_id);
        self
    }

    pub fn into_parts(self) -> (Arc<dyn CommandDispatcher>, Arc<MockContext>) {
        let ctx = Arc::clone(&self.ctx);
        (Arc::new(self), ctx)
    }
}

impl CommandDispatcher for MockDispatcher {
    fn command_exists(&self, path: &ConcreteCommandPath) -> Status {
        if path.endpoint_id != ENDPOINT {
            Status::UnsupportedEndpoint
        } else if !self.commands.iter().any(|(c, _)| *c == path.cluster_id) {
            Status::UnsupportedCluster
        } else if !self.commands.contains(&(path.cluster_id, path.command_id)) {
            Status::UnsupportedCommand
        } else {
            Status::Success
        }
    }

    fn requires_timed_invoke(&self, path: &ConcreteCommandPath) -> bool {
        self.timed_only.contains(&path.command_id)
    }

    fn invoke(
        &self,
        request: &CommandRequest,
        ctx: &mut InvokeContext<'_>,
    ) -> Option<ActionResult> {
        self.ctx.invoked.fetch_add(1, Ordering::SeqCst);
        (self.behavior)(request, ctx, &*self.ctx)
    }
}

/// Shuttle messages between a sender and a handler until both go quiet.
pub fn pump(
    sender: &mut CommandSender,
    client: &Arc<RecordingExchange>,
    handler: &CommandHandler,
    server: &Arc<RecordingExchange>,
) {
    loop {
        let to_server = client.take_new();
        let to_client = server.take_new();
        if to_server.is_empty() && to_client.is_empty() {
            return;
        }
        for (t, p) in to_server {
            let _ = handler.on_message_received(server.handle(), t, p);
        }
        for (t, p) in to_client {
            if !sender.is_done() {
                let _ = sender.on_message_received(t, p);
            }
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
