//! Message exchange collaborator.
//!
//! The drivers never talk to a socket; they call [`Exchange::send_message`] and
//! are told about inbound messages and closure by whoever owns the exchange.
//! [`exchange_pair`] provides an in-memory pair over tokio channels.

use crate::error::ExchangeError;
use crate::messages::MessageType;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One side of a message exchange.
pub trait Exchange: Send + Sync + fmt::Debug {
    /// Deliver one whole message to the peer.
    fn send_message(&self, message_type: MessageType, payload: Bytes) -> Result<(), ExchangeError>;

    /// Tear the exchange down. Idempotent.
    fn close(&self);

    /// Whether either side has closed the exchange.
    fn is_closed(&self) -> bool;
}

/// Shared handle to an exchange; cloning keeps the exchange context alive.
pub type ExchangeRef = Arc<dyn Exchange>;

/// Inbound event on one side of a channel exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// A message from the peer.
    Message {
        /// Opcode.
        message_type: MessageType,
        /// Payload.
        payload: Bytes,
    },
    /// The peer closed the exchange.
    Closed,
}

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// One side of an in-memory exchange.
pub struct ChannelExchange {
    id: u64,
    peer: mpsc::UnboundedSender<ExchangeEvent>,
    closed: Arc<AtomicBool>,
}

impl ChannelExchange {
    /// Exchange id shared by both sides.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for ChannelExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelExchange")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Exchange for ChannelExchange {
    fn send_message(&self, message_type: MessageType, payload: Bytes) -> Result<(), ExchangeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExchangeError::Closed);
        }
        self.peer
            .send(ExchangeEvent::Message { message_type, payload })
            .map_err(|_| ExchangeError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.peer.send(ExchangeEvent::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One side of a pair: the exchange to send on and the events to receive.
pub type ExchangeEnd = (Arc<ChannelExchange>, mpsc::UnboundedReceiver<ExchangeEvent>);

/// Create a connected pair of exchange ends.
pub fn exchange_pair() -> (ExchangeEnd, ExchangeEnd) {
    let id = NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed);
    let closed = Arc::new(AtomicBool::new(false));
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = ChannelExchange { id, peer: b_tx, closed: Arc::clone(&closed) };
    let b = ChannelExchange { id, peer: a_tx, closed };
    ((Arc::new(a), a_rx), (Arc::new(b), b_rx))
}
