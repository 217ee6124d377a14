//! In-process channel transport.
//!
//! A spawned worker accepts exchanges and runs one [`CommandHandler`] per
//! exchange against a shared [`CommandDispatcher`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::InvokeConfig;
use crate::error::ExchangeError;
use crate::exchange::{exchange_pair, Exchange, ExchangeEnd, ExchangeEvent, ExchangeRef};
use crate::handler::{CommandDispatcher, CommandHandler, HandlerPhase};

/// Responder side reachable over tokio channels.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<ExchangeEnd>,
    config: InvokeConfig,
}

impl ChannelTransport {
    /// Create a channel transport and spawn a worker serving `dispatcher`.
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>, config: InvokeConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<ExchangeEnd>(64);
        let worker_config = config.clone();
        tokio::spawn(async move {
            while let Some(end) = rx.recv().await {
                let dispatcher = Arc::clone(&dispatcher);
                let config = worker_config.clone();
                tokio::spawn(async move {
                    serve_exchange(dispatcher, config, end).await;
                });
            }
        });
        Self { tx, config }
    }

    /// Configuration handed to every handler.
    pub fn config(&self) -> &InvokeConfig {
        &self.config
    }

    /// Open a new exchange to the responder and return the initiator's end.
    pub async fn open_exchange(&self) -> Result<ExchangeEnd, ExchangeError> {
        let (local, remote) = exchange_pair();
        self.tx
            .send(remote)
            .await
            .map_err(|_| ExchangeError::SendFailed("responder worker stopped".into()))?;
        Ok(local)
    }
}

/// Drive one handler until its exchange closes or the transaction ends.
pub async fn serve_exchange(
    dispatcher: Arc<dyn CommandDispatcher>,
    config: InvokeConfig,
    (exchange, mut events): ExchangeEnd,
) -> HandlerPhase {
    let handler = CommandHandler::new(dispatcher, config);
    let responder: ExchangeRef = exchange.clone();
    while let Some(event) = events.recv().await {
        match event {
            ExchangeEvent::Message { message_type, payload } => {
                if let Err(err) =
                    handler.on_message_received(Arc::clone(&responder), message_type, payload)
                {
                    warn!(
                        target: "invoke_interaction::handler",
                        exchange = exchange.id(),
                        error = %err,
                        "invoke transaction failed"
                    );
                }
                if handler.is_finished() {
                    break;
                }
            }
            ExchangeEvent::Closed => {
                handler.on_exchange_closed();
                break;
            }
        }
    }
    if !exchange.is_closed() && handler.phase() == HandlerPhase::Aborted {
        exchange.close();
    }
    let phase = handler.phase();
    debug!(
        target: "invoke_interaction::handler",
        exchange = exchange.id(),
        ?phase,
        "exchange served"
    );
    phase
}
