//! Reader task for messages coming from the analysis engine.
//!
//! The reader task:
//! - Runs in a spawned tokio task, one per connection
//! - Routes responses via ResponseRouter to oneshot waiters
//! - Completes the handshake on `server.connected`
//! - Forwards push notifications to the client's event channel
//! - Tears the connection down on a fatal `server.error` or EOF

use std::ops::ControlFlow;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::{ClientEvent, ClientShared};
use super::protocol::EngineNotification;

const LOG_TARGET: &str = "annocache::reader";

/// Receives the engine version once `server.connected` arrives.
pub(crate) type HandshakeSender = oneshot::Sender<Option<String>>;

/// Handle to a running reader task.
///
/// Dropping the handle cancels the reader loop. The task also ends by
/// itself on EOF or on a fatal engine error.
pub(crate) struct ReaderTaskHandle {
    _join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl Drop for ReaderTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn the reader task of one connection.
///
/// `epoch` identifies the connection so a reader outliving its connection
/// cannot tear down a newer one.
pub(crate) fn spawn_reader_task(
    inbound: mpsc::Receiver<Value>,
    shared: Arc<ClientShared>,
    epoch: u64,
    handshake: HandshakeSender,
) -> ReaderTaskHandle {
    let cancel_token = CancellationToken::new();
    let join_handle = tokio::spawn(reader_loop(
        inbound,
        shared,
        epoch,
        handshake,
        cancel_token.clone(),
    ));

    ReaderTaskHandle {
        _join_handle: join_handle,
        cancel_token,
    }
}

async fn reader_loop(
    mut inbound: mpsc::Receiver<Value>,
    shared: Arc<ClientShared>,
    epoch: u64,
    handshake: HandshakeSender,
    cancel_token: CancellationToken,
) {
    let mut handshake = Some(handshake);
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!(target: LOG_TARGET, "Reader task cancelled, shutting down");
                break;
            }

            message = inbound.recv() => {
                match message {
                    Some(message) => {
                        if handle_message(message, &shared, epoch, &mut handshake).is_break() {
                            break;
                        }
                    }
                    None => {
                        info!(target: LOG_TARGET, "Analysis engine closed the connection");
                        shared.degrade(epoch, "connection closed by analysis engine");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle a single message from the engine.
fn handle_message(
    message: Value,
    shared: &ClientShared,
    epoch: u64,
    handshake: &mut Option<HandshakeSender>,
) -> ControlFlow<()> {
    if message.get("id").is_some() && message.get("method").is_none() {
        if !shared.router.route(&message) {
            debug!(target: LOG_TARGET, "Response for unknown request ID, dropping");
        }
        return ControlFlow::Continue(());
    }

    match EngineNotification::from_message(&message) {
        Ok(EngineNotification::Connected { version }) => match handshake.take() {
            Some(tx) => {
                let _ = tx.send(version);
            }
            None => debug!(target: LOG_TARGET, "Ignoring repeated server.connected"),
        },
        Ok(EngineNotification::ServerError {
            fatal: true,
            message,
            stack_trace,
        }) => {
            warn!(target: LOG_TARGET, "Fatal analysis engine error: {}", message);
            if let Some(trace) = stack_trace {
                debug!(target: LOG_TARGET, "Engine stack trace:\n{}", trace);
            }
            shared.degrade(epoch, &message);
            return ControlFlow::Break(());
        }
        Ok(EngineNotification::ServerError { message, .. }) => {
            warn!(target: LOG_TARGET, "Analysis engine error: {}", message);
        }
        Ok(notification) => {
            if shared
                .events
                .send(ClientEvent::Notification(notification))
                .is_err()
            {
                debug!(target: LOG_TARGET, "No event consumer, dropping notification");
            }
        }
        Err(e) => {
            warn!(target: LOG_TARGET, "Dropping malformed engine message: {}", e);
        }
    }
    ControlFlow::Continue(())
}
