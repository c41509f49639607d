//! In-process engine transport.
//!
//! `LoopbackLauncher` connects the client to an [`EngineEndpoint`] instead of
//! a real engine process. Whoever holds the endpoint plays the engine: it
//! reads what the client sends and answers or pushes on its own schedule.

use std::io;

use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::client::{EngineConnection, EngineLauncher};
use super::protocol::{
    NOTIFY_CONNECTED, NOTIFY_ERROR, RequestId, ResponseError, build_error_response,
    build_notification, build_response,
};

const LOG_TARGET: &str = "annocache::loopback";

/// Engine side of one loopback connection.
pub struct EngineEndpoint {
    /// Messages sent by the client
    incoming: mpsc::Receiver<Value>,
    /// Messages for the client
    outgoing: mpsc::Sender<Value>,
}

impl EngineEndpoint {
    /// Next message from the client, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Value> {
        self.incoming.recv().await
    }

    /// Returns false if the client is gone.
    pub async fn send(&self, message: Value) -> bool {
        self.outgoing.send(message).await.is_ok()
    }

    pub async fn connected(&self) -> bool {
        self.notify(NOTIFY_CONNECTED, serde_json::json!({ "version": "loopback" }))
            .await
    }

    pub async fn notify(&self, method: &str, params: Value) -> bool {
        self.send(build_notification(method, params)).await
    }

    pub async fn respond(&self, id: RequestId, result: Value) -> bool {
        self.send(build_response(id, result)).await
    }

    pub async fn respond_error(&self, id: RequestId, error: ResponseError) -> bool {
        self.send(build_error_response(id, &error)).await
    }

    pub async fn fatal_error(&self, message: &str) -> bool {
        self.notify(
            NOTIFY_ERROR,
            serde_json::json!({ "isFatal": true, "message": message }),
        )
        .await
    }

    /// Answer every request with `handler(method, params)` in a background
    /// task. `None` leaves the request unanswered; the return value for a
    /// notification is ignored.
    pub fn serve<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(&str, &Value) -> Option<Value> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(message) = self.recv().await {
                let method = message
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let reply = handler(method, &params);
                if let (Some(id), Some(result)) = (RequestId::from_json(&message), reply) {
                    if !self.respond(id, result).await {
                        break;
                    }
                }
            }
            debug!(target: LOG_TARGET, "Loopback engine finished serving");
        })
    }
}

/// Launcher handing every new connection's engine side to a channel.
pub struct LoopbackLauncher {
    endpoints: mpsc::UnboundedSender<EngineEndpoint>,
}

impl LoopbackLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEndpoint>) {
        let (endpoints, endpoints_rx) = mpsc::unbounded_channel();
        (Self { endpoints }, endpoints_rx)
    }
}

impl EngineLauncher for LoopbackLauncher {
    fn launch(&self, queue_capacity: usize) -> io::Result<EngineConnection> {
        let (outbound, incoming) = mpsc::channel(queue_capacity);
        let (outgoing, inbound) = mpsc::channel(queue_capacity);
        self.endpoints
            .send(EngineEndpoint { incoming, outgoing })
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "loopback engine is gone"))?;
        Ok(EngineConnection { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn launch_pairs_client_and_endpoint() {
        let (launcher, mut endpoints) = LoopbackLauncher::new();
        let mut connection = launcher.launch(4).unwrap();
        let mut endpoint = endpoints.recv().await.unwrap();

        connection.outbound.send(json!({"method": "ping"})).await.unwrap();
        assert_eq!(endpoint.recv().await.unwrap()["method"], "ping");

        assert!(endpoint.connected().await);
        assert_eq!(
            connection.inbound.recv().await.unwrap()["method"],
            NOTIFY_CONNECTED
        );
    }

    #[tokio::test]
    async fn launch_fails_once_receiver_is_gone() {
        let (launcher, endpoints) = LoopbackLauncher::new();
        drop(endpoints);

        let err = launcher.launch(4).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn serve_answers_requests() {
        let (launcher, mut endpoints) = LoopbackLauncher::new();
        let mut connection = launcher.launch(4).unwrap();
        let endpoint = endpoints.recv().await.unwrap();
        let _server = endpoint.serve(|method, _| Some(json!({ "echo": method })));

        connection
            .outbound
            .send(json!({"jsonrpc": "2.0", "id": 9, "method": "edit.format", "params": {}}))
            .await
            .unwrap();

        let reply = connection.inbound.recv().await.unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["result"]["echo"], "edit.format");
    }
}
