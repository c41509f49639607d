//! Response routing for pending engine requests.
//!
//! Before a request is sent it is registered here to obtain a oneshot
//! receiver. The reader task routes each response to its waiter by id, and
//! the requester awaits the receiver without holding any lock.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::protocol::{RequestId, ResponseError};
use crate::error::LockResultExt;

/// How a pending request ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Completion {
    /// The engine answered with a result
    Result(serde_json::Value),
    /// The engine answered with an error object
    EngineError(ResponseError),
    /// The connection went away before an answer arrived
    Cancelled(String),
}

impl Completion {
    /// Decode the payload of a response message.
    pub(crate) fn from_response(response: &serde_json::Value) -> Self {
        if let Some(error) = response.get("error") {
            return match serde_json::from_value::<ResponseError>(error.clone()) {
                Ok(error) => Completion::EngineError(error),
                Err(e) => Completion::EngineError(ResponseError::request_failed(format!(
                    "malformed error object: {}",
                    e
                ))),
            };
        }
        Completion::Result(
            response
                .get("result")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )
    }
}

/// Routes responses to pending requests via oneshot channels.
///
/// Used by a single reader task that calls `route()` for each incoming
/// response.
pub(crate) struct ResponseRouter {
    pending: std::sync::Mutex<HashMap<RequestId, oneshot::Sender<Completion>>>,
}

impl ResponseRouter {
    pub(crate) fn new() -> Self {
        Self {
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending request and return a receiver for its completion.
    ///
    /// Returns `None` if a request with this ID is already pending.
    pub(crate) fn register(&self, id: RequestId) -> Option<oneshot::Receiver<Completion>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().recover_poison("ResponseRouter::register");
        if pending.contains_key(&id) {
            return None;
        }
        pending.insert(id, tx);
        Some(rx)
    }

    /// Route a response message to its pending request.
    ///
    /// Returns `true` if the response was delivered, `false` for notifications,
    /// unknown ids, and waiters that already went away.
    pub(crate) fn route(&self, response: &serde_json::Value) -> bool {
        let Some(id) = RequestId::from_json(response) else {
            return false;
        };
        let tx = self
            .pending
            .lock()
            .recover_poison("ResponseRouter::route")
            .remove(&id);
        match tx {
            Some(sender) => sender.send(Completion::from_response(response)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .recover_poison("ResponseRouter::pending_count")
            .len()
    }

    /// Remove a pending request without completing it.
    ///
    /// Used when a request fails before being handed to the transport.
    pub(crate) fn remove(&self, id: RequestId) -> bool {
        self.pending
            .lock()
            .recover_poison("ResponseRouter::remove")
            .remove(&id)
            .is_some()
    }

    /// Cancel every pending request.
    pub(crate) fn fail_all(&self, reason: &str) {
        let entries: Vec<_> = self
            .pending
            .lock()
            .recover_poison("ResponseRouter::fail_all")
            .drain()
            .collect();

        // Lock released before sending
        for (_, tx) in entries {
            let _ = tx.send(Completion::Cancelled(reason.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_router_has_no_pending_requests() {
        let router = ResponseRouter::new();
        assert_eq!(router.pending_count(), 0);
    }

    #[test]
    fn register_duplicate_id_returns_none() {
        let router = ResponseRouter::new();
        let id = RequestId::new(1);

        assert!(router.register(id).is_some());
        assert!(router.register(id).is_none(), "duplicate ID should return None");
        assert_eq!(router.pending_count(), 1);
    }

    #[tokio::test]
    async fn route_delivers_result_to_waiter() {
        let router = ResponseRouter::new();
        let rx = router.register(RequestId::new(42)).unwrap();

        let delivered = router.route(&json!({
            "jsonrpc": "2.0",
            "id": 42,
            "result": { "errors": [] }
        }));
        assert!(delivered);

        let completion = rx.await.unwrap();
        assert_eq!(completion, Completion::Result(json!({ "errors": [] })));
    }

    #[tokio::test]
    async fn route_delivers_engine_error() {
        let router = ResponseRouter::new();
        let rx = router.register(RequestId::new(3)).unwrap();

        router.route(&json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": { "code": -32803, "message": "file not analyzed" }
        }));

        match rx.await.unwrap() {
            Completion::EngineError(error) => {
                assert_eq!(error.message, "file not analyzed");
            }
            other => panic!("unexpected completion {:?}", other),
        }
    }

    #[test]
    fn route_returns_false_for_unknown_id_and_notifications() {
        let router = ResponseRouter::new();
        let _rx = router.register(RequestId::new(1)).unwrap();

        assert!(!router.route(&json!({"jsonrpc": "2.0", "id": 999, "result": null})));
        assert!(!router.route(&json!({"jsonrpc": "2.0", "method": "server.connected"})));
        assert_eq!(router.pending_count(), 1);
    }

    #[test]
    fn route_after_receiver_dropped_returns_false() {
        let router = ResponseRouter::new();
        let rx = router.register(RequestId::new(1)).unwrap();
        drop(rx);

        assert!(!router.route(&json!({"jsonrpc": "2.0", "id": 1, "result": null})));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_cancels_every_waiter() {
        let router = ResponseRouter::new();
        let rx1 = router.register(RequestId::new(1)).unwrap();
        let rx2 = router.register(RequestId::new(2)).unwrap();

        router.fail_all("engine stopped");

        assert_eq!(router.pending_count(), 0);
        assert_eq!(rx1.await.unwrap(), Completion::Cancelled("engine stopped".into()));
        assert_eq!(rx2.await.unwrap(), Completion::Cancelled("engine stopped".into()));
    }

    #[test]
    fn remove_clears_pending_request() {
        let router = ResponseRouter::new();
        let _rx = router.register(RequestId::new(1)).unwrap();

        assert!(router.remove(RequestId::new(1)));
        assert!(!router.remove(RequestId::new(1)));
        assert_eq!(router.pending_count(), 0);
    }
}
