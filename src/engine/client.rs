//! Client side of the analysis engine connection.
//!
//! `AnalysisClient` owns one logical connection at a time. Outbound messages
//! go through the transport's queue (the transport is the single writer);
//! inbound messages are handled by the reader task. Push notifications,
//! late answers and connection failures reach the rest of the crate as
//! [`ClientEvent`]s on one channel.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::protocol::{
    EngineNotification, EngineRequest, METHOD_SET_ROOTS, METHOD_SHUTDOWN, METHOD_UPDATE_CONTENT,
    RequestId, SetRootsParams, UpdateContentParams, build_notification,
};
use super::reader::{ReaderTaskHandle, spawn_reader_task};
use super::router::{Completion, ResponseRouter};
use super::state::ConnectionState;
use crate::config::Settings;
use crate::error::{ClientError, LockResultExt, RequestError};

const LOG_TARGET: &str = "annocache::client";

/// A live message channel pair to an engine.
pub struct EngineConnection {
    /// Messages for the engine. The transport behind it is the only writer.
    pub outbound: mpsc::Sender<Value>,
    /// Messages from the engine. Closing it means the engine went away.
    pub inbound: mpsc::Receiver<Value>,
}

/// Starts an engine and connects to it.
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, queue_capacity: usize) -> std::io::Result<EngineConnection>;
}

/// Something the client observed that the cache has to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A push from the engine
    Notification(EngineNotification),
    /// A bounded request answered after its caller stopped waiting
    LateResponse {
        id: RequestId,
        request: EngineRequest,
        result: Value,
    },
    /// The connection failed. Sent once per failure.
    Degraded { message: String },
}

struct ConnectionSlot {
    state: ConnectionState,
    /// Bumped on every start
    epoch: u64,
    outbound: Option<mpsc::Sender<Value>>,
    reader: Option<ReaderTaskHandle>,
}

/// State shared between the client and its reader task.
pub(crate) struct ClientShared {
    slot: Mutex<ConnectionSlot>,
    pub(crate) router: ResponseRouter,
    pub(crate) events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientShared {
    pub(crate) fn new(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            slot: Mutex::new(ConnectionSlot {
                state: ConnectionState::Disconnected,
                epoch: 0,
                outbound: None,
                reader: None,
            }),
            router: ResponseRouter::new(),
            events,
        }
    }

    /// Tear down a ready connection after the engine failed.
    ///
    /// Cancels every pending request and tells the host once. Does nothing
    /// if the connection of `epoch` is no longer the ready one.
    pub(crate) fn degrade(&self, epoch: u64, message: &str) {
        let reader = {
            let mut slot = self.slot.lock().recover_poison("ClientShared::degrade");
            if slot.epoch != epoch || slot.state != ConnectionState::Ready {
                return;
            }
            slot.state = ConnectionState::Degraded;
            slot.outbound = None;
            slot.reader.take()
        };
        warn!(target: LOG_TARGET, "Analysis engine degraded: {}", message);
        self.router
            .fail_all(&format!("analysis engine failed: {}", message));
        let _ = self.events.send(ClientEvent::Degraded {
            message: message.to_string(),
        });
        drop(reader);
    }
}

pub struct AnalysisClient {
    launcher: Arc<dyn EngineLauncher>,
    settings: Settings,
    shared: Arc<ClientShared>,
    next_request_id: AtomicI64,
}

impl AnalysisClient {
    /// Create a disconnected client and the receiving end of its event
    /// channel.
    pub fn new(
        settings: Settings,
        launcher: Arc<dyn EngineLauncher>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            launcher,
            settings,
            shared: Arc::new(ClientShared::new(events)),
            next_request_id: AtomicI64::new(1),
        };
        (client, events_rx)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.shared
            .slot
            .lock()
            .recover_poison("AnalysisClient::state")
            .state
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.router.pending_count()
    }

    /// Launch the engine and wait for its handshake.
    pub async fn start(&self) -> Result<(), ClientError> {
        let (epoch, handshake_rx) = {
            let mut slot = self.shared.slot.lock().recover_poison("AnalysisClient::start");
            if slot.state.is_running() {
                return Err(ClientError::AlreadyRunning);
            }
            let connection = self.launcher.launch(self.settings.outbound_queue_capacity)?;
            slot.epoch += 1;
            let (handshake_tx, handshake_rx) = oneshot::channel();
            let reader = spawn_reader_task(
                connection.inbound,
                Arc::clone(&self.shared),
                slot.epoch,
                handshake_tx,
            );
            slot.state = ConnectionState::Starting;
            slot.outbound = Some(connection.outbound);
            slot.reader = Some(reader);
            (slot.epoch, handshake_rx)
        };
        debug!(target: LOG_TARGET, "Analysis engine launched, awaiting handshake");

        let timeout = self.settings.handshake_timeout();
        let failure = match tokio::time::timeout(timeout, handshake_rx).await {
            Ok(Ok(version)) => {
                let mut slot = self.shared.slot.lock().recover_poison("AnalysisClient::start");
                if slot.epoch == epoch && slot.state == ConnectionState::Starting {
                    slot.state = ConnectionState::Ready;
                    info!(
                        target: LOG_TARGET,
                        "Analysis engine connected (version {})",
                        version.as_deref().unwrap_or("unknown")
                    );
                    return Ok(());
                }
                "connection replaced during handshake".to_string()
            }
            Ok(Err(_)) => "analysis engine closed the connection before connecting".to_string(),
            Err(_) => format!("no server.connected within {:?}", timeout),
        };

        self.abandon_start(epoch);
        warn!(target: LOG_TARGET, "Analysis engine handshake failed: {}", failure);
        Err(ClientError::Handshake(failure))
    }

    fn abandon_start(&self, epoch: u64) {
        let released = {
            let mut slot = self
                .shared
                .slot
                .lock()
                .recover_poison("AnalysisClient::abandon_start");
            if slot.epoch != epoch || slot.state != ConnectionState::Starting {
                return;
            }
            slot.state = ConnectionState::Disconnected;
            (slot.outbound.take(), slot.reader.take())
        };
        drop(released);
    }

    /// Shut the connection down.
    ///
    /// Every pending bounded request fails with a cancellation error right
    /// away.
    pub fn stop(&self) {
        let (previous, outbound, reader) = {
            let mut slot = self.shared.slot.lock().recover_poison("AnalysisClient::stop");
            let previous = slot.state;
            slot.state = ConnectionState::Disconnected;
            (previous, slot.outbound.take(), slot.reader.take())
        };

        if let Some(outbound) = outbound {
            let shutdown = build_notification(METHOD_SHUTDOWN, serde_json::json!({}));
            if outbound.try_send(shutdown).is_err() {
                debug!(target: LOG_TARGET, "Could not queue server.shutdown");
            }
        }
        drop(reader);
        self.shared.router.fail_all("analysis engine stopped");

        if previous != ConnectionState::Disconnected {
            info!(target: LOG_TARGET, "Analysis engine stopped (was {})", previous);
        }
    }

    /// Reserve the id for the next request.
    pub fn allocate_request_id(&self) -> RequestId {
        RequestId::new(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    fn ready_outbound(&self) -> Result<(u64, mpsc::Sender<Value>), ClientError> {
        let slot = self.shared.slot.lock().recover_poison("AnalysisClient::outbound");
        match (&slot.outbound, slot.state) {
            (Some(outbound), ConnectionState::Ready) => Ok((slot.epoch, outbound.clone())),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Register a waiter for `id` on the ready connection.
    ///
    /// Registration happens under the slot lock, so a concurrent `stop` or
    /// degrade either sees the waiter in its `fail_all` or has already left
    /// the connection unready.
    fn register_ready(
        &self,
        id: RequestId,
    ) -> Result<(u64, mpsc::Sender<Value>, oneshot::Receiver<Completion>), RequestError> {
        let slot = self
            .shared
            .slot
            .lock()
            .recover_poison("AnalysisClient::register_ready");
        let outbound = match (&slot.outbound, slot.state) {
            (Some(outbound), ConnectionState::Ready) => outbound.clone(),
            _ => return Err(RequestError::cancelled(ClientError::NotConnected.to_string())),
        };
        let Some(rx) = self.shared.router.register(id) else {
            return Err(RequestError::cancelled(format!("duplicate request id {}", id)));
        };
        Ok((slot.epoch, outbound, rx))
    }

    /// Send a request and wait at most `timeout` for its answer.
    ///
    /// `Ok(None)` means the engine answered with an error (logged here).
    /// On timeout the request stays in flight; a late answer is delivered as
    /// [`ClientEvent::LateResponse`].
    ///
    /// A request that cannot be encoded is never sent and fails as
    /// cancelled.
    pub async fn request_bounded(
        &self,
        id: RequestId,
        request: EngineRequest,
        timeout: Duration,
    ) -> Result<Option<Value>, RequestError> {
        let message = request.to_message(id).map_err(|e| {
            warn!(target: LOG_TARGET, "Could not encode {} {}: {}", request.method(), id, e);
            RequestError::cancelled(format!("could not encode {}: {}", request.method(), e))
        })?;
        self.send_bounded(id, request, message, timeout).await
    }

    async fn send_bounded(
        &self,
        id: RequestId,
        request: EngineRequest,
        message: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, RequestError> {
        let method = request.method();
        let (epoch, outbound, mut rx) = self.register_ready(id)?;

        if outbound.send(message).await.is_err() {
            self.shared.router.remove(id);
            self.shared.degrade(epoch, "outbound queue closed");
            return Err(RequestError::cancelled("analysis engine transport closed"));
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(completion)) => resolve(method, id, completion),
            Ok(Err(_)) => Err(RequestError::cancelled("response channel closed")),
            Err(_) => {
                debug!(
                    target: LOG_TARGET,
                    "{} {} still pending after {:?}",
                    method,
                    id,
                    timeout
                );
                self.watch_late_answer(id, request, rx);
                Err(RequestError::Timeout {
                    method,
                    after: timeout,
                })
            }
        }
    }

    /// Like [`request_bounded`](Self::request_bounded) with a fresh id.
    pub async fn request(
        &self,
        request: EngineRequest,
        timeout: Duration,
    ) -> Result<Option<Value>, RequestError> {
        let id = self.allocate_request_id();
        self.request_bounded(id, request, timeout).await
    }

    fn watch_late_answer(
        &self,
        id: RequestId,
        request: EngineRequest,
        rx: oneshot::Receiver<Completion>,
    ) {
        let events = self.shared.events.clone();
        tokio::spawn(async move {
            let method = request.method();
            match rx.await {
                Ok(Completion::Result(result)) => {
                    info!(target: LOG_TARGET, "Late answer for {} {}", method, id);
                    let _ = events.send(ClientEvent::LateResponse {
                        id,
                        request,
                        result,
                    });
                }
                Ok(Completion::EngineError(error)) => {
                    warn!(
                        target: LOG_TARGET,
                        "{} {} failed late: {} (code {})",
                        method,
                        id,
                        error.message,
                        error.code
                    );
                }
                Ok(Completion::Cancelled(_)) | Err(_) => {
                    debug!(target: LOG_TARGET, "{} {} cancelled before answering", method, id);
                }
            }
        });
    }

    /// Queue an overlay batch for the engine.
    ///
    /// Returns once the batch is handed to the transport; the engine does
    /// not acknowledge it.
    pub async fn update_content(&self, params: &UpdateContentParams) -> Result<(), ClientError> {
        let (epoch, outbound) = self.ready_outbound()?;
        let message = build_notification(METHOD_UPDATE_CONTENT, serde_json::to_value(params)?);
        if outbound.send(message).await.is_err() {
            self.shared.degrade(epoch, "outbound queue closed");
            return Err(ClientError::SendFailed);
        }
        debug!(
            target: LOG_TARGET,
            "Sent {} overlay(s) to analysis engine",
            params.files.len()
        );
        Ok(())
    }

    /// Replace the engine's analysis roots and wait for the acknowledgement.
    pub async fn set_roots(&self, params: SetRootsParams) -> Result<(), ClientError> {
        let timeout = self.settings.set_roots_timeout();
        let id = self.allocate_request_id();
        let request = EngineRequest::SetRoots(params);
        let message = request.to_message(id)?;
        match self.send_bounded(id, request, message, timeout).await? {
            Some(_) => Ok(()),
            None => Err(ClientError::Rejected {
                method: METHOD_SET_ROOTS,
                message: "engine returned an error response".to_string(),
            }),
        }
    }
}

impl Drop for AnalysisClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve(
    method: &'static str,
    id: RequestId,
    completion: Completion,
) -> Result<Option<Value>, RequestError> {
    match completion {
        Completion::Result(result) => Ok(Some(result)),
        Completion::EngineError(error) => {
            warn!(
                target: LOG_TARGET,
                "{} {} failed: {} (code {})",
                method,
                id,
                error.message,
                error.code
            );
            Ok(None)
        }
        Completion::Cancelled(reason) => Err(RequestError::Cancelled { reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{EngineEndpoint, LoopbackLauncher};
    use crate::engine::protocol::{METHOD_GET_ERRORS, ResponseError};
    use serde_json::json;
    use std::path::PathBuf;

    fn settings() -> Settings {
        Settings {
            handshake_timeout_ms: 200,
            get_errors_timeout_ms: 50,
            ..Settings::default()
        }
    }

    async fn connected_client() -> (
        AnalysisClient,
        mpsc::UnboundedReceiver<ClientEvent>,
        EngineEndpoint,
    ) {
        let (launcher, mut endpoints) = LoopbackLauncher::new();
        let (client, events) = AnalysisClient::new(settings(), Arc::new(launcher));
        let start = client.start();
        let accept = async {
            let endpoint = endpoints.recv().await.unwrap();
            endpoint.connected().await;
            endpoint
        };
        let (started, endpoint) = tokio::join!(start, accept);
        started.unwrap();
        (client, events, endpoint)
    }

    fn errors_request() -> EngineRequest {
        EngineRequest::GetErrors {
            file: PathBuf::from("/work/a.txt"),
        }
    }

    #[tokio::test]
    async fn start_reaches_ready_after_handshake() {
        let (client, _events, _endpoint) = connected_client().await;
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (client, _events, _endpoint) = connected_client().await;
        assert!(matches!(client.start().await, Err(ClientError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn handshake_timeout_leaves_client_disconnected() {
        let (launcher, mut endpoints) = LoopbackLauncher::new();
        let (client, _events) = AnalysisClient::new(settings(), Arc::new(launcher));

        let result = client.start().await;
        let _endpoint = endpoints.recv().await.unwrap();

        assert!(matches!(result, Err(ClientError::Handshake(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn request_before_start_is_cancelled() {
        let (launcher, _endpoints) = LoopbackLauncher::new();
        let (client, _events) = AnalysisClient::new(settings(), Arc::new(launcher));

        let err = client
            .request(errors_request(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn request_gets_answer() {
        let (client, _events, mut endpoint) = connected_client().await;

        let request = client.request(errors_request(), Duration::from_secs(1));
        let answer = async {
            let message = endpoint.recv().await.unwrap();
            assert_eq!(message["method"], METHOD_GET_ERRORS);
            let id = RequestId::from_json(&message).unwrap();
            endpoint.respond(id, json!({"errors": []})).await;
        };
        let (result, _) = tokio::join!(request, answer);

        assert_eq!(result.unwrap(), Some(json!({"errors": []})));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn engine_error_resolves_to_none() {
        let (client, _events, mut endpoint) = connected_client().await;

        let request = client.request(errors_request(), Duration::from_secs(1));
        let answer = async {
            let message = endpoint.recv().await.unwrap();
            let id = RequestId::from_json(&message).unwrap();
            endpoint
                .respond_error(id, ResponseError::request_failed("unknown file"))
                .await;
        };
        let (result, _) = tokio::join!(request, answer);

        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn timeout_keeps_connection_ready_and_delivers_late_answer() {
        let (client, mut events, mut endpoint) = connected_client().await;

        let err = client
            .request(errors_request(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.state(), ConnectionState::Ready);

        let message = endpoint.recv().await.unwrap();
        let id = RequestId::from_json(&message).unwrap();
        endpoint.respond(id, json!({"errors": []})).await;

        match events.recv().await.unwrap() {
            ClientEvent::LateResponse {
                id: late_id,
                request,
                result,
            } => {
                assert_eq!(late_id, id);
                assert_eq!(request, errors_request());
                assert_eq!(result, json!({"errors": []}));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_request() {
        let (client, _events, mut endpoint) = connected_client().await;

        let request = client.request(errors_request(), Duration::from_secs(5));
        let stop = async {
            endpoint.recv().await.unwrap();
            client.stop();
        };
        let (result, _) = tokio::join!(request, stop);

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn requests_racing_stop_are_cancelled_not_timed_out() {
        let (client, _events, _endpoint) = connected_client().await;
        let client = Arc::new(client);

        let requests: Vec<_> = (0..32)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client.request(errors_request(), Duration::from_secs(5)).await
                })
            })
            .collect();
        tokio::task::yield_now().await;
        client.stop();

        for request in requests {
            let result = tokio::time::timeout(Duration::from_secs(1), request)
                .await
                .expect("request should resolve right after stop")
                .unwrap();
            assert!(result.unwrap_err().is_cancelled());
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unencodable_roots_are_not_sent() {
        use std::ffi::OsString;
        use std::os::unix::ffi::OsStringExt;

        let (client, _events, mut endpoint) = connected_client().await;
        let roots = SetRootsParams {
            included: vec![PathBuf::from(OsString::from_vec(vec![b'/', 0xff]))],
            ..SetRootsParams::default()
        };

        let err = client.set_roots(roots).await.unwrap_err();
        assert!(matches!(err, ClientError::Encode(_)));
        assert_eq!(client.pending_requests(), 0);
        let sent = tokio::time::timeout(Duration::from_millis(50), endpoint.recv()).await;
        assert!(sent.is_err());
    }

    #[tokio::test]
    async fn stop_sends_shutdown() {
        let (client, _events, mut endpoint) = connected_client().await;
        client.stop();

        let message = endpoint.recv().await.unwrap();
        assert_eq!(message["method"], METHOD_SHUTDOWN);
    }

    #[tokio::test]
    async fn fatal_error_degrades_once() {
        let (client, mut events, endpoint) = connected_client().await;

        endpoint.fatal_error("out of memory").await;

        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Degraded {
                message: "out of memory".to_string()
            }
        );
        assert_eq!(client.state(), ConnectionState::Degraded);

        drop(endpoint);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn engine_eof_degrades_and_allows_restart() {
        let (launcher, mut endpoints) = LoopbackLauncher::new();
        let (client, mut events) = AnalysisClient::new(settings(), Arc::new(launcher));

        let accept = async {
            let endpoint = endpoints.recv().await.unwrap();
            endpoint.connected().await;
            endpoint
        };
        let (started, endpoint) = tokio::join!(client.start(), accept);
        started.unwrap();

        drop(endpoint);
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::Degraded { .. }
        ));

        let accept = async {
            let endpoint = endpoints.recv().await.unwrap();
            endpoint.connected().await;
            endpoint
        };
        let (restarted, _endpoint) = tokio::join!(client.start(), accept);
        restarted.unwrap();
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn update_content_requires_ready_connection() {
        let (launcher, _endpoints) = LoopbackLauncher::new();
        let (client, _events) = AnalysisClient::new(settings(), Arc::new(launcher));

        let err = client
            .update_content(&UpdateContentParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }
}
