//! Sessions wired to a loopback engine played by the test.

use std::sync::Arc;

use annocache::engine::protocol::NOTIFY_HIGHLIGHTS;
use annocache::engine::{EngineEndpoint, LoopbackLauncher};
use annocache::{FixedRoots, MemoryHost, RegionKind, Session, Settings};
use serde_json::json;
use std::path::Path;
use tokio::sync::mpsc;

pub struct Harness {
    pub session: Session,
    pub host: Arc<MemoryHost>,
    pub endpoint: EngineEndpoint,
    /// Engine sides of later connections (restarts)
    pub endpoints: mpsc::UnboundedReceiver<EngineEndpoint>,
}

pub fn test_settings() -> Settings {
    Settings {
        handshake_timeout_ms: 1_000,
        ..Settings::default()
    }
}

/// Start a session and complete the handshake from the engine side.
pub async fn connected(settings: Settings) -> Harness {
    let (launcher, mut endpoints) = LoopbackLauncher::new();
    let host = Arc::new(MemoryHost::new());
    let session = Session::new(
        settings,
        Arc::new(launcher),
        host.clone(),
        Arc::new(FixedRoots::default()),
    );

    let accept = async {
        let endpoint = endpoints.recv().await.expect("launcher should hand out an endpoint");
        endpoint.connected().await;
        endpoint
    };
    let (started, endpoint) = tokio::join!(session.start(), accept);
    started.expect("session should start");

    Harness {
        session,
        host,
        endpoint,
        endpoints,
    }
}

pub async fn push_highlights(endpoint: &EngineEndpoint, file: &Path, spans: &[(usize, usize)]) {
    let regions: Vec<_> = spans
        .iter()
        .map(|&(offset, length)| json!({"offset": offset, "length": length, "type": "IDENTIFIER"}))
        .collect();
    assert!(
        endpoint
            .notify(NOTIFY_HIGHLIGHTS, json!({"file": file, "regions": regions}))
            .await,
        "client should be listening"
    );
}

pub fn highlight_spans(session: &Session, file: &Path) -> Vec<(usize, usize)> {
    session
        .cache()
        .regions(file, RegionKind::Highlight)
        .iter()
        .map(|region| (region.offset(), region.length()))
        .collect()
}
