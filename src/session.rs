//! A session ties one engine connection to one cache.
//!
//! Everything that used to be process-wide lives here: settings, the
//! client, the cache and the root tracker. The session also runs the
//! dispatcher loop that applies client events to the cache in order.

use std::path::Path;
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::AnnotationCache;
use crate::config::Settings;
use crate::engine::{AnalysisClient, ClientEvent, ConnectionState, EngineLauncher};
use crate::error::ClientError;
use crate::host::Host;
use crate::region::EditEvent;
use crate::roots::{ProjectRootTracker, RootsProvider};

const LOG_TARGET: &str = "annocache::session";

pub struct Session {
    settings: Settings,
    client: Arc<AnalysisClient>,
    cache: Arc<AnnotationCache>,
    roots: Arc<ProjectRootTracker>,
    dispatcher: JoinHandle<()>,
}

impl Session {
    /// Build a disconnected session. Must be called inside a tokio runtime.
    pub fn new(
        settings: Settings,
        launcher: Arc<dyn EngineLauncher>,
        host: Arc<dyn Host>,
        roots_provider: Arc<dyn RootsProvider>,
    ) -> Self {
        let (client, events) = AnalysisClient::new(settings.clone(), launcher);
        let client = Arc::new(client);
        let cache = Arc::new(AnnotationCache::new(host, Arc::clone(&client)));
        let roots = Arc::new(ProjectRootTracker::new(
            roots_provider,
            Arc::clone(&client),
            settings.roots_debounce(),
        ));
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&cache), events));

        Self {
            settings,
            client,
            cache,
            roots,
            dispatcher,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &Arc<AnalysisClient> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<AnnotationCache> {
        &self.cache
    }

    pub fn roots(&self) -> &Arc<ProjectRootTracker> {
        &self.roots
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Connect to the engine and bring it up to date.
    ///
    /// After the handshake every locally edited open file is marked for
    /// resending and the analysis roots are sent again.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.client.start().await?;
        self.cache.on_engine_connected();
        self.roots.reset();
        self.roots.update_roots().await?;
        Ok(())
    }

    pub fn stop(&self) {
        self.roots.cancel_pending();
        self.client.stop();
    }

    pub fn on_local_edit(&self, edit: &EditEvent) {
        self.cache.on_local_edit(edit);
    }

    pub fn on_file_closed(&self, file: &Path) {
        self.cache.remove_file(file);
    }

    pub fn host_roots_changed(&self) {
        self.roots.host_roots_changed();
    }

    pub async fn sync_content(&self) -> Result<usize, ClientError> {
        self.cache.sync_content().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.stop();
    }
}

/// Apply client events to the cache one at a time.
///
/// Runs until the client and every task holding its event sender are gone.
pub async fn run_dispatcher(
    cache: Arc<AnnotationCache>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        cache.handle_event(event);
    }
    debug!(target: LOG_TARGET, "Event channel closed, dispatcher exiting");
}
