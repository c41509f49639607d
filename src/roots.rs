//! Analysis roots derived from the host's project configuration.
//!
//! The tracker recomputes the full root set from every tracked project and
//! sends it to the engine only when it differs from the set the engine last
//! acknowledged. A failed update leaves the committed set alone, so the next
//! recompute retries the same change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::AbortHandle;

use crate::engine::AnalysisClient;
use crate::engine::protocol::SetRootsParams;
use crate::error::{ClientError, LockResultExt};

const LOG_TARGET: &str = "annocache::roots";

/// A content root and the folders excluded below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRoot {
    pub path: PathBuf,
    pub excluded: Vec<PathBuf>,
}

impl ContentRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            excluded: Vec::new(),
        }
    }

    pub fn excluding(mut self, folder: impl Into<PathBuf>) -> Self {
        self.excluded.push(folder.into());
        self
    }
}

/// The roots one host project contributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectRoots {
    pub content_roots: Vec<ContentRoot>,
    /// Package name root to the folder it resolves to
    pub package_roots: BTreeMap<PathBuf, PathBuf>,
}

/// Reads project configuration from the host.
pub trait RootsProvider: Send + Sync {
    fn project_roots(&self, project: &str) -> ProjectRoots;
}

/// Every project maps to the same fixed roots.
#[derive(Debug, Clone, Default)]
pub struct FixedRoots {
    roots: ProjectRoots,
}

impl FixedRoots {
    pub fn new(content_roots: Vec<ContentRoot>) -> Self {
        Self {
            roots: ProjectRoots {
                content_roots,
                package_roots: BTreeMap::new(),
            },
        }
    }
}

impl RootsProvider for FixedRoots {
    fn project_roots(&self, _project: &str) -> ProjectRoots {
        self.roots.clone()
    }
}

pub struct ProjectRootTracker {
    provider: Arc<dyn RootsProvider>,
    client: Arc<AnalysisClient>,
    projects: Mutex<BTreeSet<String>>,
    /// Last root set the engine acknowledged
    committed: Mutex<SetRootsParams>,
    /// Serializes updates so only one `setAnalysisRoots` is in flight
    update_lock: tokio::sync::Mutex<()>,
    debounce: Duration,
    pending: Mutex<Option<AbortHandle>>,
}

impl ProjectRootTracker {
    pub fn new(
        provider: Arc<dyn RootsProvider>,
        client: Arc<AnalysisClient>,
        debounce: Duration,
    ) -> Self {
        Self {
            provider,
            client,
            projects: Mutex::new(BTreeSet::new()),
            committed: Mutex::new(SetRootsParams::default()),
            update_lock: tokio::sync::Mutex::new(()),
            debounce,
            pending: Mutex::new(None),
        }
    }

    /// Start including a project. Returns false if it was already tracked.
    pub fn track_project(&self, project: &str) -> bool {
        self.projects
            .lock()
            .recover_poison("ProjectRootTracker::track_project")
            .insert(project.to_string())
    }

    pub fn untrack_project(&self, project: &str) -> bool {
        self.projects
            .lock()
            .recover_poison("ProjectRootTracker::untrack_project")
            .remove(project)
    }

    pub fn tracked_projects(&self) -> Vec<String> {
        self.projects
            .lock()
            .recover_poison("ProjectRootTracker::tracked_projects")
            .iter()
            .cloned()
            .collect()
    }

    /// The root set the tracked projects call for, sorted and deduplicated.
    pub fn desired_roots(&self) -> SetRootsParams {
        let projects = self.tracked_projects();
        let mut roots = SetRootsParams::default();
        for project in &projects {
            let project_roots = self.provider.project_roots(project);
            for content_root in project_roots.content_roots {
                roots.included.push(content_root.path);
                roots.excluded.extend(content_root.excluded);
            }
            roots.package_roots.extend(project_roots.package_roots);
        }
        roots.included.sort();
        roots.included.dedup();
        roots.excluded.sort();
        roots.excluded.dedup();
        roots
    }

    pub fn committed_roots(&self) -> SetRootsParams {
        self.committed
            .lock()
            .recover_poison("ProjectRootTracker::committed_roots")
            .clone()
    }

    /// Recompute the root set and send it if it changed.
    ///
    /// Returns true if the engine acknowledged a new set.
    pub async fn update_roots(&self) -> Result<bool, ClientError> {
        let _serial = self.update_lock.lock().await;

        let desired = self.desired_roots();
        if desired == self.committed_roots() {
            debug!(target: LOG_TARGET, "Analysis roots unchanged");
            return Ok(false);
        }

        self.client.set_roots(desired.clone()).await?;
        info!(
            target: LOG_TARGET,
            "Analysis roots updated: {} included, {} excluded",
            desired.included.len(),
            desired.excluded.len()
        );
        *self
            .committed
            .lock()
            .recover_poison("ProjectRootTracker::update_roots") = desired;
        Ok(true)
    }

    /// Debounced [`update_roots`](Self::update_roots) after a host
    /// configuration change. A newer change restarts the wait.
    ///
    /// Only the wait can be aborted. Once it elapses the update runs in its
    /// own task, so a root set already sent is never abandoned while the
    /// engine has yet to answer it.
    pub fn host_roots_changed(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        let delay = self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(async move {
                if let Err(e) = tracker.update_roots().await {
                    warn!(
                        target: LOG_TARGET,
                        "Analysis root update failed, keeping previous roots: {}",
                        e
                    );
                }
            });
        });

        let previous = self
            .pending
            .lock()
            .recover_poison("ProjectRootTracker::host_roots_changed")
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Forget the committed set so the next update sends the roots again.
    pub fn reset(&self) {
        *self
            .committed
            .lock()
            .recover_poison("ProjectRootTracker::reset") = SetRootsParams::default();
        debug!(target: LOG_TARGET, "Committed analysis roots reset");
    }

    pub fn cancel_pending(&self) {
        if let Some(handle) = self
            .pending
            .lock()
            .recover_poison("ProjectRootTracker::cancel_pending")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ProjectRootTracker {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::LoopbackLauncher;
    use crate::engine::protocol::{METHOD_SET_ROOTS, RequestId};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MapRoots(HashMap<String, ProjectRoots>);

    impl RootsProvider for MapRoots {
        fn project_roots(&self, project: &str) -> ProjectRoots {
            self.0.get(project).cloned().unwrap_or_default()
        }
    }

    fn provider() -> Arc<MapRoots> {
        let mut projects = HashMap::new();
        projects.insert(
            "app".to_string(),
            ProjectRoots {
                content_roots: vec![
                    ContentRoot::new("/work/app").excluding("/work/app/build"),
                    ContentRoot::new("/work/shared"),
                ],
                package_roots: BTreeMap::from([(
                    PathBuf::from("/work/app/packages"),
                    PathBuf::from("/cache/packages"),
                )]),
            },
        );
        projects.insert(
            "lib".to_string(),
            ProjectRoots {
                content_roots: vec![ContentRoot::new("/work/shared"), ContentRoot::new("/work/lib")],
                package_roots: BTreeMap::new(),
            },
        );
        Arc::new(MapRoots(projects))
    }

    struct Engine {
        set_roots_calls: Arc<AtomicUsize>,
        reject: Arc<AtomicBool>,
    }

    /// A ready client whose engine acknowledges root updates unless told
    /// to reject them.
    async fn connected_client() -> (Arc<AnalysisClient>, Engine) {
        let (launcher, mut endpoints) = LoopbackLauncher::new();
        let settings = Settings {
            set_roots_timeout_ms: 200,
            ..Settings::default()
        };
        let (client, _events) = AnalysisClient::new(settings, Arc::new(launcher));
        let client = Arc::new(client);

        let engine = Engine {
            set_roots_calls: Arc::new(AtomicUsize::new(0)),
            reject: Arc::new(AtomicBool::new(false)),
        };
        let calls = Arc::clone(&engine.set_roots_calls);
        let reject = Arc::clone(&engine.reject);

        let accept = async move {
            let endpoint = endpoints.recv().await.unwrap();
            endpoint.connected().await;
            endpoint.serve(move |method, _| {
                if method != METHOD_SET_ROOTS {
                    return None;
                }
                calls.fetch_add(1, Ordering::SeqCst);
                if reject.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(json!({}))
                }
            });
        };
        let (started, _) = tokio::join!(client.start(), accept);
        started.unwrap();
        (client, engine)
    }

    fn offline_tracker() -> ProjectRootTracker {
        let (launcher, _endpoints) = LoopbackLauncher::new();
        let (client, _events) = AnalysisClient::new(Settings::default(), Arc::new(launcher));
        ProjectRootTracker::new(provider(), Arc::new(client), Duration::from_millis(10))
    }

    #[test]
    fn desired_roots_are_a_sorted_union() {
        let tracker = offline_tracker();
        tracker.track_project("lib");
        tracker.track_project("app");

        let roots = tracker.desired_roots();
        assert_eq!(
            roots.included,
            vec![
                PathBuf::from("/work/app"),
                PathBuf::from("/work/lib"),
                PathBuf::from("/work/shared"),
            ]
        );
        assert_eq!(roots.excluded, vec![PathBuf::from("/work/app/build")]);
        assert_eq!(roots.package_roots.len(), 1);
    }

    #[test]
    fn tracking_is_idempotent() {
        let tracker = offline_tracker();
        assert!(tracker.track_project("app"));
        assert!(!tracker.track_project("app"));
        assert!(tracker.untrack_project("app"));
        assert!(!tracker.untrack_project("app"));
        assert!(tracker.desired_roots().included.is_empty());
    }

    #[tokio::test]
    async fn failed_update_keeps_committed_roots() {
        let tracker = offline_tracker();
        tracker.track_project("app");

        assert!(tracker.update_roots().await.is_err());
        assert_eq!(tracker.committed_roots(), SetRootsParams::default());
    }

    #[tokio::test]
    async fn update_commits_on_ack_and_skips_unchanged() {
        let (client, engine) = connected_client().await;
        let tracker = ProjectRootTracker::new(provider(), client, Duration::from_millis(10));
        tracker.track_project("app");

        assert!(tracker.update_roots().await.unwrap());
        assert_eq!(tracker.committed_roots(), tracker.desired_roots());
        assert!(!tracker.update_roots().await.unwrap());
        assert_eq!(engine.set_roots_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unacknowledged_update_is_retried() {
        let (client, engine) = connected_client().await;
        let tracker = ProjectRootTracker::new(provider(), client, Duration::from_millis(10));
        tracker.track_project("app");

        engine.reject.store(true, Ordering::SeqCst);
        let err = tracker.update_roots().await.unwrap_err();
        assert!(matches!(err, ClientError::Request(ref e) if e.is_timeout()));
        assert_eq!(tracker.committed_roots(), SetRootsParams::default());

        engine.reject.store(false, Ordering::SeqCst);
        assert!(tracker.update_roots().await.unwrap());
        assert_eq!(engine.set_roots_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reset_resends_roots() {
        let (client, engine) = connected_client().await;
        let tracker = ProjectRootTracker::new(provider(), client, Duration::from_millis(10));
        tracker.track_project("app");
        tracker.update_roots().await.unwrap();

        tracker.reset();
        assert!(tracker.update_roots().await.unwrap());
        assert_eq!(engine.set_roots_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn host_changes_are_debounced() {
        let (client, engine) = connected_client().await;
        let tracker = Arc::new(ProjectRootTracker::new(
            provider(),
            client,
            Duration::from_millis(50),
        ));
        tracker.track_project("app");

        tracker.host_roots_changed();
        tracker.host_roots_changed();
        tracker.track_project("lib");
        tracker.host_roots_changed();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(engine.set_roots_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.committed_roots().included.len(), 3);
    }

    #[tokio::test]
    async fn host_change_waits_for_unanswered_roots() {
        let (launcher, mut endpoints) = LoopbackLauncher::new();
        let settings = Settings {
            set_roots_timeout_ms: 2_000,
            ..Settings::default()
        };
        let (client, _events) = AnalysisClient::new(settings, Arc::new(launcher));
        let client = Arc::new(client);
        let accept = async {
            let endpoint = endpoints.recv().await.unwrap();
            endpoint.connected().await;
            endpoint
        };
        let (started, mut endpoint) = tokio::join!(client.start(), accept);
        started.unwrap();

        let tracker = Arc::new(ProjectRootTracker::new(
            provider(),
            client,
            Duration::from_millis(10),
        ));
        tracker.track_project("app");
        tracker.host_roots_changed();
        let first = endpoint.recv().await.unwrap();
        assert_eq!(first["method"], METHOD_SET_ROOTS);

        // A second change while the engine sits on the first set
        tracker.track_project("lib");
        tracker.host_roots_changed();
        let early = tokio::time::timeout(Duration::from_millis(100), endpoint.recv()).await;
        assert!(early.is_err(), "second setRoots sent before the first was answered");

        let id = RequestId::from_json(&first).unwrap();
        endpoint.respond(id, json!({})).await;

        let second = endpoint.recv().await.unwrap();
        assert_eq!(second["method"], METHOD_SET_ROOTS);
        assert_eq!(second["params"]["included"].as_array().unwrap().len(), 3);
        let id = RequestId::from_json(&second).unwrap();
        endpoint.respond(id, json!({})).await;

        for _ in 0..200 {
            if tracker.committed_roots().included.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.committed_roots().included.len(), 3);
    }
}
