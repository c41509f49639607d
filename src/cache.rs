//! The annotation cache.
//!
//! Combines the region store, edit projection and unsent-change gating with
//! the engine client. Local edits are projected immediately; engine pushes
//! are accepted only for files without unsent edits.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::engine::protocol::{
    AnalysisError, AnalysisErrorFixes, ContentOverlay, ErrorsResult, FixesResult, FormatResult,
    METHOD_FORMAT, METHOD_GET_ERRORS, METHOD_GET_FIXES, UpdateContentParams,
};
use crate::engine::{
    AnalysisClient, ClientEvent, EngineNotification, EngineRequest, RequestId, RequestKind,
    RequestTracker,
};
use crate::error::{ClientError, LockResultExt, RequestError};
use crate::host::Host;
use crate::region::{EditEvent, Region, RegionKind, RegionList, RegionStore};
use crate::unsent::UnsentChangesTracker;

const LOG_TARGET: &str = "annocache::cache";

#[derive(Debug, Default)]
struct CacheState {
    store: RegionStore,
    unsent: UnsentChangesTracker,
    errors: HashMap<PathBuf, Vec<AnalysisError>>,
}

pub struct AnnotationCache {
    /// Every mutation of regions and dirty flags goes through this lock
    state: Mutex<CacheState>,
    host: Arc<dyn Host>,
    client: Arc<AnalysisClient>,
    requests: RequestTracker,
    /// Held from planning a batch until its flags are cleared
    sync_lock: tokio::sync::Mutex<()>,
}

impl AnnotationCache {
    pub fn new(host: Arc<dyn Host>, client: Arc<AnalysisClient>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            host,
            client,
            requests: RequestTracker::new(),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn client(&self) -> &Arc<AnalysisClient> {
        &self.client
    }

    // ------------------------------------------------------------------
    // Local edits
    // ------------------------------------------------------------------

    /// Apply a buffer change before returning.
    ///
    /// Marks the file dirty and moves its regions along with the edit.
    pub fn on_local_edit(&self, edit: &EditEvent) {
        let mut state = self.state.lock().recover_poison("AnnotationCache::on_local_edit");
        let generation = state.unsent.mark_dirty(&edit.file);
        let changed = state.store.apply_edit(edit);
        trace!(
            target: LOG_TARGET,
            "Edit at {} ({} -> {}) in {}, generation {}, regions changed: {}",
            edit.offset,
            edit.old_length,
            edit.new_length,
            edit.file.display(),
            generation,
            changed
        );
    }

    pub fn is_dirty(&self, file: &Path) -> bool {
        self.state
            .lock()
            .recover_poison("AnnotationCache::is_dirty")
            .unsent
            .is_dirty(file)
    }

    /// Forget which overlays the engine holds. Called after the engine
    /// (re)started so every edited open file is sent again.
    pub fn on_engine_connected(&self) {
        self.state
            .lock()
            .recover_poison("AnnotationCache::on_engine_connected")
            .unsent
            .reset_overlays();
    }

    // ------------------------------------------------------------------
    // Engine pushes
    // ------------------------------------------------------------------

    pub fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Notification(notification) => self.handle_notification(notification),
            ClientEvent::LateResponse {
                id,
                request,
                result,
            } => self.on_late_response(id, request, result),
            ClientEvent::Degraded { message } => self.host.connection_degraded(&message),
        }
    }

    pub fn handle_notification(&self, notification: EngineNotification) {
        match notification {
            EngineNotification::Highlights { file, regions } => {
                self.on_highlights(&file, regions.into_iter().map(Region::from).collect());
            }
            EngineNotification::Navigation { file, regions } => {
                self.on_navigation(&file, regions.into_iter().map(Region::from).collect());
            }
            EngineNotification::Overrides { file, overrides } => {
                self.on_overrides(&file, overrides.into_iter().map(Region::from).collect());
            }
            EngineNotification::Implemented {
                file,
                classes,
                members,
            } => {
                self.on_implemented(
                    &file,
                    classes.into_iter().map(Region::from).collect(),
                    members.into_iter().map(Region::from).collect(),
                );
            }
            EngineNotification::Flushed { files } => self.on_flushed(&files),
            EngineNotification::Connected { .. } | EngineNotification::ServerError { .. } => {
                debug!(target: LOG_TARGET, "Ignoring connection notification");
            }
        }
    }

    pub fn on_highlights(&self, file: &Path, regions: Vec<Region>) -> bool {
        self.accept_push(file, vec![(RegionKind::Highlight, regions)])
    }

    pub fn on_navigation(&self, file: &Path, regions: Vec<Region>) -> bool {
        self.accept_push(file, vec![(RegionKind::Navigation, regions)])
    }

    pub fn on_overrides(&self, file: &Path, regions: Vec<Region>) -> bool {
        self.accept_push(file, vec![(RegionKind::Override, regions)])
    }

    pub fn on_implemented(&self, file: &Path, classes: Vec<Region>, members: Vec<Region>) -> bool {
        self.accept_push(
            file,
            vec![
                (RegionKind::ImplementedClass, classes),
                (RegionKind::ImplementedMember, members),
            ],
        )
    }

    /// Install pushed lists unless the file has unsent edits.
    ///
    /// Returns true if anything visible changed; the host is asked to
    /// re-render once in that case.
    fn accept_push(&self, file: &Path, updates: Vec<(RegionKind, Vec<Region>)>) -> bool {
        let mut lists = Vec::with_capacity(updates.len());
        for (kind, regions) in updates {
            match RegionList::from_engine(regions) {
                Some(list) => lists.push((kind, list)),
                None => {
                    warn!(
                        target: LOG_TARGET,
                        "Dropping malformed {} push for {}: regions overlap or are out of order",
                        kind,
                        file.display()
                    );
                    return false;
                }
            }
        }

        let changed = {
            let mut state = self.state.lock().recover_poison("AnnotationCache::accept_push");
            if state.unsent.is_dirty(file) {
                debug!(
                    target: LOG_TARGET,
                    "Dropping push for {}: local edits not yet sent",
                    file.display()
                );
                return false;
            }
            lists.into_iter().fold(false, |changed, (kind, list)| {
                state.store.replace(file, kind, list) || changed
            })
        };

        if changed {
            self.host.request_rerender(file);
        }
        changed
    }

    /// Drop engine results for `files`. Dirty flags are kept.
    pub fn on_flushed(&self, files: &[PathBuf]) {
        let removed: Vec<&PathBuf> = {
            let mut state = self.state.lock().recover_poison("AnnotationCache::on_flushed");
            files
                .iter()
                .filter(|file| {
                    let errors = state.errors.remove(file.as_path()).is_some();
                    state.store.remove_file(file) || errors
                })
                .collect()
        };
        for file in removed {
            debug!(target: LOG_TARGET, "Flushed results for {}", file.display());
            self.host.request_rerender(file);
        }
    }

    /// Drop everything cached for a closed file.
    ///
    /// Requests still in flight for it are not cancelled; their answers are
    /// discarded when they arrive.
    pub fn remove_file(&self, file: &Path) {
        {
            let mut state = self.state.lock().recover_poison("AnnotationCache::remove_file");
            state.store.remove_file(file);
            state.errors.remove(file);
        }
        self.requests.cancel_all_for_file(file);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot of one list; empty if there is none.
    pub fn regions(&self, file: &Path, kind: RegionKind) -> RegionList {
        self.state
            .lock()
            .recover_poison("AnnotationCache::regions")
            .store
            .get(file, kind)
    }

    pub fn lookup_at(
        &self,
        file: &Path,
        kind: RegionKind,
        offset: usize,
        length: usize,
    ) -> Option<Region> {
        self.state
            .lock()
            .recover_poison("AnnotationCache::lookup_at")
            .store
            .lookup_at(file, kind, offset, length)
    }

    pub fn regions_in_range(&self, file: &Path, kind: RegionKind, range: Range<usize>) -> Vec<Region> {
        self.state
            .lock()
            .recover_poison("AnnotationCache::regions_in_range")
            .store
            .range_scan(file, kind, range)
            .cloned()
            .collect()
    }

    /// Errors from the newest `getErrors` answer for `file`.
    pub fn cached_errors(&self, file: &Path) -> Vec<AnalysisError> {
        self.state
            .lock()
            .recover_poison("AnnotationCache::cached_errors")
            .errors
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Engine requests
    // ------------------------------------------------------------------

    /// Send overlays for edited open files and removals for closed ones.
    ///
    /// Returns the number of files in the batch. Dirty flags are cleared
    /// only after the batch is handed to the transport. Concurrent calls
    /// run one after another, so batches reach the engine in plan order.
    pub async fn sync_content(&self) -> Result<usize, ClientError> {
        let _serial = self.sync_lock.lock().await;
        let open_files = self.host.open_files();
        let mut plan = self
            .state
            .lock()
            .recover_poison("AnnotationCache::sync_content")
            .unsent
            .plan_overlays(&open_files);
        if plan.is_empty() {
            return Ok(0);
        }

        let mut params = UpdateContentParams::default();
        plan.add
            .retain(|entry| match self.host.current_content(&entry.file) {
                Some(content) => {
                    params
                        .files
                        .insert(entry.file.clone(), ContentOverlay::Add { content });
                    true
                }
                None => {
                    debug!(
                        target: LOG_TARGET,
                        "No content for {}, leaving it out of the batch",
                        entry.file.display()
                    );
                    false
                }
            });
        for entry in &plan.remove {
            params.files.insert(entry.file.clone(), ContentOverlay::Remove);
        }
        if params.files.is_empty() {
            return Ok(0);
        }

        self.client.update_content(&params).await?;
        self.state
            .lock()
            .recover_poison("AnnotationCache::sync_content")
            .unsent
            .clear_all(&plan);
        Ok(plan.len())
    }

    /// Ask the engine for the errors in `file`.
    ///
    /// The answer also replaces the cached errors, unless a newer request
    /// for the same file was issued meanwhile. After a timeout the answer
    /// is still installed when it arrives.
    pub async fn get_errors(&self, file: &Path) -> Result<Option<Vec<AnalysisError>>, RequestError> {
        let id = self.client.allocate_request_id();
        self.requests.start_request(file, RequestKind::Errors, id);

        let request = EngineRequest::GetErrors {
            file: file.to_path_buf(),
        };
        let timeout = self.client.settings().get_errors_timeout();
        let value = match self.client.request_bounded(id, request, timeout).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.requests.finish_request(file, RequestKind::Errors, id);
                return Ok(None);
            }
            Err(err) => {
                // A timed-out request stays tracked for its late answer
                if err.is_cancelled() {
                    self.requests.finish_request(file, RequestKind::Errors, id);
                }
                return Err(err);
            }
        };

        let errors = decode::<ErrorsResult>(METHOD_GET_ERRORS, value).map(|r| r.errors);
        match &errors {
            Some(errors) => {
                self.install_errors(file, id, errors.clone());
            }
            None => self.requests.finish_request(file, RequestKind::Errors, id),
        }
        Ok(errors)
    }

    pub async fn get_fixes(
        &self,
        file: &Path,
        offset: usize,
    ) -> Result<Option<Vec<AnalysisErrorFixes>>, RequestError> {
        let request = EngineRequest::GetFixes {
            file: file.to_path_buf(),
            offset,
        };
        let timeout = self.client.settings().get_fixes_timeout();
        let value = self.client.request(request, timeout).await?;
        Ok(value
            .and_then(|value| decode::<FixesResult>(METHOD_GET_FIXES, value))
            .map(|r| r.fixes))
    }

    pub async fn format(
        &self,
        file: &Path,
        selection_offset: usize,
        selection_length: usize,
    ) -> Result<Option<FormatResult>, RequestError> {
        let request = EngineRequest::Format {
            file: file.to_path_buf(),
            selection_offset,
            selection_length,
        };
        let timeout = self.client.settings().format_timeout();
        let value = self.client.request(request, timeout).await?;
        Ok(value.and_then(|value| decode::<FormatResult>(METHOD_FORMAT, value)))
    }

    fn install_errors(&self, file: &Path, id: RequestId, errors: Vec<AnalysisError>) -> bool {
        let mut state = self.state.lock().recover_poison("AnnotationCache::install_errors");
        if !self.requests.is_latest(file, RequestKind::Errors, id) {
            debug!(
                target: LOG_TARGET,
                "Dropping superseded errors {} for {}",
                id,
                file.display()
            );
            return false;
        }
        self.requests.finish_request(file, RequestKind::Errors, id);
        state.errors.insert(file.to_path_buf(), errors);
        true
    }

    fn on_late_response(&self, id: RequestId, request: EngineRequest, result: Value) {
        match request {
            EngineRequest::GetErrors { file } => {
                let Some(result) = decode::<ErrorsResult>(METHOD_GET_ERRORS, result) else {
                    return;
                };
                if self.install_errors(&file, id, result.errors) {
                    self.host.request_rerender(&file);
                }
            }
            other => {
                debug!(
                    target: LOG_TARGET,
                    "Late {} answer {} has no consumer",
                    other.method(),
                    id
                );
            }
        }
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Option<T> {
    serde_json::from_value(value)
        .map_err(|e| warn!(target: LOG_TARGET, "Malformed {} result: {}", method, e))
        .ok()
}
