//! Tracks the newest bounded request per file so superseded answers can be
//! recognised.
//!
//! A second request for the same file and kind is never deduplicated; both
//! go out. When the older one completes (in time or late) its result is
//! dropped because a newer request now owns the slot.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::protocol::{RequestId, RequestKind};

#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    /// Maps (file, kind) to the most recently issued request ID
    active_requests: Arc<DashMap<(PathBuf, RequestKind), RequestId>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as the newest request for `file`, superseding any
    /// previous one.
    pub fn start_request(&self, file: &Path, kind: RequestKind, id: RequestId) {
        self.active_requests.insert((file.to_path_buf(), kind), id);
    }

    /// True if no newer request for the same file and kind was issued.
    pub fn is_latest(&self, file: &Path, kind: RequestKind, id: RequestId) -> bool {
        self.active_requests
            .get(&(file.to_path_buf(), kind))
            .is_some_and(|entry| *entry == id)
    }

    /// Stop tracking a request if it is still the newest one.
    pub fn finish_request(&self, file: &Path, kind: RequestKind, id: RequestId) {
        self.active_requests
            .remove_if(&(file.to_path_buf(), kind), |_, active| *active == id);
    }

    /// Forget every request for a file, e.g. when it is closed.
    pub fn cancel_all_for_file(&self, file: &Path) {
        self.active_requests.retain(|(tracked, _), _| tracked != file);
    }
}
