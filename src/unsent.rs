//! Bookkeeping for local edits the analysis engine has not seen yet.
//!
//! Every local edit bumps a per-file generation. A content sync captures
//! the generation of each file it sends; once the batch is out, only files
//! whose generation has not moved since are considered clean again.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, Copy)]
struct FileSyncState {
    /// Bumped on every local edit
    generation: u64,
    /// Generation carried by the overlay the engine currently holds
    sent_generation: Option<u64>,
    dirty: bool,
}

/// A file and the edit generation captured when it was put into a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub file: PathBuf,
    pub generation: u64,
}

/// Files to overlay and files to hand back to the disk in one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayPlan {
    pub add: Vec<SentFile>,
    pub remove: Vec<SentFile>,
}

impl OverlayPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len()
    }
}

#[derive(Debug, Default)]
pub struct UnsentChangesTracker {
    files: HashMap<PathBuf, FileSyncState>,
}

impl UnsentChangesTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local edit. Returns the new generation of the file.
    pub fn mark_dirty(&mut self, file: &Path) -> u64 {
        let state = self.files.entry(file.to_path_buf()).or_default();
        state.generation += 1;
        state.dirty = true;
        state.generation
    }

    pub fn is_dirty(&self, file: &Path) -> bool {
        self.files.get(file).is_some_and(|state| state.dirty)
    }

    pub fn dirty_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(_, state)| state.dirty)
            .map(|(file, _)| file.clone())
            .collect();
        files.sort();
        files
    }

    /// Work out which overlays the next sync has to send.
    ///
    /// Open files with edits the engine has not received get an `add`;
    /// files the engine still overlays but the host has closed get a
    /// `remove`.
    pub fn plan_overlays(&self, open_files: &HashSet<PathBuf>) -> OverlayPlan {
        let mut plan = OverlayPlan::default();
        for (file, state) in &self.files {
            let sent_file = SentFile {
                file: file.clone(),
                generation: state.generation,
            };
            if open_files.contains(file) {
                if state.generation > 0 && state.sent_generation != Some(state.generation) {
                    plan.add.push(sent_file);
                }
            } else if state.sent_generation.is_some() {
                plan.remove.push(sent_file);
            }
        }
        plan.add.sort_by(|a, b| a.file.cmp(&b.file));
        plan.remove.sort_by(|a, b| a.file.cmp(&b.file));
        plan
    }

    /// Clear the dirty flag of every file in a batch that was sent.
    ///
    /// A file edited again after the batch was planned stays dirty. Must
    /// only be called once the batch is out; a failed send leaves every
    /// flag as it was. The recorded sent generation never moves backwards,
    /// so clearing an older batch after a newer one changes nothing.
    pub fn clear_all(&mut self, sent: &OverlayPlan) {
        for entry in &sent.add {
            if let Some(state) = self.files.get_mut(&entry.file) {
                if state.sent_generation.is_some_and(|g| g > entry.generation) {
                    continue;
                }
                state.sent_generation = Some(entry.generation);
                if state.generation == entry.generation {
                    state.dirty = false;
                }
            }
        }
        for entry in &sent.remove {
            if let Some(state) = self.files.get_mut(&entry.file) {
                if state.sent_generation.is_some_and(|g| g > entry.generation) {
                    continue;
                }
                state.sent_generation = None;
                if state.generation == entry.generation {
                    state.dirty = false;
                }
            }
        }
        self.files
            .retain(|_, state| state.dirty || state.sent_generation.is_some());
    }

    /// Forget what the engine holds, e.g. after it restarted.
    ///
    /// Dirty flags stay; every edited open file is resent by the next sync.
    pub fn reset_overlays(&mut self) {
        for state in self.files.values_mut() {
            if state.sent_generation.take().is_some() {
                state.dirty = true;
            }
        }
    }
}
