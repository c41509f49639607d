//! The editor side of the cache.
//!
//! The cache asks the host for buffer contents when it syncs, and tells the
//! host when annotations changed or the engine went away.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::LockResultExt;

pub trait Host: Send + Sync {
    /// Current in-memory text of an open file.
    fn current_content(&self, file: &Path) -> Option<String>;

    fn open_files(&self) -> HashSet<PathBuf>;

    /// New annotations were accepted for `file`.
    fn request_rerender(&self, file: &Path);

    /// The engine connection failed. Cached annotations stay queryable but
    /// may be outdated.
    fn connection_degraded(&self, message: &str);
}

#[derive(Debug, Default)]
struct MemoryHostState {
    buffers: HashMap<PathBuf, String>,
    rerenders: Vec<PathBuf>,
    degraded: Vec<String>,
}

/// A headless host keeping buffers in memory and recording callbacks.
#[derive(Debug, Default)]
pub struct MemoryHost {
    state: Mutex<MemoryHostState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, file: impl Into<PathBuf>, content: impl Into<String>) {
        self.state
            .lock()
            .recover_poison("MemoryHost::open")
            .buffers
            .insert(file.into(), content.into());
    }

    pub fn close(&self, file: &Path) -> bool {
        self.state
            .lock()
            .recover_poison("MemoryHost::close")
            .buffers
            .remove(file)
            .is_some()
    }

    /// Replace `old_length` characters at character `offset` with `text`.
    ///
    /// Returns false if the file is not open or the range is out of bounds.
    pub fn replace(&self, file: &Path, offset: usize, old_length: usize, text: &str) -> bool {
        let mut state = self.state.lock().recover_poison("MemoryHost::replace");
        let Some(buffer) = state.buffers.get_mut(file) else {
            return false;
        };
        let Some(start) = char_to_byte(buffer, offset) else {
            return false;
        };
        let Some(end) = char_to_byte(buffer, offset + old_length) else {
            return false;
        };
        buffer.replace_range(start..end, text);
        true
    }

    /// Files passed to `request_rerender` since the last call.
    pub fn take_rerenders(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.state.lock().recover_poison("MemoryHost::take_rerenders").rerenders)
    }

    pub fn degraded_messages(&self) -> Vec<String> {
        self.state
            .lock()
            .recover_poison("MemoryHost::degraded_messages")
            .degraded
            .clone()
    }
}

fn char_to_byte(text: &str, offset: usize) -> Option<usize> {
    if offset == text.chars().count() {
        return Some(text.len());
    }
    text.char_indices().nth(offset).map(|(byte, _)| byte)
}

impl Host for MemoryHost {
    fn current_content(&self, file: &Path) -> Option<String> {
        self.state
            .lock()
            .recover_poison("MemoryHost::current_content")
            .buffers
            .get(file)
            .cloned()
    }

    fn open_files(&self) -> HashSet<PathBuf> {
        self.state
            .lock()
            .recover_poison("MemoryHost::open_files")
            .buffers
            .keys()
            .cloned()
            .collect()
    }

    fn request_rerender(&self, file: &Path) {
        self.state
            .lock()
            .recover_poison("MemoryHost::request_rerender")
            .rerenders
            .push(file.to_path_buf());
    }

    fn connection_degraded(&self, message: &str) {
        self.state
            .lock()
            .recover_poison("MemoryHost::connection_degraded")
            .degraded
            .push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_edits_by_character_offset() {
        let host = MemoryHost::new();
        host.open("a.txt", "héllo");

        assert!(host.replace(Path::new("a.txt"), 1, 1, "e"));
        assert_eq!(host.current_content(Path::new("a.txt")).unwrap(), "hello");

        assert!(host.replace(Path::new("a.txt"), 5, 0, "!"));
        assert_eq!(host.current_content(Path::new("a.txt")).unwrap(), "hello!");
    }

    #[test]
    fn replace_rejects_out_of_range() {
        let host = MemoryHost::new();
        host.open("a.txt", "abc");
        assert!(!host.replace(Path::new("a.txt"), 2, 5, ""));
        assert!(!host.replace(Path::new("b.txt"), 0, 0, "x"));
    }

    #[test]
    fn records_callbacks() {
        let host = MemoryHost::new();
        host.request_rerender(Path::new("a.txt"));
        host.connection_degraded("gone");

        assert_eq!(host.take_rerenders(), vec![PathBuf::from("a.txt")]);
        assert!(host.take_rerenders().is_empty());
        assert_eq!(host.degraded_messages(), vec!["gone".to_string()]);
    }

    #[test]
    fn open_files_follow_open_and_close() {
        let host = MemoryHost::new();
        host.open("a.txt", "");
        host.open("b.txt", "");
        assert!(host.close(Path::new("a.txt")));
        assert_eq!(host.open_files(), HashSet::from([PathBuf::from("b.txt")]));
    }
}
