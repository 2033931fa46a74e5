use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub path: PathBuf,
    pub completed: u64,
    pub total: u64,
}

#[derive(Debug)]
struct Counter {
    completed: AtomicU64,
    total: u64,
}

/// Bytes completed per in-flight file, readable from any task.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    files: Mutex<HashMap<PathBuf, Arc<Counter>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file; it stays visible until the handle is dropped.
    pub fn start(self: &Arc<Self>, path: &Path, total: u64) -> ProgressHandle {
        let counter = Arc::new(Counter {
            completed: AtomicU64::new(0),
            total,
        });
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), Arc::clone(&counter));
        ProgressHandle {
            tracker: Arc::clone(self),
            path: path.to_path_buf(),
            counter,
        }
    }

    pub fn in_flight(&self) -> Vec<FileProgress> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let mut progress: Vec<FileProgress> = files
            .iter()
            .map(|(path, counter)| FileProgress {
                path: path.clone(),
                completed: counter.completed.load(Ordering::Relaxed),
                total: counter.total,
            })
            .collect();
        progress.sort_by(|a, b| a.path.cmp(&b.path));
        progress
    }
}

pub struct ProgressHandle {
    tracker: Arc<ProgressTracker>,
    path: PathBuf,
    counter: Arc<Counter>,
}

impl ProgressHandle {
    pub fn advance(&self, bytes: u64) {
        self.counter.completed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Restarts the count, e.g. when a restore moves to another location.
    pub fn reset(&self) {
        self.counter.completed.store(0, Ordering::Relaxed);
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        let mut files = self.tracker.files.lock().unwrap_or_else(|e| e.into_inner());
        if files.get(&self.path).is_some_and(|c| Arc::ptr_eq(c, &self.counter)) {
            files.remove(&self.path);
        }
    }
}
