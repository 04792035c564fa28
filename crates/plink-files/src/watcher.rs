//! Change-notification seam.
//!
//! Production embedders typically bridge inotify/kqueue/ReadDirectoryChangesW
//! into [`WatchEvent`]s; [`PollingWatcher`] is a portable fallback that diffs
//! periodic scans through the storage backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backend::{BoxedBackend, EntryStat};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Created { path: PathBuf, stat: EntryStat },
    Modified { path: PathBuf, stat: EntryStat },
    Deleted { path: PathBuf },
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created { path, .. }
            | WatchEvent::Modified { path, .. }
            | WatchEvent::Deleted { path } => path,
        }
    }
}

#[async_trait]
pub trait FilesystemWatcher: Send {
    /// Collect changes observed since the previous call.
    async fn drain(&mut self) -> Vec<WatchEvent>;
}

/// Snapshot-diff watcher over a physical root.
pub struct PollingWatcher {
    backend: BoxedBackend,
    root: PathBuf,
    snapshot: BTreeMap<PathBuf, EntryStat>,
    primed: bool,
}

impl PollingWatcher {
    pub fn new(backend: BoxedBackend, root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            root: root.into(),
            snapshot: BTreeMap::new(),
            primed: false,
        }
    }

    async fn scan(&self) -> BTreeMap<PathBuf, EntryStat> {
        let mut seen = BTreeMap::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match self.backend.listdir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for (name, stat) in entries {
                let path = dir.join(&name);
                if stat.is_dir {
                    stack.push(path.clone());
                }
                seen.insert(path, stat);
            }
        }
        seen
    }
}

#[async_trait]
impl FilesystemWatcher for PollingWatcher {
    async fn drain(&mut self) -> Vec<WatchEvent> {
        let current = self.scan().await;
        if !self.primed {
            // First scan only establishes the baseline.
            self.primed = true;
            self.snapshot = current;
            return Vec::new();
        }
        let mut events = Vec::new();
        for (path, stat) in &current {
            match self.snapshot.get(path) {
                None => events.push(WatchEvent::Created {
                    path: path.clone(),
                    stat: stat.clone(),
                }),
                Some(old) if old != stat => events.push(WatchEvent::Modified {
                    path: path.clone(),
                    stat: stat.clone(),
                }),
                Some(_) => {}
            }
        }
        for path in self.snapshot.keys() {
            if !current.contains_key(path) {
                events.push(WatchEvent::Deleted { path: path.clone() });
            }
        }
        self.snapshot = current;
        events
    }
}
