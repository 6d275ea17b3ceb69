use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use tracing::{debug, warn};

/// Non-recursive directory watch whose change reports are polled from the
/// event loop instead of delivered on the watcher's thread.
pub(crate) struct DirectoryWatch {
    watcher: RecommendedWatcher,
    changes: Receiver<PathBuf>,
    watched: Vec<PathBuf>,
}

impl DirectoryWatch {
    pub fn new() -> notify::Result<Self> {
        let (tx, changes) = mpsc::channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                // Our own scans open the directory; only content changes count
                if !(event.kind.is_create() || event.kind.is_remove() || event.kind.is_modify()) {
                    return;
                }
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
            Err(e) => warn!("Watch error: {e}"),
        })?;

        Ok(Self {
            watcher,
            changes,
            watched: Vec::new(),
        })
    }

    /// Start watching `path` if it exists. Returns whether it is now watched.
    pub fn watch(&mut self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.watched.contains(&path) {
            return true;
        }

        match self.watcher.watch(&path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                debug!("Monitoring directory: {}", path.display());
                self.watched.push(path);
                true
            }
            Err(e) => {
                warn!("Cannot watch {}: {e}", path.display());
                false
            }
        }
    }

    pub fn unwatch(&mut self, path: &Path) {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Some(index) = self.watched.iter().position(|p| *p == path) {
            self.watched.remove(index);
            if let Err(e) = self.watcher.unwatch(&path) {
                debug!("Unwatch {} failed: {e}", path.display());
            }
        }
    }

    pub fn unwatch_all(&mut self) {
        for path in std::mem::take(&mut self.watched) {
            let _ = self.watcher.unwatch(&path);
        }
    }

    /// Paths reported changed since the last call.
    pub fn changed_paths(&mut self) -> Vec<PathBuf> {
        self.changes.try_iter().collect()
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

impl fmt::Debug for DirectoryWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatch")
            .field("watched", &self.watched)
            .finish_non_exhaustive()
    }
}
