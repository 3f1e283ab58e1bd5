//! In-memory watcher for driving the registry from tests

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{channels, FsEvent, FsEventKind, WatchSinks, WatchStreams, Watcher};
use crate::core::sync::handle_mutex_poison;
use crate::plugin::error::{PluginError, PluginResult};

/// Records registrations and lets the caller inject events and errors
pub struct MockWatcher {
    watched: Mutex<BTreeSet<PathBuf>>,
    rejected: Mutex<BTreeSet<PathBuf>>,
    sinks: WatchSinks,
    closes: AtomicUsize,
}

fn lock_error(message: String) -> PluginError {
    PluginError::Watch { message }
}

fn inspect<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockWatcher {
    pub fn new() -> (Self, WatchStreams) {
        let (sinks, streams) = channels();
        let watcher = Self {
            watched: Mutex::new(BTreeSet::new()),
            rejected: Mutex::new(BTreeSet::new()),
            sinks,
            closes: AtomicUsize::new(0),
        };
        (watcher, streams)
    }

    /// Paths currently registered, sorted
    pub fn watched(&self) -> Vec<PathBuf> {
        inspect(&self.watched).iter().cloned().collect()
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        inspect(&self.watched).contains(path)
    }

    /// Make later `add` calls for `path` fail.
    pub fn reject(&self, path: impl Into<PathBuf>) {
        inspect(&self.rejected).insert(path.into());
    }

    pub fn send_event(&self, path: impl Into<PathBuf>, kind: FsEventKind) {
        let _ = self.sinks.events.send(FsEvent::new(path, kind));
    }

    pub fn send_error(&self, message: impl Into<String>) {
        let _ = self.sinks.errors.send(PluginError::Watch {
            message: message.into(),
        });
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }
}

impl Watcher for MockWatcher {
    fn add(&self, path: &Path) -> PluginResult<()> {
        if handle_mutex_poison(self.rejected.lock(), lock_error)?.contains(path) {
            return Err(PluginError::Watch {
                message: format!("cannot watch {}", path.display()),
            });
        }
        handle_mutex_poison(self.watched.lock(), lock_error)?.insert(path.to_path_buf());
        Ok(())
    }

    fn remove(&self, path: &Path) -> PluginResult<()> {
        handle_mutex_poison(self.watched.lock(), lock_error)?.remove(path);
        Ok(())
    }

    fn close(&self) -> PluginResult<()> {
        self.closes.fetch_add(1, Ordering::AcqRel);
        handle_mutex_poison(self.watched.lock(), lock_error)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_watches_and_forwards_events() {
        let (watcher, mut streams) = MockWatcher::new();
        watcher.add(Path::new("/r")).unwrap();
        watcher.add(Path::new("/r/a.sock")).unwrap();
        assert_eq!(
            watcher.watched(),
            vec![PathBuf::from("/r"), PathBuf::from("/r/a.sock")]
        );

        watcher.remove(Path::new("/r/a.sock")).unwrap();
        assert!(!watcher.is_watched(Path::new("/r/a.sock")));

        watcher.send_event("/r/b.sock", FsEventKind::Create);
        watcher.send_error("queue overflow");
        assert_eq!(
            streams.events.recv().await,
            Some(FsEvent::new("/r/b.sock", FsEventKind::Create))
        );
        assert!(matches!(
            streams.errors.recv().await,
            Some(PluginError::Watch { .. })
        ));
    }

    #[test]
    fn test_rejected_paths_fail_to_register() {
        let (watcher, _streams) = MockWatcher::new();
        watcher.reject("/r");
        assert!(watcher.add(Path::new("/r")).is_err());
        assert!(watcher.watched().is_empty());
    }

    #[test]
    fn test_close_clears_and_counts() {
        let (watcher, _streams) = MockWatcher::new();
        watcher.add(Path::new("/r")).unwrap();
        watcher.close().unwrap();
        assert!(watcher.watched().is_empty());
        assert_eq!(watcher.close_count(), 1);
    }
}
