//! Filesystem change notification
//!
//! The registry registers directories and sockets with a [`Watcher`] and
//! consumes the resulting [`FsEvent`]s and errors from a [`WatchStreams`]
//! handed over when the watcher is built.

use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::plugin::error::{PluginError, PluginResult};

#[cfg(test)]
pub(crate) mod mock;
pub(crate) mod notifier;

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Remove,
    Rename,
    Chmod,
    Write,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FsEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Receiving side of a watcher
pub struct WatchStreams {
    pub events: mpsc::UnboundedReceiver<FsEvent>,
    pub errors: mpsc::UnboundedReceiver<PluginError>,
}

/// Sending side shared by watcher implementations
#[derive(Clone)]
pub(crate) struct WatchSinks {
    pub events: mpsc::UnboundedSender<FsEvent>,
    pub errors: mpsc::UnboundedSender<PluginError>,
}

pub(crate) fn channels() -> (WatchSinks, WatchStreams) {
    let (events_tx, events) = mpsc::unbounded_channel();
    let (errors_tx, errors) = mpsc::unbounded_channel();
    (
        WatchSinks {
            events: events_tx,
            errors: errors_tx,
        },
        WatchStreams { events, errors },
    )
}

pub trait Watcher: Send + Sync {
    /// Start watching `path` (not its descendants).
    fn add(&self, path: &Path) -> PluginResult<()>;

    /// Stop watching `path`. Unknown paths are not an error.
    fn remove(&self, path: &Path) -> PluginResult<()>;

    /// Stop all watches; no events are delivered afterwards.
    fn close(&self) -> PluginResult<()>;
}
