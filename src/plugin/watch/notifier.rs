//! Watcher backed by the platform notification API (inotify, kqueue, ...)

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::Path;
use std::sync::Mutex;

use super::{channels, FsEvent, FsEventKind, WatchSinks, WatchStreams, Watcher};
use crate::core::sync::handle_mutex_poison;
use crate::plugin::error::{PluginError, PluginResult};

pub struct NotifyWatcher {
    inner: Mutex<Option<RecommendedWatcher>>,
}

impl NotifyWatcher {
    pub fn new() -> PluginResult<(Self, WatchStreams)> {
        let (sinks, streams) = channels();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            forward(&sinks, res)
        })
        .map_err(watch_error)?;

        Ok((
            Self {
                inner: Mutex::new(Some(watcher)),
            },
            streams,
        ))
    }
}

fn forward(sinks: &WatchSinks, res: notify::Result<notify::Event>) {
    match res {
        Ok(event) => {
            for fs_event in translate(event) {
                let _ = sinks.events.send(fs_event);
            }
        }
        Err(err) => {
            let _ = sinks.errors.send(watch_error(err));
        }
    }
}

fn watch_error(err: notify::Error) -> PluginError {
    PluginError::Watch {
        message: err.to_string(),
    }
}

/// Map a backend event onto one [`FsEvent`] per affected path.
pub(crate) fn translate(event: notify::Event) -> Vec<FsEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FsEventKind::Create,
        EventKind::Remove(_) => FsEventKind::Remove,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FsEventKind::Create,
        EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::Any)) => {
            FsEventKind::Rename
        }
        // inotify already reported the From and To halves separately
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Vec::new(),
        EventKind::Modify(ModifyKind::Metadata(_)) => FsEventKind::Chmod,
        EventKind::Modify(ModifyKind::Data(_)) => FsEventKind::Write,
        EventKind::Access(_) => return Vec::new(),
        _ => FsEventKind::Other,
    };

    event
        .paths
        .into_iter()
        .map(|path| FsEvent { path, kind })
        .collect()
}

impl Watcher for NotifyWatcher {
    fn add(&self, path: &Path) -> PluginResult<()> {
        let mut guard = handle_mutex_poison(self.inner.lock(), |message| PluginError::Watch {
            message,
        })?;
        match guard.as_mut() {
            Some(watcher) => watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(watch_error),
            None => Err(PluginError::Closed),
        }
    }

    fn remove(&self, path: &Path) -> PluginResult<()> {
        let mut guard = handle_mutex_poison(self.inner.lock(), |message| PluginError::Watch {
            message,
        })?;
        let Some(watcher) = guard.as_mut() else {
            return Ok(());
        };
        match watcher.unwatch(path) {
            Ok(()) => Ok(()),
            // the kernel drops watches on deleted paths by itself
            Err(err) if matches!(err.kind, notify::ErrorKind::WatchNotFound) => Ok(()),
            Err(err) => Err(watch_error(err)),
        }
    }

    fn close(&self) -> PluginResult<()> {
        let mut guard = handle_mutex_poison(self.inner.lock(), |message| PluginError::Watch {
            message,
        })?;
        drop(guard.take());
        Ok(())
    }
}
