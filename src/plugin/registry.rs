//! Plugin Registry
//!
//! Discovers plugin sockets under a root directory and keeps one [`Plugin`]
//! per socket path. The initial scan runs while the registry is being built;
//! afterwards a single event-loop task applies filesystem events and plugin
//! lifecycle messages to the path map. Readers take the read lock and only
//! ever see handshaken plugins, one per identifier.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::sync::handle_mutex_poison;
use crate::core::version;
use crate::plugin::client::{HandshakeConfig, Lifecycle, Plugin, ProtocolSettings};
use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::fs::{EntryKind, Filesystem, LocalFilesystem};
use crate::plugin::transport::{Dialer, Metadata, TransportKind};
use crate::plugin::watch::notifier::NotifyWatcher;
use crate::plugin::watch::{FsEvent, FsEventKind, WatchStreams, Watcher};

/// Construction parameters for a [`Registry`]
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory tree searched for plugin sockets
    pub root: PathBuf,
    /// Version every plugin must report in its handshake
    pub api_version: String,
    /// Sent to every plugin as handshake parameters
    pub handshake_metadata: Metadata,
    pub protocol: ProtocolSettings,
    pub transport: TransportKind,
}

impl RegistryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            api_version: version::default_api_version().to_string(),
            handshake_metadata: Metadata::new(),
            protocol: ProtocolSettings::default(),
            transport: TransportKind::default(),
        }
    }
}

/// Collaborators the registry is built from
pub struct Components {
    pub watcher: Arc<dyn Watcher>,
    pub streams: WatchStreams,
    pub dialer: Arc<dyn Dialer>,
    pub filesystem: Arc<dyn Filesystem>,
}

fn lock_error(message: String) -> PluginError {
    PluginError::Watch { message }
}

struct Inner {
    root: PathBuf,
    handshake: Arc<HandshakeConfig>,
    watcher: Arc<dyn Watcher>,
    dialer: Arc<dyn Dialer>,
    filesystem: Arc<dyn Filesystem>,
    plugins: RwLock<HashMap<PathBuf, Arc<Plugin>>>,
    watched: Mutex<BTreeSet<PathBuf>>,
    lifecycle: mpsc::UnboundedSender<Lifecycle>,
    generation: AtomicU64,
}

/// Handshaken plugins in path order, keeping only the most recently
/// discovered claimant of each identifier.
fn visible(plugins: &HashMap<PathBuf, Arc<Plugin>>) -> Vec<Arc<Plugin>> {
    let mut handshaken: Vec<(&PathBuf, &Arc<Plugin>, String)> = plugins
        .iter()
        .filter_map(|(path, plugin)| plugin.id().map(|id| (path, plugin, id)))
        .collect();

    let mut winners: HashMap<String, u64> = HashMap::new();
    for (_, plugin, id) in &handshaken {
        let best = winners.entry(id.clone()).or_insert(plugin.generation());
        *best = (*best).max(plugin.generation());
    }
    handshaken.retain(|(_, plugin, id)| winners.get(id) == Some(&plugin.generation()));
    handshaken.sort_by(|a, b| a.0.cmp(b.0));
    handshaken
        .into_iter()
        .map(|(_, plugin, _)| plugin.clone())
        .collect()
}

fn sorted_children(filesystem: &dyn Filesystem, dir: &Path) -> Vec<PathBuf> {
    match filesystem.read_dir(dir) {
        Ok(mut children) => {
            children.sort();
            children
        }
        Err(e) => {
            log::warn!("plugins: cannot list {}: {}", dir.display(), e);
            Vec::new()
        }
    }
}

impl Inner {
    fn watch(&self, path: &Path) -> PluginResult<()> {
        self.watcher.add(path)?;
        handle_mutex_poison(self.watched.lock(), lock_error)?.insert(path.to_path_buf());
        Ok(())
    }

    /// Stat and watch the root, then discover everything beneath it.
    async fn scan_root(&self) -> PluginResult<()> {
        let root = self.root.as_path();
        let kind = self
            .filesystem
            .stat(root)
            .map_err(|e| PluginError::io("stat", root, e))?;
        self.watch(root)?;

        match kind {
            EntryKind::Directory => {
                let mut pending = sorted_children(self.filesystem.as_ref(), root);
                pending.reverse();
                self.discover(pending).await;
            }
            EntryKind::Socket => self.add_socket(root).await,
            EntryKind::Other => log::warn!("plugins: root {} holds no plugins", root.display()),
        }
        log::info!("plugins: scanned {}", root.display());
        Ok(())
    }

    /// Depth-first walk; `pending` is a stack, so the last path is visited
    /// first.
    async fn discover(&self, mut pending: Vec<PathBuf>) {
        while let Some(path) = pending.pop() {
            let kind = match self.filesystem.stat(&path) {
                Ok(kind) => kind,
                Err(e) => {
                    log::debug!("plugins: skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            match kind {
                EntryKind::Directory => {
                    if let Err(e) = self.watch(&path) {
                        log::warn!("plugins: cannot watch {}: {}", path.display(), e);
                    }
                    let children = sorted_children(self.filesystem.as_ref(), &path);
                    pending.extend(children.into_iter().rev());
                }
                EntryKind::Socket => self.add_socket(&path).await,
                EntryKind::Other => log::debug!("plugins: ignoring {}", path.display()),
            }
        }
    }

    async fn add_socket(&self, path: &Path) {
        if let Err(e) = self.watch(path) {
            log::warn!("plugins: cannot watch {}: {}", path.display(), e);
        }
        if self.plugins.read().await.contains_key(path) {
            log::warn!(
                "plugins: conflicting plugin at {}, keeping the one already tracked",
                path.display()
            );
            return;
        }

        let transport = match self
            .dialer
            .dial(path, self.handshake.settings.connect_timeout)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                log::warn!("plugins: cannot connect to {}: {}", path.display(), e);
                return;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let plugin = Plugin::spawn(
            path.to_path_buf(),
            generation,
            transport,
            self.handshake.clone(),
            Some(self.lifecycle.clone()),
        );

        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(path) {
            log::warn!(
                "plugins: conflicting plugin at {}, keeping the one already tracked",
                path.display()
            );
            plugin.close();
            return;
        }
        plugins.insert(path.to_path_buf(), plugin);
        log::info!("plugins: tracking {}", path.display());
    }

    /// Release the watch on `path` and on everything beneath it.
    fn unwatch(&self, path: &Path) {
        let unwatched: Vec<PathBuf> = match handle_mutex_poison(self.watched.lock(), lock_error) {
            Ok(mut watched) => {
                let doomed: Vec<PathBuf> = watched
                    .iter()
                    .filter(|p| p.starts_with(path))
                    .cloned()
                    .collect();
                for p in &doomed {
                    watched.remove(p);
                }
                doomed
            }
            Err(e) => {
                log::warn!("plugins: {}", e);
                Vec::new()
            }
        };
        for p in &unwatched {
            if let Err(e) = self.watcher.remove(p) {
                log::debug!("plugins: cannot unwatch {}: {}", p.display(), e);
            }
        }
    }

    /// Forget `path` and everything beneath it.
    async fn remove_path(&self, path: &Path) {
        self.unwatch(path);

        let removed: Vec<Arc<Plugin>> = {
            let mut plugins = self.plugins.write().await;
            let doomed: Vec<PathBuf> = plugins
                .keys()
                .filter(|p| p.starts_with(path))
                .cloned()
                .collect();
            doomed.iter().filter_map(|p| plugins.remove(p)).collect()
        };
        for plugin in removed {
            log::info!("plugins: {} removed", plugin.socket().display());
            plugin.close();
        }
    }

    async fn handle_event(&self, event: FsEvent) {
        match event.kind {
            FsEventKind::Create | FsEventKind::Chmod => self.discover(vec![event.path]).await,
            FsEventKind::Remove | FsEventKind::Rename => self.remove_path(&event.path).await,
            FsEventKind::Write => {}
            FsEventKind::Other => {
                log::debug!("plugins: ignoring event on {}", event.path.display())
            }
        }
    }

    async fn handle_lifecycle(&self, message: Lifecycle) {
        match message {
            Lifecycle::Disconnected { socket, generation } => {
                let removed = {
                    let mut plugins = self.plugins.write().await;
                    match plugins.get(&socket) {
                        Some(plugin) if plugin.generation() == generation => {
                            plugins.remove(&socket)
                        }
                        _ => None,
                    }
                };
                match removed {
                    Some(plugin) => {
                        log::info!("plugins: {} went away", socket.display());
                        self.unwatch(&socket);
                        plugin.close();
                    }
                    None => log::debug!("plugins: stale disconnect for {}", socket.display()),
                }
            }
            Lifecycle::Handshaken { socket, generation } => {
                let plugins = self.plugins.read().await;
                let Some(id) = plugins
                    .get(&socket)
                    .filter(|p| p.generation() == generation)
                    .and_then(|p| p.id())
                else {
                    return;
                };
                let mut claimants: Vec<&Arc<Plugin>> = plugins
                    .values()
                    .filter(|p| p.id().as_deref() == Some(id.as_str()))
                    .collect();
                if claimants.len() < 2 {
                    return;
                }
                claimants.sort_by_key(|p| std::cmp::Reverse(p.generation()));
                let winner = claimants[0];
                for loser in &claimants[1..] {
                    log::warn!(
                        "plugins: {} supersedes {} as '{}'",
                        winner.socket().display(),
                        loser.socket().display(),
                        id
                    );
                }
            }
        }
    }
}

async fn event_loop(
    inner: Arc<Inner>,
    mut streams: WatchStreams,
    mut lifecycle: mpsc::UnboundedReceiver<Lifecycle>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(event) = streams.events.recv() => inner.handle_event(event).await,
            Some(error) = streams.errors.recv() => log::warn!("plugins: watcher error: {}", error),
            Some(message) = lifecycle.recv() => inner.handle_lifecycle(message).await,
            else => break,
        }
    }
    log::debug!("plugins: event loop for {} stopped", inner.root.display());
}

/// Live membership of the plugins found under one root
pub struct Registry {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Build a registry on the local filesystem with the configured
    /// transport.
    pub async fn new(config: RegistryConfig) -> PluginResult<Registry> {
        let (watcher, streams) = NotifyWatcher::new()?;
        let components = Components {
            watcher: Arc::new(watcher),
            streams,
            dialer: config.transport.dialer(config.protocol.retry_interval),
            filesystem: Arc::new(LocalFilesystem),
        };
        Self::with_components(config, components).await
    }

    /// Build a registry from explicit collaborators. The initial scan has
    /// completed when this returns.
    pub async fn with_components(
        config: RegistryConfig,
        components: Components,
    ) -> PluginResult<Registry> {
        let Components {
            watcher,
            streams,
            dialer,
            filesystem,
        } = components;
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            root: config.root,
            handshake: Arc::new(HandshakeConfig {
                api_version: config.api_version,
                metadata: config.handshake_metadata,
                settings: config.protocol,
            }),
            watcher,
            dialer,
            filesystem,
            plugins: RwLock::new(HashMap::new()),
            watched: Mutex::new(BTreeSet::new()),
            lifecycle: lifecycle_tx,
            generation: AtomicU64::new(0),
        });

        if let Err(e) = inner.scan_root().await {
            if let Err(close_err) = inner.watcher.close() {
                log::debug!("plugins: closing watcher: {}", close_err);
            }
            return Err(e);
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(event_loop(
            inner.clone(),
            streams,
            lifecycle_rx,
            shutdown.clone(),
        ));

        Ok(Registry {
            inner,
            shutdown,
            closed: AtomicBool::new(false),
            event_loop: Mutex::new(Some(handle)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn api_version(&self) -> &str {
        &self.inner.handshake.api_version
    }

    /// Call `f` for every visible plugin, in ascending path order.
    pub async fn for_each(&self, mut f: impl FnMut(&Arc<Plugin>)) {
        let plugins = self.inner.plugins.read().await;
        for plugin in visible(&plugins) {
            f(&plugin);
        }
    }

    /// Like [`for_each`](Self::for_each), restricted to plugins that
    /// advertise `capability`.
    pub async fn implementors(&self, capability: &str, mut f: impl FnMut(&Arc<Plugin>)) {
        self.for_each(|plugin| {
            if plugin.implements(capability) {
                f(plugin);
            }
        })
        .await
    }

    /// Snapshot of the visible plugins, in ascending path order
    pub async fn plugins(&self) -> Vec<Arc<Plugin>> {
        visible(&*self.inner.plugins.read().await)
    }

    pub async fn implementors_of(&self, capability: &str) -> Vec<Arc<Plugin>> {
        let mut found = self.plugins().await;
        found.retain(|plugin| plugin.implements(capability));
        found
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Plugin>> {
        self.plugins()
            .await
            .into_iter()
            .find(|plugin| plugin.id().as_deref() == Some(id))
    }

    /// Every tracked socket, handshaken or not
    pub async fn tracked_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.inner.plugins.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Stop the event loop, close every plugin and release the watcher.
    /// Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("plugins: event loop ended abnormally: {}", e);
            }
        }

        let plugins: Vec<Arc<Plugin>> = self
            .inner
            .plugins
            .write()
            .await
            .drain()
            .map(|(_, plugin)| plugin)
            .collect();
        for plugin in plugins {
            plugin.close();
        }

        match handle_mutex_poison(self.inner.watched.lock(), lock_error) {
            Ok(mut watched) => watched.clear(),
            Err(e) => log::debug!("plugins: {}", e),
        }
        if let Err(e) = self.inner.watcher.close() {
            log::warn!("plugins: closing watcher: {}", e);
        }
        log::info!("plugins: registry for {} closed", self.inner.root.display());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.inner.root)
            .field("api_version", &self.inner.handshake.api_version)
            .field("closed", &self.is_closed())
            .finish()
    }
}
