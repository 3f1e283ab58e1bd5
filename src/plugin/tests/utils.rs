//! Plugin Test Utilities
//!
//! In-memory transports, dialers and filesystems for driving the registry
//! without real sockets.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::plugin::client::{HandshakeConfig, ProtocolSettings};
use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::fs::{EntryKind, Filesystem};
use crate::plugin::registry::{Components, Registry, RegistryConfig};
use crate::plugin::transport::{Dialer, Metadata, Method, Transport};
use crate::plugin::watch::mock::MockWatcher;

pub const API_VERSION: &str = "1";

pub fn test_settings() -> ProtocolSettings {
    ProtocolSettings {
        rpc_timeout: Duration::from_millis(50),
        retry_interval: Duration::from_millis(20),
        connect_timeout: Duration::from_millis(50),
    }
}

pub fn test_config() -> Arc<HandshakeConfig> {
    Arc::new(HandshakeConfig {
        api_version: API_VERSION.to_string(),
        metadata: Metadata::from([("host".to_string(), "test".to_string())]),
        settings: test_settings(),
    })
}

pub fn handshake_json(name: &str, interfaces: &[&str], api_version: &str) -> Value {
    json!({
        "name": name,
        "interfaces": interfaces,
        "api_version": api_version,
    })
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Info and above, as `"<LEVEL> <message>"` lines
pub struct CapturedLog {
    lines: Mutex<Vec<String>>,
}

impl log::Log for CapturedLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            locked(&self.lines).push(format!("{} {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

impl CapturedLog {
    pub fn clear(&self) {
        locked(&self.lines).clear();
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        locked(&self.lines)
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }
}

static CAPTURED: CapturedLog = CapturedLog {
    lines: Mutex::new(Vec::new()),
};

/// The process-wide logger for this test binary, installed on first use.
/// Tests asserting on it should be `#[serial(log)]`.
pub fn captured_log() -> &'static CapturedLog {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        if log::set_logger(&CAPTURED).is_ok() {
            log::set_max_level(log::LevelFilter::Info);
        }
    });
    &CAPTURED
}

/// Scriptable transport
pub struct MockTransport {
    handshake: Mutex<Value>,
    report: Mutex<Option<Value>>,
    delay: Mutex<Duration>,
    last_params: Mutex<Metadata>,
    handshake_calls: AtomicUsize,
    report_calls: AtomicUsize,
    closes: AtomicUsize,
    gone: CancellationToken,
    shutdown: CancellationToken,
}

impl MockTransport {
    pub fn new(handshake: Value) -> Arc<Self> {
        Arc::new(Self {
            handshake: Mutex::new(handshake),
            report: Mutex::new(Some(json!({}))),
            delay: Mutex::new(Duration::ZERO),
            last_params: Mutex::new(Metadata::new()),
            handshake_calls: AtomicUsize::new(0),
            report_calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            gone: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// A plugin that handshakes successfully with the test API version
    pub fn plugin(name: &str, interfaces: &[&str]) -> Arc<Self> {
        Self::new(handshake_json(name, interfaces, API_VERSION))
    }

    pub fn set_handshake(&self, value: Value) {
        *locked(&self.handshake) = value;
    }

    /// `None` makes report calls fail with a transport error.
    pub fn set_report(&self, value: Option<Value>) {
        *locked(&self.report) = value;
    }

    pub fn set_delay(&self, delay: Duration) {
        *locked(&self.delay) = delay;
    }

    /// Simulate the plugin process exiting.
    pub fn hang_up(&self) {
        self.gone.cancel();
    }

    pub fn last_params(&self) -> Metadata {
        locked(&self.last_params).clone()
    }

    pub fn handshake_calls(&self) -> usize {
        self.handshake_calls.load(Ordering::SeqCst)
    }

    pub fn report_calls(&self) -> usize {
        self.report_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, method: Method, params: &Metadata) -> PluginResult<Value> {
        match method {
            Method::Handshake => {
                self.handshake_calls.fetch_add(1, Ordering::SeqCst);
                *locked(&self.last_params) = params.clone();
            }
            Method::Report => {
                self.report_calls.fetch_add(1, Ordering::SeqCst);
            }
        }
        if self.shutdown.is_cancelled() {
            return Err(PluginError::Closed);
        }
        if self.gone.is_cancelled() {
            return Err(PluginError::ConnectionClosed {
                socket: PathBuf::from("mock"),
            });
        }

        let delay = *locked(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match method {
            Method::Handshake => Ok(locked(&self.handshake).clone()),
            Method::Report => locked(&self.report)
                .clone()
                .ok_or_else(|| PluginError::transport("mock", "report unavailable")),
        }
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.gone.cancelled() => {}
            _ = self.shutdown.cancelled() => std::future::pending::<()>().await,
        }
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

/// Hands out pre-registered [`MockTransport`]s by socket path
#[derive(Default)]
pub struct MockDialer {
    transports: Mutex<HashMap<PathBuf, Arc<MockTransport>>>,
    dialed: Mutex<Vec<PathBuf>>,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, path: impl Into<PathBuf>, transport: Arc<MockTransport>) {
        locked(&self.transports).insert(path.into(), transport);
    }

    pub fn dialed(&self) -> Vec<PathBuf> {
        locked(&self.dialed).clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, socket: &Path, _connect_timeout: Duration) -> PluginResult<Arc<dyn Transport>> {
        locked(&self.dialed).push(socket.to_path_buf());
        let transport = locked(&self.transports).get(socket).cloned();
        match transport {
            Some(transport) => Ok(transport as Arc<dyn Transport>),
            None => Err(PluginError::ConnectionClosed {
                socket: socket.to_path_buf(),
            }),
        }
    }
}

/// Directory tree held in memory
#[derive(Default)]
pub struct FakeFilesystem {
    entries: Mutex<BTreeMap<PathBuf, EntryKind>>,
}

impl FakeFilesystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        locked(&self.entries).insert(path.into(), EntryKind::Directory);
    }

    pub fn add_socket(&self, path: impl Into<PathBuf>) {
        locked(&self.entries).insert(path.into(), EntryKind::Socket);
    }

    pub fn add_file(&self, path: impl Into<PathBuf>) {
        locked(&self.entries).insert(path.into(), EntryKind::Other);
    }

    /// Remove `path` and everything beneath it.
    pub fn remove(&self, path: &Path) {
        locked(&self.entries).retain(|p, _| !p.starts_with(path));
    }
}

impl Filesystem for FakeFilesystem {
    fn stat(&self, path: &Path) -> io::Result<EntryKind> {
        locked(&self.entries)
            .get(path)
            .copied()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = locked(&self.entries);
        match entries.get(path) {
            Some(EntryKind::Directory) => Ok(entries
                .keys()
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect()),
            Some(_) => Err(io::Error::other("not a directory")),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

/// A registry wired to mocks, plus handles on those mocks
pub struct Harness {
    pub watcher: Arc<MockWatcher>,
    pub dialer: Arc<MockDialer>,
    pub filesystem: Arc<FakeFilesystem>,
    pub registry: Arc<Registry>,
}

pub const ROOT: &str = "/run/plugins";

impl Harness {
    /// `setup` populates the filesystem and dialer before the initial scan.
    pub async fn start(setup: impl FnOnce(&FakeFilesystem, &MockDialer)) -> PluginResult<Harness> {
        let (watcher, streams) = MockWatcher::new();
        let watcher = Arc::new(watcher);
        let dialer = MockDialer::new();
        let filesystem = FakeFilesystem::new();
        filesystem.add_dir(ROOT);
        setup(&filesystem, &dialer);

        let mut config = RegistryConfig::new(ROOT);
        config.api_version = API_VERSION.to_string();
        config.protocol = test_settings();

        let registry = Registry::with_components(
            config,
            Components {
                watcher: watcher.clone(),
                streams,
                dialer: dialer.clone(),
                filesystem: filesystem.clone(),
            },
        )
        .await?;

        Ok(Harness {
            watcher,
            dialer,
            filesystem,
            registry: Arc::new(registry),
        })
    }

    /// Socket paths of the visible plugins, in iteration order
    pub async fn visible(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        self.registry
            .for_each(|plugin| paths.push(plugin.socket().to_path_buf()))
            .await;
        paths
    }

    pub async fn implementors(&self, capability: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        self.registry
            .implementors(capability, |plugin| paths.push(plugin.socket().to_path_buf()))
            .await;
        paths
    }

    /// Wait until exactly `expected` are visible.
    pub async fn settle(&self, expected: &[PathBuf]) -> bool {
        eventually(|| async { self.visible().await == expected }).await
    }
}

pub fn root_path(name: &str) -> PathBuf {
    Path::new(ROOT).join(name)
}
