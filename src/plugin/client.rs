//! Per-socket plugin client
//!
//! A [`Plugin`] owns one transport. On start it spawns a handshake task that
//! retries on a fixed interval until the plugin identifies itself with the
//! expected protocol version, and a watcher task that reports when the peer
//! goes away. Report fetches are made on demand by the caller.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::retry::{retry_async, RetryPolicy, RetryStop};
use crate::plugin::error::{PluginError, PluginResult};
use crate::plugin::spec::PluginSpec;
use crate::plugin::transport::{Metadata, Method, Transport};
use crate::report::Report;

/// Timing of the plugin protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Deadline for a single handshake or report call
    pub rpc_timeout: Duration,
    /// Delay between failed handshake attempts
    pub retry_interval: Duration,
    /// Deadline for opening a connection
    pub connect_timeout: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(500),
            retry_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

/// What every plugin is told, and expected to answer, during its handshake
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub api_version: String,
    pub metadata: Metadata,
    pub settings: ProtocolSettings,
}

/// State changes a plugin reports back to its registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Handshaken { socket: PathBuf, generation: u64 },
    Disconnected { socket: PathBuf, generation: u64 },
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    interfaces: Vec<String>,
    #[serde(default, deserialize_with = "version_string")]
    api_version: String,
}

// Plugins built against a numeric version constant send a bare number.
fn version_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

async fn timed_call(
    socket: &Path,
    transport: &dyn Transport,
    method: Method,
    params: &Metadata,
    after: Duration,
) -> PluginResult<Value> {
    match tokio::time::timeout(after, transport.call(method, params)).await {
        Ok(result) => result,
        Err(_) => Err(PluginError::Timeout {
            socket: socket.to_path_buf(),
            operation: method.name(),
            after,
        }),
    }
}

async fn handshake_once(
    socket: &Path,
    transport: &dyn Transport,
    config: &HandshakeConfig,
) -> PluginResult<PluginSpec> {
    let value = timed_call(
        socket,
        transport,
        Method::Handshake,
        &config.metadata,
        config.settings.rpc_timeout,
    )
    .await?;
    let response: HandshakeResponse = serde_json::from_value(value)
        .map_err(|e| PluginError::protocol(socket, format!("malformed handshake: {e}")))?;

    if response.name.is_empty() {
        return Err(PluginError::MissingName {
            socket: socket.to_path_buf(),
        });
    }
    if response.api_version != config.api_version {
        return Err(PluginError::VersionIncompatible {
            socket: socket.to_path_buf(),
            expected: config.api_version.clone(),
            actual: response.api_version,
        });
    }
    Ok(PluginSpec::new(
        response.name,
        response.description,
        response.interfaces,
    ))
}

struct Background {
    socket: PathBuf,
    generation: u64,
    transport: Arc<dyn Transport>,
    config: Arc<HandshakeConfig>,
    cancel: CancellationToken,
    lifecycle: Option<mpsc::UnboundedSender<Lifecycle>>,
}

impl Background {
    fn notify(&self, event: Lifecycle) {
        if let Some(tx) = &self.lifecycle {
            let _ = tx.send(event);
        }
    }

    async fn handshake(self, state: watch::Sender<Option<PluginSpec>>) {
        let operation = format!("handshake with {}", self.socket.display());
        let policy = RetryPolicy::fixed(self.config.settings.retry_interval);

        let outcome = retry_async(
            &operation,
            policy,
            &self.cancel,
            PluginError::is_retryable,
            || async {
                handshake_once(&self.socket, self.transport.as_ref(), &self.config)
                    .await
                    .inspect_err(|e| {
                        if e.is_retryable() {
                            log::info!("plugins: {}", e)
                        }
                    })
            },
        )
        .await;

        match outcome {
            Ok(spec) => {
                log::info!("plugins: {} is {}", self.socket.display(), spec);
                state.send_replace(Some(spec));
                self.notify(Lifecycle::Handshaken {
                    socket: self.socket.clone(),
                    generation: self.generation,
                });
            }
            Err(RetryStop::Cancelled) | Err(RetryStop::Fatal(PluginError::Closed)) => {
                log::debug!("plugins: {} handshake cancelled", self.socket.display())
            }
            Err(RetryStop::Fatal(e)) => {
                log::warn!("plugins: giving up on {}: {}", self.socket.display(), e)
            }
        }
    }

    async fn watch_peer(self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.transport.closed() => {
                log::info!("plugins: {} disconnected", self.socket.display());
                self.cancel.cancel();
                self.notify(Lifecycle::Disconnected {
                    socket: self.socket.clone(),
                    generation: self.generation,
                });
            }
        }
    }
}

/// Client for one plugin socket
pub struct Plugin {
    socket: PathBuf,
    generation: u64,
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
    state: watch::Receiver<Option<PluginSpec>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Plugin {
    /// Start handshaking with the plugin behind `transport`.
    pub fn start(
        socket: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        config: Arc<HandshakeConfig>,
    ) -> Arc<Plugin> {
        Self::spawn(socket.into(), 0, transport, config, None)
    }

    pub(crate) fn spawn(
        socket: PathBuf,
        generation: u64,
        transport: Arc<dyn Transport>,
        config: Arc<HandshakeConfig>,
        lifecycle: Option<mpsc::UnboundedSender<Lifecycle>>,
    ) -> Arc<Plugin> {
        let (state_tx, state_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let rpc_timeout = config.settings.rpc_timeout;

        let background = || Background {
            socket: socket.clone(),
            generation,
            transport: transport.clone(),
            config: config.clone(),
            cancel: cancel.clone(),
            lifecycle: lifecycle.clone(),
        };
        tokio::spawn(background().handshake(state_tx));
        tokio::spawn(background().watch_peer());

        Arc::new(Plugin {
            socket,
            generation,
            transport,
            rpc_timeout,
            state: state_rx,
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Discovery order within a registry; later discoveries are larger.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Identity, once the handshake has succeeded
    pub fn spec(&self) -> Option<PluginSpec> {
        self.state.borrow().clone()
    }

    pub fn id(&self) -> Option<String> {
        self.state.borrow().as_ref().map(|spec| spec.id.clone())
    }

    pub fn is_handshaken(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// False until handshaken
    pub fn implements(&self, capability: &str) -> bool {
        self.state
            .borrow()
            .as_ref()
            .is_some_and(|spec| spec.implements(capability))
    }

    /// Wait up to `within` for the handshake to complete.
    pub async fn wait_handshaken(&self, within: Duration) -> Option<PluginSpec> {
        let mut state = self.state.clone();
        let waited = tokio::time::timeout(within, state.wait_for(Option::is_some)).await;
        let spec = match waited {
            Ok(Ok(spec)) => spec.clone(),
            _ => None,
        };
        spec
    }

    /// Fetch one report. Errors are returned as-is; there is no retry.
    pub async fn report(&self) -> PluginResult<Report> {
        if self.cancel.is_cancelled() {
            return Err(PluginError::Closed);
        }
        let params = Metadata::new();
        let value = tokio::select! {
            _ = self.cancel.cancelled() => return Err(PluginError::Closed),
            value = timed_call(
                &self.socket,
                self.transport.as_ref(),
                Method::Report,
                &params,
                self.rpc_timeout,
            ) => value?,
        };
        serde_json::from_value(value)
            .map_err(|e| PluginError::protocol(&self.socket, format!("malformed report: {e}")))
    }

    /// Stop background work and release the transport. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.transport.close();
        log::debug!("plugins: closed {}", self.socket.display());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("socket", &self.socket)
            .field("generation", &self.generation)
            .field("spec", &*self.state.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}
