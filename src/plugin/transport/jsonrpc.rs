//! JSON-RPC 1.0 over one persistent Unix socket connection
//!
//! Requests are `{"method": "Plugin.Handshake", "params": [...], "id": n}`
//! objects, one per line; responses carry the same id and either a
//! `result` or a non-null `error`. A reader task routes responses to the
//! waiting callers and notices when the plugin hangs up.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{Dialer, Metadata, Method, Transport};
use crate::core::sync::handle_mutex_poison;
use crate::plugin::error::{PluginError, PluginResult};

type Pending = HashMap<u64, oneshot::Sender<PluginResult<Value>>>;

pub struct JsonRpcDialer;

#[async_trait]
impl Dialer for JsonRpcDialer {
    async fn dial(
        &self,
        socket: &Path,
        connect_timeout: Duration,
    ) -> PluginResult<Arc<dyn Transport>> {
        let stream = match tokio::time::timeout(connect_timeout, UnixStream::connect(socket)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(PluginError::transport(socket, err)),
            Err(_) => {
                return Err(PluginError::Timeout {
                    socket: socket.to_path_buf(),
                    operation: "connect",
                    after: connect_timeout,
                })
            }
        };
        Ok(Arc::new(JsonRpcTransport::start(socket.to_path_buf(), stream)))
    }
}

pub struct JsonRpcTransport {
    shared: Arc<Shared>,
}

struct Shared {
    socket: PathBuf,
    pending: Mutex<Pending>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    gone: CancellationToken,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

impl JsonRpcTransport {
    fn start(socket: PathBuf, stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            socket,
            pending: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            next_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            gone: CancellationToken::new(),
        });
        tokio::spawn(read_loop(shared.clone(), read_half));
        Self { shared }
    }
}

fn request(method: Method, params: &Metadata, id: u64) -> Value {
    match method {
        Method::Handshake => json!({"method": "Plugin.Handshake", "params": [params], "id": id}),
        Method::Report => json!({"method": "Plugin.Report", "params": [null], "id": id}),
    }
}

impl Shared {
    fn pending(&self) -> PluginResult<MutexGuard<'_, Pending>> {
        handle_mutex_poison(self.pending.lock(), |message| {
            PluginError::transport(&self.socket, message)
        })
    }

    fn connection_error(&self) -> Option<PluginError> {
        if self.shutdown.is_cancelled() {
            Some(PluginError::Closed)
        } else if self.gone.is_cancelled() {
            Some(PluginError::ConnectionClosed {
                socket: self.socket.clone(),
            })
        } else {
            None
        }
    }

    fn dispatch(&self, line: &str) {
        let response: RpcResponse = match serde_json::from_str(line) {
            Ok(response) => response,
            Err(err) => {
                log::debug!(
                    "plugins: {}: ignoring malformed response: {}",
                    self.socket.display(),
                    err
                );
                return;
            }
        };
        let Some(id) = response.id else {
            log::debug!("plugins: {}: response without id", self.socket.display());
            return;
        };

        let waiter = match self.pending() {
            Ok(mut pending) => pending.remove(&id),
            Err(err) => {
                log::warn!("plugins: {}", err);
                return;
            }
        };
        let Some(waiter) = waiter else {
            log::debug!(
                "plugins: {}: response for unknown call {}",
                self.socket.display(),
                id
            );
            return;
        };

        let outcome = match response.error {
            Value::Null => Ok(response.result),
            Value::String(message) => Err(PluginError::Remote {
                socket: self.socket.clone(),
                message,
            }),
            other => Err(PluginError::Remote {
                socket: self.socket.clone(),
                message: other.to_string(),
            }),
        };
        let _ = waiter.send(outcome);
    }

    fn fail_pending(&self) {
        let waiters: Vec<_> = match self.pending() {
            Ok(mut pending) => pending.drain().map(|(_, waiter)| waiter).collect(),
            Err(_) => return,
        };
        for waiter in waiters {
            let error = self.connection_error().unwrap_or(PluginError::ConnectionClosed {
                socket: self.socket.clone(),
            });
            let _ = waiter.send(Err(error));
        }
    }
}

async fn read_loop(shared: Arc<Shared>, read_half: OwnedReadHalf) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => shared.dispatch(&line),
            Ok(None) => {
                log::debug!("plugins: {} closed the connection", shared.socket.display());
                shared.gone.cancel();
                break;
            }
            Err(err) => {
                log::debug!("plugins: read from {} failed: {}", shared.socket.display(), err);
                shared.gone.cancel();
                break;
            }
        }
    }

    shared.fail_pending();
    if let Some(mut writer) = shared.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
}

// Drops the waiter for a call that was abandoned, e.g. by a timeout.
struct PendingCall<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

#[async_trait]
impl Transport for JsonRpcTransport {
    async fn call(&self, method: Method, params: &Metadata) -> PluginResult<Value> {
        let shared = &self.shared;
        if let Some(err) = shared.connection_error() {
            return Err(err);
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        shared.pending()?.insert(id, tx);
        let _call = PendingCall { shared, id };

        // The reader may have drained the map just before the insert.
        if let Some(err) = shared.connection_error() {
            return Err(err);
        }

        let mut line = serde_json::to_vec(&request(method, params, id))
            .map_err(|e| PluginError::protocol(&shared.socket, e))?;
        line.push(b'\n');
        {
            let mut writer = shared.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(PluginError::ConnectionClosed {
                    socket: shared.socket.clone(),
                });
            };
            writer
                .write_all(&line)
                .await
                .map_err(|e| PluginError::transport(&shared.socket, e))?;
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PluginError::ConnectionClosed {
                socket: shared.socket.clone(),
            }),
        }
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.shared.gone.cancelled() => {}
            _ = self.shared.shutdown.cancelled() => std::future::pending::<()>().await,
        }
    }

    fn close(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Drop for JsonRpcTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
