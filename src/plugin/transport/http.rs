//! HTTP/1.1 over a Unix socket
//!
//! Each call opens a fresh connection, sends a `GET` with `Connection:
//! close` and reads a single response. The handshake goes to `/` with the
//! metadata as query parameters; reports come from `/report`.

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{ACCEPT, CONNECTION, HOST};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use super::{Dialer, Metadata, Method, Transport};
use crate::plugin::error::{PluginError, PluginResult};

/// Largest response body accepted from a plugin
pub(crate) const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

pub struct HttpDialer {
    liveness_interval: Duration,
}

impl HttpDialer {
    pub fn new(liveness_interval: Duration) -> Self {
        Self { liveness_interval }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(
        &self,
        socket: &Path,
        connect_timeout: Duration,
    ) -> PluginResult<Arc<dyn Transport>> {
        Ok(Arc::new(HttpTransport {
            socket: socket.to_path_buf(),
            connect_timeout,
            liveness_interval: self.liveness_interval,
            shutdown: CancellationToken::new(),
            gone: CancellationToken::new(),
        }))
    }
}

pub struct HttpTransport {
    socket: PathBuf,
    connect_timeout: Duration,
    liveness_interval: Duration,
    shutdown: CancellationToken,
    gone: CancellationToken,
}

// Nobody is listening any more, as opposed to a transient failure.
fn peer_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}

pub(crate) fn request_target(method: Method, params: &Metadata) -> String {
    match method {
        Method::Report => "/report".to_string(),
        Method::Handshake if params.is_empty() => "/".to_string(),
        Method::Handshake => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params.iter())
                .finish();
            format!("/?{query}")
        }
    }
}

impl HttpTransport {
    async fn connect(&self) -> PluginResult<UnixStream> {
        match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket)).await
        {
            Ok(Ok(stream)) => Ok(stream),
            // Only the liveness check marks the peer gone; a new socket may not be
            // listening yet.
            Ok(Err(err)) if peer_absent(&err) => Err(PluginError::ConnectionClosed {
                socket: self.socket.clone(),
            }),
            Ok(Err(err)) => Err(PluginError::transport(&self.socket, err)),
            Err(_) => Err(PluginError::Timeout {
                socket: self.socket.clone(),
                operation: "connect",
                after: self.connect_timeout,
            }),
        }
    }

    async fn get(&self, target: &str) -> PluginResult<(StatusCode, Bytes)> {
        let stream = self.connect().await?;
        let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| self.hyper_error(e))?;
        let socket = self.socket.clone();
        let _driver = AbortOnDropHandle::new(tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("plugins: connection to {} failed: {}", socket.display(), e);
            }
        }));

        let request = Request::get(target)
            .header(HOST, "plugin")
            .header(ACCEPT, "application/json")
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(|e| PluginError::protocol(&self.socket, e))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| self.hyper_error(e))?;

        let status = response.status();
        let body = Limited::new(response.into_body(), MAX_RESPONSE_BYTES)
            .collect()
            .await
            .map_err(|e| PluginError::protocol(&self.socket, format!("bad response body: {e}")))?
            .to_bytes();
        Ok((status, body))
    }

    fn hyper_error(&self, err: hyper::Error) -> PluginError {
        if err.is_parse() || err.is_parse_status() {
            PluginError::protocol(&self.socket, err)
        } else {
            PluginError::transport(&self.socket, err)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: Method, params: &Metadata) -> PluginResult<Value> {
        if self.shutdown.is_cancelled() {
            return Err(PluginError::Closed);
        }
        let target = request_target(method, params);
        let (status, body) = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(PluginError::Closed),
            response = self.get(&target) => response?,
        };

        if !status.is_success() {
            return Err(PluginError::protocol(
                &self.socket,
                format!("GET {} returned status {}", target, status),
            ));
        }
        serde_json::from_slice(&body).map_err(|e| {
            PluginError::protocol(&self.socket, format!("invalid JSON from {}: {}", method.name(), e))
        })
    }

    async fn closed(&self) {
        loop {
            tokio::select! {
                _ = self.gone.cancelled() => return,
                _ = self.shutdown.cancelled() => std::future::pending::<()>().await,
                _ = tokio::time::sleep(self.liveness_interval) => {
                    if let Err(err) = UnixStream::connect(&self.socket).await {
                        if peer_absent(&err) {
                            log::debug!("plugins: {} stopped listening", self.socket.display());
                            self.gone.cancel();
                        }
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}
