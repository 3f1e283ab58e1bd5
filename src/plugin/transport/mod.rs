//! Transports that carry handshake and report calls to a plugin socket
//!
//! Two wire formats are supported and behave the same from the caller's
//! side: HTTP/1.1 `GET` requests (one connection per call) and newline
//! delimited JSON-RPC over a single long-lived connection.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::plugin::error::PluginResult;

pub(crate) mod http;
pub(crate) mod jsonrpc;

/// Key/value pairs sent with every handshake
pub type Metadata = BTreeMap<String, String>;

/// Remote operations a plugin serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Handshake,
    Report,
}

impl Method {
    /// Operation name used in logs and timeout errors
    pub fn name(&self) -> &'static str {
        match self {
            Method::Handshake => "handshake",
            Method::Report => "report",
        }
    }
}

/// A channel to one plugin socket
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue `method` and return the decoded JSON result.
    async fn call(&self, method: Method, params: &Metadata) -> PluginResult<serde_json::Value>;

    /// Resolves once the plugin end is known to be gone. Never resolves
    /// after a local [`close`](Transport::close).
    async fn closed(&self);

    /// Release the transport. Pending and later calls fail.
    fn close(&self);
}

/// Opens transports for discovered sockets
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, socket: &Path, connect_timeout: Duration)
        -> PluginResult<Arc<dyn Transport>>;
}

/// Wire format selection
#[derive(EnumIter, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Http,
    JsonRpc,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::JsonRpc => "jsonrpc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        TransportKind::iter().find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    pub fn names() -> Vec<&'static str> {
        TransportKind::iter().map(|kind| kind.name()).collect()
    }

    /// Production dialer for this wire format. `liveness_interval` controls how
    /// often connectionless transports check that the peer still listens.
    pub fn dialer(&self, liveness_interval: Duration) -> Arc<dyn Dialer> {
        match self {
            TransportKind::Http => Arc::new(http::HttpDialer::new(liveness_interval)),
            TransportKind::JsonRpc => Arc::new(jsonrpc::JsonRpcDialer),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
