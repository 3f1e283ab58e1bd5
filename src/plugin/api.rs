//! Public API for the plugin system
//!
//! External modules should import from here rather than directly from
//! internal modules.

// Registry and reporting
pub use crate::plugin::registry::{Components, Registry, RegistryConfig};
pub use crate::plugin::reporter::{Reporter, REPORTER_CAPABILITY};

// Per-socket client
pub use crate::plugin::client::{HandshakeConfig, Plugin, ProtocolSettings};

// Error handling
pub use crate::plugin::error::{PluginError, PluginResult};

// Plugin identity and collections
pub use crate::plugin::set::PluginSet;
pub use crate::plugin::spec::PluginSpec;

// Discovery seams
pub use crate::plugin::fs::{EntryKind, Filesystem, LocalFilesystem};
pub use crate::plugin::watch::notifier::NotifyWatcher;
pub use crate::plugin::watch::{FsEvent, FsEventKind, WatchStreams, Watcher};

// Transports
pub use crate::plugin::transport::http::HttpDialer;
pub use crate::plugin::transport::jsonrpc::JsonRpcDialer;
pub use crate::plugin::transport::{Dialer, Metadata, Method, Transport, TransportKind};
