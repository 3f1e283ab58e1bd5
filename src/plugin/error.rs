//! Plugin Error Handling
//!
//! Error types for discovery, transport, handshake and report operations.

use std::path::PathBuf;
use std::time::Duration;

use crate::core::error_handling::ContextualError;

/// Result type alias for plugin operations
pub type PluginResult<T> = std::result::Result<T, PluginError>;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Filesystem access failed while classifying or listing a path
    #[error("I/O error during {operation} on {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The change notifier failed or rejected a registration
    #[error("watch error: {message}")]
    Watch { message: String },

    /// The plugin end of the socket went away
    #[error("connection to {} closed", .socket.display())]
    ConnectionClosed { socket: PathBuf },

    /// An RPC did not complete inside its deadline
    #[error("{operation} on {} timed out after {after:?}", .socket.display())]
    Timeout {
        socket: PathBuf,
        operation: &'static str,
        after: Duration,
    },

    /// Dial, write or read failure below the protocol layer
    #[error("transport error on {}: {message}", .socket.display())]
    Transport { socket: PathBuf, message: String },

    /// The plugin answered with something that is not a valid response
    #[error("protocol error on {}: {message}", .socket.display())]
    Protocol { socket: PathBuf, message: String },

    /// The plugin reported an error for the call
    #[error("plugin at {} returned an error: {message}", .socket.display())]
    Remote { socket: PathBuf, message: String },

    /// Handshake reported a different protocol version
    #[error("incompatible plugin at {}: expected {expected:?}, got {actual:?}", .socket.display())]
    VersionIncompatible {
        socket: PathBuf,
        expected: String,
        actual: String,
    },

    /// Handshake succeeded at the transport level but carried no name
    #[error("plugin at {} sent a handshake without a name", .socket.display())]
    MissingName { socket: PathBuf },

    /// The plugin or registry was closed locally
    #[error("closed")]
    Closed,
}

impl PluginError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PluginError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn transport(socket: impl Into<PathBuf>, message: impl ToString) -> Self {
        PluginError::Transport {
            socket: socket.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn protocol(socket: impl Into<PathBuf>, message: impl ToString) -> Self {
        PluginError::Protocol {
            socket: socket.into(),
            message: message.to_string(),
        }
    }

    /// Whether a handshake hitting this error should be attempted again later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PluginError::Closed | PluginError::Io { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PluginError::Timeout { .. })
    }
}

impl ContextualError for PluginError {
    fn is_user_actionable(&self) -> bool {
        matches!(self, PluginError::Io { .. } | PluginError::Watch { .. })
    }

    fn user_message(&self) -> Option<String> {
        self.is_user_actionable().then(|| self.to_string())
    }
}
