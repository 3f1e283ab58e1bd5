//! Plugin System Module
//!
//! Discovers out-of-process plugins exposed as Unix sockets under a
//! directory tree, handshakes with each one and polls the reporters among
//! them. Internal modules are crate-private; everything callers need is
//! re-exported through [`api`].

// Internal modules - all access should go through api module
pub(crate) mod client;
pub(crate) mod error;
pub(crate) mod fs;
pub(crate) mod registry;
pub(crate) mod reporter;
pub(crate) mod set;
pub(crate) mod spec;
pub(crate) mod transport;
pub(crate) mod watch;

// Public API module - the only public interface for the plugin system
pub mod api;

#[cfg(test)]
pub(crate) mod tests;
