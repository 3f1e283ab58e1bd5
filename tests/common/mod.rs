//! Common test utilities and helpers
//!
//! Plugin servers that speak the real wire protocols over Unix sockets, and
//! helpers for building registries against a temporary plugin root.

#![allow(dead_code)]

pub mod servers;

use plugwatch::plugin::api::{ProtocolSettings, Registry, RegistryConfig, TransportKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const API_VERSION: &str = "1";

pub fn fast_protocol() -> ProtocolSettings {
    ProtocolSettings {
        rpc_timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(500),
    }
}

pub fn registry_config(root: &Path, transport: TransportKind) -> RegistryConfig {
    let mut config = RegistryConfig::new(root);
    config.api_version = API_VERSION.to_string();
    config
        .handshake_metadata
        .insert("host".to_string(), "test-host".to_string());
    config.protocol = fast_protocol();
    config.transport = transport;
    config
}

pub async fn start_registry(root: &Path, transport: TransportKind) -> Arc<Registry> {
    Arc::new(
        Registry::new(registry_config(root, transport))
            .await
            .expect("registry should start"),
    )
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Socket paths of the visible plugins, in iteration order
pub async fn visible(registry: &Registry) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    registry
        .for_each(|plugin| paths.push(plugin.socket().to_path_buf()))
        .await;
    paths
}

pub async fn implementors(registry: &Registry, capability: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    registry
        .implementors(capability, |plugin| paths.push(plugin.socket().to_path_buf()))
        .await;
    paths
}
