//! Build metadata and the plugin protocol version.
//! The generated version.rs from the build script is included here so the
//! rest of the crate has a single source of truth.

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Protocol version a plugin must report during its handshake unless the
/// caller overrides it.
pub fn default_api_version() -> &'static str {
    PLUGIN_API_VERSION
}

/// Build time string from the build script (UTC)
pub fn build_time() -> &'static str {
    BUILD_TIME
}

/// Short git hash captured by the build script
pub fn git_hash() -> &'static str {
    GIT_HASH
}
