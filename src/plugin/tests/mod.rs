//! Test modules for the plugin system
//!
//! Registry and reporter suites run against the in-memory doubles in
//! [`utils`].

pub(crate) mod utils;
