//! Collects reports from every plugin that advertises the reporter
//! capability and merges them into one.

use futures::future::join_all;
use std::sync::Arc;

use crate::plugin::registry::Registry;
use crate::report::Report;

/// Capability a plugin must advertise to be polled for reports
pub const REPORTER_CAPABILITY: &str = "reporter";

pub struct Reporter {
    registry: Arc<Registry>,
}

impl Reporter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn name(&self) -> &'static str {
        "plugins"
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Poll every reporter concurrently and merge the results in path
    /// order. A plugin that fails is logged and left out of this round.
    pub async fn report(&self) -> Report {
        let plugins = self.registry.implementors_of(REPORTER_CAPABILITY).await;
        let results = join_all(plugins.iter().map(|plugin| plugin.report())).await;

        let mut merged = Report::new();
        for (plugin, result) in plugins.iter().zip(results) {
            match (result, plugin.spec()) {
                (Ok(report), Some(spec)) => {
                    merged = merged.merge(&report.tagged(spec));
                }
                (Ok(_), None) => {}
                (Err(e), _) => {
                    log::warn!("plugins: no report from {}: {}", plugin.socket().display(), e)
                }
            }
        }
        log::debug!(
            "plugins: merged {} of {} reports",
            merged.plugins.len(),
            plugins.len()
        );
        merged
    }
}
