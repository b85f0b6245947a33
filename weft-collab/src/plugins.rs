//! Plugin compatibility check for joining a host.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// Source of the locally enabled plugin ids.
pub trait PluginRegistry: Send + Sync {
    /// Plugins a host publishes as required for its guests.
    fn enabled_plugins(&self) -> Vec<String>;

    /// Entries of `required` that are not enabled here, in input order.
    fn missing_requirements(&self, required: &[String]) -> Vec<String> {
        let enabled: BTreeSet<String> = self.enabled_plugins().into_iter().collect();
        required
            .iter()
            .filter(|id| !enabled.contains(*id))
            .cloned()
            .collect()
    }
}

/// Fixed set of plugin ids, adjustable at runtime.
#[derive(Debug, Default)]
pub struct StaticPlugins {
    enabled: RwLock<BTreeSet<String>>,
}

impl StaticPlugins {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn enable(&self, id: impl Into<String>) {
        self.enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into());
    }

    pub fn disable(&self, id: &str) {
        self.enabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

impl PluginRegistry for StaticPlugins {
    fn enabled_plugins(&self) -> Vec<String> {
        self.enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_requirements() {
        let plugins = StaticPlugins::new(["mermaid", "katex"]);
        let required = vec!["katex".to_string(), "charts".to_string(), "gantt".to_string()];
        assert_eq!(plugins.missing_requirements(&required), vec!["charts", "gantt"]);
        assert!(plugins.missing_requirements(&[]).is_empty());
    }

    #[test]
    fn test_enable_disable() {
        let plugins = StaticPlugins::default();
        assert!(plugins.enabled_plugins().is_empty());
        plugins.enable("charts");
        assert_eq!(plugins.enabled_plugins(), vec!["charts"]);
        plugins.disable("charts");
        assert!(plugins.enabled_plugins().is_empty());
    }
}
