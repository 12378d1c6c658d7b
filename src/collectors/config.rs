use crate::collectors::COLLECTOR_NAMES;

/// Which collectors to build, kept in catalog order.
#[derive(Clone, Debug, Default)]
pub struct CollectorConfig {
    pub enabled_collectors: Vec<String>,
}

impl CollectorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable collectors by name. Unknown names and duplicates are dropped.
    #[must_use]
    pub fn with_enabled(mut self, collectors: &[String]) -> Self {
        self.enabled_collectors = COLLECTOR_NAMES
            .iter()
            .filter(|name| collectors.iter().any(|c| c == *name))
            .map(|name| (*name).to_string())
            .collect();
        self
    }

    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled_collectors.iter().any(|c| c == name)
    }
}
