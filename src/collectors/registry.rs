use crate::collectors::config::CollectorConfig;
use crate::collectors::{Collector, CollectorType, all_factories};
use crate::gauges::Gauges;
use tracing::{debug, info_span, warn};
use tracing_futures::Instrument as _;

#[derive(Clone)]
pub struct CollectorRegistry {
    collectors: Vec<CollectorType>,
}

impl CollectorRegistry {
    #[must_use]
    pub fn new(config: &CollectorConfig) -> Self {
        let factories = all_factories();
        let collectors = config
            .enabled_collectors
            .iter()
            .filter_map(|name| factories.get(name.as_str()).map(|f| f()))
            .collect();

        Self { collectors }
    }

    /// Build every collector through `gauges`. A collector that fails is
    /// logged and skipped; returns how many registered cleanly.
    pub async fn register_all(&self, gauges: &Gauges) -> usize {
        let mut registered = 0;

        for collector in &self.collectors {
            let span = info_span!("collector.register", collector = collector.name());
            match collector.register(gauges).instrument(span).await {
                Ok(()) => {
                    debug!(collector = collector.name(), "registered collector");
                    registered += 1;
                }
                Err(e) => {
                    warn!(collector = collector.name(), error = %e, "failed to register collector");
                }
            }
        }

        registered
    }

    #[must_use]
    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(Collector::name).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}
