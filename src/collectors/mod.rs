use crate::gauges::Gauges;
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;

#[macro_use]
mod register_macro;

pub trait Collector {
    fn name(&self) -> &'static str;

    fn enabled_by_default(&self) -> bool;

    /// Build this collector's gauges through the factory and start their refresh loops.
    ///
    /// Capability checks happen here, once; a metric the role cannot compute is
    /// left empty rather than failing the whole collector.
    fn register<'a>(&'a self, gauges: &'a Gauges) -> BoxFuture<'a, Result<()>>;
}

// Every collector is declared here; the CLI flags follow from this list.
register_collectors! {
    database => DatabaseCollector,
    backends => BackendsCollector,
    sessions => SessionsCollector,
    deadtuples => DeadTuplesCollector,
    bloat => BloatCollector,
    replication => ReplicationCollector,
}

pub mod config;
pub mod registry;
