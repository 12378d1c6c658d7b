use crate::collectors::Collector;
use crate::gauges::{Gauges, ScalarGauge};
use anyhow::Result;
use futures::future::BoxFuture;
use tracing::instrument;

/// Per-database scalars, computed on every scrape:
/// - `postgresql_size_bytes`
/// - `postgresql_in_recovery`
#[derive(Clone, Default)]
pub struct DatabaseCollector;

/// Size of the current database.
///
/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub fn size(gauges: &Gauges) -> Result<ScalarGauge> {
    gauges.new_scalar(
        "postgresql_size_bytes",
        "Database size in bytes",
        "SELECT pg_database_size(current_database())",
        &[],
    )
}

/// 1 on a standby replaying WAL, 0 on a primary.
///
/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub fn in_recovery(gauges: &Gauges) -> Result<ScalarGauge> {
    gauges.new_scalar(
        "postgresql_in_recovery",
        "Whether the server is in recovery (1) or not (0)",
        "SELECT pg_is_in_recovery()",
        &[],
    )
}

impl Collector for DatabaseCollector {
    fn name(&self) -> &'static str {
        "database"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    #[instrument(skip(self, gauges), level = "info", err, fields(collector = "database"))]
    fn register<'a>(&'a self, gauges: &'a Gauges) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            size(gauges)?;
            in_recovery(gauges)?;
            Ok(())
        })
    }
}
