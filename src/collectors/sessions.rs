use crate::collectors::Collector;
use crate::gauges::{Gauges, LabeledQuery, VectorGauge};
use anyhow::Result;
use futures::future::BoxFuture;
use tracing::instrument;

const IDLE_SESSIONS_QUERY: &str = r"
    SELECT state, COUNT(*)::float8 AS value
    FROM pg_stat_activity
    WHERE datname = current_database()
    AND state LIKE 'idle%'
    GROUP BY state
";

/// Idle connections of the current database, by `state`
/// (`idle`, `idle in transaction`, `idle in transaction (aborted)`).
#[derive(Clone, Default)]
pub struct SessionsCollector;

#[must_use]
pub fn idle_sessions_source() -> LabeledQuery {
    LabeledQuery::new("idle sessions", IDLE_SESSIONS_QUERY)
}

/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub fn idle_sessions(gauges: &Gauges) -> Result<VectorGauge> {
    let gauge = gauges.new_vector(
        "postgresql_idle_sessions",
        "Count of idle sessions by state",
        &["state"],
    )?;

    gauges.spawn_refresh(&gauge, vec![Box::new(idle_sessions_source())]);

    Ok(gauge)
}

impl Collector for SessionsCollector {
    fn name(&self) -> &'static str {
        "sessions"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    #[instrument(skip(self, gauges), level = "info", err, fields(collector = "sessions"))]
    fn register<'a>(&'a self, gauges: &'a Gauges) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            idle_sessions(gauges)?;
            Ok(())
        })
    }
}
