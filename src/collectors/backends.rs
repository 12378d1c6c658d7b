use crate::collectors::Collector;
use crate::gauges::{
    CellSource, Gauges, LabeledQuery, Requirement, ScalarGauge, VectorGauge, capability::is_pg96,
};
use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{debug, instrument};

pub const BACKENDS_STATUS: &str = "postgresql_backends_count";

const BACKENDS_STATUS_QUERY: &str = r#"
    SELECT COALESCE(state, 'unknown') AS status, usename AS "user", COUNT(*)::float8 AS value
    FROM pg_stat_activity
    WHERE datname = current_database()
    GROUP BY state, usename
"#;

const WAITING_STATUS_QUERY_PG96: &str = r#"
    SELECT 'waiting'::text AS status, usename AS "user", COUNT(*)::float8 AS value
    FROM pg_stat_activity
    WHERE datname = current_database()
    AND wait_event IS NOT NULL
    GROUP BY usename
"#;

const WAITING_STATUS_QUERY: &str = r#"
    SELECT 'waiting'::text AS status, usename AS "user", COUNT(*)::float8 AS value
    FROM (
        SELECT usename, datname, wait_event_type = 'Lock' AS waiting
        FROM pg_stat_activity
    ) AS activity
    WHERE datname = current_database()
    AND waiting IS TRUE
    GROUP BY usename
"#;

const WAITING_BACKENDS_QUERY_PG96: &str = r"
    SELECT COUNT(*)
    FROM pg_stat_activity
    WHERE datname = current_database()
    AND wait_event IS NOT NULL
";

const WAITING_BACKENDS_QUERY: &str = r"
    SELECT COUNT(*)
    FROM (
        SELECT datname, wait_event_type = 'Lock' AS waiting
        FROM pg_stat_activity
    ) AS activity
    WHERE datname = current_database()
    AND waiting IS TRUE
";

/// Connection counts from `pg_stat_activity` and `pg_settings`:
/// - `postgresql_backends_total`
/// - `postgresql_max_backends`
/// - `postgresql_waiting_backends`
/// - `postgresql_backends_count{status,user}` (superuser only)
#[derive(Clone, Default)]
pub struct BackendsCollector;

/// Grouped "waiting" rows for `version`; 9.6 only has `wait_event`.
#[must_use]
pub fn waiting_status_query(version: &str) -> &'static str {
    if is_pg96(version) {
        WAITING_STATUS_QUERY_PG96
    } else {
        WAITING_STATUS_QUERY
    }
}

/// Total waiting backends for `version`.
#[must_use]
pub fn waiting_backends_query(version: &str) -> &'static str {
    if is_pg96(version) {
        WAITING_BACKENDS_QUERY_PG96
    } else {
        WAITING_BACKENDS_QUERY
    }
}

/// Both sources of the status vector: per-state counts, then the waiting pseudo-state.
#[must_use]
pub fn status_sources(version: &str) -> Vec<Box<dyn CellSource>> {
    vec![
        Box::new(LabeledQuery::new("backends by state", BACKENDS_STATUS_QUERY)),
        Box::new(LabeledQuery::new(
            "waiting backends",
            waiting_status_query(version),
        )),
    ]
}

/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub fn backends(gauges: &Gauges) -> Result<ScalarGauge> {
    gauges.new_scalar(
        "postgresql_backends_total",
        "Total database backends",
        "SELECT numbackends FROM pg_stat_database WHERE datname = current_database()",
        &[],
    )
}

/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub fn max_backends(gauges: &Gauges) -> Result<ScalarGauge> {
    gauges.new_scalar(
        "postgresql_max_backends",
        "Maximum database backends (per postmaster)",
        "SELECT setting::float8 FROM pg_settings WHERE name = $1",
        &["max_connections"],
    )
}

/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub async fn waiting_backends(gauges: &Gauges) -> Result<ScalarGauge> {
    let version = gauges.server_version().await;
    gauges.new_scalar(
        "postgresql_waiting_backends",
        "Database backends waiting on a lock",
        waiting_backends_query(&version),
        &[],
    )
}

/// Count of connections by state and user, refreshed every interval.
///
/// Other users' sessions are only visible to a superuser, so for any other
/// role the vector is registered but never populated.
///
/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub async fn backends_status(gauges: &Gauges) -> Result<VectorGauge> {
    let gauge = gauges.new_vector(
        BACKENDS_STATUS,
        "Count of connections by state",
        &["status", "user"],
    )?;

    if !gauges.require(BACKENDS_STATUS, Requirement::Superuser).await {
        return Ok(gauge);
    }

    let version = gauges.server_version().await;
    debug!(metric = BACKENDS_STATUS, version = %version, "selected waiting query");
    gauges.spawn_refresh(&gauge, status_sources(&version));

    Ok(gauge)
}

impl Collector for BackendsCollector {
    fn name(&self) -> &'static str {
        "backends"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    #[instrument(skip(self, gauges), level = "info", err, fields(collector = "backends"))]
    fn register<'a>(&'a self, gauges: &'a Gauges) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            backends(gauges)?;
            max_backends(gauges)?;
            waiting_backends(gauges).await?;
            backends_status(gauges).await?;
            Ok(())
        })
    }
}
