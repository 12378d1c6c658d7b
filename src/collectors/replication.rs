use crate::collectors::Collector;
use crate::gauges::{Gauges, LabeledQuery, VectorGauge, capability::is_pre_pg10};
use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{debug, instrument};

const REPLICATION_LAG_QUERY_PRE10: &str = r"
    SELECT
        application_name,
        COALESCE(client_addr::text, 'local') AS client_addr,
        pg_xlog_location_diff(
            CASE WHEN pg_is_in_recovery() THEN pg_last_xlog_receive_location() ELSE pg_current_xlog_location() END,
            replay_location
        )::float8 AS value
    FROM pg_stat_replication
    WHERE replay_location IS NOT NULL
";

const REPLICATION_LAG_QUERY: &str = r"
    SELECT
        application_name,
        COALESCE(client_addr::text, 'local') AS client_addr,
        pg_wal_lsn_diff(
            CASE WHEN pg_is_in_recovery() THEN pg_last_wal_receive_lsn() ELSE pg_current_wal_lsn() END,
            replay_lsn
        )::float8 AS value
    FROM pg_stat_replication
    WHERE replay_lsn IS NOT NULL
";

/// Replay lag of every attached standby, in bytes.
#[derive(Clone, Default)]
pub struct ReplicationCollector;

/// 9.x names WAL positions `xlog`/`location`; 10 renamed them to `wal`/`lsn`.
#[must_use]
pub fn replication_lag_query(version: &str) -> &'static str {
    if is_pre_pg10(version) {
        REPLICATION_LAG_QUERY_PRE10
    } else {
        REPLICATION_LAG_QUERY
    }
}

#[must_use]
pub fn replication_lag_source(version: &str) -> LabeledQuery {
    LabeledQuery::new("replication lag", replication_lag_query(version))
}

/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub async fn replication_lag(gauges: &Gauges) -> Result<VectorGauge> {
    let gauge = gauges.new_vector(
        "postgresql_replication_lag_bytes",
        "Replication lag of each standby in bytes",
        &["application_name", "client_addr"],
    )?;

    let version = gauges.server_version().await;
    debug!(metric = gauge.name(), version = %version, "selected replication query");

    gauges.spawn_refresh(&gauge, vec![Box::new(replication_lag_source(&version))]);

    Ok(gauge)
}

impl Collector for ReplicationCollector {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    #[instrument(skip(self, gauges), level = "info", err, fields(collector = "replication"))]
    fn register<'a>(&'a self, gauges: &'a Gauges) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            replication_lag(gauges).await?;
            Ok(())
        })
    }
}
