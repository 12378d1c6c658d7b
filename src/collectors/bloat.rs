use crate::collectors::Collector;
use crate::gauges::{Gauges, LabeledQuery, VectorGauge};
use anyhow::Result;
use futures::future::BoxFuture;
use tracing::instrument;

// Estimated vs. actual heap size per table, from pg_stats widths and
// reltuples. Only tables with significant bloat are reported.
const TABLE_BLOAT_QUERY: &str = r#"
WITH constants AS (
    SELECT current_setting('block_size')::numeric AS bs, 23 AS hdr, 8 AS ma
),
no_stats AS (
    SELECT table_schema, table_name,
        n_live_tup::numeric AS est_rows,
        pg_table_size(relid)::numeric AS table_size
    FROM information_schema.columns
    JOIN pg_stat_user_tables AS psut
        ON table_schema = psut.schemaname
        AND table_name = psut.relname
    LEFT OUTER JOIN pg_stats
        ON table_schema = pg_stats.schemaname
        AND table_name = pg_stats.tablename
        AND column_name = attname
    WHERE attname IS NULL
    AND table_schema NOT IN ('pg_catalog', 'information_schema')
    GROUP BY table_schema, table_name, relid, n_live_tup
),
null_headers AS (
    SELECT
        hdr + 1 + (SUM(CASE WHEN null_frac <> 0 THEN 1 ELSE 0 END) / 8) AS nullhdr,
        SUM((1 - null_frac) * avg_width) AS datawidth,
        MAX(null_frac) AS maxfracsum,
        schemaname, tablename, hdr, ma, bs
    FROM pg_stats CROSS JOIN constants
    LEFT OUTER JOIN no_stats
        ON schemaname = no_stats.table_schema
        AND tablename = no_stats.table_name
    WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
    AND no_stats.table_name IS NULL
    AND EXISTS (
        SELECT 1 FROM information_schema.columns
        WHERE schemaname = columns.table_schema
        AND tablename = columns.table_name
    )
    GROUP BY schemaname, tablename, hdr, ma, bs
),
data_headers AS (
    SELECT
        ma, bs, hdr, schemaname, tablename,
        (datawidth + (hdr + ma - (CASE WHEN hdr % ma = 0 THEN ma ELSE hdr % ma END)))::numeric AS datahdr,
        (maxfracsum * (nullhdr + ma - (CASE WHEN nullhdr % ma = 0 THEN ma ELSE nullhdr % ma END))) AS nullhdr2
    FROM null_headers
),
table_estimates AS (
    SELECT schemaname, tablename, bs,
        reltuples::numeric AS est_rows,
        relpages * bs AS table_bytes,
        CEIL((reltuples * (datahdr + nullhdr2 + 4 + ma
            - (CASE WHEN datahdr % ma = 0 THEN ma ELSE datahdr % ma END)) / (bs - 20))) * bs AS expected_bytes,
        reltoastrelid
    FROM data_headers
    JOIN pg_class ON tablename = relname
    JOIN pg_namespace ON relnamespace = pg_namespace.oid AND schemaname = nspname
    WHERE pg_class.relkind = 'r'
),
estimates_with_toast AS (
    SELECT schemaname, tablename,
        table_bytes + (COALESCE(toast.relpages, 0) * bs) AS table_bytes,
        expected_bytes + (CEIL(COALESCE(toast.reltuples, 0) / 4) * bs) AS expected_bytes
    FROM table_estimates
    LEFT OUTER JOIN pg_class AS toast
        ON table_estimates.reltoastrelid = toast.oid
        AND toast.relkind = 't'
),
bloat_data AS (
    SELECT tablename,
        CASE WHEN table_bytes > 0 THEN table_bytes::numeric END AS table_bytes,
        CASE WHEN expected_bytes > 0 AND table_bytes > 0 AND expected_bytes <= table_bytes
            THEN (table_bytes - expected_bytes)::numeric
            ELSE 0::numeric END AS bloat_bytes
    FROM estimates_with_toast
),
bloat_pct AS (
    SELECT tablename,
        ROUND(bloat_bytes * 100 / table_bytes) AS pct_bloat,
        ROUND(bloat_bytes / (1024::numeric ^ 2), 2) AS mb_bloat
    FROM bloat_data
)
SELECT tablename::text AS "table", pct_bloat::float8 AS value
FROM bloat_pct
WHERE (pct_bloat >= 30 AND mb_bloat >= 10)
OR (pct_bloat >= 20 AND mb_bloat >= 1000)
ORDER BY pct_bloat DESC
"#;

/// Estimated heap bloat per table. Tables below the reporting thresholds
/// never get a cell.
#[derive(Clone, Default)]
pub struct BloatCollector;

#[must_use]
pub fn table_bloat_source() -> LabeledQuery {
    LabeledQuery::new("table bloat", TABLE_BLOAT_QUERY)
}

/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub fn table_bloat(gauges: &Gauges) -> Result<VectorGauge> {
    let gauge = gauges.new_vector(
        "postgresql_table_bloat_pct",
        "Bloat percentage of a table; only reported for tables with a lot of bloat",
        &["table"],
    )?;

    gauges.spawn_refresh(&gauge, vec![Box::new(table_bloat_source())]);

    Ok(gauge)
}

impl Collector for BloatCollector {
    fn name(&self) -> &'static str {
        "bloat"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    #[instrument(skip(self, gauges), level = "info", err, fields(collector = "bloat"))]
    fn register<'a>(&'a self, gauges: &'a Gauges) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            table_bloat(gauges)?;
            Ok(())
        })
    }
}
