use crate::collectors::Collector;
use crate::gauges::{Cell, CellSource, Gauges, Requirement, VectorGauge};
use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{instrument, warn};

pub const DEAD_TUPLES: &str = "postgresql_dead_tuples_pct";

/// How many of the most written tables are inspected per refresh.
pub const TOP_TABLES: u32 = 20;

const TABLES_QUERY: &str = r"
    SELECT schemaname, relname
    FROM pg_stat_user_tables
    ORDER BY n_tup_ins + n_tup_upd DESC
    LIMIT 20
";

const DEAD_TUPLE_QUERY: &str = "SELECT dead_tuple_percent FROM pgstattuple($1)";

/// Dead tuple percentage of the busiest tables, via `pgstattuple`.
#[derive(Clone, Default)]
pub struct DeadTuplesCollector;

/// A user table, labeled `schema.table` so equally named tables in different
/// schemas get their own cell.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Relation {
    pub schemaname: String,
    pub relname: String,
}

impl Relation {
    #[must_use]
    pub fn new(schemaname: impl Into<String>, relname: impl Into<String>) -> Self {
        Self {
            schemaname: schemaname.into(),
            relname: relname.into(),
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        format!("{}.{}", self.schemaname, self.relname)
    }

    /// Quoted name accepted by `pgstattuple(text)`.
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schemaname), quote_ident(&self.relname))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Run `pgstattuple` on each of `tables`.
///
/// A table whose call fails is skipped (and counted); the others still land.
pub async fn inspect_tables(gauges: &Gauges, tables: &[Relation]) -> Vec<Cell> {
    let mut cells = Vec::with_capacity(tables.len());

    for table in tables {
        let params = [table.qualified()];
        match gauges.fetch_scalar(DEAD_TUPLE_QUERY, &params).await {
            Ok(pct) => cells.push(Cell::new([table.label()], pct)),
            Err(e) => {
                warn!(
                    metric = DEAD_TUPLES,
                    table = %table.label(),
                    error = %e,
                    "failed to inspect table"
                );
                gauges.record_error();
            }
        }
    }

    cells
}

/// Lists the busiest tables, then runs one `pgstattuple` call per table.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeadTuplesSource;

impl CellSource for DeadTuplesSource {
    fn describe(&self) -> &str {
        "pgstattuple on busiest tables"
    }

    fn fetch<'a>(&'a self, gauges: &'a Gauges, _keys: &'a [String]) -> BoxFuture<'a, Result<Vec<Cell>>> {
        Box::pin(async move {
            let tables: Vec<Relation> = gauges.fetch_all(TABLES_QUERY, &[]).await?;
            Ok(inspect_tables(gauges, &tables).await)
        })
    }
}

/// # Errors
///
/// Returns an error if the gauge cannot be registered.
pub async fn dead_tuples(gauges: &Gauges) -> Result<VectorGauge> {
    let gauge = gauges.new_vector(
        DEAD_TUPLES,
        "Dead tuples percentage on the most written tables",
        &["table"],
    )?;

    // pgstattuple needs a superuser; check that first so only one reason is counted
    if !gauges.require(DEAD_TUPLES, Requirement::Superuser).await {
        return Ok(gauge);
    }
    if !gauges
        .require(DEAD_TUPLES, Requirement::Extension("pgstattuple"))
        .await
    {
        return Ok(gauge);
    }

    gauges.spawn_refresh(&gauge, vec![Box::new(DeadTuplesSource)]);

    Ok(gauge)
}

impl Collector for DeadTuplesCollector {
    fn name(&self) -> &'static str {
        "deadtuples"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    #[instrument(skip(self, gauges), level = "info", err, fields(collector = "deadtuples"))]
    fn register<'a>(&'a self, gauges: &'a Gauges) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            dead_tuples(gauges).await?;
            Ok(())
        })
    }
}
