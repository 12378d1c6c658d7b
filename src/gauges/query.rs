//! Bounded database round-trips.
//!
//! Every call runs under a deadline and decodes its rows by column name. Callers
//! decide what a failure means for their metric; nothing here retries or logs.

use anyhow::{Context, Result, anyhow};
use sqlx::{
    Column, ColumnIndex, FromRow, PgPool, Postgres, Row, TypeInfo,
    postgres::{PgArguments, PgConnectOptions, PgRow},
    query::Query,
};
use std::{fmt::Debug, future::Future, time::Duration};
use tokio::time::timeout;
use tracing::info_span;
use tracing_futures::Instrument as _;

/// Deadline applied to every query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Column holding the numeric sample of a labeled row.
pub const VALUE_COLUMN: &str = "value";

/// One labeled sample: label values in declaration order plus the number.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub labels: Vec<String>,
    pub value: f64,
}

impl Cell {
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>, value: f64) -> Self {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            value,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) const fn i64_to_f64(value: i64) -> f64 {
    value as f64
}

fn bind<'q>(sql: &'q str, params: &'q [String]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| query.bind(param.as_str()))
}

/// Have the server abort any statement running longer than `deadline`.
///
/// Dropping a timed-out future only stops the client side; the backend keeps
/// executing and its pooled connection stays busy until it finishes. Pools
/// handed to [`crate::gauges::Gauges`] should be built from these options so
/// the server gives the connection back at the same deadline.
#[must_use]
pub fn with_statement_timeout(options: PgConnectOptions, deadline: Duration) -> PgConnectOptions {
    options.options([("statement_timeout", deadline.as_millis())])
}

// The query future is owned by `timeout` and dropped on expiry; the server side
// is stopped by `statement_timeout`.
async fn bounded<T, F>(sql: &str, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    let span = info_span!(
        "db.query",
        otel.kind = "client",
        db.system = "postgresql",
        db.statement = sql.trim()
    );

    match timeout(deadline, fut.instrument(span)).await {
        Ok(result) => result.context("query failed"),
        Err(_) => Err(anyhow!(
            "query timed out after {}ms",
            deadline.as_millis()
        )),
    }
}

/// Decode a numeric column, widening integers and booleans to `f64`.
///
/// # Errors
///
/// Returns an error if the column is missing, NULL, or not numeric.
pub fn decode_number<I>(row: &PgRow, index: I) -> Result<f64>
where
    I: ColumnIndex<PgRow> + Copy + Debug,
{
    let column = row
        .try_column(index)
        .with_context(|| format!("missing column {index:?}"))?;

    let value = match column.type_info().name() {
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?,
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(i64_to_f64),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(f64::from),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(f64::from),
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)?
            .map(|b| if b { 1.0 } else { 0.0 }),
        other => {
            return Err(anyhow!(
                "column {} has non-numeric type {other}",
                column.name()
            ));
        }
    };

    value.ok_or_else(|| anyhow!("column {} is NULL", column.name()))
}

/// Decode a row whose columns are exactly `keys` plus [`VALUE_COLUMN`].
///
/// NULL label values decode as empty strings.
///
/// # Errors
///
/// Returns an error when the row shape does not match the declared labels.
pub fn decode_cell(row: &PgRow, keys: &[String]) -> Result<Cell> {
    let columns = row.columns();
    let shape_matches = columns.len() == keys.len() + 1
        && columns.iter().all(|c| {
            c.name() == VALUE_COLUMN || keys.iter().any(|k| k.as_str() == c.name())
        });

    if !shape_matches {
        let got: Vec<&str> = columns.iter().map(Column::name).collect();
        return Err(anyhow!(
            "expected columns {keys:?} plus {VALUE_COLUMN:?}, got {got:?}"
        ));
    }

    let mut labels = Vec::with_capacity(keys.len());
    for key in keys {
        let value: Option<String> = row
            .try_get(key.as_str())
            .with_context(|| format!("label column {key} is not text"))?;
        labels.push(value.unwrap_or_default());
    }

    Ok(Cell {
        labels,
        value: decode_number(row, VALUE_COLUMN)?,
    })
}

/// Run a query returning one row and decode its first column as a number.
///
/// # Errors
///
/// Returns an error on timeout, connection failure, or decode mismatch.
pub async fn fetch_scalar(
    pool: &PgPool,
    sql: &str,
    params: &[String],
    deadline: Duration,
) -> Result<f64> {
    let row = bounded(sql, deadline, bind(sql, params).fetch_one(pool)).await?;
    decode_number(&row, 0)
}

/// Run a query returning one row and decode its first column as text.
///
/// # Errors
///
/// Returns an error on timeout, connection failure, or decode mismatch.
pub async fn fetch_text(
    pool: &PgPool,
    sql: &str,
    params: &[String],
    deadline: Duration,
) -> Result<String> {
    let row = bounded(sql, deadline, bind(sql, params).fetch_one(pool)).await?;
    row.try_get::<String, _>(0)
        .context("first column is not text")
}

/// Run a query and decode every row into `T` by column name.
///
/// # Errors
///
/// Returns an error on timeout, connection failure, or decode mismatch.
pub async fn fetch_all<T>(
    pool: &PgPool,
    sql: &str,
    params: &[String],
    deadline: Duration,
) -> Result<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
{
    let rows = bounded(sql, deadline, bind(sql, params).fetch_all(pool)).await?;
    rows.iter()
        .map(|row| T::from_row(row).map_err(Into::into))
        .collect()
}

/// Run a labeled query and decode every row into a [`Cell`].
///
/// # Errors
///
/// Returns an error on timeout, connection failure, or if any row does not
/// match `keys` plus [`VALUE_COLUMN`].
pub async fn fetch_cells(
    pool: &PgPool,
    sql: &str,
    params: &[String],
    keys: &[String],
    deadline: Duration,
) -> Result<Vec<Cell>> {
    let rows = bounded(sql, deadline, bind(sql, params).fetch_all(pool)).await?;
    rows.iter().map(|row| decode_cell(row, keys)).collect()
}
