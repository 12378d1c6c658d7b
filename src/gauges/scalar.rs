use crate::gauges::query::fetch_scalar;
use prometheus::{Gauge, IntCounter};
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Unlabeled gauge recomputed by one bounded query every time it is read.
///
/// Built by [`crate::gauges::Gauges::new_scalar`]. A failed read keeps the
/// previous value (0.0 before the first success).
#[derive(Clone)]
pub struct ScalarGauge {
    name: Arc<str>,
    query: Arc<str>,
    params: Arc<[String]>,
    gauge: Gauge,
    pool: PgPool,
    timeout: Duration,
    errors: IntCounter,
}

impl ScalarGauge {
    pub(crate) fn new(
        name: &str,
        query: &str,
        params: &[&str],
        gauge: Gauge,
        pool: PgPool,
        timeout: Duration,
        errors: IntCounter,
    ) -> Self {
        Self {
            name: Arc::from(name),
            query: Arc::from(query),
            params: params.iter().map(|p| (*p).to_string()).collect(),
            gauge,
            pool,
            timeout,
            errors,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the query now and return the fresh value, or the last one on failure.
    pub async fn read(&self) -> f64 {
        match fetch_scalar(&self.pool, &self.query, &self.params, self.timeout).await {
            Ok(value) => {
                self.gauge.set(value);
                value
            }
            Err(e) => {
                warn!(metric = %self.name, error = %e, "failed to query metric");
                self.errors.inc();
                self.gauge.get()
            }
        }
    }

    /// Last value read, without touching the database.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.gauge.get()
    }
}
