//! Metric factory and the engine behind every collector.
//!
//! [`Gauges`] owns the pool, the constant labels, the refresh interval, the
//! shared error counter and the Prometheus registry. Every metric it builds
//! borrows those through an `Arc`:
//!
//! - [`ScalarGauge`]: one query, executed on every scrape.
//! - [`VectorGauge`]: labeled cells refreshed by a background task every
//!   `interval`, read on scrape without touching the database.
//!
//! Capability checks ([`Requirement`]) run once, when a collector builds its
//! metrics. A metric whose requirement fails is registered but stays empty,
//! and the error counter is bumped exactly once.

pub mod capability;
pub mod query;
pub mod scalar;
pub mod vector;

pub use capability::{Capabilities, Requirement};
pub use query::{Cell, QUERY_TIMEOUT, with_statement_timeout};
pub use scalar::ScalarGauge;
pub use vector::{CellMap, CellSource, LabeledQuery, VectorGauge};

use anyhow::{Context, Result, bail};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder, proto::MetricFamily};
use sqlx::{FromRow, PgPool, postgres::PgRow};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info_span, warn};
use tracing_futures::Instrument as _;

/// Counter bumped whenever a metric is disabled or one of its queries fails.
pub const ERRORS_METRIC: &str = "postgresql_exporter_errors_total";

/// Default refresh interval for vector gauges.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Settings shared by every metric of one factory.
#[derive(Clone, Debug)]
pub struct GaugesConfig {
    pub labels: HashMap<String, String>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for GaugesConfig {
    fn default() -> Self {
        Self {
            labels: HashMap::new(),
            interval: DEFAULT_INTERVAL,
            timeout: QUERY_TIMEOUT,
        }
    }
}

#[derive(Clone)]
enum Metric {
    Scalar(ScalarGauge),
    Vector(VectorGauge),
}

struct Inner {
    pool: PgPool,
    config: GaugesConfig,
    registry: Registry,
    errors: IntCounter,
    capabilities: Capabilities,
    metrics: Mutex<HashMap<String, Metric>>,
    scalars: RwLock<Vec<ScalarGauge>>,
}

/// Builds and owns every gauge exported for one database.
#[derive(Clone)]
pub struct Gauges {
    inner: Arc<Inner>,
}

impl Gauges {
    /// Create a factory and register its error counter.
    ///
    /// # Errors
    ///
    /// Returns an error if a constant label is invalid.
    pub fn new(pool: PgPool, config: GaugesConfig) -> Result<Self> {
        let registry = Registry::new();

        let errors = IntCounter::with_opts(
            Opts::new(
                ERRORS_METRIC,
                "Errors while computing metrics: disabled metrics plus failed queries",
            )
            .const_labels(config.labels.clone()),
        )
        .context("invalid error counter options")?;
        registry.register(Box::new(errors.clone()))?;

        let capabilities = Capabilities::new(pool.clone(), config.timeout);

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                config,
                registry,
                errors,
                capabilities,
                metrics: Mutex::new(HashMap::new()),
                scalars: RwLock::new(Vec::new()),
            }),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    #[must_use]
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.inner.config.labels
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.config.interval
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[must_use]
    pub fn errors_total(&self) -> u64 {
        self.inner.errors.get()
    }

    pub fn record_error(&self) {
        self.inner.errors.inc();
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        Opts::new(name, help).const_labels(self.inner.config.labels.clone())
    }

    /// Build (or return the already registered) scalar gauge `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is taken by a vector or the options are invalid.
    pub fn new_scalar(
        &self,
        name: &str,
        help: &str,
        query: &str,
        params: &[&str],
    ) -> Result<ScalarGauge> {
        let mut metrics = self.inner.metrics.lock();

        match metrics.get(name) {
            Some(Metric::Scalar(existing)) => {
                debug!(metric = name, "scalar already registered");
                return Ok(existing.clone());
            }
            Some(Metric::Vector(_)) => bail!("{name} is already registered as a vector"),
            None => {}
        }

        let gauge = Gauge::with_opts(self.opts(name, help))
            .with_context(|| format!("invalid options for {name}"))?;
        self.inner
            .registry
            .register(Box::new(gauge.clone()))
            .with_context(|| format!("failed to register {name}"))?;

        let scalar = ScalarGauge::new(
            name,
            query,
            params,
            gauge,
            self.inner.pool.clone(),
            self.inner.config.timeout,
            self.inner.errors.clone(),
        );

        self.inner.scalars.write().push(scalar.clone());
        metrics.insert(name.to_string(), Metric::Scalar(scalar.clone()));

        Ok(scalar)
    }

    /// Build (or return the already registered) vector gauge `name`.
    ///
    /// Construction does not start refreshing; see [`Gauges::spawn_refresh`].
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is taken by a scalar or the options are invalid.
    pub fn new_vector(&self, name: &str, help: &str, keys: &[&str]) -> Result<VectorGauge> {
        let mut metrics = self.inner.metrics.lock();

        match metrics.get(name) {
            Some(Metric::Vector(existing)) => {
                debug!(metric = name, "vector already registered");
                return Ok(existing.clone());
            }
            Some(Metric::Scalar(_)) => bail!("{name} is already registered as a scalar"),
            None => {}
        }

        let vector = VectorGauge::new(self.opts(name, help), keys)
            .with_context(|| format!("invalid options for {name}"))?;
        self.inner
            .registry
            .register(Box::new(vector.clone()))
            .with_context(|| format!("failed to register {name}"))?;

        metrics.insert(name.to_string(), Metric::Vector(vector.clone()));

        Ok(vector)
    }

    /// Start the background refresh loop of `gauge`.
    ///
    /// The task runs every source, then sleeps for the shared interval, for as
    /// long as the process lives. Returns `None` if the loop is already running.
    pub fn spawn_refresh(
        &self,
        gauge: &VectorGauge,
        sources: Vec<Box<dyn CellSource>>,
    ) -> Option<JoinHandle<()>> {
        if !gauge.mark_started() {
            debug!(metric = gauge.name(), "refresh loop already running");
            return None;
        }

        let gauges = self.clone();
        let gauge = gauge.clone();
        let span = info_span!("gauge.refresh", metric = %gauge.name(), otel.kind = "internal");

        Some(tokio::spawn(
            async move {
                loop {
                    gauges.refresh_once(&gauge, &sources).await;
                    sleep(gauges.interval()).await;
                }
            }
            .instrument(span),
        ))
    }

    /// Run every source of `gauge` once, committing each successful result.
    pub async fn refresh_once(&self, gauge: &VectorGauge, sources: &[Box<dyn CellSource>]) {
        for source in sources {
            match source.fetch(self, gauge.keys()).await {
                Ok(cells) => {
                    let written = gauge.commit(cells);
                    debug!(
                        metric = gauge.name(),
                        source = source.describe(),
                        cells = written,
                        "refreshed"
                    );
                }
                Err(e) => {
                    warn!(
                        metric = gauge.name(),
                        source = source.describe(),
                        error = %e,
                        "failed to refresh metric"
                    );
                    self.record_error();
                }
            }
        }
    }

    /// Log that `metric` is disabled and count it once.
    pub fn disable(&self, metric: &str, reason: &str) {
        error!(metric, "{metric} disabled because {reason}");
        self.record_error();
    }

    /// Check `requirement` for `metric`, disabling the metric when it is not met.
    /// A capability that cannot be resolved counts as not met.
    pub async fn require(&self, metric: &str, requirement: Requirement) -> bool {
        let met = match requirement {
            Requirement::Superuser => self.inner.capabilities.is_superuser().await,
            Requirement::Extension(name) => self.inner.capabilities.has_extension(name).await,
        };

        match met {
            Ok(true) => true,
            Ok(false) => {
                self.disable(metric, &requirement.to_string());
                false
            }
            Err(e) => {
                self.disable(
                    metric,
                    &format!("{requirement} could not be verified: {e}"),
                );
                false
            }
        }
    }

    pub async fn is_superuser(&self) -> bool {
        self.inner
            .capabilities
            .is_superuser()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to resolve role privilege");
                false
            })
    }

    pub async fn has_extension(&self, name: &str) -> bool {
        self.inner
            .capabilities
            .has_extension(name)
            .await
            .unwrap_or_else(|e| {
                warn!(extension = name, error = %e, "failed to resolve extension");
                false
            })
    }

    /// Server version, or an empty string if it cannot be resolved (which
    /// selects the default query variants).
    pub async fn server_version(&self) -> String {
        self.inner
            .capabilities
            .server_version()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to resolve server version");
                String::new()
            })
    }

    /// Bounded scalar query against the shared pool.
    ///
    /// # Errors
    ///
    /// See [`query::fetch_scalar`].
    pub async fn fetch_scalar(&self, sql: &str, params: &[String]) -> Result<f64> {
        query::fetch_scalar(&self.inner.pool, sql, params, self.inner.config.timeout).await
    }

    /// Bounded typed query against the shared pool.
    ///
    /// # Errors
    ///
    /// See [`query::fetch_all`].
    pub async fn fetch_all<T>(&self, sql: &str, params: &[String]) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow>,
    {
        query::fetch_all(&self.inner.pool, sql, params, self.inner.config.timeout).await
    }

    /// Bounded labeled query against the shared pool.
    ///
    /// # Errors
    ///
    /// See [`query::fetch_cells`].
    pub async fn fetch_cells(
        &self,
        sql: &str,
        params: &[String],
        keys: &[String],
    ) -> Result<Vec<Cell>> {
        query::fetch_cells(&self.inner.pool, sql, params, keys, self.inner.config.timeout).await
    }

    /// Read every scalar gauge concurrently.
    pub async fn collect_scalars(&self) {
        let scalars = self.inner.scalars.read().clone();

        let mut reads: FuturesUnordered<_> = scalars.iter().map(ScalarGauge::read).collect();
        while reads.next().await.is_some() {}
    }

    /// Refresh scalars, then gather every registered family.
    pub async fn gather(&self) -> Vec<MetricFamily> {
        self.collect_scalars().await;
        self.inner.registry.gather()
    }

    /// Prometheus text exposition of [`Gauges::gather`].
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub async fn render(&self) -> Result<String> {
        let families = self.gather().await;
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
