use crate::gauges::{Gauges, query::Cell};
use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use prometheus::{
    GaugeVec, Opts,
    core::{Collector, Desc},
    proto::MetricFamily,
};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::warn;

/// Label values (in declaration order) to the last observed sample.
pub type CellMap = BTreeMap<Vec<String>, f64>;

/// One query (or query chain) feeding a [`VectorGauge`].
pub trait CellSource: Send + Sync {
    /// Short description used in logs.
    fn describe(&self) -> &str;

    fn fetch<'a>(&'a self, gauges: &'a Gauges, keys: &'a [String]) -> BoxFuture<'a, Result<Vec<Cell>>>;
}

/// A plain SQL source whose rows carry the label columns plus `value`.
#[derive(Clone, Debug)]
pub struct LabeledQuery {
    describe: String,
    query: String,
    params: Vec<String>,
}

impl LabeledQuery {
    pub fn new(describe: &str, query: &str) -> Self {
        Self {
            describe: describe.to_string(),
            query: query.to_string(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| (*p).to_string()).collect();
        self
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }
}

impl CellSource for LabeledQuery {
    fn describe(&self) -> &str {
        &self.describe
    }

    fn fetch<'a>(&'a self, gauges: &'a Gauges, keys: &'a [String]) -> BoxFuture<'a, Result<Vec<Cell>>> {
        Box::pin(gauges.fetch_cells(&self.query, &self.params, keys))
    }
}

/// Labeled gauge family refreshed in the background and read without I/O.
///
/// Cells are upserted one query result at a time under a single write lock, so
/// readers never see half of a result. Cells whose rows disappear keep their
/// last value.
#[derive(Clone)]
pub struct VectorGauge {
    name: Arc<str>,
    opts: Opts,
    keys: Arc<[String]>,
    descs: Arc<[Desc]>,
    cells: Arc<RwLock<CellMap>>,
    started: Arc<AtomicBool>,
}

impl VectorGauge {
    pub(crate) fn new(opts: Opts, keys: &[&str]) -> Result<Self> {
        let template = GaugeVec::new(opts.clone(), keys)?;
        let descs: Vec<Desc> = template.desc().into_iter().cloned().collect();

        Ok(Self {
            name: Arc::from(opts.name.as_str()),
            opts,
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
            descs: descs.into(),
            cells: Arc::new(RwLock::new(CellMap::new())),
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Upsert one query result. Cells with the wrong number of labels are skipped.
    /// Returns how many cells were written.
    pub fn commit(&self, cells: Vec<Cell>) -> usize {
        let (valid, invalid): (Vec<Cell>, Vec<Cell>) = cells
            .into_iter()
            .partition(|cell| cell.labels.len() == self.keys.len());

        for cell in &invalid {
            warn!(
                metric = %self.name,
                labels = ?cell.labels,
                expected = self.keys.len(),
                "dropping cell with wrong label count"
            );
        }

        let written = valid.len();
        let mut map = self.cells.write();
        for cell in valid {
            map.insert(cell.labels, cell.value);
        }

        written
    }

    /// Snapshot of every cell.
    #[must_use]
    pub fn cells(&self) -> CellMap {
        self.cells.read().clone()
    }

    #[must_use]
    pub fn get(&self, labels: &[&str]) -> Option<f64> {
        let key: Vec<String> = labels.iter().map(|l| (*l).to_string()).collect();
        self.cells.read().get(&key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Claim the refresh loop. Only the first caller gets `true`.
    pub(crate) fn mark_started(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Collector for VectorGauge {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.cells();
        let keys: Vec<&str> = self.keys.iter().map(String::as_str).collect();

        let family = match GaugeVec::new(self.opts.clone(), &keys) {
            Ok(family) => family,
            Err(e) => {
                warn!(metric = %self.name, error = %e, "failed to build metric family");
                return Vec::new();
            }
        };

        for (labels, value) in &snapshot {
            let values: Vec<&str> = labels.iter().map(String::as_str).collect();
            match family.get_metric_with_label_values(&values) {
                Ok(gauge) => gauge.set(*value),
                Err(e) => warn!(metric = %self.name, error = %e, "failed to set cell"),
            }
        }

        family.collect()
    }
}
