use crate::Error;
use opentelemetry::trace::TraceId;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, exemplar::HistogramWithExemplars, family::Family},
    registry::{Registry, Unit},
};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("dbcontroller");
        let reconcile =
            ReconcileMetrics::default().register(registry.sub_registry_with_prefix("reconcile"));
        Self {
            registry: Arc::new(registry),
            reconcile,
        }
    }
}

type DurationHistogram = HistogramWithExemplars<TraceLabels>;

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<KindLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Family<KindLabels, DurationHistogram, fn() -> DurationHistogram>,
}

fn duration_histogram() -> DurationHistogram {
    HistogramWithExemplars::new([0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.].into_iter())
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<KindLabels, Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: Family::new_with_constructor(duration_histogram),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TraceLabels {
    pub trace_id: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub kind: String,
    pub instance: String,
    pub error: String,
}

impl ReconcileMetrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure(&self, kind: &str, name: String, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                kind: kind.to_string(),
                instance: name,
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, kind: &str, trace_id: &TraceId) -> ReconcileMeasurer {
        let labels = KindLabels {
            kind: kind.to_string(),
        };
        self.runs.get_or_create(&labels).inc();

        let exemplar = (*trace_id != TraceId::INVALID).then(|| TraceLabels {
            trace_id: trace_id.to_string(),
        });

        ReconcileMeasurer {
            start: Instant::now(),
            exemplar,
            metric: self.duration.get_or_create(&labels).clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    exemplar: Option<TraceLabels>,
    metric: DurationHistogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(
            duration,
            self.exemplar.take(),
            Some(std::time::SystemTime::now()),
        );
    }
}
