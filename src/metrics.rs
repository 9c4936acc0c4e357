use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: UploadOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UploadOutcome {
    Success,
    Validation,
    CorruptArchive,
    SandboxIo,
    Provisioning,
    Publish,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SkipLabels {
    pub reason: SkipReason,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SkipReason {
    Junk,
    Unsafe,
    Symlink,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- uploads --
    pub uploads_total: Family<OutcomeLabels, Counter>,
    pub upload_duration_seconds: Histogram,

    // -- archive --
    pub extracted_entries_total: Counter,
    pub skipped_entries_total: Family<SkipLabels, Counter>,

    // -- repositories --
    pub repos_created_total: Counter,
    pub deletes_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let uploads_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "forgedrop_uploads",
            "Upload requests by outcome",
            uploads_total.clone(),
        );

        let upload_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 12));
        registry.register(
            "forgedrop_upload_duration_seconds",
            "End-to-end upload latency in seconds",
            upload_duration_seconds.clone(),
        );

        let extracted_entries_total = Counter::default();
        registry.register(
            "forgedrop_extracted_entries",
            "Archive entries written to a sandbox",
            extracted_entries_total.clone(),
        );

        let skipped_entries_total = Family::<SkipLabels, Counter>::default();
        registry.register(
            "forgedrop_skipped_entries",
            "Archive entries dropped during extraction by reason",
            skipped_entries_total.clone(),
        );

        let repos_created_total = Counter::default();
        registry.register(
            "forgedrop_repos_created",
            "Repositories created on the forge",
            repos_created_total.clone(),
        );

        let deletes_total = Counter::default();
        registry.register(
            "forgedrop_deletes",
            "Successful repository deletions",
            deletes_total.clone(),
        );

        Self {
            uploads_total,
            upload_duration_seconds,
            extracted_entries_total,
            skipped_entries_total,
            repos_created_total,
            deletes_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_appear_with_total_suffix() {
        let metrics = MetricsRegistry::new();
        metrics
            .metrics
            .uploads_total
            .get_or_create(&OutcomeLabels {
                outcome: UploadOutcome::Success,
            })
            .inc();
        metrics.metrics.deletes_total.inc();

        let text = metrics.encode().unwrap();

        assert!(text.contains("forgedrop_uploads_total{outcome=\"Success\"} 1"), "{text}");
        assert!(text.contains("forgedrop_deletes_total 1"), "{text}");
        assert!(text.contains("# TYPE forgedrop_upload_duration_seconds histogram"));
        assert!(text.trim_end().ends_with("# EOF"));
    }
}
