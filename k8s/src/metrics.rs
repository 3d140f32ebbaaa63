use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family};
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ValidationLabels {
    namespace: String,
}

/// Counts token validation outcomes, labeled by the claimed namespace.
#[derive(Clone, Debug, Default)]
pub struct ValidationMetrics {
    successful: Family<ValidationLabels, Counter>,
    failed: Family<ValidationLabels, Counter>,
}

// === impl ValidationMetrics ===

impl ValidationMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "prometheus_auth_successful_validations",
            "Total number of successful service account validations",
            metrics.successful.clone(),
        );
        registry.register(
            "prometheus_auth_failed_validations",
            "Total number of failed service account validations; the namespace label is empty when no namespace could be parsed",
            metrics.failed.clone(),
        );
        metrics
    }

    pub fn inc_successful(&self, namespace: &str) {
        self.successful
            .get_or_create(&ValidationLabels {
                namespace: namespace.to_string(),
            })
            .inc();
    }

    pub fn inc_failed(&self, namespace: &str) {
        self.failed
            .get_or_create(&ValidationLabels {
                namespace: namespace.to_string(),
            })
            .inc();
    }
}
