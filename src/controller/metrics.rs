//! Prometheus metrics for the OpenSearch operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `opensearch_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `opensearch_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `opensearch_switchover_total` (counter): finished switchovers labeled by mode and result.
//! - `opensearch_replication_health` (gauge): 2 = up, 1 = degraded, 0 = down, per resource.
//! - `opensearch_replication_restarts_total` (counter): replication restarts issued by the watcher.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "opensearchservice"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind/category, e.g. "kube", "remote_api", "timeout"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SwitchoverLabels {
    pub mode: String,
    /// "success" or "failed"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub namespace: String,
    pub name: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~5.5min across 16 buckets; switchovers are slow.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static SWITCHOVER_TOTAL: Lazy<Family<SwitchoverLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static REPLICATION_HEALTH: Lazy<Family<ResourceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static REPLICATION_RESTARTS_TOTAL: Lazy<Family<ResourceLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "opensearch_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "opensearch_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "opensearch_switchover",
        "Total number of finished disaster recovery switchovers",
        SWITCHOVER_TOTAL.clone(),
    );
    registry.register(
        "opensearch_replication_health",
        "Replication health of a standby cluster (2 = up, 1 = degraded, 0 = down)",
        REPLICATION_HEALTH.clone(),
    );
    registry.register(
        "opensearch_replication_restarts",
        "Total number of replication restarts issued by the replication watcher",
        REPLICATION_RESTARTS_TOTAL.clone(),
    );

    registry
});

/// Record reconcile duration in seconds
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment reconcile error counter
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_switchover(mode: &str, success: bool) {
    let labels = SwitchoverLabels {
        mode: mode.to_string(),
        result: if success { "success" } else { "failed" }.to_string(),
    };
    SWITCHOVER_TOTAL.get_or_create(&labels).inc();
}

pub fn set_replication_health(namespace: &str, name: &str, value: i64) {
    let labels = ResourceLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    REPLICATION_HEALTH.get_or_create(&labels).set(value);
}

pub fn inc_replication_restart(namespace: &str, name: &str) {
    let labels = ResourceLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    REPLICATION_RESTARTS_TOTAL.get_or_create(&labels).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_exports_switchover_counter() {
        inc_switchover("active", true);
        set_replication_health("ns", "opensearch", 2);

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();

        assert!(buffer.contains("opensearch_switchover_total"));
        assert!(buffer.contains("mode=\"active\""));
        assert!(buffer.contains("opensearch_replication_health"));
    }
}
