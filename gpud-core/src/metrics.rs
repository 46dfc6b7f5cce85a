//! Prometheus metrics for GPUd

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, GaugeVec, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

use crate::api::{HealthStateType, RepairActionType};

/// Component health (0=healthy, 1=initializing, 2=degraded, 3=unhealthy)
static COMPONENT_HEALTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("gpud_component_health", "Health of the latest component check"),
        &["component"]
    )
    .expect("Failed to create component_health metric")
});

static CHECK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gpud_check_duration_seconds",
        "Duration of component checks",
        &["component"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to create check_duration metric")
});

/// Checks that did not come back healthy
static CHECK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("gpud_check_failures_total", "Total number of non-healthy check results"),
        &["component", "health"]
    )
    .expect("Failed to create check_failures metric")
});

static SUGGESTED_ACTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!(
            "gpud_suggested_actions",
            "Number of components with a live suggestion for the repair action"
        ),
        &["action"]
    )
    .expect("Failed to create suggested_actions metric")
});

static COMPONENTS_REGISTERED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "gpud_components_registered",
        "Number of registered components"
    ))
    .expect("Failed to create components_registered metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*COMPONENT_HEALTH;
        let _ = &*CHECK_DURATION;
        let _ = &*CHECK_FAILURES;
        let _ = &*SUGGESTED_ACTIONS;
        let _ = &*COMPONENTS_REGISTERED;
        Self
    }

    /// Record the outcome and duration of one check
    pub fn observe_check(&self, component: &str, health: HealthStateType, duration_secs: f64) {
        let level = match health {
            HealthStateType::Healthy => 0.0,
            HealthStateType::Initializing => 1.0,
            HealthStateType::Degraded => 2.0,
            HealthStateType::Unhealthy => 3.0,
        };
        COMPONENT_HEALTH.with_label_values(&[component]).set(level);
        CHECK_DURATION
            .with_label_values(&[component])
            .observe(duration_secs);

        if matches!(health, HealthStateType::Degraded | HealthStateType::Unhealthy) {
            CHECK_FAILURES
                .with_label_values(&[component, &health.to_string()])
                .inc();
        }
    }

    pub fn set_registered_components(&self, count: usize) {
        COMPONENTS_REGISTERED.set(count as i64);
    }

    pub fn set_suggested_components(&self, action: RepairActionType, count: usize) {
        SUGGESTED_ACTIONS
            .with_label_values(&[action.as_str()])
            .set(count as i64);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let registry = MetricsRegistry::new();

        registry.observe_check("metrics-test", HealthStateType::Healthy, 0.025);
        registry.observe_check("metrics-test", HealthStateType::Unhealthy, 1.5);
        registry.set_registered_components(3);
        registry.set_suggested_components(RepairActionType::RebootSystem, 2);

        assert_eq!(
            COMPONENT_HEALTH.with_label_values(&["metrics-test"]).get(),
            3.0
        );
        assert_eq!(
            CHECK_FAILURES
                .with_label_values(&["metrics-test", "Unhealthy"])
                .get(),
            1
        );
    }

    #[test]
    fn test_gather_text() {
        let registry = MetricsRegistry::new();
        registry.observe_check("gather-test", HealthStateType::Healthy, 0.01);

        let text = gather_text();
        assert!(text.contains("gpud_check_duration_seconds"));
        assert!(text.contains("gather-test"));
    }
}
