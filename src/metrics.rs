use metrics::{describe_counter, describe_gauge, Counter, Gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
pub use metrics_exporter_prometheus::PrometheusHandle;
use once_cell::sync::OnceCell;

/// Global metrics handle to ensure single initialization
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Events accepted past deduplication and verification
pub fn events_received() -> Counter {
    metrics::counter!("events_received")
}

/// Deliveries discarded because their dedup key was already seen
pub fn duplicate_events() -> Counter {
    metrics::counter!("duplicate_events")
}

/// Events rejected by signature verification
pub fn invalid_events() -> Counter {
    metrics::counter!("invalid_events")
}

/// Events accepted without verification because the relay is trusted
pub fn signature_checks_skipped() -> Counter {
    metrics::counter!("signature_checks_skipped")
}

/// Registered, not yet stopped subscriptions
pub fn active_subscriptions() -> Gauge {
    metrics::gauge!("active_subscriptions")
}

/// Shared relay-level subscriptions with at least one member
pub fn active_groups() -> Gauge {
    metrics::gauge!("active_groups")
}

/// Sets up the Prometheus recorder and returns a handle that can render the
/// current values.
pub fn setup_metrics() -> Result<PrometheusHandle, anyhow::Error> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    METRICS_HANDLE
        .get_or_try_init(|| {
            describe_counter!(
                "events_received",
                "Total number of unique events accepted from relays"
            );
            describe_counter!(
                "duplicate_events",
                "Total number of duplicate deliveries discarded"
            );
            describe_counter!(
                "invalid_events",
                "Total number of events that failed signature verification"
            );
            describe_counter!(
                "signature_checks_skipped",
                "Total number of events accepted without signature verification"
            );
            describe_gauge!(
                "active_subscriptions",
                "Number of registered subscriptions"
            );
            describe_gauge!(
                "active_groups",
                "Number of shared relay-level subscriptions"
            );

            let builder = PrometheusBuilder::new();
            let handle = builder.install_recorder()?;
            Ok(handle)
        })
        .cloned()
}
