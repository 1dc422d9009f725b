// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the drop service. The exporter uses the pull
// model: the recorder is installed globally at startup and the /metrics
// endpoint renders whatever has been recorded since.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

// =============================================================================
// METRIC NAMES
// =============================================================================

/// HTTP request counter
/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Drop lifecycle transition counter
/// Labels: action, target
pub const DROP_TRANSITIONS_TOTAL: &str = "drop_transitions_total";

/// Reservation attempts counter
/// Labels: drop_id, outcome (authorized/declined)
pub const RESERVATIONS_TOTAL: &str = "drop_reservations_total";

/// Current discount gauge per active drop
/// Labels: drop_id
pub const DROP_CURRENT_DISCOUNT: &str = "drop_current_discount_percentage";

/// Settlement capture counter
/// Labels: drop_id, result (captured/failed)
pub const SETTLEMENT_CAPTURES_TOTAL: &str = "settlement_captures_total";

/// Settlement pass duration histogram
pub const SETTLEMENT_DURATION_SECONDS: &str = "settlement_duration_seconds";

/// Recorded returns counter
/// Labels: suspended (true when the return crossed the ceiling)
pub const RETURNS_TOTAL: &str = "reputation_returns_total";

// =============================================================================
// SETUP
// =============================================================================

/// Install the global Prometheus recorder and return the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    // A settlement pass calls the processor once per reservation, so
    // its distribution lives well above request latency
    let settlement_buckets = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(SETTLEMENT_DURATION_SECONDS.to_string()),
            settlement_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request latency in seconds"
    );
    describe_counter!(DROP_TRANSITIONS_TOTAL, "Drop lifecycle transitions applied");
    describe_counter!(RESERVATIONS_TOTAL, "Reservation attempts by outcome");
    describe_gauge!(
        DROP_CURRENT_DISCOUNT,
        "Current escalated discount percentage per drop"
    );
    describe_counter!(
        SETTLEMENT_CAPTURES_TOTAL,
        "Per-reservation capture results during settlement"
    );
    describe_histogram!(
        SETTLEMENT_DURATION_SECONDS,
        "Wall-clock duration of a full settlement pass"
    );
    describe_counter!(RETURNS_TOTAL, "Confirmed item returns recorded");

    Ok(handle)
}

// =============================================================================
// HELPERS
// =============================================================================

/// Record an HTTP request with its status and latency.
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record an applied lifecycle transition.
pub fn record_transition(action: crate::lifecycle::DropAction, target: crate::models::DropStatus) {
    counter!(
        DROP_TRANSITIONS_TOTAL,
        "action" => action.to_string(),
        "target" => target.as_str().to_string()
    )
    .increment(1);
}

/// Record a reservation attempt outcome for a drop.
pub fn record_reservation(drop_id: Uuid, outcome: &str) {
    counter!(
        RESERVATIONS_TOTAL,
        "drop_id" => drop_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Publish a drop's current discount after a ledger update.
pub fn set_drop_discount(drop_id: Uuid, discount: Decimal) {
    gauge!(
        DROP_CURRENT_DISCOUNT,
        "drop_id" => drop_id.to_string()
    )
    .set(discount.to_f64().unwrap_or(0.0));
}

/// Record a single capture result during settlement.
pub fn record_capture(drop_id: Uuid, success: bool) {
    let result = if success { "captured" } else { "failed" };
    counter!(
        SETTLEMENT_CAPTURES_TOTAL,
        "drop_id" => drop_id.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record the duration of a settlement pass.
pub fn record_settlement_duration(duration_secs: f64) {
    histogram!(SETTLEMENT_DURATION_SECONDS).record(duration_secs);
}

/// Record a confirmed return, tagged with whether it triggered suspension.
pub fn record_return_event(suspended: bool) {
    counter!(
        RETURNS_TOTAL,
        "suspended" => suspended.to_string()
    )
    .increment(1);
}
