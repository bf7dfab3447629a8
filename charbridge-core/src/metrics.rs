// ABOUTME: Metric descriptions and recording helpers for the dispatch engine
// ABOUTME: Goes through the metrics facade; the host decides which recorder collects them

use metrics::{describe_counter, describe_histogram};

/// Register metric descriptions. Call once after the host installs a recorder.
pub fn register_metrics() {
    describe_counter!(
        "charbridge_dispatch_total",
        "Queue items finished by the dispatch worker, by outcome"
    );
    describe_counter!(
        "charbridge_backend_retries_total",
        "Backend calls repeated after an undecodable response"
    );
    describe_counter!(
        "charbridge_linger_captured_total",
        "Follow-up messages captured by lingering windows"
    );
    describe_counter!(
        "charbridge_sessions_created_total",
        "Remote sessions created for surfaces"
    );
    describe_histogram!(
        "charbridge_delivery_seconds",
        "Time from dequeue to a posted reply"
    );
}

/// Record how a queue item ended: delivered, empty, auth_exhausted, rejected,
/// forbidden or reported.
pub fn record_dispatch(outcome: &'static str) {
    metrics::counter!("charbridge_dispatch_total", "outcome" => outcome).increment(1);
}

pub fn record_delivery_latency(seconds: f64) {
    metrics::histogram!("charbridge_delivery_seconds").record(seconds);
}

pub fn record_linger_capture() {
    metrics::counter!("charbridge_linger_captured_total").increment(1);
}

pub fn record_session_created() {
    metrics::counter!("charbridge_sessions_created_total").increment(1);
}
