//! Prometheus metrics exposition
//!
//! The gateway records request-level series here; the credential pool emits
//! its own (`gateway_selections_total`, `gateway_attempts_total`,
//! `gateway_credentials_disabled_total`, `gateway_maintenance_jobs_total`)
//! through the same global recorder.
//!
//! - `gateway_requests_total` (counter): label `status`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_rejections_total` (counter): label `kind`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Request durations render as a histogram with buckets from 5ms to 60s so
/// `histogram_quantile()` works; streamed requests are measured to the first
/// chunk.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Handle backed by a recorder that is never installed globally.
#[cfg(test)]
pub fn test_handle() -> PrometheusHandle {
    builder().build_recorder().handle()
}

/// Record a completed gateway request.
pub fn record_request(status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone()).increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a request refused by the gateway itself, keyed by error kind.
pub fn record_rejection(kind: &'static str) {
    metrics::counter!("gateway_rejections_total", "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, 0.05);
        record_rejection("rate_limited");
    }

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, 0.042);
        record_request(503, 1.5);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("status=\"503\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
    }

    #[test]
    fn rejections_carry_kind_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_rejection("quota_exceeded");
        record_rejection("unauthorized");

        let output = handle.render();
        assert!(output.contains("gateway_rejections_total"));
        assert!(output.contains("kind=\"quota_exceeded\""));
        assert!(output.contains("kind=\"unauthorized\""));
    }

    #[test]
    fn histogram_buckets_span_5ms_to_60s() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"0.01\""));
        assert!(output.contains("le=\"60\""));
        assert!(output.contains("le=\"+Inf\""));
    }
}
