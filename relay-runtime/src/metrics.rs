//! Metrics instrumentation for run observability.

use std::time::Instant;

/// Record the wall time of one run.
pub fn record_run_duration(duration_ms: f64) {
    metrics::histogram!("run_duration", duration_ms);
}

/// Record time between task publication and pickup.
pub fn record_queue_latency(duration_ms: f64) {
    metrics::histogram!("task_queue_latency", duration_ms);
}

/// Record how long a run waited for a client response.
pub fn record_correlator_wait(duration_ms: f64) {
    metrics::histogram!("correlator_wait_duration", duration_ms);
}

/// Increment the client response timeout counter.
pub fn increment_correlator_timeouts() {
    metrics::counter!("correlator_timeouts", 1);
}

/// RAII timer for automatic metric recording.
pub struct MetricTimer {
    start: Instant,
    metric_name: &'static str,
}

impl MetricTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        match self.metric_name {
            "run_duration" => record_run_duration(duration_ms),
            "correlator_wait_duration" => record_correlator_wait(duration_ms),
            _ => {}
        }
    }
}
