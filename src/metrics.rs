use ::metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::{Duration, Instant};
use tracing::info;

pub struct Metrics {
    pub captures_succeeded: Counter,
    pub captures_failed: Counter,
    pub capture_duration: Histogram,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub browser_launches: Counter,
    pub browser_disconnects: Counter,
    pub active_captures: Gauge,
    started_at: Instant,
}

impl Metrics {
    /// Handles bound to the globally installed recorder.
    ///
    /// Install the recorder (see [`install_prometheus_recorder`]) before
    /// calling this, otherwise every handle is a no-op.
    pub fn new() -> Self {
        Self {
            captures_succeeded: register_counter!("screenshot_captures_total", "outcome" => "success"),
            captures_failed: register_counter!("screenshot_captures_total", "outcome" => "failure"),
            capture_duration: register_histogram!("screenshot_capture_duration_seconds"),
            cache_hits: register_counter!("screenshot_cache_lookups_total", "result" => "hit"),
            cache_misses: register_counter!("screenshot_cache_lookups_total", "result" => "miss"),
            browser_launches: register_counter!("screenshot_browser_launches_total"),
            browser_disconnects: register_counter!("screenshot_browser_disconnects_total"),
            active_captures: register_gauge!("screenshot_active_captures"),
            started_at: Instant::now(),
        }
    }

    pub fn noop() -> Self {
        Self {
            captures_succeeded: Counter::noop(),
            captures_failed: Counter::noop(),
            capture_duration: Histogram::noop(),
            cache_hits: Counter::noop(),
            cache_misses: Counter::noop(),
            browser_launches: Counter::noop(),
            browser_disconnects: Counter::noop(),
            active_captures: Gauge::noop(),
            started_at: Instant::now(),
        }
    }

    pub fn record_capture(&self, duration: Duration, success: bool) {
        if success {
            self.captures_succeeded.increment(1);
        } else {
            self.captures_failed.increment(1);
        }

        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.increment(1);
        } else {
            self.cache_misses.increment(1);
        }
    }

    pub fn record_browser_launch(&self) {
        self.browser_launches.increment(1);
    }

    pub fn record_browser_disconnect(&self) {
        self.browser_disconnects.increment(1);
    }

    pub fn capture_started(&self) {
        self.active_captures.increment(1.0);
    }

    pub fn capture_finished(&self) {
        self.active_captures.decrement(1.0);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::noop()
    }
}

/// Install the Prometheus recorder globally and return a handle for rendering
/// the scrape output.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, ::metrics::SetRecorderError> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    ::metrics::set_boxed_recorder(Box::new(recorder))?;
    info!("Prometheus recorder installed");

    Ok(handle)
}
