// Metrics sink - typed entry points over a local Prometheus registry
//
// Every component reports through these methods rather than touching
// collectors directly. The registry is process-local; /proxy/metrics
// concatenates the backend scrape with this exposition.

use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

/// Observed backend state for the state gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

/// Typed metrics sink
pub struct Metrics {
    registry: Registry,

    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    request_bytes: IntCounterVec,

    scale_ups_total: IntCounterVec,
    scale_downs_total: IntCounterVec,
    startup_duration_seconds: HistogramVec,
    model_switches_total: IntCounter,

    xml_parse_total: IntCounterVec,
    dedup_dropped_total: IntCounter,
    translation_failures_total: IntCounterVec,

    backend_state: IntGauge,
    last_activity_timestamp: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("podchill_requests_total", "Proxied requests by path and status"),
            &["path", "status"],
        )
        .unwrap();

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "podchill_request_duration_seconds",
                "End-to-end request latency",
            )
            .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 120.0]),
            &["path"],
        )
        .unwrap();

        let request_bytes = IntCounterVec::new(
            Opts::new("podchill_request_bytes_total", "Body bytes by direction"),
            &["direction"],
        )
        .unwrap();

        let scale_ups_total = IntCounterVec::new(
            Opts::new("podchill_scale_ups_total", "Pod scale-up attempts by outcome"),
            &["outcome"],
        )
        .unwrap();

        let scale_downs_total = IntCounterVec::new(
            Opts::new("podchill_scale_downs_total", "Pod scale-downs by reason"),
            &["reason"],
        )
        .unwrap();

        let startup_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "podchill_startup_duration_seconds",
                "Cold start duration from create to ready",
            )
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 90.0, 120.0, 180.0]),
            &["outcome"],
        )
        .unwrap();

        let model_switches_total = IntCounter::new(
            "podchill_model_switches_total",
            "Model profile switches triggered by requests",
        )
        .unwrap();

        let xml_parse_total = IntCounterVec::new(
            Opts::new(
                "podchill_xml_tool_parse_total",
                "XML tool-call conversions by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let dedup_dropped_total = IntCounter::new(
            "podchill_dedup_dropped_chunks_total",
            "Duplicate tool-call chunks dropped from backend streams",
        )
        .unwrap();

        let translation_failures_total = IntCounterVec::new(
            Opts::new(
                "podchill_translation_failures_total",
                "Dialect translation failures by direction",
            ),
            &["direction"],
        )
        .unwrap();

        let backend_state = IntGauge::new(
            "podchill_backend_state",
            "Backend state: 0=stopped 1=starting 2=running 3=stopping",
        )
        .unwrap();

        let last_activity_timestamp = Gauge::new(
            "podchill_last_activity_timestamp_seconds",
            "Unix timestamp of the last proxied request",
        )
        .unwrap();

        for c in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_seconds.clone()),
            Box::new(request_bytes.clone()),
            Box::new(scale_ups_total.clone()),
            Box::new(scale_downs_total.clone()),
            Box::new(startup_duration_seconds.clone()),
            Box::new(model_switches_total.clone()),
            Box::new(xml_parse_total.clone()),
            Box::new(dedup_dropped_total.clone()),
            Box::new(translation_failures_total.clone()),
            Box::new(backend_state.clone()),
            Box::new(last_activity_timestamp.clone()),
        ] {
            registry.register(c).unwrap();
        }

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            request_bytes,
            scale_ups_total,
            scale_downs_total,
            startup_duration_seconds,
            model_switches_total,
            xml_parse_total,
            dedup_dropped_total,
            translation_failures_total,
            backend_state,
            last_activity_timestamp,
        }
    }

    pub fn record_request(
        &self,
        path: &str,
        status: u16,
        duration: Duration,
        req_bytes: usize,
        resp_bytes: usize,
    ) {
        self.requests_total
            .with_label_values(&[path, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path])
            .observe(duration.as_secs_f64());
        self.request_bytes
            .with_label_values(&["in"])
            .inc_by(req_bytes as u64);
        self.request_bytes
            .with_label_values(&["out"])
            .inc_by(resp_bytes as u64);
    }

    pub fn record_scale_up(&self, outcome: &str, duration: Duration) {
        self.scale_ups_total.with_label_values(&[outcome]).inc();
        self.startup_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn record_scale_down(&self, reason: &str) {
        self.scale_downs_total.with_label_values(&[reason]).inc();
    }

    pub fn record_model_switch(&self, from: &str, to: &str) {
        tracing::info!("model switch: {} -> {}", from, to);
        self.model_switches_total.inc();
    }

    pub fn record_xml_parse(&self, outcome: &str) {
        self.xml_parse_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_dedup_drop(&self) {
        self.dedup_dropped_total.inc();
    }

    pub fn record_translation_failure(&self, direction: &str) {
        self.translation_failures_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn set_backend_state(&self, state: BackendState) {
        self.backend_state.set(state as i64);
    }

    pub fn touch_activity(&self, unix_seconds: f64) {
        self.last_activity_timestamp.set(unix_seconds);
    }

    /// Render the local registry in the Prometheus text exposition format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buf) {
            tracing::error!("metrics encoding failed: {}", e);
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
