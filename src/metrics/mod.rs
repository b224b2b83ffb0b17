//! Metrics collection for observability

use prometheus::{
    CounterVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry,
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry,
};
use std::sync::Arc;
use once_cell::sync::Lazy;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Turn metrics
    pub turns: CounterVec,
    pub turn_duration: HistogramVec,

    // Streaming metrics
    pub stream_chunks: IntCounter,
    pub stream_failures: CounterVec,

    // Context metrics
    pub window_tokens: Histogram,
    pub compressions: CounterVec,

    // Side effects
    pub title_generations: CounterVec,

    // Sessions
    pub active_sessions: IntGauge,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let turns = register_counter_vec_with_registry!(
            Opts::new("chat_turns_total", "Total chat turns processed"),
            &["transport", "outcome"],
            registry
        )?;

        let turn_duration = register_histogram_vec_with_registry!(
            "chat_turn_duration_seconds",
            "Time from receiving a user turn to its final signal",
            &["transport"],
            registry
        )?;

        let stream_chunks = register_int_counter_with_registry!(
            Opts::new("chat_stream_chunks_total", "Total chunks relayed from the model"),
            registry
        )?;

        let stream_failures = register_counter_vec_with_registry!(
            Opts::new("chat_stream_failures_total", "Model streams that ended without completing"),
            &["reason"],
            registry
        )?;

        let window_tokens = register_histogram_with_registry!(
            HistogramOpts::new("chat_window_tokens", "Estimated tokens per model window").buckets(
                vec![64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0]
            ),
            registry
        )?;

        let compressions = register_counter_vec_with_registry!(
            Opts::new("chat_compressions_total", "Context compression attempts"),
            &["outcome"],
            registry
        )?;

        let title_generations = register_counter_vec_with_registry!(
            Opts::new("chat_title_generations_total", "Background title generation attempts"),
            &["status"],
            registry
        )?;

        let active_sessions = register_int_gauge_with_registry!(
            Opts::new("chat_active_sessions", "Live duplex sessions"),
            registry
        )?;

        Ok(Self {
            registry,
            turns,
            turn_duration,
            stream_chunks,
            stream_failures,
            window_tokens,
            compressions,
            title_generations,
            active_sessions,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished turn
    pub fn record_turn(&self, transport: &str, outcome: &str, seconds: f64) {
        self.turns.with_label_values(&[transport, outcome]).inc();
        self.turn_duration.with_label_values(&[transport]).observe(seconds);
    }

    pub fn record_chunk(&self) {
        self.stream_chunks.inc();
    }

    /// Record a stream that failed, timed out or was cancelled
    pub fn record_stream_failure(&self, reason: &str) {
        self.stream_failures.with_label_values(&[reason]).inc();
    }

    pub fn record_window(&self, tokens: usize) {
        self.window_tokens.observe(tokens as f64);
    }

    /// Record a compression outcome (`compressed`, `skipped`, `failed`)
    pub fn record_compression(&self, outcome: &str) {
        self.compressions.with_label_values(&[outcome]).inc();
    }

    pub fn record_title_generation(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.title_generations.with_label_values(&[status]).inc();
    }

    pub fn session_opened(&self) {
        self.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
