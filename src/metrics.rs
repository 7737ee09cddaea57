//! Prometheus Metrics for the Ingestion Pipeline
//!
//! In-process registry exposed in Prometheus text format via an HTTP
//! endpoint. Counters and gauges are atomics behind `RwLock<HashMap>` maps
//! keyed by their label values; the request-duration histogram uses fixed
//! bucket boundaries.

use axum::{routing::get, Router};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Histogram for request durations, bucketed in microseconds and rendered
/// in seconds.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // 1ms .. 60s
        let buckets = vec![
            1_000, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000, 1_000_000,
            2_500_000, 5_000_000, 10_000_000, 30_000_000, 60_000_000,
        ];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_us: u64) {
        for (i, &boundary) in self.buckets.iter().enumerate() {
            if value_us <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seconds(&self, value_sec: f64) {
        self.record((value_sec * 1_000_000.0) as u64);
    }

    pub fn mean_seconds(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64 / 1_000_000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Render in Prometheus histogram format with `le` boundaries in seconds.
    pub fn to_prometheus(&self, name: &str, labels: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;

        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{{},le=\"{}\"}} {}\n",
                name,
                labels,
                boundary as f64 / 1_000_000.0,
                cumulative
            ));
        }

        let total = self.count.load(Ordering::Relaxed);
        output.push_str(&format!("{}_bucket{{{},le=\"+Inf\"}} {}\n", name, labels, total));
        output.push_str(&format!(
            "{}_sum{{{}}} {}\n",
            name,
            labels,
            self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count{{{}}} {}\n", name, labels, total));
        output
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Label key for per-request metrics: vendor, provider, feed.
type RequestKey = (String, String, String);

/// Pipeline metrics registry.
///
/// One instance per process, shared by `Arc` between the client, the
/// coordinator, the validation engine, and the HTTP exporter.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    requests_total: RwLock<HashMap<RequestKey, AtomicU64>>,
    errors_total: RwLock<HashMap<(RequestKey, String), AtomicU64>>,
    request_duration: RwLock<HashMap<RequestKey, LatencyHistogram>>,

    /// Pending (symbol, day) units per symbol; floored at zero.
    ingestion_backlog: RwLock<HashMap<String, AtomicU64>>,
    /// Row-level quality rejections per (symbol, issue_type).
    data_quality: RwLock<HashMap<(String, String), AtomicU64>>,

    validation_bars_processed: RwLock<HashMap<(String, String), AtomicU64>>,
    validation_errors_found: RwLock<HashMap<(String, String), AtomicU64>>,
    validation_success_total: AtomicU64,
    validation_failure_total: AtomicU64,

    /// Timer drift sampled by the background probe, stored as f64 bits.
    event_loop_lag_seconds: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(vendor: &str, provider: &str, feed: &str) -> RequestKey {
        (vendor.to_string(), provider.to_string(), feed.to_string())
    }

    pub fn record_request(&self, vendor: &str, provider: &str, feed: &str) {
        let mut map = self.requests_total.write();
        map.entry(Self::key(vendor, provider, feed))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// `status` is the numeric HTTP code, `"timeout"` or `"exception"`.
    pub fn record_error(&self, vendor: &str, provider: &str, feed: &str, status: &str) {
        let mut map = self.errors_total.write();
        map.entry((Self::key(vendor, provider, feed), status.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duration(&self, vendor: &str, provider: &str, feed: &str, seconds: f64) {
        let mut map = self.request_duration.write();
        map.entry(Self::key(vendor, provider, feed))
            .or_insert_with(LatencyHistogram::new)
            .record_seconds(seconds);
    }

    pub fn set_backlog(&self, symbol: &str, pending: u64) {
        let mut map = self.ingestion_backlog.write();
        map.entry(symbol.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(pending, Ordering::Relaxed);
    }

    /// Decrement the backlog gauge, never dropping below zero.
    pub fn dec_backlog(&self, symbol: &str) {
        let map = self.ingestion_backlog.read();
        if let Some(gauge) = map.get(symbol) {
            let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    pub fn backlog(&self, symbol: &str) -> u64 {
        self.ingestion_backlog
            .read()
            .get(symbol)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn record_data_quality(&self, symbol: &str, issue_type: &str) {
        let mut map = self.data_quality.write();
        map.entry((symbol.to_string(), issue_type.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn data_quality_count(&self, symbol: &str, issue_type: &str) -> u64 {
        self.data_quality
            .read()
            .get(&(symbol.to_string(), issue_type.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn record_validation(&self, provider: &str, feed: &str, bars: u64, errors: u64) {
        let key = (provider.to_string(), feed.to_string());
        {
            let mut map = self.validation_bars_processed.write();
            map.entry(key.clone())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(bars, Ordering::Relaxed);
        }
        {
            let mut map = self.validation_errors_found.write();
            map.entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(errors, Ordering::Relaxed);
        }
        if errors == 0 {
            self.validation_success_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.validation_failure_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_event_loop_lag(&self, seconds: f64) {
        self.event_loop_lag_seconds
            .store(seconds.to_bits(), Ordering::Relaxed);
    }

    pub fn event_loop_lag(&self) -> f64 {
        f64::from_bits(self.event_loop_lag_seconds.load(Ordering::Relaxed))
    }

    pub fn requests_count(&self, vendor: &str, provider: &str, feed: &str) -> u64 {
        self.requests_total
            .read()
            .get(&Self::key(vendor, provider, feed))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors_count(&self, vendor: &str, provider: &str, feed: &str, status: &str) -> u64 {
        self.errors_total
            .read()
            .get(&(Self::key(vendor, provider, feed), status.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Export all metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP marketpipe_requests_total Vendor HTTP requests attempted\n");
        output.push_str("# TYPE marketpipe_requests_total counter\n");
        for ((vendor, provider, feed), count) in self.requests_total.read().iter() {
            output.push_str(&format!(
                "marketpipe_requests_total{{vendor=\"{}\",provider=\"{}\",feed=\"{}\"}} {}\n",
                vendor,
                provider,
                feed,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP marketpipe_errors_total Vendor HTTP failures by status\n");
        output.push_str("# TYPE marketpipe_errors_total counter\n");
        for (((vendor, provider, feed), status), count) in self.errors_total.read().iter() {
            output.push_str(&format!(
                "marketpipe_errors_total{{vendor=\"{}\",provider=\"{}\",feed=\"{}\",status=\"{}\"}} {}\n",
                vendor,
                provider,
                feed,
                status,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP marketpipe_request_duration_seconds Vendor request latency\n");
        output.push_str("# TYPE marketpipe_request_duration_seconds histogram\n");
        for ((vendor, provider, feed), hist) in self.request_duration.read().iter() {
            let labels = format!(
                "vendor=\"{}\",provider=\"{}\",feed=\"{}\"",
                vendor, provider, feed
            );
            output.push_str(&hist.to_prometheus("marketpipe_request_duration_seconds", &labels));
        }

        output.push_str("\n# HELP marketpipe_ingestion_backlog Pending work units per symbol\n");
        output.push_str("# TYPE marketpipe_ingestion_backlog gauge\n");
        for (symbol, gauge) in self.ingestion_backlog.read().iter() {
            output.push_str(&format!(
                "marketpipe_ingestion_backlog{{symbol=\"{}\"}} {}\n",
                symbol,
                gauge.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP marketpipe_data_quality_total Rows rejected by domain validation\n");
        output.push_str("# TYPE marketpipe_data_quality_total counter\n");
        for ((symbol, issue), count) in self.data_quality.read().iter() {
            output.push_str(&format!(
                "marketpipe_data_quality_total{{symbol=\"{}\",issue_type=\"{}\"}} {}\n",
                symbol,
                issue,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP marketpipe_validation_bars_processed Bars examined by validation\n");
        output.push_str("# TYPE marketpipe_validation_bars_processed counter\n");
        for ((provider, feed), count) in self.validation_bars_processed.read().iter() {
            output.push_str(&format!(
                "marketpipe_validation_bars_processed{{provider=\"{}\",feed=\"{}\"}} {}\n",
                provider,
                feed,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP marketpipe_validation_errors_found Rule violations found by validation\n");
        output.push_str("# TYPE marketpipe_validation_errors_found counter\n");
        for ((provider, feed), count) in self.validation_errors_found.read().iter() {
            output.push_str(&format!(
                "marketpipe_validation_errors_found{{provider=\"{}\",feed=\"{}\"}} {}\n",
                provider,
                feed,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP marketpipe_validation_success_total Symbol validations with no errors\n");
        output.push_str("# TYPE marketpipe_validation_success_total counter\n");
        output.push_str(&format!(
            "marketpipe_validation_success_total {}\n",
            self.validation_success_total.load(Ordering::Relaxed)
        ));
        output.push_str("\n# HELP marketpipe_validation_failure_total Symbol validations with errors\n");
        output.push_str("# TYPE marketpipe_validation_failure_total counter\n");
        output.push_str(&format!(
            "marketpipe_validation_failure_total {}\n",
            self.validation_failure_total.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP marketpipe_event_loop_lag_seconds Timer drift sampled by the lag probe\n");
        output.push_str("# TYPE marketpipe_event_loop_lag_seconds gauge\n");
        output.push_str(&format!(
            "marketpipe_event_loop_lag_seconds {}\n",
            self.event_loop_lag()
        ));

        output
    }
}

/// Spawn the background probe feeding `event_loop_lag_seconds`.
///
/// Sleeps for `interval` and records how far past the deadline the wake-up
/// landed; a saturated runtime shows up as growing lag.
pub fn spawn_lag_probe(
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let before = Instant::now();
            tokio::time::sleep(interval).await;
            let lag = before.elapsed().saturating_sub(interval);
            metrics.set_event_loop_lag(lag.as_secs_f64());
            debug!(lag_us = lag.as_micros() as u64, "event loop lag sample");
        }
    })
}

/// Serve `/metrics`, `/health` and `/ready` until the task is aborted.
pub async fn serve_metrics(metrics: Arc<PipelineMetrics>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let m = metrics.clone();
                async move { m.to_prometheus() }
            }),
        )
        .route("/health", get(|| async { "OK" }))
        .route("/ready", get(|| async { "OK" }));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("metrics endpoint listening on http://{}/metrics", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    if let Err(e) = axum::serve(listener, app).await {
        warn!(error = %e, "metrics server exited");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counters() {
        let m = PipelineMetrics::new();
        m.record_request("alpaca", "alpaca", "iex");
        m.record_request("alpaca", "alpaca", "iex");
        m.record_error("alpaca", "alpaca", "iex", "429");
        assert_eq!(m.requests_count("alpaca", "alpaca", "iex"), 2);
        assert_eq!(m.errors_count("alpaca", "alpaca", "iex", "429"), 1);
        assert_eq!(m.errors_count("alpaca", "alpaca", "iex", "500"), 0);
    }

    #[test]
    fn test_backlog_floors_at_zero() {
        let m = PipelineMetrics::new();
        m.set_backlog("AAPL", 2);
        m.dec_backlog("AAPL");
        m.dec_backlog("AAPL");
        m.dec_backlog("AAPL");
        assert_eq!(m.backlog("AAPL"), 0);
    }

    #[test]
    fn test_validation_counters_classify_success() {
        let m = PipelineMetrics::new();
        m.record_validation("alpaca", "iex", 390, 0);
        m.record_validation("alpaca", "iex", 390, 3);
        let text = m.to_prometheus();
        assert!(text.contains("marketpipe_validation_success_total 1"));
        assert!(text.contains("marketpipe_validation_failure_total 1"));
        assert!(text.contains(
            "marketpipe_validation_bars_processed{provider=\"alpaca\",feed=\"iex\"} 780"
        ));
    }

    #[test]
    fn test_prometheus_export_shape() {
        let m = PipelineMetrics::new();
        m.record_request("fake", "fake", "sim");
        m.record_duration("fake", "fake", "sim", 0.125);
        m.record_data_quality("AAPL", "ohlc_inconsistency");
        m.set_event_loop_lag(0.002);

        let text = m.to_prometheus();
        assert!(text.contains("marketpipe_requests_total{vendor=\"fake\",provider=\"fake\",feed=\"sim\"} 1"));
        assert!(text.contains("marketpipe_request_duration_seconds_bucket"));
        assert!(text.contains("marketpipe_data_quality_total{symbol=\"AAPL\",issue_type=\"ohlc_inconsistency\"} 1"));
        assert!(text.contains("marketpipe_event_loop_lag_seconds 0.002"));
    }

    #[test]
    fn test_histogram_bucket_accumulation() {
        let h = LatencyHistogram::new();
        h.record_seconds(0.004); // 4ms -> le 0.005
        h.record_seconds(0.2); // 200ms -> le 0.25
        let text = h.to_prometheus("x", "a=\"b\"");
        assert!(text.contains("x_bucket{a=\"b\",le=\"0.005\"} 1"));
        assert!(text.contains("x_bucket{a=\"b\",le=\"+Inf\"} 2"));
        assert_eq!(h.count(), 2);
    }
}
