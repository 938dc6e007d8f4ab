//! In-process metrics for the refund risk-decision pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector shared across workers.
pub struct PipelineMetrics {
    /// Inbound events received (including malformed ones)
    pub requests_received: AtomicU64,
    /// Terminal decisions emitted
    pub decisions_emitted: AtomicU64,
    /// Decisions by outcome
    decisions_by_outcome: RwLock<HashMap<String, u64>>,
    /// Requests flagged anomalous
    pub anomalies_flagged: AtomicU64,
    /// Anomalies that skipped the classifier/advisor calls
    pub short_circuits: AtomicU64,
    /// Advisory outcomes (approve/deny/manual_review/unknown)
    advisory_by_outcome: RwLock<HashMap<String, u64>>,
    /// Malformed payloads rejected before scoring
    pub input_errors: AtomicU64,
    /// Audit rows dropped (response still delivered)
    pub persist_failures: AtomicU64,
    /// Runs resolved by deadline expiry
    pub deadline_failures: AtomicU64,
    /// Classifier hot-swaps
    pub model_reloads: AtomicU64,
    /// End-to-end run times (in microseconds)
    run_times: RwLock<Vec<u64>>,
    /// Per-signal evaluation times (in microseconds)
    signal_times: RwLock<HashMap<String, Vec<u64>>>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            decisions_emitted: AtomicU64::new(0),
            decisions_by_outcome: RwLock::new(HashMap::new()),
            anomalies_flagged: AtomicU64::new(0),
            short_circuits: AtomicU64::new(0),
            advisory_by_outcome: RwLock::new(HashMap::new()),
            input_errors: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            deadline_failures: AtomicU64::new(0),
            model_reloads: AtomicU64::new(0),
            run_times: RwLock::new(Vec::with_capacity(1000)),
            signal_times: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record receipt of an inbound event
    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal decision and its end-to-end run time
    pub fn record_decision(&self, outcome: &str, run_time: Duration) {
        self.decisions_emitted.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut by_outcome) = self.decisions_by_outcome.write() {
            *by_outcome.entry(outcome.to_string()).or_insert(0) += 1;
        }

        if let Ok(mut times) = self.run_times.write() {
            times.push(run_time.as_micros() as u64);
            // Keep only the recent window for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }
    }

    /// Record an anomaly flag; `short_circuit` marks runs that skipped
    /// the remaining signals
    pub fn record_anomaly(&self, short_circuit: bool) {
        self.anomalies_flagged.fetch_add(1, Ordering::Relaxed);
        if short_circuit {
            self.short_circuits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an advisory outcome
    pub fn record_advisory(&self, outcome: &str) {
        if let Ok(mut by_outcome) = self.advisory_by_outcome.write() {
            *by_outcome.entry(outcome.to_string()).or_insert(0) += 1;
        }
    }

    /// Record a rejected malformed payload
    pub fn record_input_error(&self) {
        self.input_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped audit row
    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run resolved by deadline expiry
    pub fn record_deadline(&self) {
        self.deadline_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a classifier hot-swap
    pub fn record_model_reload(&self) {
        self.model_reloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one signal's evaluation time
    pub fn record_signal_time(&self, signal: &str, duration: Duration) {
        if let Ok(mut times) = self.signal_times.write() {
            let signal_times = times.entry(signal.to_string()).or_insert_with(Vec::new);
            signal_times.push(duration.as_micros() as u64);
            if signal_times.len() > 1000 {
                signal_times.drain(0..500);
            }
        }
    }

    /// Get end-to-end run time statistics
    pub fn get_run_stats(&self) -> ProcessingStats {
        let times = self.run_times.read().unwrap();
        percentile_stats(&times)
    }

    /// Get per-signal evaluation time statistics
    pub fn get_signal_stats(&self) -> HashMap<String, ProcessingStats> {
        let times = self.signal_times.read().unwrap();
        times
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(signal, v)| (signal.clone(), percentile_stats(v)))
            .collect()
    }

    /// Get current throughput (decisions per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.decisions_emitted.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get decisions by outcome
    pub fn get_decisions_by_outcome(&self) -> HashMap<String, u64> {
        self.decisions_by_outcome.read().unwrap().clone()
    }

    /// Get advisory outcomes
    pub fn get_advisory_by_outcome(&self) -> HashMap<String, u64> {
        self.advisory_by_outcome.read().unwrap().clone()
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let received = self.requests_received.load(Ordering::Relaxed);
        let decided = self.decisions_emitted.load(Ordering::Relaxed);
        let anomalies = self.anomalies_flagged.load(Ordering::Relaxed);
        let run_stats = self.get_run_stats();

        info!("==== refund pipeline metrics summary ====");
        info!(
            requests_received = received,
            decisions_emitted = decided,
            throughput = format!("{:.1}/s", self.get_throughput()),
            "Volume"
        );

        for (outcome, count) in self.get_decisions_by_outcome() {
            let pct = if decided > 0 {
                (count as f64 / decided as f64) * 100.0
            } else {
                0.0
            };
            info!(outcome = %outcome, count, pct = format!("{pct:.1}%"), "Decisions");
        }

        info!(
            anomalies_flagged = anomalies,
            short_circuits = self.short_circuits.load(Ordering::Relaxed),
            "Anomaly detection"
        );

        for (outcome, count) in self.get_advisory_by_outcome() {
            info!(outcome = %outcome, count, "Advisory outcomes");
        }

        info!(
            input_errors = self.input_errors.load(Ordering::Relaxed),
            persist_failures = self.persist_failures.load(Ordering::Relaxed),
            deadline_failures = self.deadline_failures.load(Ordering::Relaxed),
            model_reloads = self.model_reloads.load(Ordering::Relaxed),
            "Faults"
        );

        info!(
            mean_us = run_stats.mean_us,
            p50_us = run_stats.p50_us,
            p95_us = run_stats.p95_us,
            p99_us = run_stats.p99_us,
            "Run time"
        );

        for (signal, stats) in self.get_signal_stats() {
            info!(
                signal = %signal,
                mean_us = stats.mean_us,
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                calls = stats.count,
                "Signal time"
            );
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency percentile statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

fn percentile_stats(times: &[u64]) -> ProcessingStats {
    if times.is_empty() {
        return ProcessingStats::default();
    }

    let mut sorted: Vec<u64> = times.to_vec();
    sorted.sort();

    let sum: u64 = sorted.iter().sum();
    let count = sorted.len();

    ProcessingStats {
        count: count as u64,
        mean_us: sum / count as u64,
        p50_us: sorted[count / 2],
        p95_us: sorted[(count as f64 * 0.95) as usize],
        p99_us: sorted[(count as f64 * 0.99) as usize],
        max_us: *sorted.last().unwrap_or(&0),
    }
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: std::sync::Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: std::sync::Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
