//! Self-monitoring counters for the problem-detection pipeline
//!
//! Tracks how many events flowed through each stage, how analyses ended and how
//! long the RCA backend takes, so operators can see the pipeline's health in the
//! shutdown summary without reading the problem log.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Maximum number of latency samples to keep
const MAX_LATENCY_SAMPLES: usize = 100;

/// Backend latency above which the summary warns
const SLOW_ANALYSIS: Duration = Duration::from_secs(60);

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSnapshot {
    /// Event messages decoded from the stream
    pub events_received: u64,
    /// Events that classified as a trigger
    pub events_triggered: u64,
    /// Batches handed to the orchestrator
    pub batches_processed: u64,
    pub new_problems: u64,
    pub recurrences: u64,
    pub analysis_failures: u64,
    /// Sessions that ended and were retried
    pub reconnects: u64,
    /// Average backend latency over the recent samples
    pub avg_analysis_latency_ms: f64,
}

/// Shared pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    events_received: AtomicU64,
    events_triggered: AtomicU64,
    batches_processed: AtomicU64,
    new_problems: AtomicU64,
    recurrences: AtomicU64,
    analysis_failures: AtomicU64,
    reconnects: AtomicU64,
    analysis_latencies: Mutex<VecDeque<Duration>>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_triggered(&self) {
        self.events_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new_problem(&self) {
        self.new_problems.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recurrence(&self) {
        self.recurrences.fetch_add(1, Ordering::Relaxed);
    }

    /// A backend call failed, timed out or returned an unusable diagnosis
    pub fn record_analysis_failure(&self) {
        self.analysis_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A session ended and another attempt follows
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latency of one backend call
    pub fn record_analysis_latency(&self, duration: Duration) {
        debug!("Recording analysis latency: {:?}", duration);
        let mut latencies = self
            .analysis_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        latencies.push_back(duration);
        while latencies.len() > MAX_LATENCY_SAMPLES {
            latencies.pop_front();
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        let latencies = self
            .analysis_latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if latencies.is_empty() {
            return 0.0;
        }
        let total_ms: f64 = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        total_ms / latencies.len() as f64
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_triggered: self.events_triggered.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            new_problems: self.new_problems.load(Ordering::Relaxed),
            recurrences: self.recurrences.load(Ordering::Relaxed),
            analysis_failures: self.analysis_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            avg_analysis_latency_ms: self.avg_latency_ms(),
        }
    }

    /// Log the current counters, warning about unhealthy ratios
    pub fn log_summary(&self) -> PipelineSnapshot {
        let snapshot = self.snapshot();
        info!(
            "Pipeline summary: events={}, triggered={}, batches={}, new_problems={}, recurrences={}, analysis_failures={}, reconnects={}, analysis_latency={:.1}ms",
            snapshot.events_received,
            snapshot.events_triggered,
            snapshot.batches_processed,
            snapshot.new_problems,
            snapshot.recurrences,
            snapshot.analysis_failures,
            snapshot.reconnects,
            snapshot.avg_analysis_latency_ms
        );

        if snapshot.avg_analysis_latency_ms > SLOW_ANALYSIS.as_secs_f64() * 1000.0 {
            warn!(
                "High analysis latency detected: {:.1}ms",
                snapshot.avg_analysis_latency_ms
            );
        }
        if snapshot.analysis_failures > 0 && snapshot.analysis_failures >= snapshot.new_problems {
            warn!(
                "Every new problem failed analysis ({} failures); check the RCA backend",
                snapshot.analysis_failures
            );
        }
        snapshot
    }
}

/// Measures one backend call
pub struct AnalysisTimer {
    start_time: Instant,
    stats: Arc<PipelineStats>,
}

impl AnalysisTimer {
    /// Start timing one backend call; [`AnalysisTimer::finish`] records it
    pub fn start(stats: Arc<PipelineStats>) -> Self {
        Self {
            start_time: Instant::now(),
            stats,
        }
    }

    /// Record the elapsed time and return it
    pub fn finish(self) -> Duration {
        let elapsed = self.start_time.elapsed();
        self.stats.record_analysis_latency(elapsed);
        elapsed
    }
}
