//! Problem-detection pipeline assembly
//!
//! Classifier, batcher and orchestrator behind the [`EventSink`] the stream
//! collector drives.

use crate::aggregator::EventBatcher;
use crate::ai::RcaBackend;
use crate::analysis::{AnalysisOrchestrator, ProblemRegistry};
use crate::collectors::{EventOutcome, EventSink, EventStreamCollector};
use crate::config::Config;
use crate::error::{MonitorError, StoreError};
use crate::events::{RawEvent, Timestamp, TriggeredEvent};
use crate::monitoring::{PipelineSnapshot, PipelineStats};
use crate::storage::{read_records, ProblemLog};
use crate::triggers::EventClassifier;
use log::{debug, info};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Classifies stream events and feeds the triggered ones to the batcher
pub struct ProblemMonitor {
    classifier: EventClassifier,
    batcher: EventBatcher<AnalysisOrchestrator>,
    window: Duration,
    last_time_fired: Option<Timestamp>,
    stats: Arc<PipelineStats>,
}

impl ProblemMonitor {
    /// Assemble the pipeline around an orchestrator
    ///
    /// # Arguments
    ///
    /// * `orchestrator` - Receives every closed batch; its counters become the pipeline's
    /// * `window` - Batch quiet window, also the largest `time_fired` gap kept in one batch
    pub fn new(orchestrator: AnalysisOrchestrator, window: Duration) -> Self {
        let stats = orchestrator.stats();
        Self {
            classifier: EventClassifier::with_default_rules(),
            batcher: EventBatcher::new(window, orchestrator),
            window,
            last_time_fired: None,
            stats,
        }
    }

    /// Build the pipeline, rehydrating known problems from the problem log
    pub fn from_config(config: &Config, backend: Arc<dyn RcaBackend>) -> Result<Self, StoreError> {
        let directory = &config.storage.problem_dir;
        let records = read_records(directory)?;
        let registry = ProblemRegistry::rehydrate(&records);
        info!(
            "Loaded {} known problem pattern(s) from {} record(s) in {}",
            registry.len(),
            records.len(),
            directory.display()
        );

        let log = ProblemLog::open(directory.clone(), config.storage.max_bytes)?;
        let orchestrator = AnalysisOrchestrator::new(registry, backend, log)
            .with_rate_interval(config.rate_interval())
            .with_max_lines(config.max_lines())
            .with_timeout(config.analysis_timeout());

        Ok(Self::new(orchestrator, config.batch_window()))
    }

    /// Counters shared by the collector, batcher and orchestrator
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Classify one event and queue it when it triggers
    ///
    /// A `time_fired` gap wider than the batch window closes the pending batch
    /// first, so unrelated incidents are not merged.
    pub async fn observe(&mut self, event: RawEvent) -> Result<EventOutcome, StoreError> {
        let Some(trigger) = self.classifier.classify(&event) else {
            return Ok(EventOutcome::Ignored);
        };
        self.stats.record_event_triggered();
        debug!(
            "Event {} triggered {}",
            event.kind().unwrap_or("unknown"),
            trigger
        );

        if let Some(fired) = event.time_fired() {
            if let Some(previous) = self.last_time_fired {
                let gap = (fired - previous).to_std().unwrap_or(Duration::ZERO);
                if !self.window.is_zero() && gap > self.window {
                    debug!("Event gap of {:?} exceeds the batch window, flushing", gap);
                    self.batcher.flush().await?;
                }
            }
            self.last_time_fired = Some(fired);
        }

        self.batcher.add(TriggeredEvent::new(event, trigger)).await?;
        Ok(EventOutcome::Accepted)
    }

    /// Dispatch pending events and wait for the analysis to finish
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        self.batcher.flush().await
    }
}

impl EventSink for ProblemMonitor {
    fn on_event<'a>(
        &'a mut self,
        event: RawEvent,
    ) -> Pin<Box<dyn Future<Output = Result<EventOutcome, StoreError>> + Send + 'a>> {
        Box::pin(self.observe(event))
    }

    fn flush<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(ProblemMonitor::flush(self))
    }
}

/// Run the pipeline until `stop`, the configured event cap or a storage failure
///
/// Returns the final pipeline counters, which are also logged.
pub async fn run_monitor(
    config: &Config,
    backend: Arc<dyn RcaBackend>,
    stop: watch::Receiver<bool>,
) -> Result<PipelineSnapshot, MonitorError> {
    let mut monitor = ProblemMonitor::from_config(config, backend)?;
    let stats = monitor.stats();

    let mut collector =
        EventStreamCollector::new(config.connection.url.clone(), config.connection.token.clone())
            .with_backoff(config.reconnect_initial(), config.reconnect_max())
            .with_healthy_session(config.healthy_session())
            .with_message_cap(config.connection.max_events)
            .with_stats(Arc::clone(&stats));

    info!(
        "Watching {} (batch window {:?}, analysis interval {:?})",
        config.connection.url,
        config.batch_window(),
        config.rate_interval()
    );

    let outcome = collector.run(&mut monitor, stop).await;
    let snapshot = stats.log_summary();
    outcome.map(|_| snapshot)
}
