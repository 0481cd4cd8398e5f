use crate::aggregator::BatchHandler;
use crate::ai::{build_rca_prompt, parse_rca_result, RcaBackend};
use crate::analysis::patterns::ProblemRegistry;
use crate::analysis::rate_limiter::MinIntervalLimiter;
use crate::error::{AnalysisError, StoreError};
use crate::events::EventBatch;
use crate::monitoring::{AnalysisTimer, PipelineStats};
use crate::storage::{ProblemLog, ProblemRecord};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Decides per batch between "known problem" and "new problem"
///
/// Known problems only bump their fingerprint's counter. New problems go to the
/// RCA backend, spaced by the rate limiter; a successful diagnosis registers
/// its recurrence pattern. Either way exactly one record reaches the log.
pub struct AnalysisOrchestrator {
    registry: ProblemRegistry,
    backend: Arc<dyn RcaBackend>,
    log: ProblemLog,
    limiter: MinIntervalLimiter,
    max_lines: Option<usize>,
    timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl AnalysisOrchestrator {
    /// Create an orchestrator over a rehydrated registry
    ///
    /// # Arguments
    ///
    /// * `registry` - Known fingerprints, usually from [`ProblemRegistry::rehydrate`]
    /// * `backend` - RCA backend asked about new problems
    /// * `log` - Problem log receiving one record per batch
    ///
    /// Defaults: one backend call per 60 s, 50 prompt lines, 300 s call timeout.
    pub fn new(registry: ProblemRegistry, backend: Arc<dyn RcaBackend>, log: ProblemLog) -> Self {
        Self {
            registry,
            backend,
            log,
            limiter: MinIntervalLimiter::default(),
            max_lines: Some(50),
            timeout: Duration::from_secs(300),
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Minimum interval between backend calls
    pub fn with_rate_interval(mut self, interval: Duration) -> Self {
        self.limiter = MinIntervalLimiter::new(interval);
        self
    }

    /// Context lines embedded in prompts, `None` for no limit
    pub fn with_max_lines(mut self, max_lines: Option<usize>) -> Self {
        self.max_lines = max_lines;
        self
    }

    /// Upper bound on one backend call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fingerprints known so far, including those registered since startup
    pub fn registry(&self) -> &ProblemRegistry {
        &self.registry
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Classify a batch as recurrence or new problem and log the outcome
    ///
    /// Returns the record written, `None` for an empty batch.
    ///
    /// # Errors
    ///
    /// Only persistence failures are returned; backend failures become
    /// `analysis_failed` records.
    pub async fn process_batch(
        &mut self,
        batch: EventBatch,
    ) -> Result<Option<ProblemRecord>, StoreError> {
        if batch.is_empty() {
            debug!("Ignoring empty batch");
            return Ok(None);
        }
        self.stats.record_batch();

        let text = batch.text()?;
        let now = Utc::now();

        if let Some(fingerprint) = self.registry.find_mut(&text) {
            let occurrence = fingerprint.record_occurrence(now);
            info!(
                "Existing problem occurred again: pattern={} occurrence={} type={}",
                fingerprint.pattern(),
                occurrence,
                batch.primary_kind()
            );
            let record = ProblemRecord::recurrence(&batch, fingerprint.pattern(), occurrence, now);
            self.stats.record_recurrence();
            self.log.write(&record)?;
            return Ok(Some(record));
        }

        warn!(
            "New problem found: type={} data={}",
            batch.primary_kind(),
            batch.primary_data()
        );
        self.stats.record_new_problem();

        let record = match self.analyze(&batch, &text.pretty).await {
            Ok(result) => {
                info!(
                    "Analysis successful: summary={} pattern={}",
                    result.summary, result.recurrence_pattern
                );
                if self
                    .registry
                    .register(&result.recurrence_pattern, now)
                    .is_none()
                {
                    warn!(
                        "Problem recorded without a fingerprint; it will be analysed again next time"
                    );
                }
                ProblemRecord::analyzed(&batch, result, now)
            }
            Err(e) => {
                error!("Analysis failed for event {}: {}", batch.primary_kind(), e);
                self.stats.record_analysis_failure();
                ProblemRecord::failed(&batch, now)
            }
        };

        self.log.write(&record)?;
        Ok(Some(record))
    }

    async fn analyze(
        &mut self,
        batch: &EventBatch,
        pretty: &str,
    ) -> Result<crate::ai::RcaResult, AnalysisError> {
        self.limiter.wait_turn().await;

        let prompt = build_rca_prompt(&batch.context(), self.max_lines);
        debug!("Sending problem for analysis: event={}", pretty);

        self.limiter.record_call();
        let timer = AnalysisTimer::start(Arc::clone(&self.stats));
        let outcome = tokio::time::timeout(self.timeout, self.backend.generate(&prompt, self.timeout)).await;
        timer.finish();

        match outcome {
            Ok(response) => parse_rca_result(&response?),
            Err(_) => Err(AnalysisError::Timeout),
        }
    }
}

impl BatchHandler for AnalysisOrchestrator {
    fn handle_batch<'a>(
        &'a mut self,
        batch: EventBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move { self.process_batch(batch).await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockBackend;
    use crate::events::{RawEvent, TriggerKind, TriggeredEvent};
    use crate::storage::{read_records, ANALYSIS_FAILED};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn trace(data: Value) -> EventBatch {
        EventBatch::new(vec![TriggeredEvent::new(
            RawEvent::new(json!({"event_type": "trace", "data": data})),
            TriggerKind::AutomationFailure,
        )])
    }

    fn orchestrator(dir: &TempDir, backend: &MockBackend) -> AnalysisOrchestrator {
        let log = ProblemLog::open(dir.path(), 1_000_000).unwrap();
        AnalysisOrchestrator::new(ProblemRegistry::new(), Arc::new(backend.clone()), log)
            .with_rate_interval(Duration::ZERO)
            .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_recurrence_skips_backend() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::with_pattern("\"success\":false");
        let mut orchestrator = orchestrator(&dir, &backend);

        let first = orchestrator
            .process_batch(trace(json!({"result": {"success": false}})))
            .await
            .unwrap()
            .unwrap();
        let second = orchestrator
            .process_batch(trace(json!({"result": {"success": false, "extra": 1}})))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(backend.call_count(), 1);
        assert_eq!(first.occurrence, 1);
        assert!(first.result.is_some());
        assert_eq!(second.occurrence, 2);
        assert!(second.result.is_none());
        assert_eq!(second.fingerprint.as_deref(), Some("\"success\":false"));

        let records = read_records(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pattern(), Some("\"success\":false"));
        assert_eq!(records[1].fingerprint, second.fingerprint);
        assert_eq!(records[1].occurrence, 2);
    }

    #[tokio::test]
    async fn test_rehydrated_pattern_counts_on() {
        let dir = TempDir::new().unwrap();
        let seeding = MockBackend::with_pattern("\"success\":false");
        {
            let mut orchestrator = orchestrator(&dir, &seeding);
            orchestrator
                .process_batch(trace(json!({"success": false})))
                .await
                .unwrap();
        }

        let backend = MockBackend::canned();
        let registry = ProblemRegistry::rehydrate(&read_records(dir.path()).unwrap());
        assert_eq!(registry.len(), 1);
        let log = ProblemLog::open(dir.path(), 1_000_000).unwrap();
        let mut orchestrator =
            AnalysisOrchestrator::new(registry, Arc::new(backend.clone()), log)
                .with_rate_interval(Duration::ZERO);

        let record = orchestrator
            .process_batch(trace(json!({"success": false, "id": "x"})))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.occurrence, 2);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_analysis_is_retried_next_time() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::error("backend down");
        let mut orchestrator = orchestrator(&dir, &backend);

        for _ in 0..2 {
            let record = orchestrator
                .process_batch(trace(json!({"success": false})))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.error.as_deref(), Some(ANALYSIS_FAILED));
            assert_eq!(record.occurrence, 1);
            assert!(record.result.is_none());
        }

        assert_eq!(backend.call_count(), 2);
        assert!(orchestrator.registry().is_empty());
        let snapshot = orchestrator.stats().snapshot();
        assert_eq!(snapshot.analysis_failures, 2);
        assert_eq!(snapshot.new_problems, 2);
    }

    #[tokio::test]
    async fn test_non_conforming_response_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::with_response(Ok("I think the light is broken".to_string()));
        let mut orchestrator = orchestrator(&dir, &backend);

        let record = orchestrator
            .process_batch(trace(json!({"success": false})))
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_failure());
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::canned().with_delay(Duration::from_secs(5));
        let mut orchestrator = orchestrator(&dir, &backend).with_timeout(Duration::from_millis(50));

        let started = tokio::time::Instant::now();
        let record = orchestrator
            .process_batch(trace(json!({"success": false})))
            .await
            .unwrap()
            .unwrap();

        assert!(record.is_failure());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_backend_calls_are_rate_limited() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::with_pattern("never matches anything");
        let mut orchestrator =
            orchestrator(&dir, &backend).with_rate_interval(Duration::from_millis(150));

        orchestrator
            .process_batch(trace(json!({"first": true})))
            .await
            .unwrap();
        orchestrator
            .process_batch(trace(json!({"second": true})))
            .await
            .unwrap();

        let instants = backend.call_instants();
        assert_eq!(instants.len(), 2);
        assert!(instants[1] - instants[0] >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_prompt_is_truncated() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::canned();
        let mut orchestrator = orchestrator(&dir, &backend).with_max_lines(Some(3));

        orchestrator
            .process_batch(trace(json!({"a": 1, "b": 2, "c": 3, "success": false})))
            .await
            .unwrap();

        let prompt = &backend.prompts()[0];
        assert!(prompt.contains("more lines truncated"));
    }

    #[tokio::test]
    async fn test_multi_event_batch_record() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::canned();
        let mut orchestrator = orchestrator(&dir, &backend);

        let batch = EventBatch::new(vec![
            TriggeredEvent::new(
                RawEvent::new(json!({"event_type": "system_log_event", "data": {"level": "ERROR"}})),
                TriggerKind::ErrorLog,
            ),
            TriggeredEvent::new(
                RawEvent::new(json!({"event_type": "state_changed", "data": {"new_state": {"state": "unavailable"}}})),
                TriggerKind::EntityUnavailable,
            ),
        ]);
        let record = orchestrator.process_batch(batch).await.unwrap().unwrap();

        assert_eq!(record.trigger_type.as_deref(), Some("entity_unavailable,error_log"));
        assert_eq!(record.event["events"].as_array().unwrap().len(), 2);
        assert_eq!(record.event["events"][0]["trigger_type"], "error_log");
    }

    #[tokio::test]
    async fn test_empty_batch_is_ignored() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::canned();
        let mut orchestrator = orchestrator(&dir, &backend);
        assert!(orchestrator
            .process_batch(EventBatch::new(Vec::new()))
            .await
            .unwrap()
            .is_none());
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::canned();
        let mut orchestrator = orchestrator(&dir, &backend);
        let problems = dir.path().to_path_buf();
        drop(dir);
        assert!(!problems.exists());

        let result = orchestrator
            .process_batch(trace(json!({"success": false})))
            .await;
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
