use log::debug;
use std::time::Duration;
use tokio::time::Instant;

/// Enforces a minimum interval between consecutive backend calls
///
/// Unlike a sliding-window limiter this never rejects: callers wait for their
/// turn, which back-pressures the ingestion path while a burst of new problems
/// is being analysed.
#[derive(Debug)]
pub struct MinIntervalLimiter {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl Default for MinIntervalLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MinIntervalLimiter {
    /// Create a limiter allowing one call per `min_interval`
    ///
    /// The first call never waits.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Start of the most recent call, if any
    pub fn last_call(&self) -> Option<Instant> {
        self.last_call
    }

    /// How long a call issued at `now` would have to wait
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.last_call
            .map(|last| (last + self.min_interval).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// How long a call issued now would have to wait
    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    /// Sleep until the next call is allowed, returning the time waited
    pub async fn wait_turn(&self) -> Duration {
        let wait = self.remaining();
        if !wait.is_zero() {
            debug!("Rate limiting analysis for {:.2}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record that a call starts now
    pub fn record_call(&mut self) {
        self.record_call_at(Instant::now());
    }

    /// Record that a call started at a specific instant
    ///
    /// Primarily used for testing with controlled timestamps.
    pub fn record_call_at(&mut self, at: Instant) {
        self.last_call = Some(at);
    }
}
