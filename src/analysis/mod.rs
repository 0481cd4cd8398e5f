/// Analysis orchestration, recurrence fingerprints and backend rate limiting
pub mod orchestrator;
pub mod patterns;
pub mod rate_limiter;

pub use orchestrator::AnalysisOrchestrator;
pub use patterns::{validate_pattern, Fingerprint, Matcher, ProblemRegistry, RegexMatcher};
pub use rate_limiter::MinIntervalLimiter;
