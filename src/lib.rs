/// Error types for the problem monitor
pub mod error;

/// Event envelopes, trigger kinds and batches
pub mod events;

/// Home Assistant event stream collector
pub mod collectors;

/// Event classification rules
pub mod triggers;

/// Time-windowed event batching
pub mod aggregator;

/// Recurrence fingerprints, rate limiting and analysis orchestration
pub mod analysis;

/// RCA backends, response contract and prompts
pub mod ai;

/// Problem log persistence
pub mod storage;

/// Configuration management
pub mod config;

/// Pipeline self-monitoring
pub mod monitoring;

/// Pipeline assembly and top-level run loop
pub mod monitor;

// Re-export commonly used types
pub use error::{AnalysisError, ConfigError, ConnectionError, MonitorError, StoreError};
pub use monitor::{run_monitor, ProblemMonitor};
