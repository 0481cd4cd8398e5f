/// Rotating JSONL problem log
pub mod problem_log;

pub use problem_log::{list_segments, read_records, ProblemLog, ProblemRecord, ANALYSIS_FAILED};
