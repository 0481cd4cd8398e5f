//! Append-only, size-rotated JSONL log of problem occurrences
//!
//! Segments are named `problems_<YYYYmmdd_HHMMSS>_<seq>.jsonl`. The sequence is
//! zero-padded and continues from the highest one already on disk, so listing a
//! directory lexicographically yields segments in write order.

use crate::ai::RcaResult;
use crate::error::StoreError;
use crate::events::{EventBatch, Timestamp};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// `error` marker written for batches whose analysis failed
pub const ANALYSIS_FAILED: &str = "analysis_failed";

const SEGMENT_PREFIX: &str = "problems_";
const SEGMENT_SUFFIX: &str = ".jsonl";

/// One line of the problem log
///
/// `result` is present only on the first occurrence of an analysed problem;
/// `fingerprint` only on recurrences. Fields are declared in lexical order so
/// every line has sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The single event, or `{"events": [...]}` for a multi-event batch
    pub event: Value,

    /// Pattern text of the fingerprint a recurrence matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    pub occurrence: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RcaResult>,

    /// Comma-joined sorted trigger kinds of the batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,
}

impl ProblemRecord {
    fn from_batch(batch: &EventBatch, occurrence: u64, at: Timestamp) -> Self {
        Self {
            error: None,
            event: batch.context(),
            fingerprint: None,
            occurrence,
            recorded_at: Some(at),
            result: None,
            trigger_type: batch.trigger_label(),
        }
    }

    /// Another occurrence of a known problem
    pub fn recurrence(batch: &EventBatch, pattern: &str, occurrence: u64, at: Timestamp) -> Self {
        Self {
            fingerprint: Some(pattern.to_string()),
            ..Self::from_batch(batch, occurrence, at)
        }
    }

    /// First occurrence of a new problem, with its diagnosis
    pub fn analyzed(batch: &EventBatch, result: RcaResult, at: Timestamp) -> Self {
        Self {
            result: Some(result),
            ..Self::from_batch(batch, 1, at)
        }
    }

    /// New problem whose analysis failed
    pub fn failed(batch: &EventBatch, at: Timestamp) -> Self {
        Self {
            error: Some(ANALYSIS_FAILED.to_string()),
            ..Self::from_batch(batch, 1, at)
        }
    }

    /// Whether the analysis for this record failed
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Fingerprint pattern this record belongs to, if any
    pub fn pattern(&self) -> Option<&str> {
        self.result
            .as_ref()
            .map(|r| r.recurrence_pattern.as_str())
            .or(self.fingerprint.as_deref())
    }
}

struct Segment {
    path: PathBuf,
    file: File,
    written: u64,
}

/// Single writer of the problem log
pub struct ProblemLog {
    directory: PathBuf,
    max_bytes: u64,
    next_seq: u64,
    current: Option<Segment>,
}

impl ProblemLog {
    /// Open the log in `directory`, creating it if needed
    ///
    /// The first segment is created lazily on the first write.
    pub fn open(directory: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let next_seq = list_segments(&directory)?
            .iter()
            .filter_map(|path| segment_seq(path))
            .max()
            .map_or(0, |seq| seq + 1);

        debug!(
            "Opened problem log at {} (next segment {})",
            directory.display(),
            next_seq
        );

        Ok(Self {
            directory,
            max_bytes,
            next_seq,
            current: None,
        })
    }

    /// Path of the segment currently being appended to
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|s| s.path.as_path())
    }

    /// Append one record and flush it to the OS
    ///
    /// Rotates first when the line would push a non-empty segment past
    /// `max_bytes`; a line larger than the limit gets a segment of its own.
    pub fn write(&mut self, record: &ProblemRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let len = line.len() as u64;

        let mut segment = match self.current.take() {
            Some(seg) if seg.written == 0 || seg.written + len <= self.max_bytes => seg,
            Some(seg) => {
                info!(
                    "Rotating problem log after {} bytes in {}",
                    seg.written,
                    seg.path.display()
                );
                self.open_segment()?
            }
            None => self.open_segment()?,
        };

        segment.file.write_all(line.as_bytes())?;
        segment.file.flush()?;
        segment.written += len;
        self.current = Some(segment);
        Ok(())
    }

    fn open_segment(&mut self) -> Result<Segment, StoreError> {
        let name = format!(
            "{}{}_{:06}{}",
            SEGMENT_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S"),
            self.next_seq,
            SEGMENT_SUFFIX
        );
        let path = self.directory.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        self.next_seq += 1;
        debug!("Writing problems to {}", path.display());
        Ok(Segment {
            path,
            file,
            written,
        })
    }
}

fn is_segment_name(name: &str) -> bool {
    name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX)
}

fn segment_seq(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(SEGMENT_SUFFIX)?
        .rsplit('_')
        .next()?
        .parse()
        .ok()
}

/// Log segments in `directory`, sorted lexicographically (chronologically)
///
/// A missing directory has no segments.
pub fn list_segments(directory: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(is_segment_name);
        if matches && path.is_file() {
            segments.push(path);
        }
    }
    segments.sort();
    Ok(segments)
}

/// Every parseable record in `directory`, in write order
///
/// Malformed or partially written lines are skipped, as are segments that
/// cannot be read.
pub fn read_records(directory: &Path) -> Result<Vec<ProblemRecord>, StoreError> {
    let mut records = Vec::new();
    for path in list_segments(directory)? {
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping unreadable segment {}: {}", path.display(), e);
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProblemRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => debug!(
                    "Skipping malformed line {} of {}: {}",
                    number + 1,
                    path.display(),
                    e
                ),
            }
        }
    }
    Ok(records)
}
