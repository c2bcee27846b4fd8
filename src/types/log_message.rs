//! Framed log message types and utilities

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Container pipe a message was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The container's standard output
    Stdout,
    /// The container's standard error
    Stderr,
}

impl Source {
    /// Pipe name as used by the container runtime
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Stdout => "stdout",
            Source::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to each segment of a line that was split across reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialMetadata {
    /// Random identifier shared by every segment of the run
    pub id: String,
    /// 1-based position of this segment within the run
    pub ordinal: u32,
    /// Set on the final segment of the run only
    pub last: bool,
}

impl PartialMetadata {
    /// Generate a fresh run id: 256 random bits as 64 lowercase hex characters
    pub fn new_run_id() -> String {
        let bytes: [u8; 32] = rand::random();
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// A single framed record read from a container pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Line payload without its trailing newline
    pub line: Bytes,

    /// Pipe the line was read from
    pub source: Source,

    /// Capture time; shared by every segment of a partial run
    pub timestamp: DateTime<Utc>,

    /// Present only when the line was split into several records
    pub partial: Option<PartialMetadata>,
}

impl LogMessage {
    /// Create a complete (non-partial) message stamped with the current time
    pub fn new(line: impl Into<Bytes>, source: Source) -> Self {
        Self {
            line: line.into(),
            source,
            timestamp: Utc::now(),
            partial: None,
        }
    }

    /// Whether this message is one segment of a partial run
    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Payload size in bytes, as accounted by the ring buffer
    pub fn len(&self) -> usize {
        self.line.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.line.is_empty()
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn line_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }
}
