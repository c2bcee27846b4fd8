//! Message framer: turns raw pipe bytes into line records
//!
//! Lines are split on `\n`. A line that does not fit in the working buffer,
//! or that is still unterminated at end-of-stream, is emitted as a run of
//! partial segments sharing one random id and one timestamp, with ordinals
//! counting up from 1 and `last` set on the final segment.

use crate::pipeline::tracer::RoutingTracer;
use crate::types::{LogMessage, PartialMetadata, Source};
use crate::{Result, ShimError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default working buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
/// Default per-read budget
pub const DEFAULT_MAX_READ_BYTES: usize = 2 * 1024;

/// Framing state between buffer passes
#[derive(Debug, Clone, PartialEq, Eq)]
enum FrameState {
    /// The next bytes start a new line
    FreshLine,
    /// A split line is in progress
    PartialRun {
        id: String,
        ordinal: u32,
        timestamp: DateTime<Utc>,
    },
}

/// Reads one pipe and yields framed messages in order
pub struct Framer<R> {
    reader: R,
    source: Source,
    buf: Vec<u8>,
    filled: usize,
    max_read_bytes: usize,
    state: FrameState,
    pending: VecDeque<LogMessage>,
    eof: bool,
    tracer: Option<Arc<RoutingTracer>>,
}

impl<R: AsyncRead + Unpin> Framer<R> {
    /// Create a framer over `reader` with a `buffer_size` working buffer,
    /// reading at most `max_read_bytes` per read
    pub fn new(reader: R, source: Source, buffer_size: usize, max_read_bytes: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            reader,
            source,
            buf: vec![0; buffer_size],
            filled: 0,
            max_read_bytes: max_read_bytes.clamp(1, buffer_size),
            state: FrameState::FreshLine,
            pending: VecDeque::new(),
            eof: false,
            tracer: None,
        }
    }

    /// Count read bytes and newlines on `tracer`
    pub fn with_tracer(mut self, tracer: Arc<RoutingTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Pipe this framer reads from
    pub fn source(&self) -> Source {
        self.source
    }

    /// Next framed message, or `None` at end-of-stream or on cancellation.
    ///
    /// Bytes read but not yet framed when `cancel` fires are discarded.
    pub async fn next_message(&mut self, cancel: &CancellationToken) -> Result<Option<LogMessage>> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(Some(msg));
            }
            if self.eof {
                return Ok(None);
            }
            if cancel.is_cancelled() {
                debug!("Framer for {} pipe cancelled, discarding {} buffered bytes", self.source, self.filled);
                return Ok(None);
            }

            let source = self.source;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Framer for {} pipe cancelled while reading", source);
                    return Ok(None);
                }
                read = self.fill() => read?,
            }
        }
    }

    /// Read once and frame whatever is now buffered
    async fn fill(&mut self) -> Result<()> {
        let upper = (self.filled + self.max_read_bytes).min(self.buf.len());
        let n = match self.reader.read(&mut self.buf[self.filled..upper]).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                return Err(ShimError::Read {
                    pipe: self.source,
                    source: e,
                })
            }
        };

        if n == 0 {
            self.eof = true;
        } else {
            self.filled += n;
            if let Some(tracer) = &self.tracer {
                tracer.record_read(n);
            }
        }

        self.frame();
        Ok(())
    }

    fn frame(&mut self) {
        let mut consumed = 0;
        let mut newlines = 0;

        while let Some(pos) = self.buf[consumed..self.filled].iter().position(|&b| b == b'\n') {
            let end = consumed + pos;
            let line = Bytes::copy_from_slice(&self.buf[consumed..end]);
            self.emit_line(line);
            consumed = end + 1;
            newlines += 1;
        }

        let full = self.filled == self.buf.len() && consumed == 0;
        if (full || self.eof) && consumed < self.filled {
            let line = Bytes::copy_from_slice(&self.buf[consumed..self.filled]);
            self.emit_partial(line, self.eof);
            consumed = self.filled;
        } else if self.eof && matches!(self.state, FrameState::PartialRun { .. }) {
            // close a run whose bytes were all emitted before end-of-stream
            self.emit_partial(Bytes::new(), true);
        }

        self.buf.copy_within(consumed..self.filled, 0);
        self.filled -= consumed;

        if newlines > 0 {
            if let Some(tracer) = &self.tracer {
                tracer.record_newlines(newlines);
            }
        }
    }

    /// Emit a newline-terminated line: complete, or the last segment of a run
    fn emit_line(&mut self, line: Bytes) {
        match std::mem::replace(&mut self.state, FrameState::FreshLine) {
            FrameState::FreshLine => {
                if line.is_empty() {
                    return;
                }
                self.pending.push_back(LogMessage {
                    line,
                    source: self.source,
                    timestamp: Utc::now(),
                    partial: None,
                });
            }
            FrameState::PartialRun { id, ordinal, timestamp } => {
                self.pending.push_back(LogMessage {
                    line,
                    source: self.source,
                    timestamp,
                    partial: Some(PartialMetadata {
                        id,
                        ordinal: ordinal + 1,
                        last: true,
                    }),
                });
            }
        }
    }

    /// Emit an unterminated segment, starting a run if none is in progress
    fn emit_partial(&mut self, line: Bytes, last: bool) {
        let (id, ordinal, timestamp) = match std::mem::replace(&mut self.state, FrameState::FreshLine) {
            FrameState::FreshLine => (PartialMetadata::new_run_id(), 1, Utc::now()),
            FrameState::PartialRun { id, ordinal, timestamp } => (id, ordinal + 1, timestamp),
        };

        self.pending.push_back(LogMessage {
            line,
            source: self.source,
            timestamp,
            partial: Some(PartialMetadata {
                id: id.clone(),
                ordinal,
                last,
            }),
        });

        if !last {
            self.state = FrameState::PartialRun { id, ordinal, timestamp };
        }
    }
}
