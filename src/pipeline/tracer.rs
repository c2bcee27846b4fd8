//! Routing tracer: bytes read from the pipes vs. bytes handed to the sink

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default sampling interval
pub const DEFAULT_TRACE_INTERVAL: Duration = Duration::from_secs(60);
/// Shortest sampling interval `run` will use
pub const MIN_TRACE_INTERVAL: Duration = Duration::from_millis(1);

/// Counter deltas for one sampling interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceSample {
    /// Bytes read from all pipes
    pub bytes_read: u64,
    /// Line bytes accepted by the sink, newlines excluded
    pub bytes_sent: u64,
    /// Newlines seen by the framers
    pub newlines: u64,
}

impl fmt::Display for TraceSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes read: {}, bytes sent: {}, newlines: {}",
            self.bytes_read, self.bytes_sent, self.newlines
        )
    }
}

/// Receives tracer samples
pub trait TraceReporter: Send + Sync {
    /// Handle one sample
    fn report(&self, sample: &TraceSample);
}

/// Reporter that emits samples as `tracing` events
#[derive(Debug, Default, Clone)]
pub struct LogReporter {
    container_id: String,
}

impl LogReporter {
    /// Reporter tagging samples with the container id
    pub fn new(container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
        }
    }
}

impl TraceReporter for LogReporter {
    fn report(&self, sample: &TraceSample) {
        info!(target: "routing", container_id = %self.container_id, "{}", sample);
    }
}

/// Session-scoped routing counters.
///
/// Incremented from the read and send paths, so they are plain atomics.
#[derive(Debug, Default)]
pub struct RoutingTracer {
    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
    newlines: AtomicU64,
}

impl RoutingTracer {
    /// Create a tracer with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count bytes returned by a pipe read
    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count line bytes delivered to the sink
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count newline bytes stripped by the framer
    pub fn record_newlines(&self, count: usize) {
        self.newlines.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Take the current counters and reset them to zero
    pub fn sample(&self) -> TraceSample {
        TraceSample {
            bytes_read: self.bytes_read.swap(0, Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            newlines: self.newlines.swap(0, Ordering::Relaxed),
        }
    }

    /// Report a sample every `period` (at least [`MIN_TRACE_INTERVAL`]) until
    /// `shutdown` fires, then report once more
    pub async fn run(
        self: Arc<Self>,
        period: Duration,
        reporter: Arc<dyn TraceReporter>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval(period.max(MIN_TRACE_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => reporter.report(&self.sample()),
                _ = shutdown.cancelled() => break,
            }
        }

        reporter.report(&self.sample());
    }
}
