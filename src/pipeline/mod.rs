//! Per-container logging session
//!
//! A [`Pipeline`] owns the container's pipes for one session. It runs one
//! framer task per pipe and delivers messages to the sink either directly
//! (blocking mode) or through a [`RingBuffer`] drained by a single sender
//! task (non-blocking mode). Once every pipe is closed it flushes whatever is
//! left, waits out the cleanup period and returns.
//!
//! Send failures that survive all retries are logged and the message is
//! dropped; they never fail the session. Pipe read errors and a failing ready
//! callback do, and cancel the sibling tasks.

pub mod backoff;
pub mod dispatcher;
pub mod framer;
pub mod ring_buffer;
pub mod tracer;

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use dispatcher::Dispatcher;
pub use framer::{Framer, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_READ_BYTES};
pub use ring_buffer::RingBuffer;
pub use tracer::{
    LogReporter, RoutingTracer, TraceReporter, TraceSample, DEFAULT_TRACE_INTERVAL, MIN_TRACE_INTERVAL,
};

use crate::sink::LogSink;
use crate::types::{LogMessage, Source};
use crate::{Result, ShimError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default ring buffer capacity for non-blocking mode (1 MiB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// How messages travel from the pipe readers to the sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Readers send each message themselves and wait for the sink
    #[default]
    Blocking,
    /// Readers enqueue into a ring buffer and never wait for the sink
    NonBlocking,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Blocking => write!(f, "blocking"),
            Mode::NonBlocking => write!(f, "non-blocking"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = ShimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocking" => Ok(Mode::Blocking),
            "non-blocking" => Ok(Mode::NonBlocking),
            other => Err(ShimError::Config(format!(
                "Invalid mode {:?}, expected \"blocking\" or \"non-blocking\"",
                other
            ))),
        }
    }
}

/// Validated settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Delivery mode
    pub mode: Mode,
    /// Ring buffer capacity in line bytes (non-blocking mode only)
    pub max_buffer_size: usize,
    /// Framer working buffer size
    pub buffer_size: usize,
    /// Framer per-read budget, smaller than `buffer_size`
    pub max_read_bytes: usize,
    /// Retry policy for sink sends
    pub retry: RetryPolicy,
    /// Routing tracer sampling interval
    pub trace_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Blocking,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            retry: RetryPolicy::default(),
            trace_interval: DEFAULT_TRACE_INTERVAL,
        }
    }
}

/// A container pipe
pub type Pipe = Box<dyn AsyncRead + Send + Unpin>;

/// The container's output pipes, either of which may be missing
#[derive(Default)]
pub struct PipeSet {
    stdout: Option<Pipe>,
    stderr: Option<Pipe>,
}

impl PipeSet {
    /// Empty pipe set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stdout pipe
    pub fn with_stdout<R: AsyncRead + Send + Unpin + 'static>(mut self, pipe: R) -> Self {
        self.stdout = Some(Box::new(pipe));
        self
    }

    /// Set the stderr pipe
    pub fn with_stderr<R: AsyncRead + Send + Unpin + 'static>(mut self, pipe: R) -> Self {
        self.stderr = Some(Box::new(pipe));
        self
    }

    /// Number of pipes present
    pub fn len(&self) -> usize {
        self.stdout.is_some() as usize + self.stderr.is_some() as usize
    }

    /// Whether neither pipe is present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_pipes(self) -> Vec<(Source, Pipe)> {
        let mut pipes = Vec::with_capacity(2);
        if let Some(p) = self.stdout {
            pipes.push((Source::Stdout, p));
        }
        if let Some(p) = self.stderr {
            pipes.push((Source::Stderr, p));
        }
        pipes
    }
}

/// One container logging session
pub struct Pipeline<S> {
    pipes: PipeSet,
    dispatcher: Arc<Dispatcher<S>>,
    options: PipelineOptions,
    tracer: Arc<RoutingTracer>,
    reporter: Arc<dyn TraceReporter>,
}

impl<S: LogSink + 'static> Pipeline<S> {
    /// Create a session reading `pipes` and delivering to `sink`
    pub fn new(pipes: PipeSet, sink: S, options: PipelineOptions) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(sink, options.retry.clone()));
        Self {
            pipes,
            dispatcher,
            options,
            tracer: Arc::new(RoutingTracer::new()),
            reporter: Arc::new(LogReporter::default()),
        }
    }

    /// Send routing tracer samples to `reporter` instead of the log
    pub fn with_reporter(mut self, reporter: Arc<dyn TraceReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Session options
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the session to completion.
    ///
    /// `ready` is called once the readers are running; the workload may be
    /// started after it returns. Cancelling `cancel` stops the readers at
    /// their next read; bytes they had buffered but not framed are lost. The
    /// call returns after every pipe is closed, the buffer is flushed and
    /// `cleanup` has elapsed.
    pub async fn start<F>(self, cancel: CancellationToken, cleanup: Duration, ready: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let Pipeline {
            pipes,
            dispatcher,
            options,
            tracer,
            reporter,
        } = self;

        let pipes = pipes.into_pipes();
        if pipes.is_empty() {
            return Err(ShimError::NoPipes);
        }

        let session = cancel.child_token();
        let trace_shutdown = CancellationToken::new();
        let trace_task = tokio::spawn(tracer.clone().run(
            options.trace_interval,
            reporter,
            trace_shutdown.clone(),
        ));

        let buffer = match options.mode {
            Mode::Blocking => None,
            Mode::NonBlocking => Some(Arc::new(RingBuffer::new(options.max_buffer_size, pipes.len()))),
        };

        let mut tasks = JoinSet::new();
        if let Some(buffer) = &buffer {
            info!("Starting consuming logs from ring buffer");
            tasks.spawn(drain_buffer(buffer.clone(), dispatcher.clone(), tracer.clone()));
        }
        for (source, pipe) in pipes {
            let framer = Framer::new(pipe, source, options.buffer_size, options.max_read_bytes)
                .with_tracer(tracer.clone());
            tasks.spawn(read_pipe(
                framer,
                dispatcher.clone(),
                tracer.clone(),
                buffer.clone(),
                session.clone(),
            ));
        }
        info!("Started {} mode logging", options.mode);

        if let Err(e) = ready() {
            session.cancel();
            tasks.shutdown().await;
            stop_tracer(trace_shutdown, trace_task).await;
            return Err(ShimError::Ready(e.to_string()));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| ShimError::Join(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                error!("{}", e);
                session.cancel();
                first_error.get_or_insert(e);
            }
        }

        if let Some(buffer) = &buffer {
            let remaining = buffer.flush();
            info!("All pipes are closed, flushing {} buffered messages", remaining.len());
            for msg in &remaining {
                deliver(&dispatcher, &tracer, msg).await;
            }
            if buffer.dropped_count() > 0 {
                warn!("Dropped {} messages because the buffer was full", buffer.dropped_count());
            }
        }

        info!("Sleeping {:?} for cleaning up", cleanup);
        tokio::time::sleep(cleanup).await;

        stop_tracer(trace_shutdown, trace_task).await;

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Logging finished");
                Ok(())
            }
        }
    }
}

/// Stop the tracer task and wait for its final report
async fn stop_tracer(shutdown: CancellationToken, task: tokio::task::JoinHandle<()>) {
    shutdown.cancel();
    if let Err(e) = task.await {
        warn!("Routing tracer stopped abnormally: {}", e);
    }
}

/// Marks a producer closed however its reader task ends
struct ProducerGuard(Option<Arc<RingBuffer>>);

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        if let Some(buffer) = &self.0 {
            buffer.mark_producer_closed();
        }
    }
}

async fn read_pipe<S: LogSink>(
    mut framer: Framer<Pipe>,
    dispatcher: Arc<Dispatcher<S>>,
    tracer: Arc<RoutingTracer>,
    buffer: Option<Arc<RingBuffer>>,
    cancel: CancellationToken,
) -> Result<()> {
    let source = framer.source();
    let _producer = ProducerGuard(buffer.clone());

    while let Some(msg) = framer.next_message(&cancel).await? {
        match &buffer {
            Some(buffer) => {
                buffer.enqueue(msg);
            }
            None => deliver(&dispatcher, &tracer, &msg).await,
        }
    }

    info!("Pipe {} is closed", source);
    Ok(())
}

async fn drain_buffer<S: LogSink>(
    buffer: Arc<RingBuffer>,
    dispatcher: Arc<Dispatcher<S>>,
    tracer: Arc<RoutingTracer>,
) -> Result<()> {
    while let Some(msg) = buffer.dequeue().await {
        deliver(&dispatcher, &tracer, &msg).await;
    }
    debug!("Ring buffer closed");
    Ok(())
}

/// Send one message; exhausted retries are logged and the message dropped
async fn deliver<S: LogSink>(dispatcher: &Dispatcher<S>, tracer: &RoutingTracer, msg: &LogMessage) {
    match dispatcher.send(msg).await {
        Ok(()) => tracer.record_sent(msg.len()),
        Err(e) => error!("Dropping message from {} pipe: {}", msg.source, e),
    }
}
