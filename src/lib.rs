//! # shim-logger - Container Log Forwarding Shim
//!
//! shim-logger owns the stdout and stderr pipes of a single container and turns
//! their raw bytes into discrete, timestamped log records delivered to a sink,
//! without ever blocking or crashing the container it is logging for.
//!
//! ## Features
//!
//! - **Line framing**: newline splitting with partial-line runs for long lines
//! - **Two delivery modes**: blocking (direct) and non-blocking (bounded ring buffer)
//! - **Retries**: exponential backoff with jitter on transient sink failures
//! - **Routing trace**: periodic bytes-read / bytes-sent counters
//!
//! ## Quick Start
//!
//! ```no_run
//! use shim_logger::pipeline::{PipeSet, Pipeline, PipelineOptions};
//! use shim_logger::sink::UnixSocketSink;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = UnixSocketSink::new("/run/collector.sock", "abc123", "web");
//!     let pipes = PipeSet::new()
//!         .with_stdout(tokio::fs::File::open("/run/ctr/stdout").await?)
//!         .with_stderr(tokio::fs::File::open("/run/ctr/stderr").await?);
//!
//!     let pipeline = Pipeline::new(pipes, sink, PipelineOptions::default());
//!     pipeline
//!         .start(CancellationToken::new(), Duration::from_secs(5), || Ok(()))
//!         .await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod pipeline;
pub mod sink;
pub mod types;

/// Common error types used throughout shim-logger
pub mod error {
    use crate::types::Source;
    use thiserror::Error;

    /// shim-logger error types
    #[derive(Debug, Error)]
    pub enum ShimError {
        /// I/O operation failed
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        /// Serialization/deserialization failed
        #[error("Serialization error: {0}")]
        Serde(#[from] serde_json::Error),

        /// Configuration error
        #[error("Configuration error: {0}")]
        Config(String),

        /// Neither container pipe was provided
        #[error("no container pipes available: stdout and stderr are both missing")]
        NoPipes,

        /// Reading a container pipe failed with something other than end-of-stream
        #[error("failed to read logs from {pipe} pipe: {source}")]
        Read {
            /// Pipe that failed
            pipe: Source,
            /// Underlying I/O failure
            #[source]
            source: std::io::Error,
        },

        /// Sending a message gave up after exhausting its retries
        #[error("sending container logs to destination has been retried for {attempts} times: {last_error}")]
        Dispatch {
            /// Number of send attempts made
            attempts: u32,
            /// Message of the last failure
            last_error: String,
        },

        /// The runtime's ready callback failed
        #[error("failed to check container ready status: {0}")]
        Ready(String),

        /// Connection error
        #[error("Connection error: {0}")]
        Connection(String),

        /// Sink rejected a message
        #[error("Sink error: {0}")]
        Sink(String),

        /// A pipeline task panicked or was aborted
        #[error("pipeline task failed: {0}")]
        Join(String),
    }

    impl ShimError {
        /// Whether this error should end the session with a failure.
        ///
        /// Sink and dispatch failures are not fatal: a logging outage must
        /// never take down the workload being logged.
        pub fn is_fatal(&self) -> bool {
            !matches!(
                self,
                ShimError::Dispatch { .. } | ShimError::Connection(_) | ShimError::Sink(_)
            )
        }
    }

    /// Result type alias for shim-logger operations
    pub type Result<T> = std::result::Result<T, ShimError>;
}

pub use error::{Result, ShimError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShimConfig;
    pub use crate::pipeline::{Mode, PipeSet, Pipeline, PipelineOptions, RetryPolicy};
    pub use crate::sink::{LogSink, UnixSocketSink};
    pub use crate::types::{LogMessage, PartialMetadata, Source};
    pub use crate::{Result, ShimError};
}
