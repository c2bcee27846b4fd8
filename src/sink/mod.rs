//! Sink clients that receive framed log messages
//!
//! The pipeline treats a sink as an opaque capability: it hands over one
//! message at a time and only cares whether the send succeeded.

pub mod unix_socket;

use crate::types::LogMessage;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use unix_socket::UnixSocketSink;

/// Destination for framed log messages
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver a single message
    async fn send(&self, message: &LogMessage) -> Result<()>;
}

#[async_trait]
impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    async fn send(&self, message: &LogMessage) -> Result<()> {
        (**self).send(message).await
    }
}

#[async_trait]
impl<T: LogSink + ?Sized> LogSink for Box<T> {
    async fn send(&self, message: &LogMessage) -> Result<()> {
        (**self).send(message).await
    }
}
