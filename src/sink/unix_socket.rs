//! Structured log collector sink over a Unix stream socket
//!
//! Every message becomes one JSON record terminated by a newline.

use crate::config::SinkSettings;
use crate::sink::LogSink;
use crate::types::{LogMessage, PartialMetadata, Source};
use crate::{Result, ShimError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Wire record written for each log message
#[derive(Debug, Serialize)]
struct CollectorRecord<'a> {
    container_id: &'a str,
    container_name: &'a str,
    source: Source,
    log: Cow<'a, str>,
    time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partial_message: Option<&'a PartialMetadata>,
    host: &'a str,
}

/// Sink writing JSON lines to a collector listening on a Unix socket.
///
/// The connection is opened lazily and dropped after a failed or timed out
/// write, so the next attempt (usually a dispatcher retry) reconnects.
pub struct UnixSocketSink {
    socket_path: String,
    container_id: String,
    container_name: String,
    hostname: String,
    connect_timeout: Duration,
    write_timeout: Duration,
    connection: Mutex<Option<UnixStream>>,
}

impl UnixSocketSink {
    /// Create a sink for the given collector socket and container identity
    pub fn new(socket_path: &str, container_id: &str, container_name: &str) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        Self {
            socket_path: socket_path.to_string(),
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            hostname,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            connection: Mutex::new(None),
        }
    }

    /// Create a sink from validated sink settings
    pub fn from_settings(settings: &SinkSettings, container_id: &str, container_name: &str) -> Self {
        Self::new(&settings.socket_path, container_id, container_name)
            .with_connect_timeout(Duration::from_secs(settings.timeout_seconds))
            .with_write_timeout(Duration::from_secs(settings.timeout_seconds))
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Override the time allowed for writing one record
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Socket path of the collector
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Whether a connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn connect(&self) -> Result<UnixStream> {
        let conn = timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| ShimError::Connection("Connection timeout".to_string()))?
            .map_err(|e| ShimError::Connection(format!("Failed to connect to {}: {}", self.socket_path, e)))?;

        debug!("Connected to collector at {}", self.socket_path);
        Ok(conn)
    }

    fn encode(&self, message: &LogMessage) -> Result<Vec<u8>> {
        let record = CollectorRecord {
            container_id: &self.container_id,
            container_name: &self.container_name,
            source: message.source,
            log: message.line_lossy(),
            time: message.timestamp,
            partial_message: message.partial.as_ref(),
            host: &self.hostname,
        };

        let mut data = serde_json::to_vec(&record)?;
        data.push(b'\n');
        Ok(data)
    }

    /// Close the connection to the collector
    pub async fn close(&self) -> Result<()> {
        let mut conn_guard = self.connection.lock().await;
        if let Some(mut conn) = conn_guard.take() {
            conn.shutdown().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for UnixSocketSink {
    async fn send(&self, message: &LogMessage) -> Result<()> {
        let data = self.encode(message)?;

        let mut conn_guard = self.connection.lock().await;
        if conn_guard.is_none() {
            *conn_guard = Some(self.connect().await?);
        }

        if let Some(conn) = conn_guard.as_mut() {
            let write = async {
                conn.write_all(&data).await?;
                conn.flush().await
            };
            let failure = match timeout(self.write_timeout, write).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("Failed to write to collector: {}", e)),
                Err(_) => Some(format!("Write to collector timed out after {:?}", self.write_timeout)),
            };
            if let Some(reason) = failure {
                // a partially written record leaves the stream unusable
                *conn_guard = None;
                return Err(ShimError::Sink(reason));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    fn spawn_collector(listener: UnixListener) -> Arc<Mutex<Vec<String>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let lines = received.clone();

        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    let lines = lines.clone();
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(stream);
                        let mut line = String::new();
                        while let Ok(n) = reader.read_line(&mut line).await {
                            if n == 0 {
                                break;
                            }
                            lines.lock().await.push(line.trim().to_string());
                            line.clear();
                        }
                    });
                }
            }
        });

        received
    }

    #[tokio::test]
    async fn test_send_writes_json_record() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("collector.sock");
        let socket_str = socket_path.to_string_lossy().to_string();
        let received = spawn_collector(UnixListener::bind(&socket_path).unwrap());

        let sink = UnixSocketSink::new(&socket_str, "ctr-1", "web");
        assert!(!sink.is_connected().await);

        sink.send(&LogMessage::new(&b"hello"[..], Source::Stdout)).await.unwrap();
        assert!(sink.is_connected().await);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let lines = received.lock().await;
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["container_id"], "ctr-1");
        assert_eq!(parsed["container_name"], "web");
        assert_eq!(parsed["source"], "stdout");
        assert_eq!(parsed["log"], "hello");
        assert!(parsed["time"].is_string());
        assert!(parsed.get("partial_message").is_none());
        assert!(!parsed["host"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_metadata_is_forwarded() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("partial.sock");
        let socket_str = socket_path.to_string_lossy().to_string();
        let received = spawn_collector(UnixListener::bind(&socket_path).unwrap());

        let sink = UnixSocketSink::new(&socket_str, "ctr-1", "web");
        let mut msg = LogMessage::new(&b"First li"[..], Source::Stderr);
        msg.partial = Some(PartialMetadata {
            id: "ab".repeat(32),
            ordinal: 1,
            last: false,
        });
        sink.send(&msg).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let lines = received.lock().await;
        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["source"], "stderr");
        assert_eq!(parsed["partial_message"]["ordinal"], 1);
        assert_eq!(parsed["partial_message"]["last"], false);
        assert_eq!(parsed["partial_message"]["id"], "ab".repeat(32));
    }

    #[tokio::test]
    async fn test_missing_collector_is_connection_error() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nobody-home.sock");

        let sink = UnixSocketSink::new(&socket_path.to_string_lossy(), "ctr-1", "web")
            .with_connect_timeout(Duration::from_secs(1));

        match sink.send(&LogMessage::new(&b"lost"[..], Source::Stdout)).await {
            Err(ShimError::Connection(_)) => {}
            other => panic!("Expected Connection error, got {:?}", other),
        }
        assert!(!sink.is_connected().await);
    }

    #[tokio::test]
    async fn test_stalled_collector_times_out_write() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("stalled.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        // accept and hold connections without ever reading from them
        let held = Arc::new(Mutex::new(Vec::new()));
        let holder = held.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                holder.lock().await.push(stream);
            }
        });

        let sink = UnixSocketSink::new(&socket_path.to_string_lossy(), "ctr-1", "web")
            .with_write_timeout(Duration::from_millis(100));
        assert_eq!(sink.socket_path(), socket_path.to_string_lossy());

        let line = vec![b'x'; 64 * 1024];
        let mut outcome = None;
        for _ in 0..200 {
            let msg = LogMessage::new(line.clone(), Source::Stdout);
            let sent = tokio::time::timeout(Duration::from_secs(2), sink.send(&msg))
                .await
                .expect("send must not block past its write timeout");
            if let Err(e) = sent {
                outcome = Some(e);
                break;
            }
        }

        match outcome {
            Some(ShimError::Sink(reason)) => assert!(reason.contains("timed out")),
            other => panic!("Expected a write timeout, got {:?}", other),
        }
        assert!(!sink.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_drops_connection() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("close.sock");
        let socket_str = socket_path.to_string_lossy().to_string();
        let _received = spawn_collector(UnixListener::bind(&socket_path).unwrap());

        let sink = UnixSocketSink::new(&socket_str, "ctr-1", "web");
        sink.send(&LogMessage::new(&b"before close"[..], Source::Stdout)).await.unwrap();
        sink.close().await.unwrap();
        assert!(!sink.is_connected().await);

        // reconnects on the next send
        sink.send(&LogMessage::new(&b"after close"[..], Source::Stdout)).await.unwrap();
        assert!(sink.is_connected().await);
    }
}
