//! Byte-bounded message queue between the pipe readers and the sender
//!
//! Producers never block: when the queue is full the incoming message is
//! dropped. A message is always accepted into an empty queue, even when it
//! alone exceeds the capacity, so an oversized line cannot wedge the pipeline.
//!
//! The queue is a monitor: one mutex guarding [`RingState`] and one
//! [`Notify`] acting as the condition variable, with predicate loops on the
//! waiting side.

use crate::types::LogMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::debug;

/// Initial queue allocation, in messages
const RING_CAP: usize = 1000;

#[derive(Debug)]
struct RingState {
    queue: VecDeque<LogMessage>,
    cur_size_bytes: usize,
    max_size_bytes: usize,
    closed_producers: usize,
    producers: usize,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO of log messages with drop-newest backpressure
#[derive(Debug)]
pub struct RingBuffer {
    state: Mutex<RingState>,
    available: Notify,
}

impl RingBuffer {
    /// Create a buffer holding at most `max_size_bytes` of line payload,
    /// closing once `producers` producers have signalled completion
    pub fn new(max_size_bytes: usize, producers: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                queue: VecDeque::with_capacity(RING_CAP),
                cur_size_bytes: 0,
                max_size_bytes,
                closed_producers: 0,
                producers,
                closed: producers == 0,
                dropped: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Add `msg` at the tail, or drop it if it does not fit.
    ///
    /// Returns whether the message was stored.
    pub fn enqueue(&self, msg: LogMessage) -> bool {
        let mut state = self.state.lock();
        let size = msg.len();

        if !state.queue.is_empty() && state.cur_size_bytes + size > state.max_size_bytes {
            state.dropped += 1;
            debug!(
                "Buffer is full, dropping message: message size {}, current buffer size {}, max buffer size {}",
                size, state.cur_size_bytes, state.max_size_bytes
            );
            drop(state);
            self.available.notify_one();
            return false;
        }

        state.queue.push_back(msg);
        state.cur_size_bytes += size;
        drop(state);
        self.available.notify_one();
        true
    }

    /// Remove and return the head message, waiting while the buffer is empty.
    ///
    /// Returns `None` once the buffer is closed and empty.
    pub async fn dequeue(&self) -> Option<LogMessage> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // register before checking the predicate so a wake-up cannot be missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(msg) = state.queue.pop_front() {
                    state.cur_size_bytes -= msg.len();
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Record that one producer has finished; closes the buffer after the last
    pub fn mark_producer_closed(&self) {
        let mut state = self.state.lock();
        state.closed_producers += 1;
        if state.closed_producers >= state.producers && !state.closed {
            state.closed = true;
            drop(state);
            self.available.notify_waiters();
        }
    }

    /// Take every queued message, leaving the buffer empty
    pub fn flush(&self) -> Vec<LogMessage> {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            return Vec::new();
        }
        state.cur_size_bytes = 0;
        state.queue.drain(..).collect()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no messages are queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Line bytes currently queued
    pub fn size_bytes(&self) -> usize {
        self.state.lock().cur_size_bytes
    }

    /// Configured capacity in line bytes
    pub fn max_size_bytes(&self) -> usize {
        self.state.lock().max_size_bytes
    }

    /// Producers that have finished so far
    pub fn closed_producers(&self) -> usize {
        self.state.lock().closed_producers
    }

    /// Whether every producer has finished
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Messages dropped because the buffer was full
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Source;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    const TEST_BUFFER_SIZE: usize = 100;

    fn msg(line: &'static str) -> LogMessage {
        LogMessage::new(line.as_bytes(), Source::Stdout)
    }

    fn filled_buffer() -> (RingBuffer, Vec<LogMessage>) {
        let buffer = RingBuffer::new(TEST_BUFFER_SIZE, 2);
        assert_eq!(buffer.max_size_bytes(), TEST_BUFFER_SIZE);
        assert_eq!(buffer.size_bytes(), 0);

        let messages = vec![msg("line1"), msg("line2"), msg("line3"), msg("testLine4")];
        let mut expected_size = 0;
        for m in &messages {
            expected_size += m.len();
            assert!(buffer.enqueue(m.clone()));
        }
        assert_eq!(buffer.len(), messages.len());
        assert_eq!(buffer.size_bytes(), expected_size);

        (buffer, messages)
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let (buffer, messages) = filled_buffer();
        for expected in &messages {
            let got = buffer.dequeue().await.unwrap();
            assert_eq!(&got, expected);
        }
        assert!(buffer.is_empty());
        assert_eq!(buffer.size_bytes(), 0);
    }

    #[test]
    fn test_flush_drains_everything() {
        let (buffer, messages) = filled_buffer();
        let flushed = buffer.flush();
        assert_eq!(flushed, messages);
        assert!(buffer.is_empty());
        assert_eq!(buffer.size_bytes(), 0);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let buffer = RingBuffer::new(TEST_BUFFER_SIZE, 2);
        assert!(buffer.flush().is_empty());
        assert!(buffer.flush().is_empty());
        assert_eq!(buffer.size_bytes(), 0);
        assert!(!buffer.is_closed());
    }

    #[test]
    fn test_full_buffer_drops_newest() {
        let buffer = RingBuffer::new(10, 2);
        assert!(buffer.enqueue(msg("12345678")));
        assert!(!buffer.enqueue(msg("abc")));

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.size_bytes(), 8);
        assert_eq!(buffer.dropped_count(), 1);

        // still room for a message that fits exactly
        assert!(buffer.enqueue(msg("ab")));
        assert_eq!(buffer.size_bytes(), 10);
    }

    #[test]
    fn test_oversized_message_accepted_when_empty() {
        let buffer = RingBuffer::new(4, 2);
        assert!(buffer.enqueue(msg("much longer than four bytes")));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.size_bytes(), 27);

        assert!(!buffer.enqueue(msg("x")));
        assert_eq!(buffer.size_bytes(), 27);
    }

    #[test]
    fn test_closes_after_all_producers() {
        let buffer = RingBuffer::new(TEST_BUFFER_SIZE, 2);
        buffer.mark_producer_closed();
        assert_eq!(buffer.closed_producers(), 1);
        assert!(!buffer.is_closed());

        buffer.mark_producer_closed();
        assert_eq!(buffer.closed_producers(), 2);
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn test_waiting_dequeue_released_by_close() {
        let buffer = Arc::new(RingBuffer::new(TEST_BUFFER_SIZE, 2));

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        buffer.mark_producer_closed();
        buffer.mark_producer_closed();

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_waiting_dequeue_woken_by_enqueue() {
        let buffer = Arc::new(RingBuffer::new(TEST_BUFFER_SIZE, 2));

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.enqueue(msg("wake up"));

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.unwrap().line_lossy(), "wake up");
    }

    #[tokio::test]
    async fn test_closed_buffer_drains_before_reporting_closed() {
        let buffer = RingBuffer::new(TEST_BUFFER_SIZE, 1);
        buffer.enqueue(msg("tail"));
        buffer.mark_producer_closed();

        assert_eq!(buffer.dequeue().await.unwrap().line_lossy(), "tail");
        assert!(buffer.dequeue().await.is_none());
    }
}
