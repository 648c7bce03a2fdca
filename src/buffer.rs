//! Buffer module for accumulating and batching events.
//!
//! Producers hand events over through an unbounded tokio mpsc channel, so
//! sending never waits. A single consumer accumulates them and releases a
//! [`Batch`] when either the batch size is reached or the flush window has
//! elapsed since the first event of the batch was buffered, whichever comes
//! first. The window restarts with the next buffered event; empty windows
//! release nothing.
//!
//! The channel applies no back-pressure. Sustained overload grows memory
//! without bound, which is accepted at the expected event rates.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::metadata::Event;

/// Default number of events per batch.
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default flush window.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the event buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of events that triggers an immediate flush
    pub batch_size: usize,

    /// Longest time the first buffered event waits before its batch is flushed
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl BufferConfig {
    /// Create a new buffer config with the specified batch size and flush interval.
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    /// Total number of events received
    pub events_received: u64,

    /// Total number of events released in batches
    pub events_flushed: u64,

    /// Number of flushes triggered by the size threshold
    pub size_flushes: u64,

    /// Number of flushes triggered by the flush window
    pub time_flushes: u64,
}

/// Events released together by one flush. Never empty.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Identifier used to correlate log lines of one flush cycle
    pub batch_id: Uuid,

    events: Vec<Event>,
}

impl Batch {
    /// Wrap buffered events; `None` for an empty buffer.
    pub fn new(events: Vec<Event>) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(Self {
            batch_id: Uuid::new_v4(),
            events,
        })
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always `false`; provided for symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A sender handle for submitting events to the buffer.
///
/// This can be cloned and shared across producer threads and tasks.
#[derive(Clone)]
pub struct BufferSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl BufferSender {
    /// Hand an event to the buffer without waiting.
    ///
    /// Returns `BufferError::Closed` (with the event) once the buffer has
    /// been dropped.
    pub fn send(&self, event: Event) -> Result<(), BufferError> {
        self.tx
            .send(event)
            .map_err(|mpsc::error::SendError(event)| BufferError::Closed(Box::new(event)))
    }

    /// Whether the receiving buffer is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Errors that can occur during buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The buffer has been closed and is no longer accepting events
    #[error("Buffer has been closed")]
    Closed(Box<Event>),
}

/// Async event buffer with size and time-based flushing.
///
/// # Example
///
/// ```no_run
/// use log_analytics_forwarder::buffer::{BufferConfig, EventBuffer};
/// use log_analytics_forwarder::metadata::StatisticMetadata;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let config = BufferConfig::new(100, Duration::from_secs(1));
///     let (sender, mut buffer) = EventBuffer::new(config);
///
///     sender.send(StatisticMetadata::new().object_count(3).build()).ok();
///     drop(sender);
///
///     while let Some(batch) = buffer.next_batch().await {
///         println!("batch of {}", batch.len());
///     }
/// }
/// ```
pub struct EventBuffer {
    /// Receiver for incoming events
    rx: mpsc::UnboundedReceiver<Event>,

    /// Events of the batch under construction
    buffer: Vec<Event>,

    /// Flush deadline of the batch under construction, set by its first event
    deadline: Option<Instant>,

    config: BufferConfig,

    stats: BufferStats,
}

impl EventBuffer {
    /// Create a new event buffer with the given configuration.
    ///
    /// Returns a tuple of (BufferSender, EventBuffer).
    pub fn new(config: BufferConfig) -> (BufferSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();

        let buffer = Self {
            rx,
            buffer: Vec::with_capacity(config.batch_size),
            deadline: None,
            config,
            stats: BufferStats::default(),
        };

        (BufferSender { tx }, buffer)
    }

    /// Create a new event buffer with default configuration.
    pub fn with_defaults() -> (BufferSender, Self) {
        Self::new(BufferConfig::default())
    }

    /// Wait for the next batch of events to be ready.
    ///
    /// Returns `None` once every sender is dropped and the buffer is empty.
    /// Events still buffered when the channel closes are released as a
    /// final batch.
    pub async fn next_batch(&mut self) -> Option<Batch> {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                // An elapsed window closes the batch before queued events are taken
                biased;

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.stats.time_flushes += 1;
                    debug!(
                        batch_size = self.buffer.len(),
                        interval_ms = self.config.flush_interval.as_millis() as u64,
                        "Flushing buffer: flush window elapsed"
                    );
                    return self.create_batch();
                }

                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.add_event(event);

                            if self.buffer.len() >= self.config.batch_size {
                                self.stats.size_flushes += 1;
                                debug!(
                                    batch_size = self.buffer.len(),
                                    "Flushing buffer: batch size threshold reached"
                                );
                                return self.create_batch();
                            }
                        }
                        None => {
                            if !self.buffer.is_empty() {
                                info!(
                                    remaining = self.buffer.len(),
                                    "Channel closed, flushing remaining events"
                                );
                            }
                            return self.create_batch();
                        }
                    }
                }
            }
        }
    }

    fn add_event(&mut self, event: Event) {
        self.stats.events_received += 1;
        if self.buffer.is_empty() {
            self.deadline = Some(Instant::now() + self.config.flush_interval);
        }
        self.buffer.push(event);
    }

    /// Take the buffered events as a batch and reset the window.
    fn create_batch(&mut self) -> Option<Batch> {
        let events = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.config.batch_size),
        );
        self.deadline = None;
        self.stats.events_flushed += events.len() as u64;
        Batch::new(events)
    }

    /// Get the current number of events in the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Get the buffer configuration.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Stop accepting events. Events already sent are still released by
    /// `next_batch`, which returns `None` once they are drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Manually flush the buffer regardless of thresholds.
    pub fn flush(&mut self) -> Option<Batch> {
        if !self.buffer.is_empty() {
            debug!(batch_size = self.buffer.len(), "Manual buffer flush");
        }
        self.create_batch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{RequestMetadata, StatisticMetadata};
    use tokio::time::timeout;

    fn create_test_event(count: u64) -> Event {
        StatisticMetadata::new().object_count(count).build()
    }

    fn object_counts(batch: &Batch) -> Vec<u64> {
        batch
            .events()
            .iter()
            .map(|event| match event.kind() {
                crate::metadata::EventKind::Statistic(fields) => fields.object_count,
                _ => panic!("unexpected event kind"),
            })
            .collect()
    }

    #[test]
    fn test_buffer_config_default() {
        let config = BufferConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_buffer_config_rejects_zero_batch_size() {
        let config = BufferConfig::new(0, Duration::from_secs(1));
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_batch_is_never_empty() {
        assert!(Batch::new(Vec::new()).is_none());
        let batch = Batch::new(vec![create_test_event(1)]).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
    }

    #[tokio::test]
    async fn test_send_does_not_block() {
        let (sender, buffer) = EventBuffer::new(BufferConfig::new(10, Duration::from_secs(60)));

        // Far beyond the batch size with nobody consuming
        for i in 0..10_000 {
            sender.send(create_test_event(i)).unwrap();
        }
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_size_based_flush() {
        let batch_size = 5;
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(batch_size, Duration::from_secs(60)));

        for i in 0..batch_size as u64 + 2 {
            sender.send(create_test_event(i)).unwrap();
        }

        let batch = timeout(Duration::from_millis(100), buffer.next_batch())
            .await
            .expect("Should complete quickly")
            .expect("Should get batch");

        assert_eq!(batch.len(), batch_size);
        assert_eq!(object_counts(&batch), vec![0, 1, 2, 3, 4]);
        assert_eq!(buffer.stats().size_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_time_based_flush() {
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(100, Duration::from_secs(1)));

        sender.send(create_test_event(1)).unwrap();
        sender.send(create_test_event(2)).unwrap();

        let started = Instant::now();
        let batch = buffer.next_batch().await.expect("Should get batch");

        assert_eq!(batch.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().time_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_starts_at_first_buffered_event() {
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(100, Duration::from_secs(1)));

        let producer = tokio::spawn(async move {
            // Nothing is buffered during the first five seconds
            tokio::time::sleep(Duration::from_secs(5)).await;
            sender.send(create_test_event(1)).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            sender.send(create_test_event(2)).unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let started = Instant::now();
        let batch = buffer.next_batch().await.expect("Should get batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(buffer.stats().time_flushes, 1);

        producer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_window_excludes_late_events() {
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(100, Duration::from_secs(1)));

        sender.send(create_test_event(1)).unwrap();
        // Buffer the first event, then let its window run out
        assert!(timeout(Duration::from_millis(10), buffer.next_batch()).await.is_err());
        assert_eq!(buffer.len(), 1);
        tokio::time::advance(Duration::from_secs(2)).await;

        for count in 2..=50 {
            sender.send(create_test_event(count)).unwrap();
        }

        let expired = buffer.next_batch().await.unwrap();
        assert_eq!(object_counts(&expired), vec![1]);

        let next = buffer.next_batch().await.unwrap();
        assert_eq!(next.len(), 49);
        assert_eq!(buffer.stats().time_flushes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_restarts_after_size_flush() {
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(2, Duration::from_secs(1)));

        sender.send(create_test_event(1)).unwrap();
        sender.send(create_test_event(2)).unwrap();
        let first = buffer.next_batch().await.unwrap();
        assert_eq!(first.len(), 2);

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            sender.send(create_test_event(3)).unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let started = Instant::now();
        let second = buffer.next_batch().await.unwrap();
        assert_eq!(object_counts(&second), vec![3]);
        // 700ms until the event arrives, then a full window
        assert_eq!(started.elapsed(), Duration::from_millis(1_700));

        producer.abort();
    }

    #[tokio::test]
    async fn test_buffer_channel_close() {
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(100, Duration::from_secs(60)));

        sender.send(create_test_event(1)).unwrap();
        sender.send(create_test_event(2)).unwrap();
        drop(sender);

        let batch = timeout(Duration::from_millis(100), buffer.next_batch())
            .await
            .expect("Should complete")
            .expect("Should get batch");
        assert_eq!(batch.len(), 2);

        let batch = timeout(Duration::from_millis(100), buffer.next_batch())
            .await
            .expect("Should complete");
        assert!(batch.is_none());
    }

    #[tokio::test]
    async fn test_close_drains_pending_events() {
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(100, Duration::from_secs(60)));

        sender.send(create_test_event(1)).unwrap();
        sender.send(create_test_event(2)).unwrap();
        buffer.close();
        assert!(sender.send(create_test_event(3)).is_err());

        let batch = timeout(Duration::from_millis(100), buffer.next_batch())
            .await
            .expect("Should complete")
            .expect("Should get batch");
        assert_eq!(object_counts(&batch), vec![1, 2]);
        assert!(buffer.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_buffer_manual_flush_of_empty_buffer() {
        let (_sender, mut buffer) = EventBuffer::with_defaults();
        assert!(buffer.flush().is_none());
    }

    #[tokio::test]
    async fn test_sender_closed_error_returns_event() {
        let (sender, buffer) = EventBuffer::with_defaults();
        drop(buffer);

        assert!(sender.is_closed());
        let event = RequestMetadata::new().duration_sec(9).build();
        match sender.send(event.clone()) {
            Err(BufferError::Closed(returned)) => assert_eq!(*returned, event),
            Ok(()) => panic!("send should fail once the buffer is dropped"),
        }
    }

    #[tokio::test]
    async fn test_buffer_stats() {
        let (sender, mut buffer) =
            EventBuffer::new(BufferConfig::new(3, Duration::from_secs(60)));

        for i in 0..7 {
            sender.send(create_test_event(i)).unwrap();
        }
        drop(sender);

        buffer.next_batch().await.unwrap();
        assert_eq!(buffer.stats().events_received, 3);
        assert_eq!(buffer.stats().events_flushed, 3);

        buffer.next_batch().await.unwrap();
        let last = buffer.next_batch().await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(buffer.stats().events_received, 7);
        assert_eq!(buffer.stats().events_flushed, 7);
        assert_eq!(buffer.stats().size_flushes, 2);
        assert!(buffer.next_batch().await.is_none());
    }

    #[test]
    fn test_buffer_error_display() {
        let err = BufferError::Closed(Box::new(create_test_event(0)));
        assert_eq!(format!("{}", err), "Buffer has been closed");
    }
}
