//! The producer-facing entry point and the background delivery pipeline.
//!
//! [`LogAnalytics::enqueue`] hands an event to the buffer and returns
//! immediately. A single background task turns buffered events into batches,
//! splits each batch by log type and sends every sub-batch through the
//! circuit breaker to the data collector API. Sub-batches that cannot be
//! delivered (no credentials, breaker open, request failed) are written to
//! the fallback sink. Nothing that goes wrong in the pipeline is reported
//! back to producers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{Batch, BufferConfig, BufferError, BufferSender, EventBuffer};
use crate::circuit_breaker::{CircuitBreaker, CircuitError, CircuitState};
use crate::client::LogAnalyticsClient;
use crate::config::{ApplicationConfig, Config};
use crate::error::{Error, Result};
use crate::fallback::{FallbackReason, FallbackSink};
use crate::grouping::{group_by_type, SubBatch};
use crate::metadata::Event;
use crate::signer::Signer;

/// Name of the breaker in log output.
const BREAKER_NAME: &str = "azure-log-analytics";

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Events accepted by `enqueue`
    pub events_enqueued: u64,

    /// Events delivered to the workspace
    pub events_delivered: u64,

    /// Events routed to the fallback sink
    pub events_fallback: u64,

    /// Events dropped because their batch could not be serialized
    pub events_dropped: u64,

    /// Sub-batches accepted by the workspace
    pub sub_batches_delivered: u64,

    /// Sub-batches whose delivery attempt failed
    pub sub_batches_failed: u64,

    /// Sub-batches rejected by the open circuit breaker
    pub sub_batches_rejected: u64,
}

#[derive(Default)]
struct Counters {
    events_enqueued: AtomicU64,
    events_delivered: AtomicU64,
    events_fallback: AtomicU64,
    events_dropped: AtomicU64,
    sub_batches_delivered: AtomicU64,
    sub_batches_failed: AtomicU64,
    sub_batches_rejected: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ForwarderStats {
        ForwarderStats {
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_fallback: self.events_fallback.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            sub_batches_delivered: self.sub_batches_delivered.load(Ordering::Relaxed),
            sub_batches_failed: self.sub_batches_failed.load(Ordering::Relaxed),
            sub_batches_rejected: self.sub_batches_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Remote delivery, present only when credentials are configured.
struct Delivery {
    client: LogAnalyticsClient,
    breaker: CircuitBreaker,
}

/// Routes flushed batches to the workspace or the fallback sink.
struct Dispatcher {
    delivery: Option<Delivery>,
    fallback: FallbackSink,
    counters: Arc<Counters>,
}

impl Dispatcher {
    async fn dispatch(&self, batch: Batch) {
        let batch_id = batch.batch_id;
        let batch_size = batch.len();
        let sub_batches = group_by_type(batch);

        debug!(
            batch_id = %batch_id,
            batch_size = batch_size,
            log_types = sub_batches.len(),
            "Dispatching batch"
        );

        for sub_batch in sub_batches {
            self.dispatch_sub_batch(sub_batch).await;
        }
    }

    async fn dispatch_sub_batch(&self, sub_batch: SubBatch) {
        let Some(delivery) = &self.delivery else {
            self.fallback(&sub_batch, FallbackReason::Disabled);
            return;
        };

        let body = match sub_batch.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(
                    batch_id = %sub_batch.batch_id,
                    log_type = sub_batch.log_type(),
                    batch_size = sub_batch.len(),
                    error = %e,
                    "Failed to serialize log batch, dropping it"
                );
                Counters::add(&self.counters.events_dropped, sub_batch.len());
                return;
            }
        };

        let result = delivery
            .breaker
            .call(|| delivery.client.post(sub_batch.log_type(), body))
            .await;

        match result {
            Ok(()) => {
                debug!(
                    batch_id = %sub_batch.batch_id,
                    log_type = sub_batch.log_type(),
                    batch_size = sub_batch.len(),
                    "Delivered log batch"
                );
                Counters::add(&self.counters.sub_batches_delivered, 1);
                Counters::add(&self.counters.events_delivered, sub_batch.len());
            }
            Err(CircuitError::Open) => {
                warn!(
                    batch_id = %sub_batch.batch_id,
                    log_type = sub_batch.log_type(),
                    batch_size = sub_batch.len(),
                    "Circuit breaker open, skipping delivery"
                );
                Counters::add(&self.counters.sub_batches_rejected, 1);
                self.fallback(&sub_batch, FallbackReason::CircuitOpen);
            }
            Err(CircuitError::Inner(e)) => {
                error!(
                    batch_id = %sub_batch.batch_id,
                    log_type = sub_batch.log_type(),
                    batch_size = sub_batch.len(),
                    error = %e,
                    "Post of log batch not successful"
                );
                Counters::add(&self.counters.sub_batches_failed, 1);
                self.fallback(&sub_batch, FallbackReason::DeliveryFailed);
            }
        }
    }

    fn fallback(&self, sub_batch: &SubBatch, reason: FallbackReason) {
        debug!(
            batch_id = %sub_batch.batch_id,
            log_type = sub_batch.log_type(),
            batch_size = sub_batch.len(),
            reason = %reason,
            "Writing log batch to fallback output"
        );
        self.fallback.emit(sub_batch.events(), reason);
        Counters::add(&self.counters.events_fallback, sub_batch.len());
    }
}

/// Consume batches until the buffer is closed and drained.
async fn run_consumer(
    mut buffer: EventBuffer,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut closing = false;

    loop {
        tokio::select! {
            maybe_batch = buffer.next_batch() => {
                let Some(batch) = maybe_batch else {
                    break;
                };

                // A panic while dispatching must not end the consumer
                let batch_id = batch.batch_id;
                let dispatcher = Arc::clone(&dispatcher);
                let handle = tokio::spawn(async move { dispatcher.dispatch(batch).await });
                if let Err(e) = handle.await {
                    error!(batch_id = %batch_id, error = %e, "Batch dispatch aborted");
                }
            }

            _ = shutdown.changed(), if !closing => {
                closing = true;
                buffer.close();
            }
        }
    }

    info!(stats = ?buffer.stats(), "Log forwarder stopped");
}

struct Shared {
    sender: BufferSender,
    application: ApplicationConfig,
    counters: Arc<Counters>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle for sending custom logs to an Azure Log Analytics workspace.
///
/// Cheap to clone; all clones feed the same pipeline.
///
/// # Example
///
/// ```no_run
/// use log_analytics_forwarder::config::{ApplicationConfig, Config};
/// use log_analytics_forwarder::metadata::{MetadataBuilder, RequestMetadata};
/// use log_analytics_forwarder::LogAnalytics;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::from_env()
///         .expect("Failed to load config")
///         .with_application(ApplicationConfig::new("server-1.mydomain.net", "EMEA"));
///     let log_analytics = LogAnalytics::start(config).expect("Failed to start forwarder");
///
///     log_analytics.enqueue(
///         RequestMetadata::new()
///             .workspace_id("a1b2")
///             .user_agent("python-requests/2.24.0")
///             .duration_sec(2)
///             .build(),
///     );
///
///     log_analytics.shutdown().await;
/// }
/// ```
#[derive(Clone)]
pub struct LogAnalytics {
    shared: Arc<Shared>,
}

impl LogAnalytics {
    /// Start the pipeline, echoing undeliverable events to standard output.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the workspace key is malformed or the HTTP client cannot
    /// be built. These are checked once here, never per request.
    pub fn start(config: Config) -> Result<Self> {
        Self::start_with_fallback(config, FallbackSink::stdout())
    }

    /// Start the pipeline with a custom fallback sink.
    pub fn start_with_fallback(config: Config, fallback: FallbackSink) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let delivery = match config.credentials() {
            Some(credentials) => {
                let signer = Signer::new(&credentials.workspace_id, &credentials.workspace_key)?;
                let client = LogAnalyticsClient::new(&config, signer)?;
                info!(
                    workspace_id = %credentials.workspace_id,
                    ingest_url = %client.ingest_url(),
                    "Log Analytics delivery enabled"
                );
                Some(Delivery {
                    client,
                    breaker: CircuitBreaker::new(BREAKER_NAME, config.circuit_breaker.clone()),
                })
            }
            None => {
                warn!("Log Analytics workspace not configured, events go to the fallback output only");
                None
            }
        };

        let counters = Arc::new(Counters::default());
        let dispatcher = Arc::new(Dispatcher {
            delivery,
            fallback,
            counters: Arc::clone(&counters),
        });

        let (sender, buffer) =
            EventBuffer::new(BufferConfig::new(config.batch_size, config.flush_interval));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run_consumer(buffer, Arc::clone(&dispatcher), shutdown_rx));

        Ok(Self {
            shared: Arc::new(Shared {
                sender,
                application: config.application,
                counters,
                dispatcher,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Queue an event for delivery.
    ///
    /// Adds the configured server and region labels and returns
    /// immediately. Never blocks and never fails; after `shutdown` the
    /// event is discarded with a warning.
    pub fn enqueue(&self, event: Event) {
        let event = event.with_application(&self.shared.application);
        match self.shared.sender.send(event) {
            Ok(()) => Counters::add(&self.shared.counters.events_enqueued, 1),
            Err(BufferError::Closed(event)) => {
                warn!(
                    log_type = event.log_type(),
                    "Log forwarder is shut down, discarding event"
                );
            }
        }
    }

    /// Whether events are sent to the workspace rather than only to the
    /// fallback sink.
    pub fn is_enabled(&self) -> bool {
        self.shared.dispatcher.delivery.is_some()
    }

    /// State of the delivery circuit breaker, `None` when delivery is disabled.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.shared
            .dispatcher
            .delivery
            .as_ref()
            .map(|delivery| delivery.breaker.state())
    }

    pub fn stats(&self) -> ForwarderStats {
        self.shared.counters.snapshot()
    }

    /// Stop accepting events, flush what is buffered and wait for the
    /// background task to finish.
    ///
    /// Later calls, from this or any clone, return immediately.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);

        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Log forwarder task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{RequestMetadata, StatisticMetadata};
    use std::io::{self, Write};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn json_lines(&self) -> Vec<serde_json::Value> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    fn disabled_config() -> Config {
        Config {
            flush_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_mode_routes_everything_to_fallback() {
        let buf = SharedBuf::default();
        let config = disabled_config().with_application(ApplicationConfig::new("srv-1", "EMEA"));
        let forwarder =
            LogAnalytics::start_with_fallback(config, FallbackSink::new(buf.clone())).unwrap();

        assert!(!forwarder.is_enabled());
        assert!(forwarder.circuit_state().is_none());

        for i in 0..5 {
            forwarder.enqueue(RequestMetadata::new().duration_sec(i).build());
        }
        forwarder.enqueue(StatisticMetadata::new().object_count(9).build());
        forwarder.shutdown().await;

        let lines = buf.json_lines();
        assert_eq!(lines.len(), 6);
        assert!(lines.iter().all(|line| line["Server"] == "srv-1"));
        assert!(lines.iter().all(|line| line["Region"] == "EMEA"));

        let stats = forwarder.stats();
        assert_eq!(stats.events_enqueued, 6);
        assert_eq!(stats.events_fallback, 6);
        assert_eq!(stats.events_delivered, 0);
        assert_eq!(stats.sub_batches_failed, 0);
    }

    #[tokio::test]
    async fn test_per_type_order_is_preserved() {
        let buf = SharedBuf::default();
        let forwarder =
            LogAnalytics::start_with_fallback(disabled_config(), FallbackSink::new(buf.clone()))
                .unwrap();

        for i in 0..20 {
            forwarder.enqueue(RequestMetadata::new().duration_sec(i).build());
            forwarder.enqueue(StatisticMetadata::new().object_count(u64::from(i)).build());
        }
        forwarder.shutdown().await;

        let lines = buf.json_lines();
        let durations: Vec<u64> = lines
            .iter()
            .filter_map(|line| line.get("DurationSec").and_then(|v| v.as_u64()))
            .collect();
        let counts: Vec<u64> = lines
            .iter()
            .filter_map(|line| line.get("ObjectCount").and_then(|v| v.as_u64()))
            .collect();
        assert_eq!(durations, (0..20).collect::<Vec<u64>>());
        assert_eq!(counts, (0..20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_discarded() {
        let buf = SharedBuf::default();
        let forwarder =
            LogAnalytics::start_with_fallback(disabled_config(), FallbackSink::new(buf.clone()))
                .unwrap();
        let clone = forwarder.clone();

        forwarder.shutdown().await;
        clone.shutdown().await;

        clone.enqueue(StatisticMetadata::new().build());
        assert_eq!(forwarder.stats().events_enqueued, 0);
        assert!(buf.json_lines().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_key_fails_at_start() {
        let config = disabled_config().with_credentials("ws-123", "*** not base64 ***");
        let result = LogAnalytics::start_with_fallback(config, FallbackSink::new(io::sink()));
        assert!(matches!(result, Err(Error::Signer(_))));
    }

    #[test]
    fn test_start_requires_runtime() {
        let result = LogAnalytics::start_with_fallback(disabled_config(), FallbackSink::new(io::sink()));
        assert!(matches!(result, Err(Error::NoRuntime)));
    }

    #[tokio::test]
    async fn test_enabled_with_valid_credentials() {
        let config = disabled_config().with_credentials("ws-123", "MDEyMzQ1Njc4OWFiY2RlZg==");
        let forwarder =
            LogAnalytics::start_with_fallback(config, FallbackSink::new(io::sink())).unwrap();
        assert!(forwarder.is_enabled());
        assert_eq!(forwarder.circuit_state(), Some(CircuitState::Closed));
        forwarder.shutdown().await;
    }
}
