//! Log Analytics Forwarder Library
//!
//! Non-blocking, batched delivery of custom log events to an Azure Log
//! Analytics workspace through the HTTP data collector API:
//!
//! - **metadata**: Event types, builders and user agent normalization
//! - **config**: Environment-based configuration
//! - **buffer**: Async buffering with size and time-based flush triggers
//! - **grouping**: Splitting batches into single-log-type sub-batches
//! - **signer**: SharedKey request signing
//! - **client**: HTTP client posting one sub-batch per request
//! - **circuit_breaker**: Failure-rate circuit breaker around delivery
//! - **fallback**: Local JSON-lines output for undeliverable events
//! - **forwarder**: The producer-facing handle tying it all together
//!
//! # Example
//!
//! ```no_run
//! use log_analytics_forwarder::config::Config;
//! use log_analytics_forwarder::metadata::{MetadataBuilder, StatisticMetadata};
//! use log_analytics_forwarder::LogAnalytics;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Start the background pipeline
//!     let log_analytics = LogAnalytics::start(config).expect("Failed to start forwarder");
//!
//!     // Queue events; this never blocks
//!     log_analytics.enqueue(
//!         StatisticMetadata::new()
//!             .workspace_id("a1b2")
//!             .object_count(42)
//!             .build(),
//!     );
//!
//!     // Flush what is left before exiting
//!     log_analytics.shutdown().await;
//! }
//! ```

// Module declarations
pub mod buffer;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod fallback;
pub mod forwarder;
pub mod grouping;
pub mod metadata;
pub mod signer;

// Re-export commonly used types at crate root for convenience
pub use buffer::{Batch, BufferConfig, BufferError, BufferSender, BufferStats, EventBuffer};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use client::{ClientError, LogAnalyticsClient};
pub use config::{ApplicationConfig, Config, ConfigError};
pub use error::{Error, Result};
pub use fallback::{FallbackReason, FallbackSink};
pub use forwarder::{ForwarderStats, LogAnalytics};
pub use grouping::{group_by_type, SubBatch};
pub use metadata::{
    normalize_user_agent, CustomMetadata, Event, EventKind, MetadataBuilder, MetadataError,
    RequestMetadata, StatisticMetadata,
};
pub use signer::{Signer, SignerError};
