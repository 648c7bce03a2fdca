//! Log Analytics Forwarder demo service
//!
//! Produces sample request and statistic events and forwards them to the
//! configured Azure Log Analytics workspace. Without credentials every event
//! is echoed to standard output instead.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables, see
//! [`log_analytics_forwarder::config::Config`]. In addition:
//!
//! - `RUST_LOG`: Logging level filter (default: info)

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use log_analytics_forwarder::config::Config;
use log_analytics_forwarder::metadata::{Event, MetadataBuilder, RequestMetadata, StatisticMetadata};
use log_analytics_forwarder::LogAnalytics;

/// Interval between sample events in milliseconds
const DEFAULT_GENERATION_INTERVAL_MS: u64 = 50;

/// Upper bound for the graceful shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const SAMPLE_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/86.0.4240.75 Safari/537.36",
    "python-requests/2.24.0",
    "curl/7.68.0",
    "Java/11.0.8",
];

const SAMPLE_WORKSPACES: &[(&str, &str)] = &[("a1b2", "analytics"), ("c3d4", "billing")];

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Log Analytics forwarder demo...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                batch_size = config.batch_size,
                flush_interval_ms = config.flush_interval.as_millis() as u64,
                delivery_enabled = config.credentials().is_some(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let log_analytics = match LogAnalytics::start(config) {
        Ok(log_analytics) => log_analytics,
        Err(e) => {
            error!(error = %e, "Failed to start forwarder");
            std::process::exit(1);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let producer = tokio::spawn(run_producer(log_analytics.clone(), stop_rx));

    info!("Forwarder running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    stop_tx.send_replace(true);
    if let Err(e) = producer.await {
        warn!(error = %e, "Producer task failed");
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, log_analytics.shutdown()).await {
        Ok(()) => info!(stats = ?log_analytics.stats(), "Forwarder shut down gracefully"),
        Err(_) => warn!("Forwarder shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Enqueue sample events at a fixed interval until told to stop.
async fn run_producer(log_analytics: LogAnalytics, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_millis(DEFAULT_GENERATION_INTERVAL_MS));
    let mut produced: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log_analytics.enqueue(sample_event(&mut rand::thread_rng()));
                produced += 1;
            }
            _ = stop.changed() => break,
        }
    }

    info!(produced = produced, "Producer stopped");
}

fn sample_event<R: Rng>(rng: &mut R) -> Event {
    let (workspace_id, workspace_name) = SAMPLE_WORKSPACES[rng.gen_range(0..SAMPLE_WORKSPACES.len())];

    if rng.gen_bool(0.7) {
        RequestMetadata::new()
            .workspace_id(workspace_id)
            .workspace_name(workspace_name)
            .user_agent(SAMPLE_USER_AGENTS[rng.gen_range(0..SAMPLE_USER_AGENTS.len())])
            .duration_sec(rng.gen_range(0..30))
            .build()
    } else {
        StatisticMetadata::new()
            .workspace_id(workspace_id)
            .workspace_name(workspace_name)
            .object_count(rng.gen_range(0..100_000))
            .build()
    }
}
