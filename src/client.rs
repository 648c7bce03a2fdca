//! HTTP client module for posting sub-batches to the data collector API.
//!
//! One call performs exactly one signed POST of one single-type sub-batch.
//! The outcome is all-or-nothing: any 2xx status is success, every other
//! status, transport error or timeout is a failure. Retrying is not this
//! module's concern; a failed sub-batch goes to the fallback sink.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::grouping::SubBatch;
use crate::metadata::TIMESTAMP_FIELD_NAME;
use crate::signer::{self, rfc7231_date, Signer};

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("log-analytics-forwarder/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while delivering a sub-batch.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Server answered with a non-2xx status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Connect or read timeout elapsed
    #[error("Request timed out")]
    Timeout,

    /// The sub-batch could not be encoded as JSON
    #[error("Failed to serialize batch: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// HTTP client for the Log Analytics data collector API.
///
/// The underlying reqwest client is reused across calls for connection
/// pooling.
pub struct LogAnalyticsClient {
    client: Client,

    ingest_url: String,

    signer: Signer,

    connect_timeout: Duration,

    read_timeout: Duration,
}

impl LogAnalyticsClient {
    /// Create a client for the workspace the configuration points at.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if no ingestion URL can be derived or
    /// the HTTP client cannot be built.
    pub fn new(config: &Config, signer: Signer) -> Result<Self, ClientError> {
        let ingest_url = config.ingest_url().ok_or_else(|| {
            ClientError::Config("no workspace id or ingest URL configured".to_string())
        })?;
        Self::with_settings(
            ingest_url,
            signer,
            config.connect_timeout,
            config.read_timeout,
        )
    }

    /// Create a client with custom settings.
    pub fn with_settings(
        ingest_url: impl Into<String>,
        signer: Signer,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .timeout(connect_timeout + read_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            ingest_url: ingest_url.into(),
            signer,
            connect_timeout,
            read_timeout,
        })
    }

    /// Serialize and post one sub-batch.
    pub async fn deliver(&self, sub_batch: &SubBatch) -> Result<(), ClientError> {
        let body = sub_batch.to_json()?;
        self.post(sub_batch.log_type(), body).await
    }

    /// Post an already serialized JSON array of events of `log_type`.
    pub async fn post(&self, log_type: &str, body: String) -> Result<(), ClientError> {
        let body_length = body.len();
        let date = rfc7231_date(Utc::now());
        let authorization = self.signer.authorization(body_length, &date);

        debug!(
            log_type = log_type,
            body_length = body_length,
            url = %self.ingest_url,
            "Posting log batch"
        );

        let response = self
            .client
            .post(&self.ingest_url)
            .header(CONTENT_TYPE, signer::CONTENT_TYPE)
            .header(AUTHORIZATION, authorization)
            .header("Log-Type", log_type)
            .header("x-ms-date", &date)
            .header("time-generated-field", TIMESTAMP_FIELD_NAME)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ClientError::Status {
            code: status,
            message,
        })
    }

    /// Get the configured ingest URL.
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}
