//! HTTP delivery of batches to the log ingestion endpoint.
//!
//! Delivery is split in two layers. [`HttpDelivery`] performs a single POST
//! and only *classifies* the result as delivered, retryable or fatal.
//! [`RetryPolicy`] decides what happens to a retryable result, so the
//! classification stays the same whatever policy a run is configured with.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::Config;

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Errors that can occur while delivering a batch.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// Server answered with a non-success status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

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

/// Classified result of one delivery attempt.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The endpoint accepted the batch
    Delivered,

    /// Transport-level failure; the same batch may succeed later
    Retryable(ClientError),

    /// The endpoint rejected the batch
    Fatal(ClientError),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Something that can take a batch off the pipeline's hands.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, batch: &Batch) -> DeliveryOutcome;
}

/// Delivers batches as raw request bodies over HTTP POST.
///
/// The batch bytes are sent unchanged, with no extra headers: the CLEF raw
/// endpoint reads newline-delimited events straight from the body.
///
/// # Example
///
/// ```no_run
/// use archive_shipper::batch::{Batcher, FlushPolicy};
/// use archive_shipper::client::{Deliver, HttpDelivery};
/// use archive_shipper::config::Config;
///
/// #[tokio::main]
/// async fn main() {
///     let client = HttpDelivery::new(&Config::default()).expect("Failed to create client");
///
///     let mut batcher = Batcher::new(FlushPolicy::Bytes(1_000));
///     batcher.append("{\"@t\":\"2024-01-01T00:00:00Z\",\"@m\":\"hello\"}\n");
///     let batch = batcher.flush().unwrap();
///
///     let outcome = client.deliver(&batch).await;
///     println!("delivered: {}", outcome.is_delivered());
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL for the ingestion endpoint
    url: String,

    /// Request timeout duration
    timeout: Duration,
}

impl HttpDelivery {
    /// Create a delivery client from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(config.url.clone(), config.request_timeout)
    }

    /// Create a delivery client for an explicit URL and timeout.
    pub fn with_settings(url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    /// Send a single request without retry logic.
    async fn send_request(&self, batch: &Batch) -> Result<(), ClientError> {
        let response = self
            .client
            .post(&self.url)
            .body(batch.bytes().to_vec())
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

    /// Get the configured endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Deliver for HttpDelivery {
    async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        debug!(
            batch_bytes = batch.len(),
            payloads = batch.payloads(),
            url = %self.url,
            "Sending batch"
        );

        match self.send_request(batch).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => classify(e),
        }
    }
}

/// Sort a delivery error into retryable and fatal.
///
/// Any answer from the server is final: the endpoint saw the data and
/// refused it. Only failures to get an answer at all are retryable.
pub fn classify(error: ClientError) -> DeliveryOutcome {
    match error {
        ClientError::Request(_) | ClientError::Timeout => DeliveryOutcome::Retryable(error),
        ClientError::Status { .. } | ClientError::Config(_) => DeliveryOutcome::Fatal(error),
    }
}

/// What to do with retryable outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,

    /// Delay before the first retry; doubled on every further retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// No retries: the first transport failure aborts the run.
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Deliver `batch`, retrying retryable outcomes while attempts remain.
    ///
    /// Returns the error of the last attempt when the batch could not be
    /// delivered.
    pub async fn deliver<D>(&self, client: &D, batch: &Batch) -> Result<u32, ClientError>
    where
        D: Deliver + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match client.deliver(batch).await {
                DeliveryOutcome::Delivered => return Ok(attempt + 1),
                DeliveryOutcome::Fatal(e) => return Err(e),
                DeliveryOutcome::Retryable(e) => {
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        error = %e,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Delivery failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Calculate the backoff delay before retry number `attempt` (1-based).
    ///
    /// delay = min(base_delay * 2^(attempt-1) + jitter, max_delay)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.base_delay.as_millis() as u64;

        let exponential_delay =
            base_delay.saturating_mul(1 << attempt.saturating_sub(1).min(10));

        // Up to 25% jitter
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let total_delay = exponential_delay
            .saturating_add(jitter)
            .min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }
}
