use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::RelayConfig;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const ACCEPT: &str = "application/json, text/xml, application/xml, */*";

/// Default per-relay timeout; a relay that never answers would otherwise
/// stall the whole refresh pass.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from a single relay attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// No response within the relay timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// 2xx response with a blank body
    #[error("Relay returned an empty body")]
    EmptyBody,
    /// JSON envelope parsed but carried no usable `contents`
    #[error("No content received from relay")]
    EmptyEnvelope,
    /// The relay promised a JSON envelope but sent something else
    #[error("Malformed relay envelope: {0}")]
    InvalidEnvelope(String),
    /// The relay chain has no strategies to try
    #[error("No relays configured")]
    NoRelays,
}

/// Every relay in the chain failed.
#[derive(Debug, Error)]
#[error("All {attempts} relays failed. Last error: {last}")]
pub struct RelayExhausted {
    pub attempts: usize,
    #[source]
    pub last: TransportError,
}

/// One way of retrieving a feed body.
///
/// The chain only needs a name for logs and a fallible fetch; each relay,
/// direct fetching, or a test double can be swapped in on its own.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, url: &str) -> Result<String, TransportError>;
}

/// How a relay wraps the upstream body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayFormat {
    /// `{"contents": "<feed body>", ...}`
    Envelope,
    /// Body passed through untouched
    Raw,
    /// A JSON object is treated as an envelope, anything else as raw
    #[default]
    Auto,
}

// ============================================================================
// HTTP relay
// ============================================================================

/// A public HTTP relay (or a direct fetch when `endpoint` is `None`).
///
/// The feed URL is percent-encoded and substituted for `{url}` in the
/// endpoint, or appended to it when the endpoint has no placeholder.
pub struct HttpRelay {
    name: String,
    endpoint: Option<String>,
    format: RelayFormat,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(
        name: impl Into<String>,
        endpoint: Option<String>,
        format: RelayFormat,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            format,
            client,
            timeout,
        }
    }

    /// Fetches the feed URL itself, no relay in between.
    pub fn direct(client: reqwest::Client, timeout: Duration) -> Self {
        Self::new("direct", None, RelayFormat::Raw, client, timeout)
    }

    pub fn request_url(&self, feed_url: &str) -> String {
        match &self.endpoint {
            None => feed_url.to_string(),
            Some(endpoint) => {
                // Spaces become %20, not `+`, so path-segment templates work too
                let encoded = urlencoding::encode(feed_url);
                if endpoint.contains("{url}") {
                    endpoint.replace("{url}", &encoded)
                } else {
                    format!("{endpoint}{encoded}")
                }
            }
        }
    }

    async fn get_body(&self, request_url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(request_url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, MAX_FEED_SIZE).await
    }
}

#[async_trait]
impl FetchStrategy for HttpRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, url: &str) -> Result<String, TransportError> {
        let request_url = self.request_url(url);
        let bytes = tokio::time::timeout(self.timeout, self.get_body(&request_url))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        let body = String::from_utf8_lossy(&bytes).into_owned();
        extract_contents(body, self.format)
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    contents: Option<serde_json::Value>,
}

fn envelope_contents(envelope: Envelope) -> Result<String, TransportError> {
    match envelope.contents {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s),
        _ => Err(TransportError::EmptyEnvelope),
    }
}

fn extract_contents(body: String, format: RelayFormat) -> Result<String, TransportError> {
    if body.trim().is_empty() {
        return Err(TransportError::EmptyBody);
    }
    match format {
        RelayFormat::Raw => Ok(body),
        RelayFormat::Envelope => {
            let envelope: Envelope = serde_json::from_str(&body)
                .map_err(|e| TransportError::InvalidEnvelope(e.to_string()))?;
            envelope_contents(envelope)
        }
        RelayFormat::Auto => {
            if !body.trim_start().starts_with('{') {
                return Ok(body);
            }
            match serde_json::from_str::<Envelope>(&body) {
                Ok(envelope) => envelope_contents(envelope),
                Err(_) => Ok(body),
            }
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(TransportError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(TransportError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(TransportError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

// ============================================================================
// Relay chain
// ============================================================================

/// Shared HTTP client for every relay.
///
/// Redirects are capped at 3 hops and loops are rejected.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, TransportError> {
    let policy = reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }
        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }
        tracing::debug!(to = %url, hop = attempt.previous().len() + 1, "Following redirect");
        attempt.follow()
    });

    let client = reqwest::Client::builder()
        .user_agent(concat!("relayfeed/", env!("CARGO_PKG_VERSION")))
        .redirect(policy)
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .connect_timeout(timeout)
        .build()?;
    Ok(client)
}

/// Ordered fallback list of fetch strategies.
#[derive(Default)]
pub struct RelayChain {
    strategies: Vec<Box<dyn FetchStrategy>>,
}

impl RelayChain {
    pub fn new(strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        Self { strategies }
    }

    /// Builds the chain from configured relays, all sharing one HTTP client.
    pub fn from_config(relays: &[RelayConfig], client: &reqwest::Client, timeout: Duration) -> Self {
        let strategies = relays
            .iter()
            .map(|relay| {
                Box::new(HttpRelay::new(
                    relay.name.clone(),
                    relay.endpoint.clone(),
                    relay.format,
                    client.clone(),
                    timeout,
                )) as Box<dyn FetchStrategy>
            })
            .collect();
        Self::new(strategies)
    }

    pub fn push(&mut self, strategy: Box<dyn FetchStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Tries each strategy in order and returns the first usable body.
    ///
    /// Attempts are sequential; once a strategy succeeds no later one is
    /// called. When all fail, the last underlying error is returned inside
    /// [`RelayExhausted`].
    pub async fn fetch_remote_content(&self, url: &str) -> Result<String, RelayExhausted> {
        let total = self.strategies.len();
        let mut last = TransportError::NoRelays;

        for (idx, strategy) in self.strategies.iter().enumerate() {
            match strategy.fetch(url).await {
                Ok(body) => {
                    tracing::debug!(
                        feed = %url,
                        relay = strategy.name(),
                        bytes = body.len(),
                        "Relay returned content"
                    );
                    return Ok(body);
                }
                Err(e) => {
                    tracing::warn!(
                        feed = %url,
                        relay = strategy.name(),
                        attempt = idx + 1,
                        total = total,
                        error = %e,
                        "Relay failed"
                    );
                    last = e;
                }
            }
        }

        Err(RelayExhausted {
            attempts: total,
            last,
        })
    }
}
