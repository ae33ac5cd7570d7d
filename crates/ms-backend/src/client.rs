//! Messages API client with SSE streaming support.

use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use ms_protocol::{Envelope, MessageRequest};
use reqwest::{Client, RequestBuilder};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientConfig, ConfigError};
use crate::error::StreamError;
use crate::session::{decode_response, error_envelope};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Messages API client.
pub struct MessagesClient {
    config: ClientConfig,
    api_key: String,
    url: String,
    http: Client,
}

/// Build an HTTP client with the configured timeouts and connection limits.
fn build_http_client(config: &ClientConfig) -> Result<Client, ClientError> {
    let client = Client::builder()
        .read_timeout(Duration::from_secs(config.read_timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(2)
        .build()?;
    Ok(client)
}

impl MessagesClient {
    /// Create a client, resolving the API key from the config.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let api_key = config.resolve_api_key()?;
        Self::with_api_key(config, api_key)
    }

    /// Create a client with an already known API key.
    pub fn with_api_key(config: ClientConfig, api_key: impl Into<String>) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            url: config.messages_url(),
            http: build_http_client(&config)?,
            api_key: api_key.into(),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a request and wait for the whole message.
    ///
    /// A non-success status is returned as an error envelope, not an `Err`.
    pub async fn create(&self, request: &MessageRequest) -> Result<Envelope, ClientError> {
        let body = self.prepare(request, false);
        let response = self.post(&body, false).send().await?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;

        if !status.is_success() {
            return Ok(error_envelope(status, request_id, &text));
        }

        let mut envelope = Envelope::from_document(&text)?;
        envelope.status = Some(status.as_u16());
        envelope.request_id = request_id;
        Ok(envelope)
    }

    /// Send a request and return a stream of envelopes.
    pub fn create_stream(
        &self,
        request: &MessageRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<Envelope, StreamError>> + Send + 'static {
        let body = self.prepare(request, true);
        let builder = self.post(&body, true);

        stream! {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = builder.send() => sent,
            };
            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    yield Err(StreamError::Http(e));
                    return;
                }
            };
            debug!(status = response.status().as_u16(), "stream response received");

            let mut envelopes = Box::pin(decode_response(response, cancel));
            while let Some(item) = envelopes.next().await {
                yield item;
            }
        }
    }

    /// Fill in defaults the request left unset.
    fn prepare(&self, request: &MessageRequest, stream: bool) -> MessageRequest {
        let mut body = request.clone();
        if body.model.is_empty() {
            body.model = self.config.default_model.clone();
        }
        if body.max_tokens == 0 {
            body.max_tokens = self.config.max_tokens;
        }
        body.stream = stream.then_some(true);
        body
    }

    fn post(&self, body: &MessageRequest, stream: bool) -> RequestBuilder {
        let builder = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.anthropic_version)
            .header("content-type", "application/json")
            .json(body);
        if stream {
            builder.header("accept", "text/event-stream")
        } else {
            builder
        }
    }
}
