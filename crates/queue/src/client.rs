//! Queue service clients.
//!
//! [`QueueClient`] is the contract the poller consumes. [`HttpQueueClient`]
//! speaks the unsigned SQS JSON protocol to SQS-compatible endpoints
//! (ElasticMQ, LocalStack, or a request-signing proxy in front of SQS). SQS
//! itself needs the signed [`crate::SqsQueueClient`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::message::RawMessage;

const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_HEADER: &str = "X-Amz-Target";
const RECEIVE_TARGET: &str = "AmazonSQS.ReceiveMessage";
const DELETE_TARGET: &str = "AmazonSQS.DeleteMessage";

/// Contract of the durable queue: at-least-once delivery, visibility
/// timeout, long polling.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max_messages`, waiting server-side up to `wait_time`
    /// for at least one to arrive.
    async fn receive(&self, max_messages: u32, wait_time: Duration) -> Result<Vec<RawMessage>>;

    /// Delete one delivery of a message.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

/// Client for SQS-compatible endpoints using the JSON protocol.
#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    queue_url: Url,
    endpoint: Url,
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageRequest<'a> {
    queue_url: &'a str,
    max_number_of_messages: u32,
    wait_time_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceivedMessage {
    message_id: String,
    receipt_handle: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteMessageRequest<'a> {
    queue_url: &'a str,
    receipt_handle: &'a str,
}

impl HttpQueueClient {
    /// Create a client for `queue_url`.
    ///
    /// Requests go to the origin of the queue URL, as the JSON protocol
    /// expects; `request_timeout` must exceed the long-poll wait.
    ///
    /// # Errors
    ///
    /// Returns `Error::Http` if the HTTP client cannot be built.
    pub fn new(queue_url: Url, request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        let mut endpoint = queue_url.clone();
        endpoint.set_path("/");
        endpoint.set_query(None);
        endpoint.set_fragment(None);

        Ok(Self {
            queue_url,
            endpoint,
            http_client,
        })
    }

    /// Create a client from a validated config.
    ///
    /// # Errors
    ///
    /// Returns `Error::Core` when the config is invalid, `Error::Http` when
    /// the HTTP client cannot be built.
    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        let url = config.validate()?.clone();
        Self::new(url, config.request_timeout())
    }

    /// The queue this client consumes.
    pub const fn queue_url(&self) -> &Url {
        &self.queue_url
    }

    async fn call<B: Serialize + Sync>(&self, target: &str, body: &B) -> Result<String> {
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(TARGET_HEADER, target)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Error::ServiceError {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    async fn receive(&self, max_messages: u32, wait_time: Duration) -> Result<Vec<RawMessage>> {
        let request = ReceiveMessageRequest {
            queue_url: self.queue_url.as_str(),
            max_number_of_messages: max_messages,
            wait_time_seconds: wait_time.as_secs(),
        };

        let text = self.call(RECEIVE_TARGET, &request).await?;
        // an empty long poll may come back as an empty body
        let response: ReceiveMessageResponse = if text.trim().is_empty() {
            ReceiveMessageResponse::default()
        } else {
            serde_json::from_str(&text)?
        };

        debug!(count = response.messages.len(), "Received messages");

        Ok(response
            .messages
            .into_iter()
            .map(|m| RawMessage::new(m.message_id, m.receipt_handle, m.body))
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let request = DeleteMessageRequest {
            queue_url: self.queue_url.as_str(),
            receipt_handle,
        };

        self.call(DELETE_TARGET, &request)
            .await
            .map(|_| ())
            .map_err(|e| Error::delete_failed(receipt_handle, e.to_string()))
    }
}
