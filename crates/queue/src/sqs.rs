//! AWS SDK queue client.
//!
//! Requests are SigV4-signed with credentials from the standard provider
//! chain (environment, shared profile, web identity, instance metadata), so
//! this is the client that talks to SQS itself.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::config::timeout::TimeoutConfig;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::Message;
use tracing::{debug, warn};
use url::Url;

use crate::client::QueueClient;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::message::RawMessage;

/// Client for SQS built on the AWS SDK.
#[derive(Debug, Clone)]
pub struct SqsQueueClient {
    client: Client,
    queue_url: Url,
}

impl SqsQueueClient {
    /// Wrap an already configured SDK client.
    pub const fn with_client(client: Client, queue_url: Url) -> Self {
        Self { client, queue_url }
    }

    /// Create a client from a validated config.
    ///
    /// The region comes from `queue.region`, then the provider chain, then
    /// the queue URL host (`sqs.<region>.amazonaws.com`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Core` when the config is invalid.
    pub async fn from_config(config: &QueueConfig) -> Result<Self> {
        let queue_url = config.validate()?.clone();

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(
            TimeoutConfig::builder()
                .operation_attempt_timeout(config.request_timeout())
                .build(),
        );
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        let shared = loader.load().await;

        let mut sqs_config = aws_sdk_sqs::config::Builder::from(&shared);
        if shared.region().is_none() {
            let region = region_from_queue_url(&queue_url);
            debug!(region = ?region, "No region configured, using the queue URL");
            sqs_config = sqs_config.region(region.map(Region::new));
        }

        Ok(Self::with_client(Client::from_conf(sqs_config.build()), queue_url))
    }

    /// The queue this client consumes.
    pub const fn queue_url(&self) -> &Url {
        &self.queue_url
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(&self, max_messages: u32, wait_time: Duration) -> Result<Vec<RawMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(self.queue_url.as_str())
            .max_number_of_messages(i32::try_from(max_messages).unwrap_or(i32::MAX))
            .wait_time_seconds(i32::try_from(wait_time.as_secs()).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|e| Error::receive_failed(DisplayErrorContext(&e).to_string()))?;

        let messages: Vec<RawMessage> = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(into_raw)
            .collect();
        debug!(count = messages.len(), "Received messages");
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(self.queue_url.as_str())
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Error::delete_failed(receipt_handle, DisplayErrorContext(&e).to_string()))
    }
}

/// A delivery without id or receipt handle can be neither traced nor deleted.
fn into_raw(message: Message) -> Option<RawMessage> {
    match (message.message_id, message.receipt_handle) {
        (Some(id), Some(handle)) => Some(RawMessage::new(
            id,
            handle,
            message.body.unwrap_or_default(),
        )),
        (id, _) => {
            warn!(message_id = ?id, "Dropping delivery without id or receipt handle");
            None
        }
    }
}

/// Region part of `sqs.<region>.amazonaws.com` or the legacy
/// `<region>.queue.amazonaws.com`.
fn region_from_queue_url(url: &Url) -> Option<String> {
    let mut labels = url.host_str()?.split('.');
    match (labels.next(), labels.next(), labels.next()) {
        (Some("sqs"), Some(region), Some("amazonaws"))
        | (Some(region), Some("queue"), Some("amazonaws")) => Some(region.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_sqs::config::retry::RetryConfig;
    use aws_sdk_sqs::config::{BehaviorVersion, Credentials};
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    const JSON_1_0: &str = "application/x-amz-json-1.0";

    fn client_for(server: &MockServer) -> std::result::Result<SqsQueueClient, url::ParseError> {
        let config = aws_sdk_sqs::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("eu-west-1"))
            .credentials_provider(Credentials::new("AKIDEXAMPLE", "secret", None, None, "test"))
            .endpoint_url(server.uri())
            .retry_config(RetryConfig::disabled())
            .build();
        let queue_url = format!("{}/123456789012/namespaces", server.uri()).parse()?;
        Ok(SqsQueueClient::with_client(Client::from_conf(config), queue_url))
    }

    #[tokio::test]
    async fn test_receive_is_signed() -> TestResult {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("x-amz-target", "AmazonSQS.ReceiveMessage"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", JSON_1_0)
                    .set_body_string(
                        serde_json::json!({
                            "Messages": [
                                {
                                    "MessageId": "msg-1",
                                    "ReceiptHandle": "rh-1",
                                    "Body": "{\"namespace\":\"team-a\"}"
                                },
                                { "Body": "no handle" }
                            ]
                        })
                        .to_string(),
                    ),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server)?;
        let messages = client.receive(10, Duration::from_secs(0)).await?;

        assert_eq!(
            messages,
            vec![RawMessage::new("msg-1", "rh-1", r#"{"namespace":"team-a"}"#)]
        );
        let requests = server.received_requests().await.unwrap_or_default();
        let authorization = requests
            .first()
            .and_then(|r| r.headers.get("authorization"))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256"));
        assert!(authorization.contains("/eu-west-1/sqs/"));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_signed() -> TestResult {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("x-amz-target", "AmazonSQS.DeleteMessage"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", JSON_1_0)
                    .set_body_string("{}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)?.delete("rh-1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_service_error_is_a_receive_failure() -> TestResult {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("content-type", JSON_1_0)
                    .set_body_string(
                        r#"{"__type":"com.amazonaws.sqs#QueueDoesNotExist","message":"no queue"}"#,
                    ),
            )
            .mount(&server)
            .await;

        let result = client_for(&server)?.receive(10, Duration::from_secs(0)).await;

        assert!(matches!(result, Err(Error::ReceiveFailed { .. })));
        assert!(result.is_err_and(|e| e.is_transient()));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_failure_names_handle() -> TestResult {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = client_for(&server)?.delete("rh-9").await;

        assert!(matches!(
            result,
            Err(Error::DeleteFailed { receipt_handle, .. }) if receipt_handle == "rh-9"
        ));
        Ok(())
    }

    #[test]
    fn test_region_from_queue_url() -> TestResult {
        let modern: Url = "https://sqs.eu-west-1.amazonaws.com/123456789012/namespaces".parse()?;
        let legacy: Url = "https://us-east-2.queue.amazonaws.com/123456789012/namespaces".parse()?;
        let local: Url = "http://localhost:9324/000000000000/namespaces".parse()?;

        assert_eq!(region_from_queue_url(&modern).as_deref(), Some("eu-west-1"));
        assert_eq!(region_from_queue_url(&legacy).as_deref(), Some("us-east-2"));
        assert_eq!(region_from_queue_url(&local), None);
        Ok(())
    }
}
