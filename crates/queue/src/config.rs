//! Configuration for the queue consumer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Largest batch a single receive call may return.
pub const MAX_BATCH_SIZE: u32 = 10;

/// Longest server-side wait a long poll may request.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// What happens to a message once the poller is done with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Never delete; the message becomes visible again after the visibility
    /// timeout and triggers another (idempotent) reconcile.
    #[default]
    Retain,
    /// Delete once its event was accepted by the router, and delete
    /// undecodable messages straight away.
    DeleteAfterDispatch,
}

/// Which client talks to the queue service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueClientKind {
    /// AWS SDK client: SigV4-signed, credentials and region from the
    /// standard provider chain.
    #[default]
    Aws,
    /// Unsigned SQS JSON protocol, for ElasticMQ, LocalStack or a signing
    /// proxy.
    Http,
}

/// Configuration for the queue consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue to consume. Required.
    #[serde(default)]
    pub url: Option<Url>,

    /// Client used to reach the queue.
    #[serde(default)]
    pub client: QueueClientKind,

    /// AWS region; the provider chain and then the queue URL are used when
    /// unset.
    #[serde(default)]
    pub region: Option<String>,

    /// Endpoint override for the AWS client (LocalStack, ElasticMQ).
    #[serde(default)]
    pub endpoint_url: Option<Url>,

    /// Pause between receive calls.
    #[serde(with = "ebb_core::duration::millis", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Server-side long-poll wait.
    #[serde(with = "ebb_core::duration::secs", default = "default_wait_time")]
    pub wait_time: Duration,

    /// Messages per receive call.
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,

    /// Acknowledgement policy.
    #[serde(default)]
    pub ack_policy: AckPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            client: QueueClientKind::default(),
            region: None,
            endpoint_url: None,
            poll_interval: default_poll_interval(),
            wait_time: default_wait_time(),
            max_messages: default_max_messages(),
            ack_policy: AckPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the long-poll wait time.
    #[must_use]
    pub const fn wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn max_messages(mut self, max: u32) -> Self {
        self.max_messages = max;
        self
    }

    /// Set the acknowledgement policy.
    #[must_use]
    pub const fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// HTTP timeout for a receive call: the long-poll wait plus a margin.
    pub fn request_timeout(&self) -> Duration {
        self.wait_time.saturating_add(Duration::from_secs(10))
    }

    /// Check the fields the poller cannot run without.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending field.
    pub fn validate(&self) -> ebb_core::Result<&Url> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ebb_core::Error::missing_config("queue.url"))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ebb_core::Error::invalid_config(
                "queue.url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if self.region.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(ebb_core::Error::invalid_config(
                "queue.region",
                "must not be empty",
            ));
        }
        self.validate_polling()?;
        Ok(url)
    }

    /// Check the polling knobs alone, for clients that need no URL.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending field.
    pub fn validate_polling(&self) -> ebb_core::Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ebb_core::Error::invalid_config(
                "queue.poll_interval",
                "must be greater than zero",
            ));
        }
        if self.wait_time > MAX_WAIT_TIME {
            return Err(ebb_core::Error::invalid_config(
                "queue.wait_time",
                format!("must be at most {}s", MAX_WAIT_TIME.as_secs()),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.max_messages) {
            return Err(ebb_core::Error::invalid_config(
                "queue.max_messages",
                format!("must be between 1 and {MAX_BATCH_SIZE}"),
            ));
        }
        Ok(())
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_wait_time() -> Duration {
    MAX_WAIT_TIME
}

const fn default_max_messages() -> u32 {
    MAX_BATCH_SIZE
}
