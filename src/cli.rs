//! CLI definition using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ebb_queue::{AckPolicy, QueueClientKind};
use url::Url;

use crate::config::BridgeConfig;
use crate::telemetry::LogFormat;

/// EBB - reconcile namespaces on demand from an SQS queue
#[derive(Parser, Debug)]
#[command(name = "ebb")]
#[command(version)]
#[command(about = "Turns queue messages into level-triggered namespace reconciles")]
#[command(
    long_about = "EBB long-polls an SQS-compatible queue for {\"namespace\": ...} messages and \
                  makes sure every named namespace contains its managed Role. Namespace and \
                  Role watches trigger the same reconcile."
)]
pub struct Cli {
    /// Queue to consume
    #[arg(long, env = "EBB_QUEUE_URL")]
    pub queue_url: Option<Url>,

    /// Client used to reach the queue
    #[arg(long, value_enum, env = "EBB_QUEUE_CLIENT")]
    pub queue_client: Option<QueueClientArg>,

    /// AWS region of the queue (defaults to the provider chain, then the queue URL)
    #[arg(long)]
    pub region: Option<String>,

    /// Endpoint override for the AWS client, e.g. LocalStack
    #[arg(long, env = "EBB_ENDPOINT_URL")]
    pub endpoint_url: Option<Url>,

    /// TOML configuration file; flags override its values
    #[arg(short, long, env = "EBB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of concurrent reconciles
    #[arg(long)]
    pub workers: Option<usize>,

    /// Pause between receive calls, in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Server-side long-poll wait, in seconds (at most 20)
    #[arg(long)]
    pub wait_time_secs: Option<u64>,

    /// Messages per receive call (1 to 10)
    #[arg(long)]
    pub max_messages: Option<u32>,

    /// Whether consumed messages are deleted from the queue
    #[arg(long, value_enum)]
    pub ack_policy: Option<AckPolicyArg>,

    /// Name of the Role kept in every namespace
    #[arg(long)]
    pub role_name: Option<String>,

    /// Re-reconcile converged namespaces after this many seconds
    #[arg(long)]
    pub resync_period_secs: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "EBB_LOG_FORMAT")]
    pub log_format: LogFormat,
}

/// CLI spelling of [`AckPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AckPolicyArg {
    /// Leave messages on the queue; they come back after the visibility timeout
    Retain,
    /// Delete messages once handed to the router
    DeleteAfterDispatch,
}

impl From<AckPolicyArg> for AckPolicy {
    fn from(arg: AckPolicyArg) -> Self {
        match arg {
            AckPolicyArg::Retain => Self::Retain,
            AckPolicyArg::DeleteAfterDispatch => Self::DeleteAfterDispatch,
        }
    }
}

/// CLI spelling of [`QueueClientKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueClientArg {
    /// Signed requests through the AWS SDK
    Aws,
    /// Unsigned SQS JSON protocol (ElasticMQ, LocalStack, signing proxy)
    Http,
}

impl From<QueueClientArg> for QueueClientKind {
    fn from(arg: QueueClientArg) -> Self {
        match arg {
            QueueClientArg::Aws => Self::Aws,
            QueueClientArg::Http => Self::Http,
        }
    }
}

impl Cli {
    /// Load the configuration file, if any, and apply the flags on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn resolve_config(&self) -> ebb_core::Result<BridgeConfig> {
        let base = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };
        Ok(self.apply(base))
    }

    /// Override `config` with every flag that was given.
    pub fn apply(&self, mut config: BridgeConfig) -> BridgeConfig {
        if let Some(url) = &self.queue_url {
            config.queue.url = Some(url.clone());
        }
        if let Some(client) = self.queue_client {
            config.queue.client = client.into();
        }
        if let Some(region) = &self.region {
            config.queue.region = Some(region.clone());
        }
        if let Some(endpoint) = &self.endpoint_url {
            config.queue.endpoint_url = Some(endpoint.clone());
        }
        if let Some(ms) = self.poll_interval_ms {
            config.queue.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.wait_time_secs {
            config.queue.wait_time = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_messages {
            config.queue.max_messages = max;
        }
        if let Some(policy) = self.ack_policy {
            config.queue.ack_policy = policy.into();
        }
        if let Some(workers) = self.workers {
            config.controller.workers = workers;
        }
        if let Some(name) = &self.role_name {
            config.reconciler.role.name.clone_from(name);
        }
        if let Some(secs) = self.resync_period_secs {
            config.reconciler.resync_period = Some(Duration::from_secs(secs));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() -> Result<(), Box<dyn std::error::Error>> {
        let cli = Cli::try_parse_from([
            "ebb",
            "--queue-url",
            "http://localhost:9324/000000000000/namespaces",
            "--workers",
            "4",
            "--poll-interval-ms",
            "500",
            "--ack-policy",
            "delete-after-dispatch",
            "--queue-client",
            "http",
            "--region",
            "eu-west-1",
            "--role-name",
            "team-viewer",
            "--log-format",
            "json",
        ])?;

        let config = cli.apply(BridgeConfig::default());

        assert_eq!(
            config.queue.url.as_ref().map(Url::as_str),
            Some("http://localhost:9324/000000000000/namespaces")
        );
        assert_eq!(config.controller.workers, 4);
        assert_eq!(config.queue.poll_interval, Duration::from_millis(500));
        assert_eq!(config.queue.ack_policy, AckPolicy::DeleteAfterDispatch);
        assert_eq!(config.queue.client, QueueClientKind::Http);
        assert_eq!(config.queue.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.reconciler.role.name, "team-viewer");
        assert_eq!(cli.log_format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn test_unset_flags_keep_config() -> Result<(), Box<dyn std::error::Error>> {
        let cli = Cli::try_parse_from(["ebb"])?;
        let mut base = BridgeConfig::default();
        base.controller.workers = 7;

        let config = cli.apply(base.clone());

        assert_eq!(config, base);
        Ok(())
    }

    #[test]
    fn test_invalid_queue_url_is_rejected() {
        assert!(Cli::try_parse_from(["ebb", "--queue-url", "not a url"]).is_err());
    }
}
