use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

/// How the batch loop commits a batch once its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Resolve every delivered batch, even when a message failed. A crash or a
    /// failing handler mid-batch loses the rest of that batch.
    #[default]
    AutoResolve,
    /// Resolve only what was handled. The session is rewound to the failed
    /// message, which is fetched again along with the rest of its batch.
    AfterSuccess,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCommitPolicyError(String);

impl std::fmt::Display for ParseCommitPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown commit policy {}, must be auto or after_success", self.0)
    }
}

impl FromStr for CommitPolicy {
    type Err = ParseCommitPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "auto" | "auto_resolve" => Ok(CommitPolicy::AutoResolve),
            "after_success" => Ok(CommitPolicy::AfterSuccess),
            _ => Err(ParseCommitPolicyError(s.to_owned())),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    /// Upper bound on concurrent handler invocations per single-message subscription.
    #[envconfig(from = "MAX_IN_FLIGHT", default = "64")]
    pub max_in_flight: usize,

    #[envconfig(from = "BATCH_SIZE", default = "500")]
    pub batch_size: usize,

    #[envconfig(from = "BATCH_TIMEOUT_MS", default = "500")]
    pub batch_timeout: EnvMsDuration,

    /// 0 disables the per-message timeout.
    #[envconfig(from = "HANDLER_TIMEOUT_MS", default = "0")]
    pub handler_timeout: EnvMsDuration,

    /// Kafka evicts a consumer that goes this long between fetches, so every
    /// batch must be fully handled within it.
    #[envconfig(from = "MAX_POLL_INTERVAL_MS", default = "300000")]
    pub max_poll_interval: EnvMsDuration,

    #[envconfig(from = "COMMIT_POLICY", default = "auto")]
    pub commit_policy: CommitPolicy,
}

impl ConsumerConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        Some(self.handler_timeout.0).filter(|timeout| !timeout.is_zero())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            batch_size: 500,
            batch_timeout: EnvMsDuration(Duration::from_millis(500)),
            handler_timeout: EnvMsDuration(Duration::ZERO),
            max_poll_interval: EnvMsDuration(Duration::from_secs(300)),
            commit_policy: CommitPolicy::AutoResolve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Kafka,
    Memory,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "kafka" => Ok(BrokerKind::Kafka),
            "memory" => Ok(BrokerKind::Memory),
            _ => Err(format!("Unknown broker: {s}, must be kafka or memory")),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "DOC_STREAM_BROKER", default = "kafka")]
    pub broker: BrokerKind,

    #[envconfig(from = "TOPIC", default = "documents")]
    pub topic: String,

    #[envconfig(from = "GROUP_ID", default = "doc-stream")]
    pub group_id: String,

    #[envconfig(from = "SESSION_TIMEOUT_MS", default = "30000")]
    pub session_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commit_policies() {
        assert_eq!("auto".parse(), Ok(CommitPolicy::AutoResolve));
        assert_eq!("AFTER_SUCCESS".parse(), Ok(CommitPolicy::AfterSuccess));
        assert!("sometimes".parse::<CommitPolicy>().is_err());
    }

    #[test]
    fn zero_handler_timeout_means_none() {
        let mut config = ConsumerConfig::default();
        assert_eq!(config.handler_timeout(), None);

        config.handler_timeout = "250".parse().unwrap();
        assert_eq!(config.handler_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn consumer_config_from_env_defaults() {
        let config = ConsumerConfig::init_from_hashmap(&Default::default()).unwrap();
        assert_eq!(config.max_in_flight, 64);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.batch_timeout.0, Duration::from_millis(500));
        assert_eq!(config.max_poll_interval.0, Duration::from_secs(300));
        assert_eq!(config.commit_policy, CommitPolicy::AutoResolve);
    }
}
