use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{duration, option_duration};

const DEFAULT_PULL_EXPIRES: Duration = Duration::from_secs(5);

/// A JetStream consumer configuration
///
/// Every optional field left as `None` is omitted from the request payload,
/// letting the server pick its own default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(
        with = "option_duration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ack_wait: Option<Duration>,
    #[serde(flatten)]
    pub deliver_policy: DeliverPolicy,
    /// The subject messages are pushed to. Leave unset for a pull consumer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    /// Present for consumers surviving client disconnects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_control: Option<bool>,
    #[serde(
        with = "option_duration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_heartbeat: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<i64>,
    #[serde(
        rename = "rate_limit_bps",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub rate_limit: Option<u64>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_freq: Option<String>,
}

/// The acknowledgment policy of the consumer
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

/// Where in the stream the consumer starts delivering from
///
/// The start sequence and start time only exist for the policies using them.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "deliver_policy")]
pub enum DeliverPolicy {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "last")]
    Last,
    #[serde(rename = "new")]
    New,
    #[serde(rename = "by_start_sequence")]
    StartSequence {
        #[serde(rename = "opt_start_seq")]
        sequence: u64,
    },
    #[serde(rename = "by_start_time")]
    StartTime {
        #[serde(rename = "opt_start_time")]
        from: DateTime<Utc>,
    },
}

/// The replay policy of the consumer
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    /// Replay messages at the rate they were originally published
    Original,
}

/// The payload creating a durable consumer
///
/// Unlike ephemeral consumers, whose payload is the bare [`ConsumerConfig`],
/// durable consumers nest the configuration next to the stream name.
#[derive(Debug, Serialize)]
pub struct DurableConsumerCreate<'a> {
    pub stream_name: &'a str,
    pub config: &'a ConsumerConfig,
}

/// The payload of a pull request sent to `CONSUMER.MSG.NEXT`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    /// How long the server keeps the request alive waiting for messages
    #[serde(with = "duration")]
    pub expires: Duration,
    pub batch: usize,
}

impl ConsumerConfig {
    /// A durable consumer named `durable_name` with default settings
    #[must_use]
    pub fn durable(durable_name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(durable_name.into()),
            ..Self::default()
        }
    }
}

impl PullRequest {
    #[must_use]
    pub fn new(expires: Duration, batch: usize) -> Self {
        Self { expires, batch }
    }
}

impl Default for PullRequest {
    fn default() -> Self {
        Self {
            expires: DEFAULT_PULL_EXPIRES,
            batch: 1,
        }
    }
}
