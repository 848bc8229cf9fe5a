use std::{num::NonZeroU32, time::Duration};

use serde::{Deserialize, Serialize};

use super::{duration, nullable_number, opposite_bool};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(2 * 60);

/// A JetStream stream configuration
///
/// Limits set to `None` are sent as `-1`, which the server reads as unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub storage: Storage,
    #[serde(with = "nullable_number", default)]
    pub max_consumers: Option<u32>,
    #[serde(with = "nullable_number", rename = "max_msgs", default)]
    pub max_messages: Option<u64>,
    #[serde(with = "nullable_number", default)]
    pub max_bytes: Option<u64>,
    #[serde(with = "nullable_number", rename = "max_msg_size", default)]
    pub max_message_size: Option<u32>,
    #[serde(with = "duration", default = "default_max_age")]
    pub max_age: Duration,
    #[serde(with = "duration", default = "default_duplicate_window")]
    pub duplicate_window: Duration,
    #[serde(rename = "num_replicas", default = "default_replicas")]
    pub replicas: NonZeroU32,
    /// Whether publishes into the stream are acknowledged by the server
    #[serde(with = "opposite_bool", rename = "no_ack", default = "default_ack")]
    pub ack: bool,
}

/// A streams retention policy
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    #[default]
    #[serde(rename = "limits")]
    Limits,
    #[serde(rename = "interest")]
    Interest,
    #[serde(rename = "workqueue")]
    WorkQueue,
}

/// Whether the stream is stored on disk or in memory
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    File,
    #[default]
    Memory,
}

impl StreamConfig {
    /// A stream named `name` with no subjects and unbounded limits
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            storage: Storage::default(),
            max_consumers: None,
            max_messages: None,
            max_bytes: None,
            max_message_size: None,
            max_age: DEFAULT_MAX_AGE,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            replicas: default_replicas(),
            ack: default_ack(),
        }
    }

    /// Append a subject filter
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }
}

fn default_max_age() -> Duration {
    DEFAULT_MAX_AGE
}

fn default_duplicate_window() -> Duration {
    DEFAULT_DUPLICATE_WINDOW
}

fn default_replicas() -> NonZeroU32 {
    NonZeroU32::MIN
}

fn default_ack() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroU32, time::Duration};

    use serde_json::json;

    use super::{RetentionPolicy, Storage, StreamConfig};

    #[test]
    fn default_payload() {
        let config = StreamConfig::new("ORDERS").subject("ORDERS.*");

        assert_eq!(
            json!({
                "name": "ORDERS",
                "subjects": ["ORDERS.*"],
                "retention": "limits",
                "storage": "memory",
                "max_consumers": -1,
                "max_msgs": -1,
                "max_bytes": -1,
                "max_msg_size": -1,
                "max_age": 31_536_000_000_000_000_u64,
                "duplicate_window": 120_000_000_000_u64,
                "num_replicas": 1,
                "no_ack": false,
            }),
            serde_json::to_value(&config).unwrap()
        );
    }

    #[test]
    fn bounded_limits() {
        let mut config = StreamConfig::new("EVENTS");
        config.retention = RetentionPolicy::WorkQueue;
        config.storage = Storage::File;
        config.max_messages = Some(1000);
        config.max_consumers = Some(4);
        config.replicas = NonZeroU32::new(3).unwrap();
        config.ack = false;

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!("workqueue", value["retention"]);
        assert_eq!("file", value["storage"]);
        assert_eq!(1000, value["max_msgs"]);
        assert_eq!(4, value["max_consumers"]);
        assert_eq!(-1, value["max_bytes"]);
        assert_eq!(3, value["num_replicas"]);
        assert_eq!(true, value["no_ack"]);
    }

    #[test]
    fn server_reported_config() {
        let config = serde_json::from_value::<StreamConfig>(json!({
            "name": "ORDERS",
            "subjects": ["ORDERS.*"],
            "retention": "interest",
            "max_consumers": -1,
            "max_msgs": 10,
            "max_bytes": -1,
            "max_age": 0,
            "max_msg_size": -1,
            "storage": "file",
            "discard": "old",
            "num_replicas": 1,
            "duplicate_window": 120_000_000_000_u64,
        }))
        .unwrap();

        assert_eq!("ORDERS", config.name);
        assert_eq!(RetentionPolicy::Interest, config.retention);
        assert_eq!(Storage::File, config.storage);
        assert_eq!(Some(10), config.max_messages);
        assert_eq!(None, config.max_bytes);
        assert_eq!(Duration::ZERO, config.max_age);
        assert!(config.ack);
    }
}
