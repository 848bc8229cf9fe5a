use std::time::Duration;

use serde::Deserialize;
use watermelon_proto::{ServerAddr, Subject};

pub use self::identity::ClientIdentity;

#[cfg(feature = "from-env")]
mod from_env;
mod identity;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_STAN_PING_INTERVAL: u32 = 5;
const DEFAULT_STAN_PING_MAX_OUT: u32 = 3;
const DEFAULT_STAN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration of a [`NatsUtility`]
///
/// Usually deserialized from the host application settings with [`Settings::from_value`]:
///
/// ```json
/// {
///     "hosts": ["nats://localhost:4222"],
///     "timeout": 2.5,
///     "stan": "test-cluster"
/// }
/// ```
///
/// Durations are expressed in seconds, possibly fractional.
///
/// [`NatsUtility`]: crate::NatsUtility
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub(crate) hosts: Vec<ServerAddr>,
    #[serde(with = "seconds", default = "default_timeout")]
    pub(crate) timeout: Duration,
    #[serde(default)]
    pub(crate) stan: Option<String>,
    #[serde(default = "default_stan_ping_interval")]
    pub(crate) stan_ping_interval: u32,
    #[serde(default = "default_stan_ping_max_out")]
    pub(crate) stan_ping_max_out: u32,
    #[serde(with = "seconds", default = "default_stan_timeout")]
    pub(crate) stan_timeout: Duration,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) thread: bool,
    #[serde(with = "seconds", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,
    #[serde(default = "default_inbox_prefix")]
    pub(crate) inbox_prefix: Subject,
}

/// An error encountered while loading [`Settings`]
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no hosts configured")]
    NoHosts,
    #[error("invalid settings")]
    Invalid(#[source] serde_json::Error),
    #[cfg(feature = "from-env")]
    #[error("invalid settings in the environment")]
    Env(#[source] envy::Error),
}

impl Settings {
    /// Settings connecting to `hosts`, with every other option at its default
    #[must_use]
    pub fn new<I>(hosts: I) -> Self
    where
        I: IntoIterator<Item = ServerAddr>,
    {
        Self {
            hosts: hosts.into_iter().collect(),
            timeout: DEFAULT_TIMEOUT,
            stan: None,
            stan_ping_interval: DEFAULT_STAN_PING_INTERVAL,
            stan_ping_max_out: DEFAULT_STAN_PING_MAX_OUT,
            stan_timeout: DEFAULT_STAN_TIMEOUT,
            name: None,
            thread: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            inbox_prefix: default_inbox_prefix(),
        }
    }

    /// Load the settings from the host application configuration
    ///
    /// # Errors
    ///
    /// It returns an error if `value` doesn't describe valid settings
    /// or if no hosts are configured.
    pub fn from_value(value: serde_json::Value) -> Result<Self, SettingsError> {
        serde_json::from_value::<Self>(value)
            .map_err(SettingsError::Invalid)?
            .validate()
    }

    /// Load the settings from the `NATS_*` environment variables
    ///
    /// Variables are named after the options, like `NATS_HOSTS`, `NATS_TIMEOUT`
    /// or `NATS_STAN`. `NATS_HOSTS` is a comma separated list.
    ///
    /// # Errors
    ///
    /// It returns an error if the variables don't describe valid settings
    /// or if no hosts are configured.
    #[cfg(feature = "from-env")]
    pub fn from_env() -> Result<Self, SettingsError> {
        from_env::from_vars(std::env::vars())
    }

    /// The default timeout of requests
    ///
    /// Default: 2 seconds.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable NATS Streaming, connecting to the `cluster_id` cluster
    #[must_use]
    pub fn stan(mut self, cluster_id: impl Into<String>) -> Self {
        self.stan = Some(cluster_id.into());
        self
    }

    /// How often, in seconds, the streaming server is pinged
    ///
    /// The value advertised by the server, if any, takes precedence.
    ///
    /// Default: 5.
    #[must_use]
    pub fn stan_ping_interval(mut self, seconds: u32) -> Self {
        self.stan_ping_interval = seconds;
        self
    }

    /// How many pings can go unanswered before the streaming session is considered lost
    ///
    /// The value advertised by the server, if any, takes precedence.
    ///
    /// Default: 3.
    #[must_use]
    pub fn stan_ping_max_out(mut self, max_out: u32) -> Self {
        self.stan_ping_max_out = max_out;
        self
    }

    /// The timeout of streaming control requests
    ///
    /// Default: 2 seconds.
    #[must_use]
    pub fn stan_timeout(mut self, timeout: Duration) -> Self {
        self.stan_timeout = timeout;
        self
    }

    /// The client name handed to the [`Connector`](crate::transport::Connector)
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// How long to wait for each server to accept the connection
    ///
    /// Default: 2 seconds.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The prefix of the inboxes receiving replies
    ///
    /// Default: `_INBOX`
    #[must_use]
    pub fn inbox_prefix(mut self, inbox_prefix: Subject) -> Self {
        self.inbox_prefix = inbox_prefix;
        self
    }

    #[must_use]
    pub fn hosts(&self) -> &[ServerAddr] {
        &self.hosts
    }

    /// The streaming cluster, if NATS Streaming is enabled
    #[must_use]
    pub fn stan_cluster(&self) -> Option<&str> {
        self.stan.as_deref()
    }

    fn validate(self) -> Result<Self, SettingsError> {
        if self.hosts.is_empty() {
            return Err(SettingsError::NoHosts);
        }

        Ok(self)
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_stan_ping_interval() -> u32 {
    DEFAULT_STAN_PING_INTERVAL
}

fn default_stan_ping_max_out() -> u32 {
    DEFAULT_STAN_PING_MAX_OUT
}

fn default_stan_timeout() -> Duration {
    DEFAULT_STAN_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_inbox_prefix() -> Subject {
    Subject::from_static("_INBOX")
}

mod seconds {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(de::Error::custom)
    }
}
