use std::{
    env,
    fmt::{self, Display},
};

use rand::RngCore;

/// The identity this process presents to the NATS Streaming server
///
/// Resolved once, usually with [`ClientIdentity::from_env`], and handed to
/// [`NatsUtility::new`](crate::NatsUtility::new).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Use `id` as the identity
    ///
    /// Characters the streaming server doesn't accept in client IDs are
    /// replaced with `_`. An empty `id` is replaced with a random one.
    #[must_use]
    pub fn new(id: &str) -> Self {
        if id.is_empty() {
            return Self::random();
        }

        Self(
            id.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect(),
        )
    }

    /// A random identity
    #[must_use]
    pub fn random() -> Self {
        let mut token = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token);
        Self(format!("{:032x}", u128::from_ne_bytes(token)))
    }

    /// The host name from the `HOSTNAME` environment variable, or a random identity
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_hostname(env::var("HOSTNAME").ok())
    }

    fn from_hostname(hostname: Option<String>) -> Self {
        match hostname {
            Some(hostname) => Self::new(&hostname),
            None => Self::random(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::ClientIdentity;

    #[test]
    fn hostname() {
        let identity = ClientIdentity::from_hostname(Some("orders-7f9c.pod".to_owned()));
        assert_eq!("orders-7f9c_pod", identity.as_str());
    }

    #[test]
    fn fallback_is_random() {
        let a = ClientIdentity::from_hostname(None);
        let b = ClientIdentity::from_hostname(Some(String::new()));
        assert_eq!(32, a.as_str().len());
        assert_eq!(32, b.as_str().len());
        assert_ne!(a, b);
    }
}
