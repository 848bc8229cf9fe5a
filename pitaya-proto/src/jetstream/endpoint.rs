use std::fmt::{self, Display};

use watermelon_proto::{error::SubjectValidateError, Subject};

/// A JetStream control plane endpoint
///
/// [`ApiEndpoint::subject`] renders the full subject the request has to be
/// published to, given the API prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApiEndpoint<'a> {
    /// Account information
    Info,
    /// List the streams of the account
    StreamList,
    StreamInfo {
        stream: &'a str,
    },
    StreamCreate {
        stream: &'a str,
    },
    StreamUpdate {
        stream: &'a str,
    },
    StreamDelete {
        stream: &'a str,
    },
    StreamPurge {
        stream: &'a str,
    },
    /// Fetch a stored message by sequence number
    StreamMessageGet {
        stream: &'a str,
    },
    /// Create an ephemeral consumer
    ConsumerCreate {
        stream: &'a str,
    },
    ConsumerDurableCreate {
        stream: &'a str,
        durable_name: &'a str,
    },
    ConsumerList {
        stream: &'a str,
    },
    ConsumerDelete {
        stream: &'a str,
        consumer: &'a str,
    },
    ConsumerInfo {
        stream: &'a str,
        consumer: &'a str,
    },
    /// Pull the next message(s) of a pull consumer
    ConsumerMessageNext {
        stream: &'a str,
        consumer: &'a str,
    },
}

/// An error encountered while building the subject of an [`ApiEndpoint`]
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid stream or consumer name {name:?}")]
    InvalidName { name: String },
    #[error("invalid subject")]
    Subject(#[source] SubjectValidateError),
}

impl ApiEndpoint<'_> {
    /// Render the subject of this endpoint under the given API `prefix`
    ///
    /// # Errors
    ///
    /// It returns an error if a stream or consumer name is empty or contains
    /// characters that would change the shape of the subject (`.`, `*`, `>` or
    /// whitespace).
    pub fn subject(&self, prefix: &Subject) -> Result<Subject, EndpointError> {
        for name in self.names() {
            validate_name(name)?;
        }

        format!("{prefix}.{self}")
            .try_into()
            .map_err(EndpointError::Subject)
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        let (first, second) = match *self {
            Self::Info | Self::StreamList => (None, None),
            Self::StreamInfo { stream }
            | Self::StreamCreate { stream }
            | Self::StreamUpdate { stream }
            | Self::StreamDelete { stream }
            | Self::StreamPurge { stream }
            | Self::StreamMessageGet { stream }
            | Self::ConsumerCreate { stream }
            | Self::ConsumerList { stream } => (Some(stream), None),
            Self::ConsumerDurableCreate {
                stream,
                durable_name: consumer,
            }
            | Self::ConsumerDelete { stream, consumer }
            | Self::ConsumerInfo { stream, consumer }
            | Self::ConsumerMessageNext { stream, consumer } => (Some(stream), Some(consumer)),
        };
        first.into_iter().chain(second)
    }
}

impl Display for ApiEndpoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::StreamList => f.write_str("STREAM.LIST"),
            Self::StreamInfo { stream } => write!(f, "STREAM.INFO.{stream}"),
            Self::StreamCreate { stream } => write!(f, "STREAM.CREATE.{stream}"),
            Self::StreamUpdate { stream } => write!(f, "STREAM.UPDATE.{stream}"),
            Self::StreamDelete { stream } => write!(f, "STREAM.DELETE.{stream}"),
            Self::StreamPurge { stream } => write!(f, "STREAM.PURGE.{stream}"),
            Self::StreamMessageGet { stream } => write!(f, "STREAM.MSG.GET.{stream}"),
            Self::ConsumerCreate { stream } => write!(f, "CONSUMER.CREATE.{stream}"),
            Self::ConsumerDurableCreate {
                stream,
                durable_name,
            } => write!(f, "CONSUMER.DURABLE.CREATE.{stream}.{durable_name}"),
            Self::ConsumerList { stream } => write!(f, "CONSUMER.LIST.{stream}"),
            Self::ConsumerDelete { stream, consumer } => {
                write!(f, "CONSUMER.DELETE.{stream}.{consumer}")
            }
            Self::ConsumerInfo { stream, consumer } => {
                write!(f, "CONSUMER.INFO.{stream}.{consumer}")
            }
            Self::ConsumerMessageNext { stream, consumer } => {
                write!(f, "CONSUMER.MSG.NEXT.{stream}.{consumer}")
            }
        }
    }
}

fn validate_name(name: &str) -> Result<(), EndpointError> {
    let valid = !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'));
    if valid {
        Ok(())
    } else {
        Err(EndpointError::InvalidName {
            name: name.to_owned(),
        })
    }
}
