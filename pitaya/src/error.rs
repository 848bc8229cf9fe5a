use pitaya_proto::error::{EndpointError, StoredMessageError, SubjectValidateError};
use watermelon_proto::StatusCode;

use crate::{settings::SettingsError, transport::TransportError};

/// An error returned by [`NatsUtility`](crate::NatsUtility) and
/// [`JetstreamClient`](crate::JetstreamClient) operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// There's no active connection to operate on
    #[error("connection closed")]
    ConnectionClosed,
    /// None of the configured servers accepted the connection
    #[error("no servers available for connection")]
    NoServersAvailable,
    /// No reply arrived before the deadline
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("invalid subject")]
    Subject(#[source] SubjectValidateError),
    #[error("invalid jetstream endpoint")]
    Endpoint(#[source] EndpointError),
    #[error("json encoding or decoding failed")]
    Json(#[source] serde_json::Error),
    #[error("protobuf decoding failed")]
    Protobuf(#[source] prost::DecodeError),
    #[error("malformed stored message")]
    StoredMessage(#[source] StoredMessageError),
    /// The NATS Streaming server refused the operation
    #[error("streaming server error: {0}")]
    Streaming(String),
    /// The server ended the pull request without delivering a message
    #[error("pull request ended with status {0}")]
    PullStatus(StatusCode),
    /// The message doesn't carry a reply subject to send the acknowledgment to
    #[error("message can't be acknowledged")]
    NotAcknowledgeable,
    #[error("durable consumer configuration has no durable name")]
    MissingDurableName,
    #[error("invalid settings")]
    Settings(#[source] SettingsError),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::AlreadyClosing => Self::ConnectionClosed,
            TransportError::Connect(_) => Self::NoServersAvailable,
        }
    }
}

impl From<SubjectValidateError> for Error {
    fn from(err: SubjectValidateError) -> Self {
        Self::Subject(err)
    }
}

impl From<EndpointError> for Error {
    fn from(err: EndpointError) -> Self {
        Self::Endpoint(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::Protobuf(err)
    }
}

impl From<SettingsError> for Error {
    fn from(err: SettingsError) -> Self {
        Self::Settings(err)
    }
}
