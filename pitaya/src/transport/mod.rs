//! The seam between [`NatsUtility`](crate::NatsUtility) and the NATS client doing the I/O
//!
//! [`WatermelonConnector`] is the implementation used by [`NatsUtility::new`](crate::NatsUtility::new).
//! Other implementations can be plugged in with
//! [`NatsUtility::with_connector`](crate::NatsUtility::with_connector).

use std::{error::Error as StdError, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use watermelon_proto::{QueueGroup, ServerAddr, Subject};

pub use self::watermelon_client::{WatermelonConnector, WatermelonTransport};
use crate::{ConnectionEvent, Message};

mod watermelon_client;

/// Opens connections to a NATS server
#[async_trait]
pub trait Connector: Debug + Send + Sync {
    /// Connect to the server at `addr`
    ///
    /// # Errors
    ///
    /// It returns an error if the server can't be reached or refuses the connection.
    async fn connect(
        &self,
        addr: &ServerAddr,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// An established connection to a NATS server
///
/// Reconnecting after a lost connection is the responsibility of the implementation,
/// which reports it through [`Transport::events`].
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Publish `payload` to `subject`
    ///
    /// # Errors
    ///
    /// It returns an error if the connection has been closed.
    async fn publish(
        &self,
        subject: Subject,
        reply_subject: Option<Subject>,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Subscribe to `subject`, optionally as a member of `queue_group`
    ///
    /// # Errors
    ///
    /// It returns an error if the connection has been closed.
    async fn subscribe(
        &self,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Box<dyn InboundSubscription>, TransportError>;

    /// Receive the lifecycle events of this connection
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Wait for buffered messages to be written to the server
    ///
    /// # Errors
    ///
    /// It returns an error if the connection has been closed.
    async fn flush(&self) -> Result<(), TransportError>;

    /// Stop accepting new messages, completing the in-flight ones
    ///
    /// # Errors
    ///
    /// It returns [`TransportError::AlreadyClosing`] if the connection is already
    /// draining or closed.
    async fn drain(&self) -> Result<(), TransportError>;

    /// Close the connection
    ///
    /// # Errors
    ///
    /// It returns [`TransportError::AlreadyClosing`] if the connection is already closed.
    async fn close(&self) -> Result<(), TransportError>;
}

/// The receiving side of a subscription
#[async_trait]
pub trait InboundSubscription: Debug + Send {
    /// Wait for the next message
    ///
    /// Returns `None` once the subscription or the connection has been closed.
    async fn next_message(&mut self) -> Option<Message>;

    /// Remove the subscription from the server
    ///
    /// Calling this method multiple times is a NOOP.
    ///
    /// # Errors
    ///
    /// It returns an error if the connection has been closed.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Options applied to every connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub inbox_prefix: Subject,
    /// The client name to announce to the server
    ///
    /// [`WatermelonConnector`] ignores it: `watermelon` always connects
    /// with its own client name.
    pub name: Option<String>,
    pub default_response_timeout: Duration,
}

/// An error returned by a [`Transport`] or [`Connector`]
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("connection already closing")]
    AlreadyClosing,
    #[error("connect error")]
    Connect(#[source] Box<dyn StdError + Send + Sync>),
}
