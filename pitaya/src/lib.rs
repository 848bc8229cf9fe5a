//! A NATS service core
//!
//! [`NatsUtility`] owns the connection to the NATS servers and exposes
//! publish/subscribe, request/reply and, when a streaming cluster is configured,
//! NATS Streaming. [`JetstreamClient`] layers the JetStream control plane on top
//! of it.

pub use pitaya_proto as proto;

pub use self::error::Error;
pub use self::jetstream::JetstreamClient;
pub use self::message::Message;
pub use self::settings::{ClientIdentity, Settings, SettingsError};
pub use self::streaming::{StartAt, StreamSubscribeOptions, StreamingMessage};
pub use self::utility::{
    ConnectionEvent, ConnectionState, MessageHandler, NatsUtility, SubscriptionHandle,
};

mod error;
mod jetstream;
mod message;
mod settings;
mod streaming;
pub mod transport;
mod utility;
#[cfg(test)]
pub(crate) mod tests;
