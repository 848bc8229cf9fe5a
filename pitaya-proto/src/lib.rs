//! Sans-IO building blocks for the pitaya NATS service core
//!
//! Nothing in this crate touches the network. It describes what goes on the
//! wire: JetStream control plane subjects, configuration payloads and response
//! envelopes, NATS Streaming protobuf messages and inbox subjects.

pub use watermelon_proto::{QueueGroup, ServerAddr, StatusCode, Subject};

pub use self::inbox::create_inbox_subject;

mod inbox;
pub mod jetstream;
pub mod streaming;

pub mod error {
    pub use crate::jetstream::{EndpointError, StoredMessageError};
    pub use watermelon_proto::error::{QueueGroupValidateError, SubjectValidateError};
}
