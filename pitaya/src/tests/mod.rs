//! In-process stand-ins for the NATS server, shared by the unit tests

pub(crate) use self::jetstream_server::FakeJetstream;
pub(crate) use self::memory::{MemoryBroker, Reply};
pub(crate) use self::streaming_server::FakeStreaming;

mod jetstream_server;
