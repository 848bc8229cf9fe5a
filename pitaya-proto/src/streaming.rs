//! NATS Streaming (STAN) wire messages
//!
//! Every exchange with the streaming server is a protobuf message carried as
//! the payload of a regular NATS message.

use std::time::Duration;

use bytes::Bytes;

/// The streaming protocol version spoken by this client
pub const PROTOCOL: i32 = 1;

/// The prefix under which streaming clusters answer discover requests
pub const DISCOVER_PREFIX: &str = "_STAN.discover";

/// The subject where the connect request for `cluster_id` is sent
#[must_use]
pub fn discover_subject(cluster_id: &str) -> String {
    format!("{DISCOVER_PREFIX}.{cluster_id}")
}

/// Sent to the server to publish a message into a channel
#[derive(Clone, PartialEq, prost::Message)]
pub struct PubMsg {
    #[prost(string, tag = "1")]
    pub client_id: String,
    /// Unique identifier echoed back in the [`PubAck`]
    #[prost(string, tag = "2")]
    pub guid: String,
    #[prost(string, tag = "3")]
    pub subject: String,
    #[prost(string, tag = "4")]
    pub reply: String,
    #[prost(bytes = "bytes", tag = "5")]
    pub data: Bytes,
    #[prost(bytes = "bytes", tag = "6")]
    pub conn_id: Bytes,
    #[prost(bytes = "bytes", tag = "10")]
    pub sha256: Bytes,
}

/// The server acknowledgement of a [`PubMsg`]
#[derive(Clone, PartialEq, prost::Message)]
pub struct PubAck {
    #[prost(string, tag = "1")]
    pub guid: String,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// A message delivered to a subscription
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgProto {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    #[prost(string, tag = "2")]
    pub subject: String,
    #[prost(string, tag = "3")]
    pub reply: String,
    #[prost(bytes = "bytes", tag = "4")]
    pub data: Bytes,
    /// Nanoseconds since the unix epoch
    #[prost(int64, tag = "5")]
    pub timestamp: i64,
    #[prost(bool, tag = "6")]
    pub redelivered: bool,
    #[prost(uint32, tag = "7")]
    pub redelivery_count: u32,
    #[prost(uint32, tag = "10")]
    pub crc32: u32,
}

/// Acknowledges a [`MsgProto`] to the subscription's ack inbox
#[derive(Clone, PartialEq, prost::Message)]
pub struct Ack {
    #[prost(string, tag = "1")]
    pub subject: String,
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
    /// Inbox where the server sends heartbeats which must be answered
    #[prost(string, tag = "2")]
    pub heartbeat_inbox: String,
    #[prost(int32, tag = "3")]
    pub protocol: i32,
    #[prost(bytes = "bytes", tag = "4")]
    pub conn_id: Bytes,
    /// Seconds between pings
    #[prost(int32, tag = "5")]
    pub ping_interval: i32,
    #[prost(int32, tag = "6")]
    pub ping_max_out: i32,
}

/// The subjects and tuning of an established streaming session
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectResponse {
    #[prost(string, tag = "1")]
    pub pub_prefix: String,
    #[prost(string, tag = "2")]
    pub sub_requests: String,
    #[prost(string, tag = "3")]
    pub unsub_requests: String,
    #[prost(string, tag = "4")]
    pub close_requests: String,
    #[prost(string, tag = "5")]
    pub error: String,
    #[prost(string, tag = "6")]
    pub sub_close_requests: String,
    #[prost(string, tag = "7")]
    pub ping_requests: String,
    #[prost(int32, tag = "8")]
    pub ping_interval: i32,
    #[prost(int32, tag = "9")]
    pub ping_max_out: i32,
    #[prost(int32, tag = "10")]
    pub protocol: i32,
    #[prost(string, tag = "100")]
    pub public_key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {
    #[prost(bytes = "bytes", tag = "1")]
    pub conn_id: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    #[prost(string, tag = "1")]
    pub error: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscriptionRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub subject: String,
    #[prost(string, tag = "3")]
    pub q_group: String,
    /// Inbox where messages are delivered
    #[prost(string, tag = "4")]
    pub inbox: String,
    #[prost(int32, tag = "5")]
    pub max_in_flight: i32,
    #[prost(int32, tag = "6")]
    pub ack_wait_in_secs: i32,
    #[prost(string, tag = "7")]
    pub durable_name: String,
    #[prost(enumeration = "StartPosition", tag = "10")]
    pub start_position: i32,
    #[prost(uint64, tag = "11")]
    pub start_sequence: u64,
    /// Nanoseconds before now
    #[prost(int64, tag = "12")]
    pub start_time_delta: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscriptionResponse {
    /// Where [`Ack`]s for this subscription go
    #[prost(string, tag = "2")]
    pub ack_inbox: String,
    #[prost(string, tag = "3")]
    pub error: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UnsubscribeRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub subject: String,
    /// The ack inbox of the subscription
    #[prost(string, tag = "3")]
    pub inbox: String,
    #[prost(string, tag = "4")]
    pub durable_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseResponse {
    #[prost(string, tag = "1")]
    pub error: String,
}

/// Where a new subscription starts receiving from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StartPosition {
    NewOnly = 0,
    LastReceived = 1,
    TimeDeltaStart = 2,
    SequenceStart = 3,
    First = 4,
}

/// The start position of a subscription, with its argument
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum StartAt {
    /// Only messages published after the subscription is created
    #[default]
    NewOnly,
    /// Starting from the last message stored in the channel
    LastReceived,
    /// Starting from messages younger than the given age
    TimeDelta(Duration),
    Sequence(u64),
    /// Starting from the oldest message available
    First,
}

impl StartAt {
    /// Fill the start position fields of `request`
    pub fn apply(self, request: &mut SubscriptionRequest) {
        let position = match self {
            Self::NewOnly => StartPosition::NewOnly,
            Self::LastReceived => StartPosition::LastReceived,
            Self::TimeDelta(delta) => {
                request.start_time_delta = i64::try_from(delta.as_nanos()).unwrap_or(i64::MAX);
                StartPosition::TimeDeltaStart
            }
            Self::Sequence(sequence) => {
                request.start_sequence = sequence;
                StartPosition::SequenceStart
            }
            Self::First => StartPosition::First,
        };
        request.set_start_position(position);
    }
}
