use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pitaya_proto::streaming::{Ack, MsgProto, StartAt};
use prost::Message as _;
use tracing::{debug, warn};
use watermelon_proto::Subject;

use crate::{transport::Transport, utility::Dispatch, Message, MessageHandler};

const DEFAULT_MAX_IN_FLIGHT: i32 = 1024;
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// A message delivered by a NATS Streaming subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingMessage {
    /// The position of the message in its channel
    pub sequence: u64,
    pub subject: String,
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
    /// Whether the message was already delivered without being acknowledged in time
    pub redelivered: bool,
    pub redelivery_count: u32,
}

/// Options of [`NatsUtility::stream_subscribe`](crate::NatsUtility::stream_subscribe)
#[derive(Debug, Clone)]
pub struct StreamSubscribeOptions {
    pub(crate) queue_group: Option<String>,
    pub(crate) durable_name: Option<String>,
    pub(crate) start_at: StartAt,
    pub(crate) max_in_flight: i32,
    pub(crate) ack_wait: Duration,
}

/// An open streaming subscription, owned by the registry
#[derive(Debug)]
pub(crate) struct StreamingSubscription {
    pub(super) dispatch: Dispatch,
    pub(super) subject: String,
    pub(super) ack_inbox: String,
    pub(super) durable_name: String,
}

/// Hands messages to the user handler, then acknowledges them
#[derive(Debug)]
pub(super) struct AckingHandler<H> {
    pub(super) transport: Arc<dyn Transport>,
    pub(super) ack_inbox: Subject,
    pub(super) handler: H,
}

impl StreamingSubscription {
    /// Stop delivering messages, leaving the subscription on the server
    pub(crate) async fn stop(self) {
        self.dispatch.stop().await;
    }
}

impl StreamSubscribeOptions {
    /// Join the `queue_group`, sharing the messages with its other members
    #[must_use]
    pub fn queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }

    /// Make the subscription durable, resuming from where it left when re-created
    #[must_use]
    pub fn durable_name(mut self, durable_name: impl Into<String>) -> Self {
        self.durable_name = Some(durable_name.into());
        self
    }

    /// Where the subscription starts receiving from
    ///
    /// Default: [`StartAt::NewOnly`]
    #[must_use]
    pub fn start_at(mut self, start_at: StartAt) -> Self {
        self.start_at = start_at;
        self
    }

    /// How many messages can be delivered without having been acknowledged
    ///
    /// Default: 1024
    #[must_use]
    pub fn max_in_flight(mut self, max_in_flight: i32) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// How long the server waits for an acknowledgment before redelivering
    ///
    /// The server counts it in whole seconds, so it is rounded up to the next
    /// second, with a minimum of one second.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }
}

impl StreamSubscribeOptions {
    pub(super) fn ack_wait_secs(&self) -> i32 {
        let secs = self.ack_wait.as_secs() + u64::from(self.ack_wait.subsec_nanos() > 0);
        i32::try_from(secs.max(1)).unwrap_or(i32::MAX)
    }
}

impl Default for StreamSubscribeOptions {
    fn default() -> Self {
        Self {
            queue_group: None,
            durable_name: None,
            start_at: StartAt::NewOnly,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }
}

impl From<MsgProto> for StreamingMessage {
    fn from(message: MsgProto) -> Self {
        Self {
            sequence: message.sequence,
            subject: message.subject,
            data: message.data,
            timestamp: DateTime::from_timestamp_nanos(message.timestamp),
            redelivered: message.redelivered,
            redelivery_count: message.redelivery_count,
        }
    }
}

#[async_trait]
impl<H> MessageHandler<Message> for AckingHandler<H>
where
    H: MessageHandler<StreamingMessage>,
{
    async fn handle(&self, message: Message) {
        let delivered = match MsgProto::decode(message.payload) {
            Ok(delivered) => delivered,
            Err(err) => {
                warn!(error = %err, subject = %message.subject, "undecodable streaming message");
                return;
            }
        };
        let ack = Ack {
            subject: delivered.subject.clone(),
            sequence: delivered.sequence,
        };

        self.handler.handle(delivered.into()).await;

        if let Err(err) = self
            .transport
            .publish(self.ack_inbox.clone(), None, ack.encode_to_vec().into())
            .await
        {
            debug!(error = %err, sequence = ack.sequence, "couldn't acknowledge streaming message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::StreamSubscribeOptions;

    #[test]
    fn ack_wait_is_rounded_up_to_seconds() {
        let secs = |ack_wait: Duration| {
            StreamSubscribeOptions::default()
                .ack_wait(ack_wait)
                .ack_wait_secs()
        };

        assert_eq!(30, StreamSubscribeOptions::default().ack_wait_secs());
        assert_eq!(5, secs(Duration::from_secs(5)));
        assert_eq!(1, secs(Duration::from_millis(300)));
        assert_eq!(1, secs(Duration::ZERO));
        assert_eq!(3, secs(Duration::from_millis(2001)));
        assert_eq!(i32::MAX, secs(Duration::from_secs(u64::MAX)));
    }
}
