use std::time::Duration;

use bytes::Bytes;
use pitaya_proto::{create_inbox_subject, jetstream::PullRequest};
use tokio::time::{self, Instant};
use tracing::debug;
use watermelon_proto::{StatusCode, Subject};

use crate::{
    transport::{InboundSubscription, Transport},
    Error, Message,
};

/// Publish `payload` to `subject` and wait for the first reply
///
/// The reply is received on a fresh inbox, which is unsubscribed before returning
/// whatever the outcome. A no-responders status counts as no reply.
pub(crate) async fn request(
    transport: &dyn Transport,
    inbox_prefix: &Subject,
    subject: Subject,
    payload: Bytes,
    timeout: Duration,
) -> Result<Message, Error> {
    let inbox = create_inbox_subject(inbox_prefix);
    let mut subscription = transport.subscribe(inbox.clone(), None).await?;

    let reply = await_reply(
        transport,
        &mut *subscription,
        subject,
        inbox,
        payload,
        timeout,
    )
    .await;

    release(&mut *subscription).await;
    reply
}

/// Ask a pull consumer for its next message, published by the server to a fresh inbox
///
/// Waits for as long as the server keeps the pull request alive. Idle heartbeats
/// are skipped, while the statuses reporting that no message is available are
/// returned as [`Error::Timeout`]. Any other status, like 409 for a deleted
/// consumer, is returned as [`Error::PullStatus`]. Only the first message is returned.
pub(crate) async fn pull(
    transport: &dyn Transport,
    inbox_prefix: &Subject,
    subject: Subject,
    pull: PullRequest,
) -> Result<Message, Error> {
    let payload = Bytes::from(serde_json::to_vec(&pull)?);
    let deadline = Instant::now() + pull.expires;

    let inbox = create_inbox_subject(inbox_prefix);
    let mut subscription = transport.subscribe(inbox.clone(), None).await?;

    let message = await_pulled(
        transport,
        &mut *subscription,
        subject,
        inbox,
        payload,
        deadline,
    )
    .await;

    release(&mut *subscription).await;
    message
}

async fn await_reply(
    transport: &dyn Transport,
    subscription: &mut dyn InboundSubscription,
    subject: Subject,
    inbox: Subject,
    payload: Bytes,
    timeout: Duration,
) -> Result<Message, Error> {
    transport.publish(subject, Some(inbox), payload).await?;

    let message = time::timeout(timeout, subscription.next_message())
        .await
        .map_err(|_| Error::Timeout)?
        .ok_or(Error::ConnectionClosed)?;
    if message.is_status(StatusCode::NO_RESPONDERS) {
        return Err(Error::Timeout);
    }
    Ok(message)
}

async fn await_pulled(
    transport: &dyn Transport,
    subscription: &mut dyn InboundSubscription,
    subject: Subject,
    inbox: Subject,
    payload: Bytes,
    deadline: Instant,
) -> Result<Message, Error> {
    transport.publish(subject, Some(inbox), payload).await?;

    loop {
        let message = time::timeout_at(deadline, subscription.next_message())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::ConnectionClosed)?;

        match message.status_code {
            None => return Ok(message),
            Some(StatusCode::IDLE_HEARTBEAT) => {}
            Some(StatusCode::NOT_FOUND | StatusCode::TIMEOUT | StatusCode::NO_RESPONDERS) => {
                return Err(Error::Timeout);
            }
            Some(status_code) => return Err(Error::PullStatus(status_code)),
        }
    }
}

async fn release(subscription: &mut dyn InboundSubscription) {
    if let Err(err) = subscription.close().await {
        debug!(error = %err, "couldn't remove inbox subscription");
    }
}
