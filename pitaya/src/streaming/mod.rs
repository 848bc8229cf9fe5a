//! NATS Streaming session
//!
//! The session is negotiated over the core connection: a connect request to
//! the cluster discover subject returns the subjects every later request
//! goes to. The server expects its heartbeats to be answered and this client
//! pings it periodically, giving up on the session after too many unanswered pings.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use pitaya_proto::{
    create_inbox_subject,
    streaming::{
        discover_subject, CloseRequest, CloseResponse, ConnectRequest, ConnectResponse, Ping,
        PingResponse, PubAck, PubMsg, SubscriptionRequest, SubscriptionResponse,
        UnsubscribeRequest, PROTOCOL,
    },
};
use prost::Message as _;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info};
use watermelon_proto::Subject;

pub use pitaya_proto::streaming::StartAt;

pub use self::subscription::{StreamSubscribeOptions, StreamingMessage};
pub(crate) use self::subscription::StreamingSubscription;
use self::subscription::AckingHandler;
use crate::{
    settings::{ClientIdentity, Settings},
    transport::Transport,
    utility::{request, Dispatch},
    ConnectionEvent, Error, Message, MessageHandler,
};

mod subscription;

const PUB_ACK_WAIT: Duration = Duration::from_secs(60);

/// An established NATS Streaming session
#[derive(Debug)]
pub(crate) struct StreamingSession {
    transport: Arc<dyn Transport>,
    inbox_prefix: Subject,
    client_id: String,
    conn_id: Bytes,
    pub_prefix: String,
    sub_requests: Subject,
    unsub_requests: Subject,
    close_requests: Subject,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    heartbeat: Mutex<Option<Dispatch>>,
    pinger: Mutex<Option<JoinHandle<()>>>,
}

/// The ping loop of a session
#[derive(Debug)]
struct Pinger {
    transport: Arc<dyn Transport>,
    inbox_prefix: Subject,
    subject: Subject,
    ping: Bytes,
    interval: Duration,
    max_out: u32,
    closed: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl StreamingSession {
    /// Connect to the `cluster_id` streaming cluster
    ///
    /// # Errors
    ///
    /// It returns an error if the cluster doesn't answer in time or refuses the client.
    pub(crate) async fn connect(
        transport: Arc<dyn Transport>,
        settings: &Settings,
        identity: &ClientIdentity,
        cluster_id: &str,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Result<Self, Error> {
        let heartbeat_inbox = create_inbox_subject(&settings.inbox_prefix);
        let heartbeat = Dispatch::spawn(
            transport.subscribe(heartbeat_inbox.clone(), None).await?,
            answer_heartbeats(Arc::clone(&transport)),
        );

        let conn_id = Bytes::from(random_token());
        let connect = ConnectRequest {
            client_id: identity.to_string(),
            heartbeat_inbox: heartbeat_inbox.to_string(),
            protocol: PROTOCOL,
            conn_id: conn_id.clone(),
            ping_interval: saturating_i32(settings.stan_ping_interval),
            ping_max_out: saturating_i32(settings.stan_ping_max_out),
        };
        let response = match handshake(&*transport, settings, cluster_id, &connect).await {
            Ok(response) => response,
            Err(err) => {
                heartbeat.stop().await;
                return Err(err);
            }
        };

        // The values advertised by the server take precedence
        let mut ping_interval = settings.stan_ping_interval;
        let mut ping_max_out = settings.stan_ping_max_out;
        if response.protocol >= PROTOCOL {
            if let Ok(interval @ 1..) = u32::try_from(response.ping_interval) {
                ping_interval = interval;
            }
            if let Ok(max_out @ 1..) = u32::try_from(response.ping_max_out) {
                ping_max_out = max_out;
            }
        }

        let subjects = (|| {
            Ok::<_, Error>((
                Subject::try_from(response.sub_requests.clone())?,
                Subject::try_from(response.unsub_requests.clone())?,
                Subject::try_from(response.close_requests.clone())?,
            ))
        })();
        let (sub_requests, unsub_requests, close_requests) = match subjects {
            Ok(subjects) => subjects,
            Err(err) => {
                heartbeat.stop().await;
                return Err(err);
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let pinger = match Subject::try_from(response.ping_requests.clone()) {
            Ok(subject) if ping_interval > 0 => Some(tokio::spawn(
                Pinger {
                    transport: Arc::clone(&transport),
                    inbox_prefix: settings.inbox_prefix.clone(),
                    subject,
                    ping: Ping {
                        conn_id: conn_id.clone(),
                    }
                    .encode_to_vec()
                    .into(),
                    interval: Duration::from_secs(u64::from(ping_interval)),
                    max_out: ping_max_out,
                    closed: Arc::clone(&closed),
                    events,
                }
                .run(),
            )),
            // Servers speaking protocol version 0 don't support pings
            _ => None,
        };

        info!(cluster_id, client_id = %identity, "connected to nats streaming");
        Ok(Self {
            transport,
            inbox_prefix: settings.inbox_prefix.clone(),
            client_id: identity.to_string(),
            conn_id,
            pub_prefix: response.pub_prefix,
            sub_requests,
            unsub_requests,
            close_requests,
            request_timeout: settings.stan_timeout,
            closed,
            heartbeat: Mutex::new(Some(heartbeat)),
            pinger: Mutex::new(pinger),
        })
    }

    /// Whether the session was closed or lost
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish `payload` to the `channel`, waiting for the server to persist it
    pub(crate) async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), Error> {
        self.ensure_open()?;

        let guid = random_token();
        let message = PubMsg {
            client_id: self.client_id.clone(),
            guid: guid.clone(),
            subject: channel.to_owned(),
            reply: String::new(),
            data: payload,
            conn_id: self.conn_id.clone(),
            sha256: Bytes::new(),
        };
        let subject = Subject::try_from(format!("{}.{channel}", self.pub_prefix))?;

        let reply = request(
            &*self.transport,
            &self.inbox_prefix,
            subject,
            message.encode_to_vec().into(),
            PUB_ACK_WAIT,
        )
        .await?;
        let ack = PubAck::decode(reply.payload)?;
        if !ack.error.is_empty() {
            return Err(Error::Streaming(ack.error));
        }

        debug!(%guid, channel, "streaming publish acknowledged");
        Ok(())
    }

    /// Subscribe to `channel`, acknowledging every message after `handler` returns
    pub(crate) async fn subscribe<H>(
        &self,
        channel: &str,
        options: StreamSubscribeOptions,
        handler: H,
    ) -> Result<StreamingSubscription, Error>
    where
        H: MessageHandler<StreamingMessage>,
    {
        self.ensure_open()?;

        // Subscribe first, so that nothing delivered right after the request is lost
        let inbox = create_inbox_subject(&self.inbox_prefix);
        let mut inbound = self.transport.subscribe(inbox.clone(), None).await?;

        let ack_wait_in_secs = options.ack_wait_secs();
        let mut request = SubscriptionRequest {
            client_id: self.client_id.clone(),
            subject: channel.to_owned(),
            q_group: options.queue_group.unwrap_or_default(),
            inbox: inbox.to_string(),
            max_in_flight: options.max_in_flight,
            ack_wait_in_secs,
            durable_name: options.durable_name.unwrap_or_default(),
            ..SubscriptionRequest::default()
        };
        options.start_at.apply(&mut request);

        let response = self
            .control::<SubscriptionResponse>(&self.sub_requests, request.encode_to_vec())
            .await
            .and_then(|response| {
                if response.error.is_empty() {
                    Ok(response)
                } else {
                    Err(Error::Streaming(response.error))
                }
            })
            .and_then(|response| {
                let ack_inbox = Subject::try_from(response.ack_inbox.clone())?;
                Ok((ack_inbox, response.ack_inbox))
            });
        let (ack_inbox, ack_inbox_name) = match response {
            Ok(response) => response,
            Err(err) => {
                if let Err(err) = inbound.close().await {
                    debug!(error = %err, "couldn't remove streaming inbox");
                }
                return Err(err);
            }
        };

        let dispatch = Dispatch::spawn(
            inbound,
            AckingHandler {
                transport: Arc::clone(&self.transport),
                ack_inbox,
                handler,
            },
        );
        Ok(StreamingSubscription {
            dispatch,
            subject: request.subject,
            ack_inbox: ack_inbox_name,
            durable_name: request.durable_name,
        })
    }

    /// Stop delivering messages to `subscription` and remove it from the server
    pub(crate) async fn unsubscribe(
        &self,
        subscription: StreamingSubscription,
    ) -> Result<(), Error> {
        subscription.dispatch.stop().await;
        self.ensure_open()?;

        let request = UnsubscribeRequest {
            client_id: self.client_id.clone(),
            subject: subscription.subject,
            inbox: subscription.ack_inbox,
            durable_name: subscription.durable_name,
        };
        let response = self
            .control::<SubscriptionResponse>(&self.unsub_requests, request.encode_to_vec())
            .await?;
        if !response.error.is_empty() {
            return Err(Error::Streaming(response.error));
        }
        Ok(())
    }

    /// Close the session
    ///
    /// Background tasks are stopped even if the session was already lost, in
    /// which case [`Error::ConnectionClosed`] is returned.
    pub(crate) async fn close(&self) -> Result<(), Error> {
        let already_closed = self.closed.swap(true, Ordering::AcqRel);

        let pinger = self
            .pinger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pinger) = pinger {
            pinger.abort();
        }
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        if already_closed {
            return Err(Error::ConnectionClosed);
        }

        let request = CloseRequest {
            client_id: self.client_id.clone(),
        };
        let response = self
            .control::<CloseResponse>(&self.close_requests, request.encode_to_vec())
            .await?;
        if !response.error.is_empty() {
            return Err(Error::Streaming(response.error));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn control<R>(&self, subject: &Subject, payload: Vec<u8>) -> Result<R, Error>
    where
        R: prost::Message + Default,
    {
        let reply = request(
            &*self.transport,
            &self.inbox_prefix,
            subject.clone(),
            payload.into(),
            self.request_timeout,
        )
        .await?;
        Ok(R::decode(reply.payload)?)
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if let Some(pinger) = self
            .pinger
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pinger.abort();
        }
    }
}

impl Pinger {
    async fn run(self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        let mut outstanding = 0_u32;
        loop {
            interval.tick().await;
            if self.closed.load(Ordering::Acquire) {
                break;
            }

            match request(
                &*self.transport,
                &self.inbox_prefix,
                self.subject.clone(),
                self.ping.clone(),
                self.interval,
            )
            .await
            .and_then(|reply| Ok(PingResponse::decode(reply.payload)?))
            {
                Ok(response) if response.error.is_empty() => outstanding = 0,
                Ok(response) => {
                    self.lost(&response.error);
                    break;
                }
                Err(err) => {
                    debug!(error = %err, "streaming ping unanswered");
                    outstanding += 1;
                }
            }

            if outstanding > self.max_out {
                self.lost("connection lost due to PING failure");
                break;
            }
        }
    }

    fn lost(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        error!(reason, "nats streaming session lost");
        let _ = self.events.send(ConnectionEvent::Error {
            message: format!("nats streaming session lost: {reason}"),
        });
    }
}

async fn handshake(
    transport: &dyn Transport,
    settings: &Settings,
    cluster_id: &str,
    connect: &ConnectRequest,
) -> Result<ConnectResponse, Error> {
    let reply = request(
        transport,
        &settings.inbox_prefix,
        Subject::try_from(discover_subject(cluster_id))?,
        connect.encode_to_vec().into(),
        settings.stan_timeout,
    )
    .await?;
    let response = ConnectResponse::decode(reply.payload)?;
    if !response.error.is_empty() {
        return Err(Error::Streaming(response.error));
    }
    Ok(response)
}

fn answer_heartbeats(transport: Arc<dyn Transport>) -> impl MessageHandler<Message> {
    move |message: Message| {
        let transport = Arc::clone(&transport);
        async move {
            if let Some(reply_subject) = message.reply_subject {
                if let Err(err) = transport.publish(reply_subject, None, Bytes::new()).await {
                    debug!(error = %err, "couldn't answer streaming heartbeat");
                }
            }
        }
    }
}

fn random_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn saturating_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
