use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::warn;
use watermelon::core::{Client, Echo, Subscription};
use watermelon_proto::{QueueGroup, ServerAddr, Subject};

use super::{ConnectOptions, Connector, InboundSubscription, Transport, TransportError};
use crate::{ConnectionEvent, Message};

const WATCH_INTERVAL: Duration = Duration::from_millis(250);
const EVENTS_CAPACITY: usize = 64;

/// Connects through the [`watermelon`] NATS client
///
/// `watermelon` reconnects on its own and resumes the open subscriptions.
/// Connection state changes are observed by polling the client and reported
/// as [`ConnectionEvent`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatermelonConnector;

/// A connection established by [`WatermelonConnector`]
#[derive(Debug)]
pub struct WatermelonTransport {
    client: Client,
    events: broadcast::Sender<ConnectionEvent>,
    draining: AtomicBool,
    closed: AtomicBool,
    watcher: JoinHandle<()>,
}

#[derive(Debug)]
struct WatermelonSubscription(Subscription);

impl WatermelonConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WatermelonConnector {
    async fn connect(
        &self,
        addr: &ServerAddr,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let client = Client::builder()
            .inbox_prefix(options.inbox_prefix.clone())
            .echo(Echo::Allow)
            .default_response_timeout(options.default_response_timeout)
            .connect(addr.clone())
            .await
            .map_err(|err| TransportError::Connect(Box::new(err)))?;

        Ok(Arc::new(WatermelonTransport::new(client, addr.clone())))
    }
}

impl WatermelonTransport {
    fn new(client: Client, addr: ServerAddr) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let watcher = tokio::spawn(watch(client.clone(), addr, events.clone()));

        Self {
            client,
            events,
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            watcher,
        }
    }

    /// The underlying `watermelon` client
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for WatermelonTransport {
    async fn publish(
        &self,
        subject: Subject,
        reply_subject: Option<Subject>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.client
            .publish(subject)
            .reply_subject(reply_subject)
            .payload(payload)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn subscribe(
        &self,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Box<dyn InboundSubscription>, TransportError> {
        let subscription = self
            .client
            .subscribe(subject, queue_group)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::new(WatermelonSubscription(subscription)))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn flush(&self) -> Result<(), TransportError> {
        // Buffered messages are written as soon as the connection allows it
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn drain(&self) -> Result<(), TransportError> {
        if self.draining.swap(true, Ordering::AcqRel) || self.closed.load(Ordering::Acquire) {
            return Err(TransportError::AlreadyClosing);
        }

        // Closing the client processes every buffered command first
        self.client.close().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyClosing);
        }

        self.client.close().await;
        self.watcher.abort();
        let _ = self.events.send(ConnectionEvent::Closed);
        Ok(())
    }
}

impl Drop for WatermelonTransport {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl InboundSubscription for WatermelonSubscription {
    async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.0.next().await? {
                Ok(message) => return Some(message.into()),
                Err(err) => warn!(error = ?err, "subscription refused by the server"),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.close().await.map_err(|_| TransportError::Closed)
    }
}

async fn watch(client: Client, addr: ServerAddr, events: broadcast::Sender<ConnectionEvent>) {
    let mut interval = interval(WATCH_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut connected = true;
    let mut lameduck = false;
    loop {
        interval.tick().await;

        let info = client.quick_info();
        let event = match (connected, info.is_connected()) {
            (true, false) => Some(ConnectionEvent::Disconnected),
            (false, true) => Some(ConnectionEvent::Reconnected { addr: addr.clone() }),
            _ => None,
        };
        connected = info.is_connected();
        if let Some(event) = event {
            let _ = events.send(event);
        }

        if info.is_lameduck() && !lameduck {
            let _ = events.send(ConnectionEvent::Error {
                message: "server entered lame duck mode".to_owned(),
            });
        }
        lameduck = info.is_lameduck();
    }
}
