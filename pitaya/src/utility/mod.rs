use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use pitaya_proto::jetstream::PullRequest;
use tokio::{
    sync::{self, broadcast},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};
use watermelon_proto::{QueueGroup, Subject};

pub use self::events::ConnectionEvent;
pub(crate) use self::registry::{Dispatch, Registry};
pub use self::registry::{MessageHandler, SubscriptionHandle};
pub(crate) use self::request::request;
pub use self::state::ConnectionState;
pub(crate) use self::state::Session;
use crate::{
    settings::{ClientIdentity, Settings},
    streaming::{
        StreamSubscribeOptions, StreamingMessage, StreamingSession, StreamingSubscription,
    },
    transport::{ConnectOptions, Connector, Transport, TransportError, WatermelonConnector},
    Error, Message,
};

mod events;
mod registry;
mod request;
mod state;

const EVENTS_CAPACITY: usize = 64;
const RELAY_GRACE: Duration = Duration::from_secs(1);

/// The connection manager of a NATS service
///
/// A `NatsUtility` is created from [`Settings`], connected once with
/// [`NatsUtility::initialize`] and torn down once with [`NatsUtility::finalize`].
/// Every other operation requires the connection to be established and fails
/// with [`Error::ConnectionClosed`] otherwise.
///
/// Cloning is cheap and gives access to the same connection.
#[derive(Debug, Clone)]
pub struct NatsUtility {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    settings: Settings,
    identity: ClientIdentity,
    connector: Arc<dyn Connector>,
    init_lock: sync::Mutex<()>,
    session: ArcSwap<Session>,
    subscriptions: Registry<Dispatch>,
    streaming_subscriptions: Registry<StreamingSubscription>,
    events: broadcast::Sender<ConnectionEvent>,
    next_handle: AtomicU64,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl NatsUtility {
    /// Build a `NatsUtility` connecting through the `watermelon` NATS client
    #[must_use]
    pub fn new(settings: Settings, identity: ClientIdentity) -> Self {
        Self::with_connector(settings, identity, Arc::new(WatermelonConnector::new()))
    }

    /// Build a `NatsUtility` opening its connections through `connector`
    #[must_use]
    pub fn with_connector(
        settings: Settings,
        identity: ClientIdentity,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings,
                identity,
                connector,
                init_lock: sync::Mutex::new(()),
                session: ArcSwap::from_pointee(Session::new(ConnectionState::Uninitialized)),
                subscriptions: Registry::new(),
                streaming_subscriptions: Registry::new(),
                events,
                next_handle: AtomicU64::new(1),
                relay: Mutex::new(None),
            }),
        }
    }

    /// Connect to the first server accepting the connection and, if a streaming
    /// cluster is configured, establish the NATS Streaming session
    ///
    /// Concurrent calls are serialized. Calling this method on an already
    /// connected `NatsUtility` is a NOOP.
    ///
    /// # Errors
    ///
    /// It returns [`Error::NoServersAvailable`] if no server accepted the connection,
    /// an error if the streaming session couldn't be established or
    /// [`Error::ConnectionClosed`] if the `NatsUtility` has been finalized.
    pub async fn initialize(&self) -> Result<(), Error> {
        let _guard = self.inner.init_lock.lock().await;
        match self.inner.session.load().state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Draining | ConnectionState::Closed => {
                return Err(Error::ConnectionClosed)
            }
            ConnectionState::Uninitialized | ConnectionState::Connecting => {}
        }

        let settings = &self.inner.settings;
        debug!(
            name = settings.name.as_deref(),
            thread = settings.thread,
            "initializing nats"
        );
        self.store(Session::new(ConnectionState::Connecting));

        let transport = match self.connect().await {
            Ok(transport) => transport,
            Err(err) => {
                self.store(Session::new(ConnectionState::Uninitialized));
                return Err(err);
            }
        };
        let relay = events::spawn_relay(transport.events(), self.inner.events.clone());

        let streaming = match &settings.stan {
            Some(cluster_id) => match StreamingSession::connect(
                Arc::clone(&transport),
                settings,
                &self.inner.identity,
                cluster_id,
                self.inner.events.clone(),
            )
            .await
            {
                Ok(streaming) => Some(Arc::new(streaming)),
                Err(err) => {
                    error!(
                        error = %err,
                        cluster_id = cluster_id.as_str(),
                        "couldn't connect to nats streaming"
                    );
                    relay.abort();
                    if let Err(err) = transport.close().await {
                        debug!(error = %err, "couldn't close the connection");
                    }
                    self.store(Session::new(ConnectionState::Uninitialized));
                    return Err(err);
                }
            },
            None => None,
        };

        if let Some(previous) = self
            .inner
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(relay)
        {
            previous.abort();
        }
        self.store(Session::connected(transport, streaming));
        info!(client_id = %self.inner.identity, "nats initialized");
        Ok(())
    }

    /// Whether the connection is established
    ///
    /// Waits for an in-flight [`NatsUtility::initialize`] to complete before answering.
    pub async fn initialized(&self) -> bool {
        if self.state() == ConnectionState::Connected {
            return true;
        }

        let _guard = self.inner.init_lock.lock().await;
        self.state() == ConnectionState::Connected
    }

    /// Tear down every subscription and close the connection
    ///
    /// Streaming subscriptions are removed first, then the streaming session is
    /// closed. Pending messages are flushed before the core subscriptions are
    /// removed and the connection is drained and closed. Finalizing a
    /// `NatsUtility` that was never initialized, or was already finalized, is a NOOP.
    ///
    /// # Errors
    ///
    /// Failures met while tearing down are logged and skipped, since the
    /// connection ends up closed regardless. No error is currently returned.
    pub async fn finalize(&self) -> Result<(), Error> {
        let _guard = self.inner.init_lock.lock().await;
        let session = self.inner.session.load_full();
        let Some(transport) = session.active_transport().cloned() else {
            self.store(Session::new(ConnectionState::Closed));
            return Ok(());
        };
        self.store(session.with_state(ConnectionState::Draining));

        let streaming_subscriptions = self.inner.streaming_subscriptions.take_all();
        match &session.streaming {
            Some(streaming) => {
                for subscription in streaming_subscriptions {
                    if let Err(err) = streaming.unsubscribe(subscription).await {
                        warn!(error = %err, "couldn't remove streaming subscription");
                    }
                }

                match streaming.close().await {
                    Ok(()) => info!("nats streaming session closed"),
                    Err(Error::Timeout | Error::ConnectionClosed) => {
                        warn!("nats streaming session already gone");
                    }
                    Err(err) => {
                        warn!(error = %err, "couldn't close nats streaming session");
                    }
                }
            }
            None => {
                for subscription in streaming_subscriptions {
                    subscription.stop().await;
                }
            }
        }

        if let Err(err) = transport.flush().await {
            debug!(error = %err, "couldn't flush pending messages");
        }
        for dispatch in self.inner.subscriptions.take_all() {
            dispatch.stop().await;
        }
        for outcome in [transport.drain().await, transport.close().await] {
            match outcome {
                Ok(()) | Err(TransportError::AlreadyClosing) => {}
                Err(err) => warn!(error = %err, "couldn't close the connection cleanly"),
            }
        }

        drop(session);
        self.store(Session::new(ConnectionState::Closed));
        drop(transport);

        let relay = self
            .inner
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut relay) = relay {
            if time::timeout(RELAY_GRACE, &mut relay).await.is_err() {
                relay.abort();
            }
        }

        info!("nats finalized");
        Ok(())
    }

    /// The current state of the connection
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.session.load().state
    }

    /// Receive the lifecycle events of the connection
    ///
    /// Events are also logged, whether anyone receives them or not.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Publish `payload` to `subject`
    ///
    /// # Errors
    ///
    /// It returns [`Error::ConnectionClosed`] if the connection isn't established.
    pub async fn publish(&self, subject: Subject, payload: Bytes) -> Result<(), Error> {
        let transport = self.transport()?;
        transport.publish(subject, None, payload).await?;
        Ok(())
    }

    /// Subscribe to `subject`, handing every message to `handler`
    ///
    /// Members of the same `queue_group` share the messages, each one being
    /// delivered to a single member. Without a queue group every subscriber
    /// receives every message.
    ///
    /// # Errors
    ///
    /// It returns [`Error::ConnectionClosed`] if the connection isn't established.
    pub async fn subscribe<H>(
        &self,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        handler: H,
    ) -> Result<SubscriptionHandle, Error>
    where
        H: MessageHandler<Message>,
    {
        let transport = self.transport()?;
        let inbound = transport
            .subscribe(subject.clone(), queue_group.clone())
            .await?;

        let handle = self.next_handle();
        self.inner
            .subscriptions
            .insert(handle, Dispatch::spawn(inbound, handler));

        // `finalize` may have emptied the registry in the meantime
        if self.state() != ConnectionState::Connected {
            if let Some(dispatch) = self.inner.subscriptions.remove(handle) {
                dispatch.stop().await;
            }
            return Err(Error::ConnectionClosed);
        }

        info!(%subject, queue_group = queue_group.as_deref(), "subscribed");
        Ok(handle)
    }

    /// Remove the subscription identified by `handle`
    ///
    /// # Errors
    ///
    /// It returns [`Error::ConnectionClosed`] if the connection isn't established
    /// or `handle` doesn't identify an open subscription.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), Error> {
        self.transport()?;
        let dispatch = self
            .inner
            .subscriptions
            .remove(handle)
            .ok_or(Error::ConnectionClosed)?;
        dispatch.stop().await;
        Ok(())
    }

    /// Publish `payload` to `subject` and wait for the reply
    ///
    /// `timeout` defaults to the configured request timeout.
    ///
    /// # Errors
    ///
    /// It returns [`Error::Timeout`] if no reply arrived in time and
    /// [`Error::ConnectionClosed`] if the connection isn't established.
    pub async fn request(
        &self,
        subject: Subject,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Message, Error> {
        let transport = self.transport()?;
        request(
            &*transport,
            &self.inner.settings.inbox_prefix,
            subject,
            payload,
            timeout.unwrap_or(self.inner.settings.timeout),
        )
        .await
    }

    /// Subscribe to the streaming `channel`, handing every message to `handler`
    ///
    /// Messages are acknowledged after `handler` returns.
    ///
    /// # Errors
    ///
    /// It returns [`Error::ConnectionClosed`] if the streaming session isn't
    /// established and [`Error::Streaming`] if the server refused the subscription.
    pub async fn stream_subscribe<H>(
        &self,
        channel: &str,
        options: StreamSubscribeOptions,
        handler: H,
    ) -> Result<SubscriptionHandle, Error>
    where
        H: MessageHandler<StreamingMessage>,
    {
        let streaming = self.streaming()?;
        let subscription = streaming.subscribe(channel, options, handler).await?;

        let handle = self.next_handle();
        self.inner
            .streaming_subscriptions
            .insert(handle, subscription);

        if self.state() != ConnectionState::Connected {
            if let Some(subscription) = self.inner.streaming_subscriptions.remove(handle) {
                subscription.stop().await;
            }
            return Err(Error::ConnectionClosed);
        }

        info!(channel, "subscribed to streaming channel");
        Ok(handle)
    }

    /// Remove the streaming subscription identified by `handle`
    ///
    /// Durable subscriptions are removed from the server too, forgetting their position.
    ///
    /// # Errors
    ///
    /// It returns [`Error::ConnectionClosed`] if the streaming session isn't
    /// established or `handle` doesn't identify an open streaming subscription.
    pub async fn stream_unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), Error> {
        let streaming = self.streaming()?;
        let subscription = self
            .inner
            .streaming_subscriptions
            .remove(handle)
            .ok_or(Error::ConnectionClosed)?;
        streaming.unsubscribe(subscription).await
    }

    /// Publish `payload` to the streaming `channel`, waiting for the server to store it
    ///
    /// # Errors
    ///
    /// It returns [`Error::ConnectionClosed`] if the streaming session isn't
    /// established and [`Error::Streaming`] if the server refused the message.
    pub async fn stream_publish(&self, channel: &str, payload: Bytes) -> Result<(), Error> {
        self.streaming()?.publish(channel, payload).await
    }

    /// The number of open subscriptions
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// The number of open streaming subscriptions
    #[must_use]
    pub fn streaming_subscription_count(&self) -> usize {
        self.inner.streaming_subscriptions.len()
    }

    pub(crate) async fn pull(&self, subject: Subject, pull: PullRequest) -> Result<Message, Error> {
        let transport = self.transport()?;
        request::pull(&*transport, &self.inner.settings.inbox_prefix, subject, pull).await
    }

    async fn connect(&self) -> Result<Arc<dyn Transport>, Error> {
        let settings = &self.inner.settings;
        let options = ConnectOptions {
            inbox_prefix: settings.inbox_prefix.clone(),
            name: settings.name.clone(),
            default_response_timeout: settings.timeout,
        };

        for addr in &settings.hosts {
            match time::timeout(
                settings.connect_timeout,
                self.inner.connector.connect(addr, &options),
            )
            .await
            {
                Ok(Ok(transport)) => {
                    info!(host = ?addr.host(), port = addr.port(), "connected to nats");
                    return Ok(transport);
                }
                Ok(Err(err)) => {
                    warn!(
                        host = ?addr.host(),
                        port = addr.port(),
                        error = %err,
                        "couldn't connect to nats"
                    );
                }
                Err(_) => {
                    warn!(host = ?addr.host(), port = addr.port(), "timed out connecting to nats");
                }
            }
        }

        error!(hosts = settings.hosts.len(), "no nats server available");
        Err(Error::NoServersAvailable)
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, Error> {
        self.inner
            .session
            .load()
            .active_transport()
            .cloned()
            .ok_or(Error::ConnectionClosed)
    }

    fn streaming(&self) -> Result<Arc<StreamingSession>, Error> {
        self.inner
            .session
            .load()
            .active_streaming()
            .cloned()
            .ok_or(Error::ConnectionClosed)
    }

    fn store(&self, session: Session) {
        self.inner.session.store(Arc::new(session));
    }

    fn next_handle(&self) -> SubscriptionHandle {
        SubscriptionHandle::new(self.inner.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(relay) = self
            .relay
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            relay.abort();
        }
    }
}
