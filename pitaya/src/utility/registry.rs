use std::{
    collections::BTreeMap,
    future::Future,
    mem,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

use crate::{transport::InboundSubscription, Message};

/// Receives the messages of a subscription
///
/// Messages of a subscription are handled one at a time, in the order they
/// were delivered by the server.
///
/// Implemented for every `Fn(M) -> impl Future<Output = ()>`.
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: M);
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, message: M) {
        self(message).await;
    }
}

/// An opaque identifier of a subscription
///
/// Returned by [`NatsUtility::subscribe`](crate::NatsUtility::subscribe) and
/// [`NatsUtility::stream_subscribe`](crate::NatsUtility::stream_subscribe).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionHandle(u64);

/// The subscriptions opened through a [`NatsUtility`](crate::NatsUtility)
#[derive(Debug)]
pub(crate) struct Registry<S> {
    entries: Mutex<BTreeMap<SubscriptionHandle, S>>,
}

/// A task feeding the messages of an [`InboundSubscription`] to a [`MessageHandler`]
#[derive(Debug)]
pub(crate) struct Dispatch {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl<S> Registry<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, handle: SubscriptionHandle, subscription: S) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, subscription);
    }

    pub(crate) fn remove(&self, handle: SubscriptionHandle) -> Option<S> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
    }

    /// Remove every subscription, in the order they were opened
    pub(crate) fn take_all(&self) -> Vec<S> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        mem::take(&mut *entries).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Dispatch {
    pub(crate) fn spawn<H>(mut inbound: Box<dyn InboundSubscription>, handler: H) -> Self
    where
        H: MessageHandler<Message>,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    message = inbound.next_message() => match message {
                        Some(message) => handler.handle(message).await,
                        None => break,
                    },
                }
            }

            if let Err(err) = inbound.close().await {
                debug!(error = %err, "couldn't remove the subscription from the server");
            }
        });

        Self { stop, task }
    }

    /// Stop dispatching and remove the subscription from the server
    ///
    /// A message being handled is allowed to complete. Must not be awaited
    /// from within the handler of the same subscription.
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            warn!(error = %err, "subscription dispatch task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use watermelon_proto::Subject;

    use super::{Dispatch, Registry, SubscriptionHandle};
    use crate::{tests::MemoryBroker, Message};

    #[test]
    fn registry_bookkeeping() {
        let registry = Registry::new();
        registry.insert(SubscriptionHandle::new(2), "b");
        registry.insert(SubscriptionHandle::new(1), "a");
        registry.insert(SubscriptionHandle::new(3), "c");
        assert_eq!(3, registry.len());

        assert_eq!(Some("b"), registry.remove(SubscriptionHandle::new(2)));
        assert_eq!(None, registry.remove(SubscriptionHandle::new(2)));
        assert_eq!(vec!["a", "c"], registry.take_all());
        assert_eq!(0, registry.len());
    }

    #[tokio::test]
    async fn dispatch_preserves_order_and_unsubscribes() {
        let broker = MemoryBroker::new();
        let transport = broker.transport();
        let subject = Subject::from_static("orders");

        let inbound = transport.subscribe(subject.clone(), None).await.unwrap();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let dispatch = Dispatch::spawn(inbound, move |message: Message| {
            let sender = sender.clone();
            async move {
                // Give a chance to later messages to overtake this one
                tokio::time::sleep(Duration::from_millis(1)).await;
                let _ = sender.send(message.payload);
            }
        });
        assert_eq!(1, broker.subscription_count());

        for i in 0..10_u8 {
            transport
                .publish(subject.clone(), None, Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        for i in 0..10_u8 {
            assert_eq!(Bytes::from(vec![i]), receiver.recv().await.unwrap());
        }

        dispatch.stop().await;
        assert_eq!(0, broker.subscription_count());
    }
}
