use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use watermelon_proto::ServerAddr;

/// A change in the state of the connection
///
/// Received from [`NatsUtility::events`](crate::NatsUtility::events).
/// Subscriptions aren't re-created by [`NatsUtility`](crate::NatsUtility) after
/// [`ConnectionEvent::Reconnected`]; whether they survived depends on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection to the server was lost
    Disconnected,
    /// The connection was re-established
    Reconnected { addr: ServerAddr },
    /// An asynchronous error reported by the server or by the streaming session
    Error { message: String },
    /// The connection has been closed and won't be re-established
    Closed,
}

/// Log every event of `source` and forward it to `sink`
///
/// The relay never blocks the transport: a slow `sink` receiver only
/// loses events, and lagging behind `source` is logged and skipped.
/// It stops after relaying [`ConnectionEvent::Closed`].
pub(super) fn spawn_relay(
    mut source: broadcast::Receiver<ConnectionEvent>,
    sink: broadcast::Sender<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(event) => {
                    log_event(&event);
                    let closed = event == ConnectionEvent::Closed;
                    let _ = sink.send(event);
                    if closed {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lagging behind connection events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub(crate) fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Disconnected => info!("disconnected from nats"),
        ConnectionEvent::Reconnected { addr } => {
            info!(host = ?addr.host(), port = addr.port(), "reconnected to nats");
        }
        ConnectionEvent::Error { message } => error!(%message, "nats connection error"),
        ConnectionEvent::Closed => info!("nats connection closed"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;
    use tracing_test::traced_test;

    use super::{spawn_relay, ConnectionEvent};

    #[tokio::test]
    #[traced_test]
    async fn relays_and_logs() {
        let (source, source_receiver) = broadcast::channel(8);
        let (sink, mut sink_receiver) = broadcast::channel(8);
        let relay = spawn_relay(source_receiver, sink);

        source.send(ConnectionEvent::Disconnected).unwrap();
        source
            .send(ConnectionEvent::Reconnected {
                addr: "nats://localhost:4222".parse().unwrap(),
            })
            .unwrap();
        source
            .send(ConnectionEvent::Error {
                message: "authorization violation".to_owned(),
            })
            .unwrap();
        drop(source);

        assert_eq!(ConnectionEvent::Disconnected, sink_receiver.recv().await.unwrap());
        assert!(matches!(
            sink_receiver.recv().await.unwrap(),
            ConnectionEvent::Reconnected { .. }
        ));
        assert!(matches!(
            sink_receiver.recv().await.unwrap(),
            ConnectionEvent::Error { .. }
        ));
        relay.await.unwrap();

        assert!(logs_contain("disconnected from nats"));
        assert!(logs_contain("reconnected to nats"));
        assert!(logs_contain("authorization violation"));
    }
}
