use std::{
    fmt::{self, Display},
    sync::Arc,
};

use crate::{streaming::StreamingSession, transport::Transport};

/// The lifecycle state of a [`NatsUtility`](crate::NatsUtility)
///
/// ```text
/// Uninitialized -> Connecting -> Connected -> Draining -> Closed
///                      |
///                      +-> Uninitialized (no server accepted the connection)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    /// Subscriptions are being torn down ahead of closing the connection
    Draining,
    Closed,
}

/// A consistent snapshot of the connection
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) state: ConnectionState,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) streaming: Option<Arc<StreamingSession>>,
}

impl Session {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self {
            state,
            transport: None,
            streaming: None,
        }
    }

    pub(crate) fn connected(
        transport: Arc<dyn Transport>,
        streaming: Option<Arc<StreamingSession>>,
    ) -> Self {
        Self {
            state: ConnectionState::Connected,
            transport: Some(transport),
            streaming,
        }
    }

    /// The same connection, moved to `state`
    pub(crate) fn with_state(&self, state: ConnectionState) -> Self {
        Self {
            state,
            transport: self.transport.clone(),
            streaming: self.streaming.clone(),
        }
    }

    pub(crate) fn active_transport(&self) -> Option<&Arc<dyn Transport>> {
        match self.state {
            ConnectionState::Connected => self.transport.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn active_streaming(&self) -> Option<&Arc<StreamingSession>> {
        match self.state {
            ConnectionState::Connected => self
                .streaming
                .as_ref()
                .filter(|streaming| !streaming.is_closed()),
            _ => None,
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Draining => "draining",
            Self::Closed => "closed",
        })
    }
}
