use bytes::Bytes;
use watermelon_proto::{headers::HeaderMap, ServerMessage, StatusCode, Subject};

/// A message received from a subscription, a request or a pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: Subject,
    /// Where replies, or JetStream acknowledgments, have to be published
    pub reply_subject: Option<Subject>,
    pub headers: HeaderMap,
    pub payload: Bytes,
    /// Present on status messages, like no-responders or idle heartbeats
    pub status_code: Option<StatusCode>,
}

impl Message {
    /// A plain message with no headers or status code
    #[must_use]
    pub fn new(subject: Subject, reply_subject: Option<Subject>, payload: Bytes) -> Self {
        Self {
            subject,
            reply_subject,
            headers: HeaderMap::new(),
            payload,
            status_code: None,
        }
    }

    pub(crate) fn is_status(&self, status_code: StatusCode) -> bool {
        self.status_code == Some(status_code)
    }
}

impl From<ServerMessage> for Message {
    fn from(message: ServerMessage) -> Self {
        Self {
            subject: message.base.subject,
            reply_subject: message.base.reply_subject,
            headers: message.base.headers,
            payload: message.base.payload,
            status_code: message.status_code,
        }
    }
}
