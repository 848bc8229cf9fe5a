use std::time::Duration;

use bytes::Bytes;
use pitaya_proto::jetstream::{
    decode_stored_message, ApiEndpoint, ConsumerConfig, DurableConsumerCreate, PullRequest,
    StoredMessage, StreamConfig, DEFAULT_API_PREFIX,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use watermelon_proto::Subject;

use crate::{Error, Message, NatsUtility};

/// A client of the JetStream control plane
///
/// Every management operation is a request to a subject under the API prefix.
/// Responses are returned as decoded JSON: an `error` object in a response is
/// not turned into an [`Error`], use [`response_error`] to inspect it.
///
/// [`response_error`]: crate::proto::jetstream::response_error
#[derive(Debug, Clone)]
pub struct JetstreamClient {
    utility: NatsUtility,
    prefix: Subject,
    request_timeout: Option<Duration>,
}

impl JetstreamClient {
    /// A client of the default JetStream domain, using `$JS.API` as the prefix
    #[must_use]
    pub fn new(utility: NatsUtility) -> Self {
        Self {
            utility,
            prefix: Subject::from_static(DEFAULT_API_PREFIX),
            request_timeout: None,
        }
    }

    /// A client of the JetStream `domain`
    ///
    /// # Errors
    ///
    /// It returns an error if `domain` can't be part of a subject.
    pub fn new_with_domain(utility: NatsUtility, domain: &str) -> Result<Self, Error> {
        Self::new_with_prefix(utility, &format!("$JS.{domain}.API"))
    }

    /// A client sending its requests under a custom API `prefix`
    ///
    /// # Errors
    ///
    /// It returns an error if `prefix` isn't a valid subject.
    pub fn new_with_prefix(utility: NatsUtility, prefix: &str) -> Result<Self, Error> {
        Ok(Self {
            utility,
            prefix: Subject::try_from(prefix.to_owned())?,
            request_timeout: None,
        })
    }

    /// The timeout of control plane requests
    ///
    /// Default: the request timeout configured in the [`Settings`](crate::Settings).
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Information about the account
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn info(&self) -> Result<Value, Error> {
        self.call(ApiEndpoint::Info, Bytes::new()).await
    }

    /// List the streams
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn streams(&self) -> Result<Value, Error> {
        self.call(ApiEndpoint::StreamList, Bytes::new()).await
    }

    /// Information about the `stream`
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn stream(&self, stream: &str) -> Result<Value, Error> {
        self.call(ApiEndpoint::StreamInfo { stream }, Bytes::new())
            .await
    }

    /// Create a stream
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn create_stream(&self, config: &StreamConfig) -> Result<Value, Error> {
        self.call(
            ApiEndpoint::StreamCreate {
                stream: &config.name,
            },
            json_payload(config)?,
        )
        .await
    }

    /// Replace the configuration of an existing stream
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn update_stream(&self, config: &StreamConfig) -> Result<Value, Error> {
        self.call(
            ApiEndpoint::StreamUpdate {
                stream: &config.name,
            },
            json_payload(config)?,
        )
        .await
    }

    /// Delete the `stream` along with its messages and consumers
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn delete_stream(&self, stream: &str) -> Result<Value, Error> {
        self.call(ApiEndpoint::StreamDelete { stream }, Bytes::new())
            .await
    }

    /// Delete every message of the `stream`
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn purge_stream(&self, stream: &str) -> Result<Value, Error> {
        self.call(ApiEndpoint::StreamPurge { stream }, Bytes::new())
            .await
    }

    /// Create a consumer living as long as its interest
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn create_ephemeral_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<Value, Error> {
        self.call(ApiEndpoint::ConsumerCreate { stream }, json_payload(config)?)
            .await
    }

    /// Create a consumer named after the `durable_name` of `config`
    ///
    /// # Errors
    ///
    /// It returns [`Error::MissingDurableName`] if `config` has no durable name,
    /// or an error if the request fails or the response isn't JSON.
    pub async fn create_durable_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<Value, Error> {
        let durable_name = config
            .durable_name
            .as_deref()
            .ok_or(Error::MissingDurableName)?;
        let payload = json_payload(&DurableConsumerCreate {
            stream_name: stream,
            config,
        })?;

        self.call(
            ApiEndpoint::ConsumerDurableCreate {
                stream,
                durable_name,
            },
            payload,
        )
        .await
    }

    /// List the consumers of `stream`
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn consumers(&self, stream: &str) -> Result<Value, Error> {
        self.call(ApiEndpoint::ConsumerList { stream }, Bytes::new())
            .await
    }

    /// Information about the `consumer` of `stream`
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn consumer(&self, stream: &str, consumer: &str) -> Result<Value, Error> {
        self.call(ApiEndpoint::ConsumerInfo { stream, consumer }, Bytes::new())
            .await
    }

    /// Delete the `consumer` of `stream`
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response isn't JSON.
    pub async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<Value, Error> {
        self.call(ApiEndpoint::ConsumerDelete { stream, consumer }, Bytes::new())
            .await
    }

    /// Pull the next message of a pull `consumer`
    ///
    /// The message has to be acknowledged with [`JetstreamClient::ack`] if the
    /// consumer requires acknowledgments.
    ///
    /// # Errors
    ///
    /// It returns [`Error::Timeout`] if no message was available before the
    /// pull request expired, and [`Error::PullStatus`] if the server ended the
    /// pull request for another reason.
    pub async fn next_message(
        &self,
        stream: &str,
        consumer: &str,
        pull: PullRequest,
    ) -> Result<Message, Error> {
        let subject = ApiEndpoint::ConsumerMessageNext { stream, consumer }.subject(&self.prefix)?;
        self.utility.pull(subject, pull).await
    }

    /// Acknowledge a message received from a consumer
    ///
    /// # Errors
    ///
    /// It returns [`Error::NotAcknowledgeable`] if `message` has no reply subject
    /// and [`Error::ConnectionClosed`] if the connection isn't established.
    pub async fn ack(&self, message: &Message) -> Result<(), Error> {
        let reply_subject = message
            .reply_subject
            .clone()
            .ok_or(Error::NotAcknowledgeable)?;
        self.utility.publish(reply_subject, Bytes::new()).await
    }

    /// Fetch the message stored at `sequence` in `stream`
    ///
    /// Returns `None` if there's no such message.
    ///
    /// # Errors
    ///
    /// It returns an error if the request fails or the response can't be interpreted.
    pub async fn get_message(
        &self,
        stream: &str,
        sequence: u64,
    ) -> Result<Option<StoredMessage>, Error> {
        let response = self
            .call(
                ApiEndpoint::StreamMessageGet { stream },
                json_payload(&json!({ "seq": sequence }))?,
            )
            .await?;
        decode_stored_message(response).map_err(Error::StoredMessage)
    }

    async fn call(&self, endpoint: ApiEndpoint<'_>, payload: Bytes) -> Result<Value, Error> {
        let subject = endpoint.subject(&self.prefix)?;
        debug!(%subject, "jetstream api request");

        let reply = self
            .utility
            .request(subject, payload, self.request_timeout)
            .await?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }
}

fn json_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, Error> {
    Ok(serde_json::to_vec(payload)?.into())
}
