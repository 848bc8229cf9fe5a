use bytes::Bytes;
use data_encoding::BASE64;
use serde::Deserialize;
use serde_json::Value;

/// The `error` object of a failed JetStream API response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("jetstream api error code={code} description={description:?}")]
pub struct ApiError {
    /// HTTP-like status code
    pub code: u16,
    /// JetStream specific error code, sent by newer servers
    #[serde(default)]
    pub err_code: Option<u16>,
    #[serde(default)]
    pub description: String,
}

/// The outcome of fetching a stored message by sequence number
#[derive(Debug, Clone, PartialEq)]
pub enum StoredMessage {
    /// The decoded message payload
    Found(Bytes),
    /// The server refused the lookup for a reason other than the message not existing.
    ///
    /// Holds the whole decoded response.
    Rejected(Value),
}

/// A `STREAM.MSG.GET` response that can't be interpreted
#[derive(Debug, thiserror::Error)]
pub enum StoredMessageError {
    #[error("response has neither a message nor an error")]
    MissingMessage,
    #[error("message data isn't a string")]
    InvalidData,
    #[error("message data isn't valid base64")]
    Base64(#[source] data_encoding::DecodeError),
}

impl ApiError {
    /// The code used for missing messages and resources
    pub const NOT_FOUND: u16 = 404;

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }
}

/// Extract the `error` object of a response, if there is one
///
/// An `error` value which doesn't carry at least a numeric `code` is reported
/// with the code `0`, so that callers never mistake it for a success.
#[must_use]
pub fn response_error(response: &Value) -> Option<ApiError> {
    let error = response.get("error")?;
    Some(
        ApiError::deserialize(error).unwrap_or_else(|_| ApiError {
            code: 0,
            err_code: None,
            description: error.to_string(),
        }),
    )
}

/// The `type` discriminator of a response, like `io.nats.jetstream.api.v1.stream_create_response`
#[must_use]
pub fn response_type(response: &Value) -> Option<&str> {
    response.get("type")?.as_str()
}

/// Interpret a `STREAM.MSG.GET` response
///
/// Returns `Ok(None)` when the server reports that the message doesn't exist.
///
/// # Errors
///
/// It returns an error if a successful response doesn't contain a decodable message.
pub fn decode_stored_message(response: Value) -> Result<Option<StoredMessage>, StoredMessageError> {
    if let Some(error) = response_error(&response) {
        return Ok(if error.is_not_found() {
            None
        } else {
            Some(StoredMessage::Rejected(response))
        });
    }

    let message = response
        .get("message")
        .ok_or(StoredMessageError::MissingMessage)?;
    let data = match message.get("data") {
        // Empty payloads are omitted by the server
        None | Some(Value::Null) => Bytes::new(),
        Some(Value::String(data)) => BASE64
            .decode(data.as_bytes())
            .map(Bytes::from)
            .map_err(StoredMessageError::Base64)?,
        Some(_) => return Err(StoredMessageError::InvalidData),
    };
    Ok(Some(StoredMessage::Found(data)))
}
