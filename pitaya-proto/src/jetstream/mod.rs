//! JetStream control plane
//!
//! Management operations are plain request/reply exchanges against subjects living
//! under the API prefix (`$JS.API` unless a domain is in use). Requests and responses
//! are JSON documents.

pub use self::consumer::{
    AckPolicy, ConsumerConfig, DeliverPolicy, DurableConsumerCreate, PullRequest, ReplayPolicy,
};
pub use self::endpoint::{ApiEndpoint, EndpointError};
pub use self::response::{
    decode_stored_message, response_error, response_type, ApiError, StoredMessage,
    StoredMessageError,
};
pub use self::stream::{RetentionPolicy, Storage, StreamConfig};

mod consumer;
mod endpoint;
mod response;
mod stream;

/// The default API prefix
pub const DEFAULT_API_PREFIX: &str = "$JS.API";

mod nullable_number {
    use std::{any::type_name, fmt::Display};

    use serde::{
        de::{self, DeserializeOwned},
        ser, Deserialize, Deserializer, Serialize, Serializer,
    };

    pub(crate) trait NullableNumber: Copy + Display {
        const NULL_VALUE: Self::SignedValue;
        type SignedValue: Copy
            + TryFrom<Self>
            + TryInto<Self>
            + Display
            + Eq
            + Serialize
            + DeserializeOwned;
    }

    impl NullableNumber for u32 {
        const NULL_VALUE: Self::SignedValue = -1;
        type SignedValue = i32;
    }

    impl NullableNumber for u64 {
        const NULL_VALUE: Self::SignedValue = -1;
        type SignedValue = i64;
    }

    #[expect(clippy::ref_option)]
    pub(crate) fn serialize<S, N>(num: &Option<N>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        N: NullableNumber,
    {
        match *num {
            Some(num) => num.try_into().map_err(|_| {
                ser::Error::custom(format!(
                    "{num} can't be converted to {}",
                    type_name::<N::SignedValue>()
                ))
            })?,
            None => N::NULL_VALUE,
        }
        .serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>, N: NullableNumber>(
        deserializer: D,
    ) -> Result<Option<N>, D::Error> {
        let num = N::SignedValue::deserialize(deserializer)?;
        Ok(if num == N::NULL_VALUE {
            None
        } else {
            Some(num.try_into().map_err(|_| {
                de::Error::custom(format!("{num} can't be converted to {}", type_name::<N>()))
            })?)
        })
    }
}

mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub(crate) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_nanos().serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

mod option_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[expect(clippy::ref_option)]
    pub(crate) fn serialize<S>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|duration| duration.as_nanos()).serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_nanos))
    }
}

mod opposite_bool {
    use std::ops::Not;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[expect(
        clippy::trivially_copy_pass_by_ref,
        reason = "this must follow the signature expected by serde"
    )]
    pub(crate) fn serialize<S>(val: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        val.not().serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<bool, D::Error> {
        bool::deserialize(deserializer).map(Not::not)
    }
}
