use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::CoreError;

/// A message type that can travel over a session.
///
/// The type tag is carried next to the body so that a receiver can detect a
/// payload of the wrong type before attempting to decode it.
pub trait FlowMessage: Serialize + DeserializeOwned + Send {
    /// Stable tag identifying this message type on the wire
    const TYPE_TAG: &'static str;
}

/// Represents a typed packet of data exchanged between flows
///
/// This is a wrapper around a JSON value with the type tag of the message
/// it was encoded from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    /// Type tag of the encoded message
    pub type_tag: String,
    /// The inner JSON value
    pub body: serde_json::Value,
}

impl Payload {
    /// Encode a flow message
    pub fn encode<T: FlowMessage>(message: &T) -> Result<Self, CoreError> {
        Ok(Self {
            type_tag: T::TYPE_TAG.to_string(),
            body: serde_json::to_value(message)?,
        })
    }

    /// Check whether this payload carries a message of type `T`
    #[inline]
    pub fn is<T: FlowMessage>(&self) -> bool {
        self.type_tag == T::TYPE_TAG
    }

    /// Decode into a flow message, checking the type tag first
    pub fn decode<T: FlowMessage>(&self) -> Result<T, CoreError> {
        if !self.is::<T>() {
            return Err(CoreError::SerializationError(format!(
                "Payload of type {} cannot be decoded as {}",
                self.type_tag,
                T::TYPE_TAG
            )));
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Get the inner JSON value
    #[inline]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.body
    }
}
