//! Converting message bodies to and from typed values.
use crate::amqp::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};

const JSON_CONTENT_TYPE: &str = "application/json";

/// The body of a delivery could not be turned into the expected request type.
///
/// Retrying will never help: the consumers reject these messages without requeueing them.
#[derive(thiserror::Error, Debug)]
pub enum DeserializationError {
    #[error("The message body could not be decoded")]
    Malformed(#[source] anyhow::Error),
    #[error("The message body does not contain a request")]
    Empty,
}

/// A value could not be encoded as a message body.
#[derive(thiserror::Error, Debug)]
#[error("Failed to serialize the message body")]
pub struct SerializationError(#[source] pub anyhow::Error);

/// Encodes typed values as message bodies and decodes them back.
///
/// Both directions get to see the message properties: a serializer can stamp the content
/// type on the way out and dispatch on it on the way in.
pub trait Serializer: Send + Sync + 'static {
    /// Encode `value`, returning the (possibly enriched) properties alongside the body.
    fn serialize<T>(
        &self,
        properties: BasicProperties,
        value: &T,
    ) -> Result<(BasicProperties, Vec<u8>), SerializationError>
    where
        T: Serialize + ?Sized;

    /// Decode a body.
    ///
    /// `Ok(None)` means the body carries no value at all (e.g. it is empty).
    fn deserialize<T>(
        &self,
        properties: &BasicProperties,
        body: &[u8],
    ) -> Result<Option<T>, DeserializationError>
    where
        T: DeserializeOwned;
}

/// JSON bodies, via `serde_json`.
///
/// Empty and whitespace-only bodies decode to `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T>(
        &self,
        properties: BasicProperties,
        value: &T,
    ) -> Result<(BasicProperties, Vec<u8>), SerializationError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|e| SerializationError(e.into()))?;
        let properties = if properties.content_type().is_none() {
            properties.with_content_type(JSON_CONTENT_TYPE.into())
        } else {
            properties
        };
        Ok((properties, body))
    }

    fn deserialize<T>(
        &self,
        _properties: &BasicProperties,
        body: &[u8],
    ) -> Result<Option<T>, DeserializationError>
    where
        T: DeserializeOwned,
    {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(body)
            .map(Some)
            .map_err(|e| DeserializationError::Malformed(e.into()))
    }
}
