use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::borrow::{Borrow, Cow};

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if the header is missing or is not a string.
    /// Byte arrays are accepted as well: some clients (e.g. the .NET one) write
    /// string headers as raw bytes.
    /// Invalid UTF-8 sequences are replaced, use [`header_utf8`] to detect them.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key)? {
            AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes())),
            AMQPValue::ShortString(s) => Some(Cow::Borrowed(s.as_str())),
            AMQPValue::ByteArray(b) => Some(String::from_utf8_lossy(b.as_slice())),
            _ => None,
        }
    }
}

impl BasicPropertiesExt for BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Strictly decode a header value as UTF-8.
///
/// `Ok(None)` means the value is not string-like, `Err` means it is string-like but not UTF-8.
pub fn header_utf8(value: &AMQPValue) -> Result<Option<&str>, std::str::Utf8Error> {
    match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).map(Some),
        AMQPValue::ShortString(s) => Ok(Some(s.as_str())),
        AMQPValue::ByteArray(b) => std::str::from_utf8(b.as_slice()).map(Some),
        _ => Ok(None),
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// `lapin` does not give us mutable access to the headers of a [`BasicProperties`]:
/// we clone them, insert the new value and hand back a new set of properties.
/// `properties` is consumed to make sure the caller does not re-use the stale copy.
///
/// # Example
///
/// ```rust
/// use carrot_courier::amqp::types::{AMQPValue, ShortString};
/// use carrot_courier::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = BasicProperties::default();
/// let header_value = AMQPValue::LongString("42".into());
///
/// let properties = set_header(properties, "x-attempt", header_value.clone());
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = "x-attempt".into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}

/// Same as [`set_header`], storing `value` as an AMQP long string.
pub fn set_header_str(properties: BasicProperties, header_name: &str, value: &str) -> BasicProperties {
    set_header(
        properties,
        header_name,
        AMQPValue::LongString(LongString::from(value)),
    )
}

/// Take the headers out of `properties`, defaulting to an empty table.
pub(crate) fn headers_or_default(properties: &BasicProperties) -> FieldTable {
    properties.headers().clone().unwrap_or_default()
}
