//! `Injector` and `Extractor` implementations over AMQP message headers.
use crate::amqp::convenience::header_utf8;
use crate::amqp::types::{AMQPValue, FieldTable, LongString};
use opentelemetry::propagation::{Extractor, Injector};

/// AMQP short strings (header names included) can't be longer than this.
const MAX_HEADER_NAME_LENGTH: usize = 255;

/// A header could not be read while extracting the trace context of a message.
#[derive(thiserror::Error, Debug)]
pub enum TraceExtractionError {
    #[error("The `{header}` header is not valid UTF-8")]
    InvalidEncoding {
        header: String,
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("The `{header}` header does not contain a valid trace context")]
    MalformedTraceHeader { header: String },
}

/// A header could not be written while injecting a trace context into a message.
#[derive(thiserror::Error, Debug)]
pub enum TraceInjectionError {
    #[error("`{header}` is too long to be used as an AMQP header name")]
    HeaderNameTooLong { header: String },
}

/// The string headers of a message, decoded upfront.
///
/// Headers that are not string-like are ignored.
/// Headers that are string-like but not valid UTF-8 are skipped and reported.
pub(crate) struct HeaderExtractor {
    headers: Vec<(String, String)>,
}

impl HeaderExtractor {
    pub(crate) fn new(headers: Option<&FieldTable>) -> (Self, Vec<TraceExtractionError>) {
        let mut decoded = Vec::new();
        let mut errors = Vec::new();
        for (name, value) in headers.into_iter().flat_map(|h| h.inner().iter()) {
            match header_utf8(value) {
                Ok(Some(value)) => decoded.push((name.as_str().to_owned(), value.to_owned())),
                Ok(None) => {}
                Err(source) => errors.push(TraceExtractionError::InvalidEncoding {
                    header: name.as_str().to_owned(),
                    source,
                }),
            }
        }
        (Self { headers: decoded }, errors)
    }
}

impl Extractor for HeaderExtractor {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Writes propagation fields into a header table as long strings.
///
/// Existing entries with the same name are overwritten.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut FieldTable,
    errors: Vec<TraceInjectionError>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut FieldTable) -> Self {
        Self {
            headers,
            errors: Vec::new(),
        }
    }

    pub(crate) fn into_errors(self) -> Vec<TraceInjectionError> {
        self.errors
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if key.len() > MAX_HEADER_NAME_LENGTH {
            self.errors.push(TraceInjectionError::HeaderNameTooLong {
                header: key.to_owned(),
            });
            return;
        }
        self.headers
            .insert(key.into(), AMQPValue::LongString(LongString::from(value)));
    }
}
