//! Distributed-trace propagation across the broker.
//!
//! A [`Telemetry`] value owns the propagator and the tracer used by consumers and publishers.
//! Build one at startup and hand it (behind an `Arc`) to everything that needs it: there is
//! no process-wide registry.
use crate::amqp::convenience::headers_or_default;
use crate::amqp::types::FieldTable;
use crate::amqp::BasicProperties;
use opentelemetry::baggage::BaggageExt;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::{
    BaggagePropagator, TextMapCompositePropagator, TraceContextPropagator,
};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

mod propagation;

pub use propagation::{TraceExtractionError, TraceInjectionError};
use propagation::{HeaderExtractor, HeaderInjector};

/// The name the default tracer reports spans under.
pub const INSTRUMENTATION_NAME: &str = "carrot-courier";

/// The header carrying the W3C trace context.
const TRACEPARENT_HEADER: &str = "traceparent";

/// Propagator and tracer shared by consumers and publishers.
///
/// The default uses the W3C `traceparent`/`tracestate` and `baggage` headers and the
/// tracer of the globally installed tracer provider (a no-op if none was installed: the
/// trace context is still propagated).
pub struct Telemetry {
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    tracer: BoxedTracer,
}

impl Telemetry {
    pub fn new<P>(propagator: P, tracer: BoxedTracer) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        Self {
            propagator: Arc::new(propagator),
            tracer,
        }
    }

    /// Use the W3C propagators with a custom tracer.
    pub fn with_tracer(tracer: BoxedTracer) -> Self {
        Self::new(w3c_propagator(), tracer)
    }

    /// Read the trace context out of a set of message headers.
    ///
    /// This never fails: unreadable headers are logged and skipped, falling back to an
    /// empty context.
    pub fn extract(&self, headers: Option<&FieldTable>) -> TraceContext {
        let (extractor, errors) = HeaderExtractor::new(headers);
        for e in &errors {
            tracing::warn!(error = %e, "Failed to extract the trace context of a message");
        }
        let context = self.propagator.extract(&extractor);

        let has_traceparent = opentelemetry::propagation::Extractor::get(
            &extractor,
            TRACEPARENT_HEADER,
        )
        .is_some();
        if has_traceparent && !context.span().span_context().is_valid() {
            let e = TraceExtractionError::MalformedTraceHeader {
                header: TRACEPARENT_HEADER.into(),
            };
            tracing::warn!(error = %e, "Failed to extract the trace context of a message");
        }
        TraceContext(context)
    }

    /// Write `context` into the headers of `properties`.
    ///
    /// Headers that can't be written are logged and skipped: injection never prevents a
    /// message from being published.
    pub fn inject(&self, context: &TraceContext, properties: BasicProperties) -> BasicProperties {
        let mut headers = headers_or_default(&properties);
        let mut injector = HeaderInjector::new(&mut headers);
        self.propagator.inject_context(&context.0, &mut injector);
        for e in injector.into_errors() {
            tracing::warn!(error = %e, "Failed to inject the trace context into a message");
        }
        properties.with_headers(headers)
    }

    /// Start a span as a child of `parent`, returning the context that carries it.
    ///
    /// The span is ended by [`TraceContext::end`].
    pub fn start_span(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        parent: &TraceContext,
        attributes: Vec<KeyValue>,
    ) -> TraceContext {
        let span = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent.0);
        TraceContext(parent.0.with_span(span))
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::with_tracer(global::tracer(INSTRUMENTATION_NAME))
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

fn w3c_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Trace identifiers and baggage attached to a message.
#[derive(Clone, Debug, Default)]
pub struct TraceContext(Context);

impl TraceContext {
    /// A context carrying no trace at all.
    pub fn empty() -> Self {
        Self(Context::new())
    }

    /// Whether there is a valid trace to continue.
    pub fn is_empty(&self) -> bool {
        !self.0.span().span_context().is_valid()
    }

    /// The hex-encoded trace id, if any.
    pub fn trace_id(&self) -> Option<String> {
        let span = self.0.span();
        let span_context = span.span_context();
        span_context
            .is_valid()
            .then(|| span_context.trace_id().to_string())
    }

    /// The hex-encoded span id, if any.
    pub fn span_id(&self) -> Option<String> {
        let span = self.0.span();
        let span_context = span.span_context();
        span_context
            .is_valid()
            .then(|| span_context.span_id().to_string())
    }

    pub fn is_sampled(&self) -> bool {
        self.0.span().span_context().is_sampled()
    }

    /// The baggage entries, sorted by name.
    pub fn baggage(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .0
            .baggage()
            .iter()
            .map(|(name, (value, _))| (name.as_str().to_owned(), value.to_string()))
            .collect();
        entries.sort();
        entries
    }

    /// Mark the current span as failed.
    pub fn record_error(&self, error: &dyn std::error::Error) {
        let span = self.0.span();
        span.set_attribute(KeyValue::new("exception.message", error.to_string()));
        span.set_status(Status::error(error.to_string()));
    }

    /// End the current span.
    pub fn end(&self) {
        self.0.span().end();
    }

    pub fn as_otel(&self) -> &Context {
        &self.0
    }
}

impl From<Context> for TraceContext {
    fn from(context: Context) -> Self {
        Self(context)
    }
}
