use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::SegmentError;

/// Value of a span attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Float(x) => write!(f, "{}", x),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

/// Span status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

/// Span status with optional message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanStatus {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: Some(message.into()),
        }
    }
}

/// Handle identifying a started span, used to parent child spans.
#[derive(Debug, Clone)]
pub struct SpanContext {
    name: String,
    id: u64,
    span: tracing::Span,
}

impl SpanContext {
    /// Context for tracers that do not integrate with `tracing`.
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
            span: tracing::Span::none(),
        }
    }

    /// Context that refers to no span at all.
    pub fn none() -> Self {
        Self::new("", 0)
    }

    /// Name of the span
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tracer-assigned id, 0 for the no-op tracer
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The backing `tracing` span (disabled for other tracers)
    pub fn tracing_span(&self) -> &tracing::Span {
        &self.span
    }
}

/// A started span.
pub trait TraceSpan: Send {
    fn set_attribute(&mut self, key: &str, value: AttributeValue);

    fn set_status(&mut self, status: SpanStatus);

    /// Close the span. Called exactly once by [`SpanGuard`].
    fn end(&mut self);

    fn context(&self) -> SpanContext;
}

/// Span factory.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Box<dyn TraceSpan>;
}

/// Scoped span ownership: ends the span exactly once, explicitly or on drop.
pub struct SpanGuard {
    span: Box<dyn TraceSpan>,
    ended: bool,
}

impl SpanGuard {
    /// Start a span on `tracer` and guard it
    ///
    /// A tracer that panics is replaced by a no-op span.
    pub fn start(tracer: &dyn Tracer, name: &str, parent: Option<&SpanContext>) -> Self {
        let span = catch_unwind(AssertUnwindSafe(|| tracer.start_span(name, parent)))
            .unwrap_or_else(|_| {
                tracing::warn!(span = name, "tracer panicked while starting a span");
                Box::new(NoopSpan)
            });
        Self { span, ended: false }
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) {
        let value = value.into();
        self.guarded(|span| span.set_attribute(key, value));
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.guarded(|span| span.set_status(status));
    }

    /// Mark the span failed and attach the error's kind, message and cause chain.
    pub fn record_error(&mut self, error: &SegmentError) {
        let message = error.to_string();
        self.set_attribute("error.kind", error.kind().as_str());
        self.set_attribute("error.message", message.as_str());
        self.set_attribute("error.stack", error.chain_text());
        self.set_status(SpanStatus::error(message));
    }

    pub fn context(&self) -> SpanContext {
        catch_unwind(AssertUnwindSafe(|| self.span.context()))
            .unwrap_or_else(|_| SpanContext::none())
    }

    /// End the span now; later calls and the drop are no-ops.
    pub fn end(&mut self) {
        self.guarded(|span| span.end());
        self.ended = true;
    }

    fn guarded<F: FnOnce(&mut dyn TraceSpan)>(&mut self, call: F) {
        if self.ended {
            return;
        }
        let span = self.span.as_mut();
        if catch_unwind(AssertUnwindSafe(|| call(span))).is_err() {
            tracing::warn!("tracer span panicked, span disabled");
            self.span = Box::new(NoopSpan);
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.end();
    }
}

/// Tracer used when tracing is disabled. Never panics, records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl TraceSpan for NoopSpan {
    #[inline]
    fn set_attribute(&mut self, _key: &str, _value: AttributeValue) {}

    #[inline]
    fn set_status(&mut self, _status: SpanStatus) {}

    #[inline]
    fn end(&mut self) {}

    fn context(&self) -> SpanContext {
        SpanContext::none()
    }
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, _parent: Option<&SpanContext>) -> Box<dyn TraceSpan> {
        Box::new(NoopSpan)
    }
}

/// Shared no-op tracer handle.
pub(crate) fn noop_tracer() -> Arc<dyn Tracer> {
    static NOOP: once_cell::sync::Lazy<Arc<dyn Tracer>> =
        once_cell::sync::Lazy::new(|| Arc::new(NoopTracer));
    NOOP.clone()
}

/// Process-wide tracer used for `tracer: true`.
///
/// Falls back to the no-op tracer when the `spans` feature is disabled.
pub(crate) fn default_tracer() -> Arc<dyn Tracer> {
    #[cfg(feature = "spans")]
    {
        static TRACING: once_cell::sync::Lazy<Arc<dyn Tracer>> =
            once_cell::sync::Lazy::new(|| Arc::new(TracingTracer::new()));
        TRACING.clone()
    }
    #[cfg(not(feature = "spans"))]
    {
        noop_tracer()
    }
}

#[cfg(feature = "spans")]
pub use tracing_backend::TracingTracer;

#[cfg(feature = "spans")]
mod tracing_backend {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tracing::field::Empty;

    use super::*;

    /// Tracer that maps spans onto `tracing` spans.
    ///
    /// Known attributes (`segment.name`, `matcher.name`, results and error
    /// fields) are recorded on the span; anything else is emitted as a debug
    /// event inside it.
    #[derive(Debug, Default)]
    pub struct TracingTracer {
        next_id: AtomicU64,
    }

    impl TracingTracer {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
            }
        }
    }

    struct TracingSpan {
        name: String,
        id: u64,
        span: tracing::Span,
        ended: bool,
    }

    impl Tracer for TracingTracer {
        fn start_span(&self, name: &str, parent: Option<&SpanContext>) -> Box<dyn TraceSpan> {
            let span = match parent {
                Some(parent) => tracing::info_span!(
                    parent: parent.tracing_span(),
                    "segment_engine",
                    otel.name = %name,
                    otel.status_code = Empty,
                    otel.status_message = Empty,
                    segment.name = Empty,
                    segment.result = Empty,
                    matcher.name = Empty,
                    matcher.args = Empty,
                    matcher.result = Empty,
                    error.kind = Empty,
                    error.message = Empty,
                ),
                None => tracing::info_span!(
                    "segment_engine",
                    otel.name = %name,
                    otel.status_code = Empty,
                    otel.status_message = Empty,
                    segment.name = Empty,
                    segment.result = Empty,
                    matcher.name = Empty,
                    matcher.args = Empty,
                    matcher.result = Empty,
                    error.kind = Empty,
                    error.message = Empty,
                ),
            };
            Box::new(TracingSpan {
                name: name.to_string(),
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                span,
                ended: false,
            })
        }
    }

    impl TraceSpan for TracingSpan {
        fn set_attribute(&mut self, key: &str, value: AttributeValue) {
            if self.ended {
                return;
            }
            if self.span.has_field(key) {
                match &value {
                    AttributeValue::String(s) => self.span.record(key, s.as_str()),
                    AttributeValue::Bool(b) => self.span.record(key, *b),
                    AttributeValue::Int(i) => self.span.record(key, *i),
                    AttributeValue::Float(x) => self.span.record(key, *x),
                };
            } else {
                tracing::debug!(
                    parent: &self.span,
                    attribute = key,
                    value = %value,
                    "span attribute"
                );
            }
        }

        fn set_status(&mut self, status: SpanStatus) {
            if self.ended {
                return;
            }
            let code = match status.code {
                StatusCode::Unset => "UNSET",
                StatusCode::Ok => "OK",
                StatusCode::Error => "ERROR",
            };
            self.span.record("otel.status_code", code);
            if let Some(message) = &status.message {
                self.span.record("otel.status_message", message.as_str());
            }
        }

        fn end(&mut self) {
            if !self.ended {
                self.ended = true;
                // Dropping the last handle closes the span.
                self.span = tracing::Span::none();
            }
        }

        fn context(&self) -> SpanContext {
            SpanContext {
                name: self.name.clone(),
                id: self.id,
                span: self.span.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counts {
        attributes: Vec<(String, AttributeValue)>,
        statuses: Vec<SpanStatus>,
        ends: usize,
    }

    struct CountingSpan(Arc<Mutex<Counts>>);

    impl TraceSpan for CountingSpan {
        fn set_attribute(&mut self, key: &str, value: AttributeValue) {
            self.0.lock().attributes.push((key.to_string(), value));
        }

        fn set_status(&mut self, status: SpanStatus) {
            self.0.lock().statuses.push(status);
        }

        fn end(&mut self) {
            self.0.lock().ends += 1;
        }

        fn context(&self) -> SpanContext {
            SpanContext::new("counting", 1)
        }
    }

    struct CountingTracer(Arc<Mutex<Counts>>);

    impl Tracer for CountingTracer {
        fn start_span(&self, _name: &str, _parent: Option<&SpanContext>) -> Box<dyn TraceSpan> {
            Box::new(CountingSpan(self.0.clone()))
        }
    }

    #[test]
    fn test_guard_ends_exactly_once() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let tracer = CountingTracer(counts.clone());

        {
            let mut guard = SpanGuard::start(&tracer, "segment:a", None);
            guard.set_attribute("segment.name", "a");
            guard.end();
            guard.end();
            // Ignored after end.
            guard.set_attribute("late", true);
        }
        {
            let _guard = SpanGuard::start(&tracer, "segment:b", None);
        }

        let counts = counts.lock();
        assert_eq!(counts.ends, 2);
        assert_eq!(counts.attributes.len(), 1);
    }

    struct PanickingTracer;

    impl Tracer for PanickingTracer {
        fn start_span(&self, _name: &str, _parent: Option<&SpanContext>) -> Box<dyn TraceSpan> {
            panic!("tracer backend unavailable");
        }
    }

    struct PanickingSpan;

    impl TraceSpan for PanickingSpan {
        fn set_attribute(&mut self, _key: &str, _value: AttributeValue) {
            panic!("attribute rejected");
        }

        fn set_status(&mut self, _status: SpanStatus) {}

        fn end(&mut self) {}

        fn context(&self) -> SpanContext {
            SpanContext::none()
        }
    }

    #[test]
    fn test_misbehaving_tracer_is_contained() {
        let mut guard = SpanGuard::start(&PanickingTracer, "segment:a", None);
        guard.set_attribute("segment.name", "a");
        guard.set_status(SpanStatus::ok());
        assert_eq!(guard.context().id(), 0);
        guard.end();

        let mut guard = SpanGuard {
            span: Box::new(PanickingSpan),
            ended: false,
        };
        guard.set_attribute("segment.name", "a");
        // The panicking span was swapped for a no-op one.
        guard.set_attribute("segment.result", true);
        guard.end();
    }

    #[test]
    fn test_record_error_sets_status_and_attributes() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let tracer = CountingTracer(counts.clone());

        let mut guard = SpanGuard::start(&tracer, "matcher:isAdmin", None);
        guard.record_error(&SegmentError::UnknownMatcher("isAdmin".into()));
        drop(guard);

        let counts = counts.lock();
        let keys: Vec<&str> = counts.attributes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["error.kind", "error.message", "error.stack"]);
        assert_eq!(
            counts.attributes[0].1,
            AttributeValue::String("StructuralError".into())
        );
        assert_eq!(counts.statuses[0].code, StatusCode::Error);
        assert_eq!(counts.ends, 1);
    }

    #[test]
    fn test_noop_tracer_never_panics() {
        let tracer = NoopTracer;
        let mut span = tracer.start_span("segment:x", Some(&SpanContext::none()));
        span.set_attribute("k", AttributeValue::Int(1));
        span.set_status(SpanStatus::error("bad"));
        span.end();
        span.end();
        span.set_attribute("after", AttributeValue::Bool(true));
        assert_eq!(span.context().id(), 0);
    }

    #[cfg(feature = "spans")]
    #[test]
    fn test_tracing_tracer_without_subscriber() {
        let tracer = default_tracer();
        let mut parent = SpanGuard::start(tracer.as_ref(), "segment:vip", None);
        parent.set_attribute("segment.name", "vip");
        let ctx = parent.context();
        assert_eq!(ctx.name(), "segment:vip");

        let mut child = SpanGuard::start(tracer.as_ref(), "matcher:isAdmin", Some(&ctx));
        child.set_attribute("custom.attr", 3_i64);
        child.record_error(&SegmentError::Unexpected("boom".into()));
        child.end();
        parent.set_status(SpanStatus::ok());
        parent.end();
        assert_ne!(ctx.id(), child.context().id());
    }
}
