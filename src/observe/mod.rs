//! Observability interfaces consumed by the evaluator: loggers and tracers.

pub mod logger;
pub mod trace;

pub use logger::{FnLogger, Logger, NoopLogger, TracingLogger};
pub use trace::{
    AttributeValue, NoopTracer, SpanContext, SpanGuard, SpanStatus, StatusCode, TraceSpan, Tracer,
};

#[cfg(feature = "spans")]
pub use trace::TracingTracer;
