use crate::error::SegmentError;
use crate::types::ErrorContext;

/// Logger callback type for [`FnLogger`]
type LoggerCallback = Box<dyn Fn(&SegmentError, &ErrorContext) + Send + Sync>;

/// Sink for errors contained by the evaluator.
///
/// Only `error` is called by the engine; the other entry points are inert by
/// default and exist for callers that share one logger across components.
pub trait Logger: Send + Sync {
    /// Record a contained failure.
    fn error(&self, error: &SegmentError, context: &ErrorContext);

    fn log(&self, _message: &str) {}

    fn info(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}
}

/// Default logger: emits through `tracing` at error level.
///
/// With a `fmt` subscriber writing to stderr this is the console sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, error: &SegmentError, context: &ErrorContext) {
        tracing::error!(
            segment = %context.segment,
            kind = %error.kind(),
            matcher = error.matcher_name().unwrap_or("-"),
            error = %error.chain_text(),
            "segment evaluation failed"
        );
    }

    fn log(&self, message: &str) {
        tracing::debug!("{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

/// Logger that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    #[inline]
    fn error(&self, _error: &SegmentError, _context: &ErrorContext) {}
}

/// Logger backed by a closure.
pub struct FnLogger {
    callback: LoggerCallback,
}

impl FnLogger {
    /// Create a logger that forwards errors to `callback`
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&SegmentError, &ErrorContext) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl Logger for FnLogger {
    fn error(&self, error: &SegmentError, context: &ErrorContext) {
        (self.callback)(error, context)
    }
}
