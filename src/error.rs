use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;

use crate::types::Subject;

/// Boxed error returned by user-supplied evaluators and callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classifies segment errors for programmatic matching and span attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A bound matcher argument failed its schema
    MatcherArgument,
    /// A user evaluator returned an error or panicked
    MatcherEvaluation,
    /// Unregistered segment, unknown matcher, wrong arity, or broken batch wiring
    Structural,
    /// A segment definition function failed while building its expression
    SegmentDefinition,
    /// Anything else (panics in engine-adjacent code, foreign failures)
    Unexpected,
}

impl ErrorKind {
    /// Stable name used in logs and span attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MatcherArgument => "MatcherArgumentError",
            ErrorKind::MatcherEvaluation => "MatcherEvaluationError",
            ErrorKind::Structural => "StructuralError",
            ErrorKind::SegmentDefinition => "SegmentDefinitionError",
            ErrorKind::Unexpected => "UnexpectedError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, cloneable handle to the original cause of a failure.
#[derive(Clone)]
pub struct ErrorCause(Arc<dyn std::error::Error + Send + Sync>);

impl ErrorCause {
    /// Wrap any error as a cause.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Wrap a plain message (a non-error failure value) as a cause.
    pub fn message(message: impl Into<String>) -> Self {
        Self(Arc::new(MessageError(message.into())))
    }

    /// Normalize a panic payload into a cause carrying its string form.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::message(panic_message(payload.as_ref()))
    }
}

impl From<BoxError> for ErrorCause {
    fn from(error: BoxError) -> Self {
        Self(Arc::from(error))
    }
}

impl fmt::Debug for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ErrorCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}

/// Segment engine error types
#[derive(Error, Debug, Clone)]
pub enum SegmentError {
    #[error("Invalid arguments for matcher '{matcher}' in segment '{segment}': {message}")]
    MatcherArgument {
        matcher: String,
        segment: String,
        message: String,
        subject: Option<Subject>,
    },

    #[error("Matcher '{matcher}' failed in segment '{segment}': {cause}")]
    MatcherEvaluation {
        matcher: String,
        segment: String,
        subject: Subject,
        args: Option<serde_json::Value>,
        #[source]
        cause: ErrorCause,
    },

    #[error("Segment '{0}' is not registered")]
    UnknownSegment(String),

    #[error("Matcher '{0}' is not registered")]
    UnknownMatcher(String),

    #[error("Matcher '{matcher}' {message}")]
    MatcherArity { matcher: String, message: String },

    #[error("Invalid matcher configuration: {0}")]
    InvalidMatcher(String),

    #[error("Batched matcher '{matcher}' was evaluated in segment '{segment}' without an active batch context")]
    MissingBatchContext { matcher: String, segment: String },

    #[error("Batch evaluator for matcher '{matcher}' in segment '{segment}' dropped a request without resolving it")]
    BatchResolverDropped { matcher: String, segment: String },

    #[error("Segment '{segment}' definition failed: {cause}")]
    SegmentDefinition {
        segment: String,
        #[source]
        cause: ErrorCause,
    },

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl SegmentError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SegmentError::MatcherArgument { .. } => ErrorKind::MatcherArgument,
            SegmentError::MatcherEvaluation { .. } | SegmentError::BatchResolverDropped { .. } => {
                ErrorKind::MatcherEvaluation
            }
            SegmentError::UnknownSegment(_)
            | SegmentError::UnknownMatcher(_)
            | SegmentError::MatcherArity { .. }
            | SegmentError::InvalidMatcher(_)
            | SegmentError::MissingBatchContext { .. } => ErrorKind::Structural,
            SegmentError::SegmentDefinition { .. } => ErrorKind::SegmentDefinition,
            SegmentError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Name of the matcher involved, if any.
    pub fn matcher_name(&self) -> Option<&str> {
        match self {
            SegmentError::MatcherArgument { matcher, .. }
            | SegmentError::MatcherEvaluation { matcher, .. }
            | SegmentError::MatcherArity { matcher, .. }
            | SegmentError::MissingBatchContext { matcher, .. }
            | SegmentError::BatchResolverDropped { matcher, .. } => Some(matcher),
            SegmentError::UnknownMatcher(name) => Some(name),
            _ => None,
        }
    }

    /// Name of the segment involved, if any.
    pub fn segment_name(&self) -> Option<&str> {
        match self {
            SegmentError::MatcherArgument { segment, .. }
            | SegmentError::MatcherEvaluation { segment, .. }
            | SegmentError::MissingBatchContext { segment, .. }
            | SegmentError::BatchResolverDropped { segment, .. }
            | SegmentError::SegmentDefinition { segment, .. } => Some(segment),
            SegmentError::UnknownSegment(name) => Some(name),
            _ => None,
        }
    }

    /// Build an unexpected error from a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        SegmentError::Unexpected(panic_message(payload.as_ref()))
    }

    /// Render the error followed by its source chain, one cause per line.
    pub fn chain_text(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            text.push_str("\n  caused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text
    }
}

pub type Result<T> = std::result::Result<T, SegmentError>;

/// Call a user-supplied async function, turning errors and panics (raised
/// while creating the future or while polling it) into an [`ErrorCause`].
pub(crate) async fn contain<T, F, Fut>(call: F) -> std::result::Result<T, ErrorCause>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, BoxError>>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result.map_err(ErrorCause::from),
            Err(payload) => Err(ErrorCause::from_panic(payload)),
        },
        Err(payload) => Err(ErrorCause::from_panic(payload)),
    }
}

/// Extract the string form of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
