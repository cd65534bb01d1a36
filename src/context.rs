//! Per-evaluation state shared by every node of one expression tree.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::batch::BatchContext;
use crate::error::SegmentError;
use crate::observe::trace::noop_tracer;
use crate::observe::{SpanContext, SpanGuard, Tracer};
use crate::types::{CacheKey, Subject};

/// Result of evaluating a matcher or expression.
pub type Outcome = std::result::Result<bool, SegmentError>;

/// In-flight or settled outcome, shared between every reference to the same
/// matcher invocation.
pub type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;

/// Read-only state a matcher invocation needs while it runs.
///
/// Matcher futures own an `Arc<EvalScope>`, never the [`EvalContext`]: the
/// context owns those futures through its cache, so they must not own it back.
#[derive(Clone)]
pub struct EvalScope {
    subject: Subject,
    segment: String,
    batches: Option<Arc<BatchContext>>,
    tracer: Arc<dyn Tracer>,
    parent_span: SpanContext,
}

impl EvalScope {
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn batches(&self) -> Option<&Arc<BatchContext>> {
        self.batches.as_ref()
    }

    /// Start a span parented on the segment span.
    pub(crate) fn start_span(&self, name: &str) -> SpanGuard {
        SpanGuard::start(self.tracer.as_ref(), name, Some(&self.parent_span))
    }
}

/// State for a single `matches` call.
///
/// Holds the subject, the segment name used in errors and spans, the
/// per-call result cache, and the batch context that batched matchers queue
/// their requests on. Never shared across calls. Dropping it drops every
/// cached invocation, including ones still in flight.
pub struct EvalContext {
    scope: Arc<EvalScope>,
    cache: Mutex<HashMap<CacheKey, SharedOutcome>>,
}

impl EvalContext {
    /// Create a context with a fresh batch context and tracing disabled.
    pub fn new(subject: Subject, segment: impl Into<String>) -> Self {
        Self {
            scope: Arc::new(EvalScope {
                subject,
                segment: segment.into(),
                batches: Some(Arc::new(BatchContext::new())),
                tracer: noop_tracer(),
                parent_span: SpanContext::none(),
            }),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the batch context. `None` leaves batched matchers without one.
    pub fn with_batches(mut self, batches: Option<Arc<BatchContext>>) -> Self {
        self.scope_mut().batches = batches;
        self
    }

    /// Emit matcher spans through `tracer`, parented on `parent`.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>, parent: SpanContext) -> Self {
        let scope = self.scope_mut();
        scope.tracer = tracer;
        scope.parent_span = parent;
        self
    }

    fn scope_mut(&mut self) -> &mut EvalScope {
        Arc::make_mut(&mut self.scope)
    }

    pub fn scope(&self) -> &Arc<EvalScope> {
        &self.scope
    }

    pub fn subject(&self) -> &Subject {
        self.scope.subject()
    }

    pub fn segment(&self) -> &str {
        self.scope.segment()
    }

    pub fn batches(&self) -> Option<&Arc<BatchContext>> {
        self.scope.batches()
    }

    /// Number of distinct matcher invocations started so far
    pub fn cached_results(&self) -> usize {
        self.cache.lock().len()
    }

    /// Return the cached outcome for `key`, or store and return the one
    /// produced by `launch`.
    ///
    /// The entry is inserted before anything polls it, so concurrent and
    /// later references to the same key share one invocation.
    pub(crate) fn outcome_for<F>(&self, key: &CacheKey, launch: F) -> SharedOutcome
    where
        F: FnOnce() -> SharedOutcome,
    {
        let mut cache = self.cache.lock();
        if let Some(hit) = cache.get(key) {
            tracing::trace!(segment = %self.segment(), key = key.as_str(), "matcher cache hit");
            return hit.clone();
        }
        let outcome = launch();
        cache.insert(key.clone(), outcome.clone());
        outcome
    }
}
