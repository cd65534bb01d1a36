//! The segment engine: registration, subject contexts, and evaluation.

mod evaluate;
mod options;

pub use evaluate::FallbackValue;
pub use options::{EngineOptions, ErrorObserver, TracerOption, DEFAULT_MEMO_CAPACITY};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;

use crate::compile::{compile, CompiledMatchers};
use crate::error::{panic_message, Result, SegmentError};
use crate::matcher::{Expr, LogicalOperators, MatcherConfigs, MatcherFactory};
use crate::observe::{Logger, Tracer};
use crate::schema::Schema;
use crate::types::{Issue, Subject, AD_HOC_SEGMENT};

/// Segment definition: builds an expression from the subject and matchers.
pub type SegmentFn = Arc<dyn Fn(&SegmentScope<'_>) -> Result<Expr> + Send + Sync>;

/// Wrap a closure as a [`SegmentFn`].
pub fn segment_fn<F>(define: F) -> SegmentFn
where
    F: Fn(&SegmentScope<'_>) -> Result<Expr> + Send + Sync + 'static,
{
    Arc::new(define)
}

/// What a segment definition receives.
pub struct SegmentScope<'a> {
    pub subject: &'a Subject,
    pub matchers: &'a CompiledMatchers,
    pub ops: LogicalOperators,
}

impl<'a> SegmentScope<'a> {
    pub(crate) fn new(subject: &'a Subject, matchers: &'a CompiledMatchers) -> Self {
        Self {
            subject,
            matchers,
            ops: LogicalOperators,
        }
    }

    /// Reference a matcher without arguments.
    pub fn matcher(&self, name: &str) -> Result<Expr> {
        self.matchers.call(name)
    }

    /// Reference a matcher bound to `args`.
    pub fn matcher_with(&self, name: &str, args: Value) -> Result<Expr> {
        self.matchers.call_with(name, args)
    }
}

/// A segment to evaluate: a registered name or an inline definition.
#[derive(Clone)]
pub enum SegmentRef {
    Named(String),
    AdHoc(SegmentFn),
}

impl SegmentRef {
    /// Inline definition, reported as the `ad-hoc` segment.
    pub fn ad_hoc<F>(define: F) -> Self
    where
        F: Fn(&SegmentScope<'_>) -> Result<Expr> + Send + Sync + 'static,
    {
        SegmentRef::AdHoc(Arc::new(define))
    }

    /// Name used in errors and spans
    pub fn name(&self) -> &str {
        match self {
            SegmentRef::Named(name) => name,
            SegmentRef::AdHoc(_) => AD_HOC_SEGMENT,
        }
    }
}

impl From<&str> for SegmentRef {
    fn from(name: &str) -> Self {
        SegmentRef::Named(name.to_string())
    }
}

impl From<String> for SegmentRef {
    fn from(name: String) -> Self {
        SegmentRef::Named(name)
    }
}

impl From<&String> for SegmentRef {
    fn from(name: &String) -> Self {
        SegmentRef::Named(name.clone())
    }
}

impl std::fmt::Debug for SegmentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentRef::Named(name) => f.debug_tuple("Named").field(name).finish(),
            SegmentRef::AdHoc(_) => f.write_str("AdHoc"),
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) schema: Arc<dyn Schema>,
    pub(crate) matchers: CompiledMatchers,
    pub(crate) segments: HashMap<String, SegmentFn>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) tracer: Arc<dyn Tracer>,
    pub(crate) on_error: Option<ErrorObserver>,
}

/// Segment engine
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct SegmentEngine {
    inner: Arc<EngineInner>,
}

impl SegmentEngine {
    /// Start building an engine whose subjects are validated by `schema`.
    pub fn builder<S: Schema + 'static>(schema: S) -> SegmentEngineBuilder {
        SegmentEngineBuilder::new(Arc::new(schema))
    }

    /// Validate `input` once and bind it to a context for evaluation.
    pub async fn context_for(
        &self,
        input: &Value,
    ) -> std::result::Result<SubjectContext, Vec<Issue>> {
        let schema = self.inner.schema.clone();
        let validation = AssertUnwindSafe(schema.validate(input))
            .catch_unwind()
            .await
            .map_err(|payload| {
                vec![Issue::new(format!(
                    "validator panicked: {}",
                    panic_message(payload.as_ref())
                ))]
            })?;

        match validation {
            Ok(Some(value)) => Ok(SubjectContext {
                inner: self.inner.clone(),
                subject: Subject::new(value),
            }),
            Ok(None) => Err(vec![Issue::new(
                "validator reported success without a value",
            )]),
            Err(issues) => {
                tracing::debug!(issues = issues.len(), "subject failed validation");
                Err(issues)
            }
        }
    }

    /// Registered segment names, sorted
    pub fn segment_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.segments.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn matchers(&self) -> &CompiledMatchers {
        &self.inner.matchers
    }
}

impl std::fmt::Debug for SegmentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentEngine")
            .field("matchers", &self.inner.matchers.names())
            .field("segments", &self.segment_names())
            .finish()
    }
}

/// Builder for [`SegmentEngine`]
pub struct SegmentEngineBuilder {
    schema: Arc<dyn Schema>,
    options: EngineOptions,
    matchers: MatcherConfigs,
    segments: HashMap<String, SegmentFn>,
    error: Option<SegmentError>,
}

impl SegmentEngineBuilder {
    fn new(schema: Arc<dyn Schema>) -> Self {
        Self {
            schema,
            options: EngineOptions::default(),
            matchers: MatcherConfigs::new(),
            segments: HashMap::new(),
            error: None,
        }
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Register matchers. May be called more than once; later names replace
    /// earlier ones.
    pub fn matchers<F>(mut self, define: F) -> Self
    where
        F: FnOnce(&MatcherFactory) -> Result<MatcherConfigs>,
    {
        match define(&MatcherFactory) {
            Ok(configs) => self.matchers.extend(configs),
            Err(error) => {
                self.error.get_or_insert(error);
            }
        }
        self
    }

    /// Register a named segment.
    pub fn segment<F>(mut self, name: impl Into<String>, define: F) -> Self
    where
        F: Fn(&SegmentScope<'_>) -> Result<Expr> + Send + Sync + 'static,
    {
        self.segments.insert(name.into(), Arc::new(define));
        self
    }

    /// Register several segments at once.
    pub fn segments<I, K>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = (K, SegmentFn)>,
        K: Into<String>,
    {
        self.segments
            .extend(segments.into_iter().map(|(name, define)| (name.into(), define)));
        self
    }

    /// Build the engine, reporting the first error raised while registering
    /// matchers.
    pub fn build(self) -> Result<SegmentEngine> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let matchers = compile(self.matchers, self.options.memo_capacity);
        tracing::debug!(
            matchers = matchers.len(),
            segments = self.segments.len(),
            tracer = ?self.options.tracer,
            "segment engine built"
        );

        Ok(SegmentEngine {
            inner: Arc::new(EngineInner {
                schema: self.schema,
                matchers,
                segments: self.segments,
                logger: self.options.resolve_logger(),
                tracer: self.options.tracer.resolve(),
                on_error: self.options.on_error,
            }),
        })
    }
}

/// A validated subject bound to an engine.
///
/// Each `matches` call gets its own result cache and batch context; nothing
/// is shared between calls except the engine's memoized matcher definitions.
#[derive(Clone)]
pub struct SubjectContext {
    inner: Arc<EngineInner>,
    subject: Subject,
}

impl SubjectContext {
    pub fn subject(&self) -> &Subject {
        &self.subject
    }
}

impl std::fmt::Debug for SubjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectContext")
            .field("subject", &self.subject)
            .finish()
    }
}
