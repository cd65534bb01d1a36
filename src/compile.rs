//! Compilation of matcher configs into callable, memoized definitions.
//!
//! Each configured matcher becomes a [`MatcherHandle`]. A handle hands out
//! [`MatcherDefinition`]s: one lazily created singleton for matchers without
//! arguments, and one LRU-memoized definition per distinct argument value for
//! matchers with arguments, so repeated calls with equal arguments return the
//! same definition.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::FutureExt;
use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;

use crate::batch::{BatchCoalescer, BatchFn, BatchRequest};
use crate::context::{EvalContext, EvalScope, Outcome, SharedOutcome};
use crate::error::{contain, ErrorCause, Result, SegmentError};
use crate::hash::stable_key;
use crate::matcher::definition::{Evaluator, MatcherConfig, MatcherInput, SingleFn};
use crate::matcher::Expr;
use crate::observe::SpanStatus;
use crate::schema::Schema;
use crate::types::{CacheKey, Issue, MatcherNode};

/// A matcher bound to its name and (optionally) its raw arguments.
///
/// Evaluating it goes through the per-call cache, validates the arguments,
/// and dispatches to the single or batched evaluator.
pub struct MatcherDefinition {
    name: String,
    args: Option<Value>,
    key: CacheKey,
    config: Arc<MatcherConfig>,
}

impl MatcherDefinition {
    fn new(name: &str, args: Option<Value>, config: Arc<MatcherConfig>) -> Self {
        let key = CacheKey::new(name, args.as_ref());
        Self {
            name: name.to_string(),
            args,
            key,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw (unvalidated) arguments bound to this definition
    pub fn args(&self) -> Option<&Value> {
        self.args.as_ref()
    }

    pub fn to_node(&self) -> MatcherNode {
        MatcherNode::Matcher {
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }

    /// Evaluate against `ctx`, reusing an earlier invocation with the same
    /// name and arguments when one exists.
    pub fn evaluate(self: &Arc<Self>, ctx: &Arc<EvalContext>) -> SharedOutcome {
        ctx.outcome_for(&self.key, || {
            Self::run(self.clone(), ctx.scope().clone()).boxed().shared()
        })
    }

    async fn run(self: Arc<Self>, scope: Arc<EvalScope>) -> Outcome {
        let mut span = scope.start_span(&format!("matcher:{}", self.name));
        span.set_attribute("matcher.name", self.name.as_str());
        span.set_attribute("segment.name", scope.segment());
        if let Some(args) = &self.args {
            span.set_attribute("matcher.args", stable_key(args));
        }

        let outcome = self.invoke(&scope).await;
        match &outcome {
            Ok(value) => {
                span.set_attribute("matcher.result", *value);
                span.set_status(SpanStatus::ok());
            }
            Err(error) => span.record_error(error),
        }
        span.end();
        outcome
    }

    async fn invoke(&self, scope: &EvalScope) -> Outcome {
        let args = match (self.config.args_schema(), &self.args) {
            (Some(schema), Some(raw)) => {
                Some(self.validate_args(schema.as_ref(), raw, scope).await?)
            }
            (Some(_), None) => {
                return Err(self.argument_error(scope, "no arguments were bound".to_string()))
            }
            (None, args) => args.clone(),
        };

        match self.config.evaluator() {
            Evaluator::Single(f) => self.call_single(f, scope, args).await,
            Evaluator::Batch(f) => self.call_batched(f, scope, args).await,
        }
    }

    async fn validate_args(
        &self,
        schema: &dyn Schema,
        raw: &Value,
        scope: &EvalScope,
    ) -> Result<Value> {
        let validation = contain(|| async { Ok(schema.validate(raw).await) })
            .await
            .map_err(|cause| {
                self.argument_error(scope, format!("validator failed: {}", cause))
            })?;

        match validation {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(self.argument_error(
                scope,
                "validator reported success without a value".to_string(),
            )),
            Err(issues) => Err(self.argument_error(scope, describe_issues(&issues))),
        }
    }

    async fn call_single(
        &self,
        f: &SingleFn,
        scope: &EvalScope,
        args: Option<Value>,
    ) -> Outcome {
        let input = MatcherInput {
            subject: scope.subject().clone(),
            args: args.clone(),
        };
        contain(|| f(input))
            .await
            .map_err(|cause| self.evaluation_error(scope, args, cause))
    }

    async fn call_batched(
        &self,
        f: &BatchFn<BatchRequest>,
        scope: &EvalScope,
        args: Option<Value>,
    ) -> Outcome {
        let batches = scope
            .batches()
            .ok_or_else(|| SegmentError::MissingBatchContext {
                matcher: self.name.clone(),
                segment: scope.segment().to_string(),
            })?;

        let coalescer = batches.coalescer(&self.name, || BatchCoalescer::new(f.clone()));
        let key = args.as_ref().map(stable_key).unwrap_or_default();
        let load = coalescer.load_keyed(
            key,
            BatchRequest {
                subject: scope.subject().clone(),
                args,
            },
        );

        load.await.map_err(|_| SegmentError::BatchResolverDropped {
            matcher: self.name.clone(),
            segment: scope.segment().to_string(),
        })
    }

    fn argument_error(&self, scope: &EvalScope, message: String) -> SegmentError {
        SegmentError::MatcherArgument {
            matcher: self.name.clone(),
            segment: scope.segment().to_string(),
            message,
            subject: Some(scope.subject().clone()),
        }
    }

    fn evaluation_error(
        &self,
        scope: &EvalScope,
        args: Option<Value>,
        cause: ErrorCause,
    ) -> SegmentError {
        SegmentError::MatcherEvaluation {
            matcher: self.name.clone(),
            segment: scope.segment().to_string(),
            subject: scope.subject().clone(),
            args,
            cause,
        }
    }
}

impl std::fmt::Debug for MatcherDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatcherDefinition")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

fn describe_issues(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "validation failed".to_string();
    }
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Callable form of one configured matcher.
pub struct MatcherHandle {
    name: String,
    config: Arc<MatcherConfig>,
    singleton: OnceCell<Arc<MatcherDefinition>>,
    memo: Mutex<LruCache<String, Arc<MatcherDefinition>>>,
}

impl MatcherHandle {
    fn new(name: String, config: MatcherConfig, memo_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(memo_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            config: Arc::new(config),
            singleton: OnceCell::new(),
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn takes_args(&self) -> bool {
        self.config.shape().takes_args()
    }

    /// The shared definition of a matcher without arguments.
    pub fn definition(&self) -> Result<Arc<MatcherDefinition>> {
        if self.takes_args() {
            return Err(SegmentError::MatcherArity {
                matcher: self.name.clone(),
                message: "requires an argument".to_string(),
            });
        }
        let definition = self.singleton.get_or_init(|| {
            Arc::new(MatcherDefinition::new(&self.name, None, self.config.clone()))
        });
        Ok(definition.clone())
    }

    /// The definition bound to `args`; structurally equal arguments share one.
    ///
    /// Arguments are validated when the definition is evaluated, not here.
    pub fn definition_with(&self, args: Value) -> Result<Arc<MatcherDefinition>> {
        if !self.takes_args() {
            return Err(SegmentError::MatcherArity {
                matcher: self.name.clone(),
                message: "takes no arguments".to_string(),
            });
        }

        let key = stable_key(&args);
        let mut memo = self.memo.lock();
        if let Some(existing) = memo.get(&key) {
            return Ok(existing.clone());
        }
        let definition = Arc::new(MatcherDefinition::new(
            &self.name,
            Some(args),
            self.config.clone(),
        ));
        memo.put(key, definition.clone());
        Ok(definition)
    }

    /// Number of argument-bound definitions currently memoized
    pub fn memoized(&self) -> usize {
        self.memo.lock().len()
    }
}

/// Every configured matcher, by name.
pub struct CompiledMatchers {
    handles: HashMap<String, MatcherHandle>,
}

impl CompiledMatchers {
    pub fn get(&self, name: &str) -> Option<&MatcherHandle> {
        self.handles.get(name)
    }

    /// Expression for a matcher without arguments.
    pub fn call(&self, name: &str) -> Result<Expr> {
        self.handle(name)?.definition().map(Expr::Matcher)
    }

    /// Expression for a matcher bound to `args`.
    pub fn call_with(&self, name: &str, args: Value) -> Result<Expr> {
        self.handle(name)?.definition_with(args).map(Expr::Matcher)
    }

    /// Registered matcher names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn handle(&self, name: &str) -> Result<&MatcherHandle> {
        self.handles
            .get(name)
            .ok_or_else(|| SegmentError::UnknownMatcher(name.to_string()))
    }
}

/// Compile matcher configs into callable handles.
pub fn compile(configs: HashMap<String, MatcherConfig>, memo_capacity: usize) -> CompiledMatchers {
    let handles = configs
        .into_iter()
        .map(|(name, config)| {
            tracing::debug!(matcher = %name, shape = ?config.shape(), "compiled matcher");
            (name.clone(), MatcherHandle::new(name, config, memo_capacity))
        })
        .collect();
    CompiledMatchers { handles }
}
