//! Matcher configurations and the factory handed to `matchers(..)`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::batch::{BatchEntry, BatchFn, BatchFuture, BatchRequest};
use crate::error::{BoxError, Result, SegmentError};
use crate::schema::Schema;
use crate::types::Subject;

/// Future returned by a single (non-batched) evaluator.
pub type SingleFuture = BoxFuture<'static, std::result::Result<bool, BoxError>>;

/// Single evaluator: decides one subject/arguments pair.
pub type SingleFn = Arc<dyn Fn(MatcherInput) -> SingleFuture + Send + Sync>;

/// Matcher configurations keyed by matcher name.
pub type MatcherConfigs = HashMap<String, MatcherConfig>;

/// What a single evaluator receives.
#[derive(Debug, Clone)]
pub struct MatcherInput {
    pub subject: Subject,
    /// Validated arguments; `None` for matchers without an argument schema
    pub args: Option<Value>,
}

/// How a matcher produces its answer.
#[derive(Clone)]
pub enum Evaluator {
    Single(SingleFn),
    Batch(BatchFn<BatchRequest>),
}

/// The four matcher shapes: with or without arguments, batched or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherShape {
    Plain,
    Batched,
    WithArgs,
    BatchedWithArgs,
}

impl MatcherShape {
    pub fn takes_args(&self) -> bool {
        matches!(self, MatcherShape::WithArgs | MatcherShape::BatchedWithArgs)
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, MatcherShape::Batched | MatcherShape::BatchedWithArgs)
    }
}

/// A registered matcher: optional argument schema plus its evaluator.
#[derive(Clone)]
pub struct MatcherConfig {
    pub(crate) args: Option<Arc<dyn Schema>>,
    pub(crate) evaluator: Evaluator,
}

impl MatcherConfig {
    pub fn shape(&self) -> MatcherShape {
        match (self.args.is_some(), &self.evaluator) {
            (false, Evaluator::Single(_)) => MatcherShape::Plain,
            (false, Evaluator::Batch(_)) => MatcherShape::Batched,
            (true, Evaluator::Single(_)) => MatcherShape::WithArgs,
            (true, Evaluator::Batch(_)) => MatcherShape::BatchedWithArgs,
        }
    }

    pub fn args_schema(&self) -> Option<&Arc<dyn Schema>> {
        self.args.as_ref()
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }
}

impl std::fmt::Debug for MatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatcherConfig")
            .field("shape", &self.shape())
            .finish()
    }
}

/// Factory passed to the engine builder's `matchers` callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatcherFactory;

impl MatcherFactory {
    /// Start describing a matcher.
    pub fn define(&self) -> MatcherConfigBuilder {
        MatcherConfigBuilder::default()
    }
}

/// Builder for a [`MatcherConfig`].
#[derive(Default)]
pub struct MatcherConfigBuilder {
    args: Option<Arc<dyn Schema>>,
    single: Option<SingleFn>,
    batch: Option<BatchFn<BatchRequest>>,
}

impl MatcherConfigBuilder {
    /// Declare an argument schema; the matcher then takes exactly one argument.
    pub fn args<S: Schema + 'static>(self, schema: S) -> Self {
        self.args_schema(Arc::new(schema))
    }

    pub fn args_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.args = Some(schema);
        self
    }

    /// Async single evaluator.
    pub fn evaluate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(MatcherInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, BoxError>> + Send + 'static,
    {
        self.single = Some(Arc::new(move |input: MatcherInput| -> SingleFuture {
            f(input).boxed()
        }));
        self
    }

    /// Synchronous single evaluator.
    pub fn evaluate_sync<F>(mut self, f: F) -> Self
    where
        F: Fn(&MatcherInput) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.single = Some(Arc::new(move |input: MatcherInput| -> SingleFuture {
            let result = f(&input);
            futures::future::ready(result).boxed()
        }));
        self
    }

    /// Batch evaluator: receives every request queued in one tick and must
    /// resolve each entry's resolver.
    pub fn evaluate_batch<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<BatchEntry<BatchRequest>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.batch = Some(Arc::new(
            move |entries: Vec<BatchEntry<BatchRequest>>| -> BatchFuture { f(entries).boxed() },
        ));
        self
    }

    /// Finish the configuration.
    ///
    /// When both evaluators are supplied the batch evaluator is used.
    pub fn build(self) -> Result<MatcherConfig> {
        let evaluator = match (self.single, self.batch) {
            (Some(_), Some(batch)) => {
                tracing::warn!(
                    "matcher defines both evaluate and evaluate_batch, using evaluate_batch"
                );
                Evaluator::Batch(batch)
            }
            (None, Some(batch)) => Evaluator::Batch(batch),
            (Some(single), None) => Evaluator::Single(single),
            (None, None) => {
                return Err(SegmentError::InvalidMatcher(
                    "a matcher needs an evaluate or evaluate_batch function".to_string(),
                ))
            }
        };
        Ok(MatcherConfig {
            args: self.args,
            evaluator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AnySchema;
    use serde_json::json;

    fn input() -> MatcherInput {
        MatcherInput {
            subject: Subject::new(json!({"role": "admin"})),
            args: None,
        }
    }

    #[test]
    fn test_shapes() {
        let m = MatcherFactory;
        let plain = m.define().evaluate_sync(|_| Ok(true)).build().unwrap();
        assert_eq!(plain.shape(), MatcherShape::Plain);

        let batched = m
            .define()
            .evaluate_batch(|_entries| async { Ok(()) })
            .build()
            .unwrap();
        assert_eq!(batched.shape(), MatcherShape::Batched);

        let with_args = m
            .define()
            .args(AnySchema)
            .evaluate(|_input| async { Ok(false) })
            .build()
            .unwrap();
        assert_eq!(with_args.shape(), MatcherShape::WithArgs);
        assert!(with_args.shape().takes_args());

        let batched_with_args = m
            .define()
            .args(AnySchema)
            .evaluate_batch(|_entries| async { Ok(()) })
            .build()
            .unwrap();
        assert_eq!(batched_with_args.shape(), MatcherShape::BatchedWithArgs);
        assert!(batched_with_args.shape().is_batched());
    }

    #[test]
    fn test_batch_wins_when_both_supplied() {
        let config = MatcherFactory
            .define()
            .evaluate_sync(|_| Ok(true))
            .evaluate_batch(|_entries| async { Ok(()) })
            .build()
            .unwrap();
        assert!(matches!(config.evaluator(), Evaluator::Batch(_)));
    }

    #[test]
    fn test_missing_evaluator_is_rejected() {
        let err = MatcherFactory.define().args(AnySchema).build().unwrap_err();
        assert!(matches!(err, SegmentError::InvalidMatcher(_)));
    }

    #[tokio::test]
    async fn test_sync_evaluator_sees_subject() {
        let config = MatcherFactory
            .define()
            .evaluate_sync(|input| Ok(input.subject["role"] == "admin"))
            .build()
            .unwrap();
        match config.evaluator() {
            Evaluator::Single(f) => assert!(f(input()).await.unwrap()),
            Evaluator::Batch(_) => panic!("expected a single evaluator"),
        }
    }
}
