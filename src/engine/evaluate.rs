//! Segment evaluation for a bound subject.
//!
//! `matches` never fails. Every error raised while building or evaluating an
//! expression is logged, handed to the error observer, recorded on the
//! segment span, and then resolved to `false` (or to the fallback's answer).

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};

use super::{SegmentRef, SegmentScope, SubjectContext};
use crate::batch::{flush_all_batch_queues, BatchContext};
use crate::context::EvalContext;
use crate::error::{contain, BoxError, ErrorCause, Result, SegmentError};
use crate::matcher::{Expr, SegmentMatcher};
use crate::observe::{SpanContext, SpanGuard, SpanStatus};
use crate::types::{ErrorContext, MatcherNode};

/// Values a fallback may produce: a plain answer or a fallible one.
pub trait FallbackValue {
    fn into_decision(self) -> std::result::Result<bool, BoxError>;
}

impl FallbackValue for bool {
    fn into_decision(self) -> std::result::Result<bool, BoxError> {
        Ok(self)
    }
}

impl<E: Into<BoxError>> FallbackValue for std::result::Result<bool, E> {
    fn into_decision(self) -> std::result::Result<bool, BoxError> {
        self.map_err(Into::into)
    }
}

type Fallback = Box<
    dyn FnOnce(Vec<SegmentError>) -> BoxFuture<'static, std::result::Result<bool, BoxError>>
        + Send,
>;

impl SubjectContext {
    /// Whether the subject belongs to `segment`. Errors resolve to `false`.
    pub async fn matches(&self, segment: impl Into<SegmentRef>) -> bool {
        self.evaluate(segment.into(), None).await
    }

    /// Like [`matches`](Self::matches), but on error the answer comes from
    /// `fallback`, which receives the one or more errors that were raised.
    /// A fallback that fails or panics still yields `false`.
    pub async fn matches_or_else<F, Fut>(
        &self,
        segment: impl Into<SegmentRef>,
        fallback: F,
    ) -> bool
    where
        F: FnOnce(Vec<SegmentError>) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: FallbackValue,
    {
        let fallback: Fallback = Box::new(move |errors: Vec<SegmentError>| {
            fallback(errors).map(FallbackValue::into_decision).boxed()
        });
        self.evaluate(segment.into(), Some(fallback)).await
    }

    /// Expression tree `segment` builds for this subject, without evaluating it.
    pub fn describe(&self, segment: impl Into<SegmentRef>) -> Result<MatcherNode> {
        self.build_expr(&segment.into()).map(|expr| expr.to_node())
    }

    /// Names of every registered segment the subject matches, sorted.
    ///
    /// Each segment is evaluated independently with its own cache.
    pub async fn matching_segments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.segments.keys().cloned().collect();
        names.sort_unstable();
        let results = join_all(names.iter().map(|name| self.matches(name))).await;
        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, matched)| matched.then_some(name))
            .collect()
    }

    async fn evaluate(&self, target: SegmentRef, fallback: Option<Fallback>) -> bool {
        let segment = target.name().to_string();
        let mut span = SpanGuard::start(
            self.inner.tracer.as_ref(),
            &format!("segment:{}", segment),
            None,
        );
        span.set_attribute("segment.name", segment.as_str());
        let parent = span.context();

        let outcome = AssertUnwindSafe(self.run(&target, &segment, parent))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(SegmentError::from_panic(payload)));

        let value = match outcome {
            Ok(value) => {
                span.set_status(SpanStatus::ok());
                value
            }
            Err(error) => {
                span.record_error(&error);
                self.recover(&segment, error, fallback).await
            }
        };
        span.set_attribute("segment.result", value);
        span.end();
        value
    }

    async fn run(&self, target: &SegmentRef, segment: &str, parent: SpanContext) -> Result<bool> {
        let expr = self.build_expr(target)?;
        let batches = Arc::new(BatchContext::new());
        let ctx = Arc::new(
            EvalContext::new(self.subject.clone(), segment)
                .with_batches(Some(batches.clone()))
                .with_tracer(self.inner.tracer.clone(), parent),
        );

        let outcome = batches.drive(expr.evaluate(&ctx)).await;
        let flushed = flush_all_batch_queues(&batches).await;
        tracing::trace!(
            segment,
            invocations = ctx.cached_results(),
            flushed,
            "segment evaluated"
        );
        outcome
    }

    fn build_expr(&self, target: &SegmentRef) -> Result<Expr> {
        let define = match target {
            SegmentRef::Named(name) => self
                .inner
                .segments
                .get(name)
                .ok_or_else(|| SegmentError::UnknownSegment(name.clone()))?,
            SegmentRef::AdHoc(define) => define,
        };

        let scope = SegmentScope::new(&self.subject, &self.inner.matchers);
        catch_unwind(AssertUnwindSafe(|| define(&scope))).unwrap_or_else(|payload| {
            Err(SegmentError::SegmentDefinition {
                segment: target.name().to_string(),
                cause: ErrorCause::from_panic(payload),
            })
        })
    }

    async fn recover(
        &self,
        segment: &str,
        error: SegmentError,
        fallback: Option<Fallback>,
    ) -> bool {
        let context = ErrorContext {
            segment: segment.to_string(),
            subject: self.subject.clone(),
        };
        self.report(&error, &context);

        let Some(fallback) = fallback else {
            return false;
        };
        match contain(move || fallback(vec![error])).await {
            Ok(value) => value,
            Err(cause) => {
                tracing::warn!(segment, error = %cause, "fallback failed, resolving to false");
                false
            }
        }
    }

    fn report(&self, error: &SegmentError, context: &ErrorContext) {
        if catch_unwind(AssertUnwindSafe(|| self.inner.logger.error(error, context))).is_err() {
            tracing::warn!(segment = %context.segment, "logger panicked while reporting an error");
        }
        if let Some(observer) = &self.inner.on_error {
            if catch_unwind(AssertUnwindSafe(|| observer(error, context))).is_err() {
                tracing::warn!(segment = %context.segment, "error observer panicked");
            }
        }
    }
}
