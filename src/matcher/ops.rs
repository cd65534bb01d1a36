//! Logical combinators over matcher expressions.
//!
//! `and` and `or` launch every child at once and wait for all of them; there
//! is no short-circuiting. If any child fails, the first failure to settle is
//! the combinator's failure.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};

use super::{Expr, SegmentMatcher};
use crate::context::{EvalContext, Outcome};
use crate::error::Result;

/// True when every child is true. An empty `and` is true.
pub fn and<I>(children: I) -> Expr
where
    I: IntoIterator<Item = Expr>,
{
    Expr::And(children.into_iter().collect())
}

/// True when any child is true. An empty `or` is false.
pub fn or<I>(children: I) -> Expr
where
    I: IntoIterator<Item = Expr>,
{
    Expr::Or(children.into_iter().collect())
}

pub fn not(child: Expr) -> Expr {
    Expr::Not(Box::new(child))
}

/// The combinators, as handed to segment definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalOperators;

impl LogicalOperators {
    pub fn and<I: IntoIterator<Item = Expr>>(&self, children: I) -> Expr {
        and(children)
    }

    pub fn or<I: IntoIterator<Item = Expr>>(&self, children: I) -> Expr {
        or(children)
    }

    pub fn not(&self, child: Expr) -> Expr {
        not(child)
    }
}

type Pending = FuturesUnordered<BoxFuture<'static, Outcome>>;

pub(crate) fn evaluate_and(
    children: &[Expr],
    ctx: &Arc<EvalContext>,
) -> BoxFuture<'static, Outcome> {
    let pending = launch(children, ctx);
    async move { Ok(settle(pending).await?.into_iter().all(|value| value)) }.boxed()
}

pub(crate) fn evaluate_or(
    children: &[Expr],
    ctx: &Arc<EvalContext>,
) -> BoxFuture<'static, Outcome> {
    let pending = launch(children, ctx);
    async move { Ok(settle(pending).await?.into_iter().any(|value| value)) }.boxed()
}

pub(crate) fn evaluate_not(child: &Expr, ctx: &Arc<EvalContext>) -> BoxFuture<'static, Outcome> {
    let inner = child.evaluate(ctx);
    async move { Ok(!inner.await?) }.boxed()
}

fn launch(children: &[Expr], ctx: &Arc<EvalContext>) -> Pending {
    children.iter().map(|child| child.evaluate(ctx)).collect()
}

async fn settle(mut pending: Pending) -> Result<Vec<bool>> {
    let mut values = Vec::with_capacity(pending.len());
    let mut first_error = None;
    while let Some(outcome) = pending.next().await {
        match outcome {
            Ok(value) => values.push(value),
            Err(error) => {
                first_error.get_or_insert(error);
            }
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(values),
    }
}
