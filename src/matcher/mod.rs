pub mod definition;
pub mod ops;

pub use definition::{
    Evaluator, MatcherConfig, MatcherConfigBuilder, MatcherConfigs, MatcherFactory, MatcherInput,
    MatcherShape, SingleFn, SingleFuture,
};
pub use ops::{and, not, or, LogicalOperators};

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::compile::MatcherDefinition;
use crate::context::{EvalContext, Outcome};
use crate::types::MatcherNode;

/// Trait for segment matchers
pub trait SegmentMatcher: Send + Sync {
    /// Evaluate against the current call's context
    fn evaluate(&self, ctx: &Arc<EvalContext>) -> BoxFuture<'static, Outcome>;

    /// Structural description of this matcher
    fn to_node(&self) -> MatcherNode;
}

impl SegmentMatcher for Arc<MatcherDefinition> {
    fn evaluate(&self, ctx: &Arc<EvalContext>) -> BoxFuture<'static, Outcome> {
        MatcherDefinition::evaluate(self, ctx).boxed()
    }

    fn to_node(&self) -> MatcherNode {
        MatcherDefinition::to_node(self)
    }
}

/// Expression tree produced by a segment definition.
#[derive(Debug, Clone)]
pub enum Expr {
    Matcher(Arc<MatcherDefinition>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl SegmentMatcher for Expr {
    fn evaluate(&self, ctx: &Arc<EvalContext>) -> BoxFuture<'static, Outcome> {
        match self {
            Expr::Matcher(m) => MatcherDefinition::evaluate(m, ctx).boxed(),
            Expr::And(children) => ops::evaluate_and(children, ctx),
            Expr::Or(children) => ops::evaluate_or(children, ctx),
            Expr::Not(child) => ops::evaluate_not(child, ctx),
        }
    }

    fn to_node(&self) -> MatcherNode {
        match self {
            Expr::Matcher(m) => m.to_node(),
            Expr::And(children) => MatcherNode::And {
                children: children.iter().map(Expr::to_node).collect(),
            },
            Expr::Or(children) => MatcherNode::Or {
                children: children.iter().map(Expr::to_node).collect(),
            },
            Expr::Not(child) => MatcherNode::Not {
                child: Box::new(child.to_node()),
            },
        }
    }
}

impl From<Arc<MatcherDefinition>> for Expr {
    fn from(definition: Arc<MatcherDefinition>) -> Self {
        Expr::Matcher(definition)
    }
}
