use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::stable_key;

/// Sentinel segment name for expressions supplied inline at call time.
pub const AD_HOC_SEGMENT: &str = "ad-hoc";

/// Validated subject data, shared by reference with every matcher.
///
/// The engine never mutates a subject; cloning only bumps a reference count.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject(Arc<Value>);

impl Subject {
    /// Wrap a validated value
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the underlying JSON value
    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl Deref for Subject {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for Subject {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl Serialize for Subject {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// A single problem reported by a schema validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Human-readable message
    pub message: String,
    /// Location of the offending value, outermost key first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

impl Issue {
    /// Create an issue with no path
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
        }
    }

    /// Attach a path and return self for chaining
    pub fn at(mut self, path: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path.join("."), self.message)
        }
    }
}

/// Context handed to loggers and error observers alongside an error.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Segment name, or `"ad-hoc"`
    pub segment: String,
    /// The subject under evaluation
    pub subject: Subject,
}

/// Immutable description of an expression tree, used for tracing and introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatcherNode {
    /// Leaf referencing a named matcher and its bound arguments
    Matcher {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
    And { children: Vec<MatcherNode> },
    Or { children: Vec<MatcherNode> },
    Not { child: Box<MatcherNode> },
}

impl MatcherNode {
    /// Binding strength, higher binds tighter.
    fn precedence(&self) -> u8 {
        match self {
            MatcherNode::Or { .. } => 1,
            MatcherNode::And { .. } => 2,
            MatcherNode::Not { .. } => 3,
            MatcherNode::Matcher { .. } => 4,
        }
    }

    /// Number of matcher leaves, counting duplicates.
    pub fn leaf_count(&self) -> usize {
        match self {
            MatcherNode::Matcher { .. } => 1,
            MatcherNode::And { children } | MatcherNode::Or { children } => {
                children.iter().map(MatcherNode::leaf_count).sum()
            }
            MatcherNode::Not { child } => child.leaf_count(),
        }
    }

    fn fmt_with_precedence(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        let current = self.precedence();
        let needs_parens = current < parent;
        if needs_parens {
            write!(f, "(")?;
        }

        match self {
            MatcherNode::Matcher { name, args: None } => write!(f, "{}", name)?,
            MatcherNode::Matcher {
                name,
                args: Some(args),
            } => write!(f, "{}({})", name, stable_key(args))?,
            MatcherNode::And { children } => self.fmt_children(f, " AND ", children, current)?,
            MatcherNode::Or { children } => self.fmt_children(f, " OR ", children, current)?,
            MatcherNode::Not { child } => {
                write!(f, "NOT ")?;
                child.fmt_with_precedence(f, current)?;
            }
        }

        if needs_parens {
            write!(f, ")")?;
        }
        Ok(())
    }

    fn fmt_children(
        &self,
        f: &mut fmt::Formatter<'_>,
        op: &str,
        children: &[MatcherNode],
        current: u8,
    ) -> fmt::Result {
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                f.write_str(op)?;
            }
            // Nested operators of the same kind still get parentheses so the
            // tree shape survives in the rendering.
            child.fmt_with_precedence(f, current + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for MatcherNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with_precedence(f, 0)
    }
}

/// Cache key for per-evaluation matcher results
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey(String);

impl CacheKey {
    pub fn new(name: &str, args: Option<&Value>) -> Self {
        match args {
            Some(args) => Self(format!("{}({})", name, stable_key(args))),
            None => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
