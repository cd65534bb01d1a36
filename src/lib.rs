//! Segment Engine - decide whether a subject belongs to a named segment
//!
//! A segment is a boolean expression over reusable matchers. This library
//! provides:
//! - Subject validation through a pluggable schema
//! - Matchers with or without arguments, single or batched
//! - `and` / `or` / `not` combinators evaluated concurrently
//! - Per-call memoization of matcher results
//! - Same-tick request coalescing for batched matchers
//! - Error containment: evaluation never fails, errors resolve to `false`
//! - Optional spans through `tracing` or a custom tracer
//!
//! # Example
//!
//! ```rust
//! use segment_engine::{AnySchema, MatcherConfigs, SegmentEngine};
//! use serde_json::json;
//!
//! # async fn demo() -> segment_engine::Result<()> {
//! let engine = SegmentEngine::builder(AnySchema)
//!     .matchers(|m| {
//!         let mut matchers = MatcherConfigs::new();
//!         matchers.insert(
//!             "isAdmin".into(),
//!             m.define()
//!                 .evaluate_sync(|input| Ok(input.subject["role"] == "admin"))
//!                 .build()?,
//!         );
//!         matchers.insert(
//!             "onPlan".into(),
//!             m.define()
//!                 .args(AnySchema)
//!                 .evaluate_sync(|input| Ok(Some(&input.subject["plan"]) == input.args.as_ref()))
//!                 .build()?,
//!         );
//!         Ok(matchers)
//!     })
//!     .segment("paying-admins", |s| {
//!         Ok(s.ops.and([s.matcher("isAdmin")?, s.matcher_with("onPlan", json!("pro"))?]))
//!     })
//!     .build()?;
//!
//! let user = engine
//!     .context_for(&json!({"role": "admin", "plan": "pro"}))
//!     .await
//!     .expect("valid subject");
//! assert!(user.matches("paying-admins").await);
//! # Ok(())
//! # }
//! ```
//!
//! # Evaluation model
//!
//! | Step | Behavior |
//! |------|----------|
//! | `context_for` | Validates the subject once; the validated value is shared read-only |
//! | `matches` | Builds the segment's expression and evaluates it with a fresh cache |
//! | Matchers | The same name and arguments run at most once per call |
//! | Batches | Requests queued in one poll pass reach the batch function together |
//! | Errors | Logged, observed, recorded on the span, then resolved to `false` |

pub mod batch;
pub mod compile;
pub mod context;
pub mod engine;
pub mod error;
pub mod hash;
pub mod matcher;
pub mod observe;
pub mod schema;
pub mod types;

// Re-export commonly used items
pub use batch::{
    flush_all_batch_queues, BatchCoalescer, BatchContext, BatchEntry, BatchFailure, BatchFn,
    BatchFuture, BatchRequest, LoadFuture, Resolver, ResolverDropped,
};
pub use compile::{compile, CompiledMatchers, MatcherDefinition, MatcherHandle};
pub use context::{EvalContext, EvalScope, Outcome, SharedOutcome};
pub use error::{BoxError, ErrorCause, ErrorKind, Result, SegmentError};
pub use hash::{stable_key, stable_key_of};
pub use matcher::{
    and, not, or, Evaluator, Expr, LogicalOperators, MatcherConfig, MatcherConfigBuilder,
    MatcherConfigs, MatcherFactory, MatcherInput, MatcherShape, SegmentMatcher,
};
pub use schema::{AnySchema, FnSchema, Schema, TypedSchema, Validation};
pub use types::{ErrorContext, Issue, MatcherNode, Subject, AD_HOC_SEGMENT};

// Re-export engine types
pub use engine::{
    segment_fn, EngineOptions, ErrorObserver, FallbackValue, SegmentEngine, SegmentEngineBuilder,
    SegmentFn, SegmentRef, SegmentScope, SubjectContext, TracerOption, DEFAULT_MEMO_CAPACITY,
};

// Re-export observability types
pub use observe::{
    AttributeValue, FnLogger, Logger, NoopLogger, NoopTracer, SpanContext, SpanGuard, SpanStatus,
    StatusCode, TraceSpan, Tracer, TracingLogger,
};

#[cfg(feature = "spans")]
pub use observe::TracingTracer;
